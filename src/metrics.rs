//! Prometheus metrics for the gateway

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Request-level gateway metrics
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    /// Responses by HTTP status
    pub requests_total: Arc<CounterVec>,

    /// Responses by the plugin that produced them
    pub plugin_dispatch_total: Arc<CounterVec>,

    /// End-to-end request duration by negotiated format
    pub request_duration_seconds: Arc<HistogramVec>,

    /// Failed requests by error kind
    pub errors_total: Arc<CounterVec>,
}

impl GatewayMetrics {
    /// Create metrics on a registry of their own
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(&Registry::new())
    }

    /// Create metrics registered on `registry`
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of gateway responses"),
            &["status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let plugin_dispatch_total = CounterVec::new(
            Opts::new(
                "gateway_plugin_dispatch_total",
                "Total number of responses produced per plugin",
            ),
            &["plugin"],
        )?;
        registry.register(Box::new(plugin_dispatch_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Duration of gateway requests in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["format"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("gateway_errors_total", "Total number of failed requests"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            requests_total: Arc::new(requests_total),
            plugin_dispatch_total: Arc::new(plugin_dispatch_total),
            request_duration_seconds: Arc::new(request_duration_seconds),
            errors_total: Arc::new(errors_total),
        })
    }

    pub fn record_response(&self, status: u16) {
        self.requests_total
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn record_dispatch(&self, plugin: &str) {
        self.plugin_dispatch_total.with_label_values(&[plugin]).inc();
    }

    /// Record a request's duration; `format` is "unset" when none was negotiated
    pub fn record_duration(&self, format: &str, duration: Duration) {
        self.request_duration_seconds
            .with_label_values(&[format])
            .observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    /// Render every metric on the registry in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
