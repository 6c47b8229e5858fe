//! Request orchestration
//!
//! [`Gateway::fetch`] parses the resource, negotiates the representation,
//! seeds a [`RequestContext`] and hands it to the plugin pipeline. Failures
//! are mapped to responses exactly once, here; only cancellations are
//! returned as errors. The plugin's payload is then stamped with the cache
//! identity and protocol headers.

use crate::accept::negotiate;
use crate::cache_identity::{etag, if_none_match, is_weak, CachePolicy, EtagOptions};
use crate::codec::{CodecRegistry, NodeCodec};
use crate::config::GatewayConfig;
use crate::context::{GatewayServices, RequestContext, RequestOptions};
use crate::error::{GatewayError, Result};
use crate::http_store::HttpBlockStore;
use crate::metrics::GatewayMetrics;
use crate::models::{ReqFormat, StageTiming};
use crate::name_cache::NameCache;
use crate::name_resolver::{
    CachingNameResolver, HttpNameResolver, NameResolver, ResolveOptions, StaticNameResolver,
};
use crate::pipeline::{Pipeline, Plugin};
use crate::plugins::{default_plugins, fingerprint, Traced};
use crate::resource::{Resource, ResourceParser};
use crate::response::{content_disposition, GatewayResponse};
use crate::store::{BlockFetcher, BlockStore, MemoryBlockStore};
use http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, ETAG, IF_NONE_MATCH, VARY};
use http::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const X_IPFS_PATH: &str = "x-ipfs-path";
const X_IPFS_ROOTS: &str = "x-ipfs-roots";
const SERVER_TIMING: &str = "server-timing";

/// Headers a 304 keeps from the response it replaces
const NOT_MODIFIED_HEADERS: [&str; 5] = ["etag", "cache-control", "vary", X_IPFS_PATH, X_IPFS_ROOTS];

/// A content-addressed gateway
pub struct Gateway {
    services: Arc<GatewayServices>,
    pipeline: Pipeline,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.services.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn metrics(&self) -> Option<&Arc<GatewayMetrics>> {
        self.metrics.as_ref()
    }

    /// Serve one request
    ///
    /// # Arguments
    /// * `resource` - A CID, an `ipfs://`/`ipns://` URL, an `/ipfs/`/`/ipns/`
    ///   path, or an HTTP(S) path- or subdomain-gateway URL
    /// * `options` - Method, headers, cancellation and session flag
    ///
    /// # Returns
    /// * `Ok(response)` for every outcome except cancellation, including
    ///   error responses with a JSON body
    /// * `Err(GatewayError::Aborted)` when `options.cancel` fired, carrying the
    ///   elapsed time and stage timings collected so far
    pub async fn fetch(
        &self,
        resource: impl Into<Resource>,
        options: RequestOptions,
    ) -> Result<GatewayResponse> {
        let started = Instant::now();
        let resource = resource.into();
        let resource_text = resource.to_string();
        let is_head = options.is_head();
        let mut timings = Vec::new();

        let outcome = self
            .serve(&resource, &resource_text, options, started, &mut timings)
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(GatewayError::Aborted(mut diagnostics)) => {
                diagnostics.elapsed = started.elapsed();
                diagnostics.timings = timings;
                debug!(
                    "Request aborted: resource={}, {}",
                    resource_text, diagnostics
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_error("aborted");
                }
                return Err(GatewayError::Aborted(diagnostics));
            }
            Err(err) => self.error_response(err, &resource_text),
        };

        let response = if is_head {
            response.without_body()
        } else {
            response
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_response(response.status.as_u16());
        }
        Ok(response)
    }

    async fn serve(
        &self,
        resource: &Resource,
        resource_text: &str,
        options: RequestOptions,
        started: Instant,
        timings: &mut Vec<StageTiming>,
    ) -> Result<GatewayResponse> {
        if options.cancel.is_cancelled() {
            return Err(GatewayError::aborted("request"));
        }

        let parse_start = Instant::now();
        let parser = ResourceParser::new(
            self.services.resolver.as_ref(),
            self.services.config.resolver_timeout(),
        );
        let resolve_options = ResolveOptions {
            cancel: options.cancel.clone(),
            nocache: false,
        };
        let parsed = parser.parse(resource, &resolve_options).await;
        timings.push(StageTiming::new("parse", parse_start.elapsed()));
        let parsed = parsed?;

        let negotiation = negotiate(&parsed.query, options.header("accept"), parsed.protocol)?;

        let session = if options.session {
            self.services.store.start_session(&parsed.cid).await
        } else {
            None
        };
        let fetcher = BlockFetcher::new(
            self.services.store.clone(),
            options.cancel.clone(),
            self.services.config.store_timeout(),
            self.services.config.max_outstanding_fetches,
        )
        .with_session(session);

        let mut ctx = RequestContext::new(
            resource_text.to_string(),
            parsed,
            negotiation,
            options,
            self.services.clone(),
            fetcher,
            started,
        );
        ctx.timings = std::mem::take(timings);

        let render_start = Instant::now();
        let dispatched = self.pipeline.dispatch(&mut ctx).await;
        ctx.record_timing("render", render_start.elapsed());

        // streamed bodies keep fetching after this, without affinity
        if let Some(session) = session {
            self.services.store.end_session(session).await;
        }

        timings.clone_from(&ctx.timings);
        let response = dispatched?;
        self.finalize(&ctx, response)
    }

    /// Stamp protocol and cache headers onto a plugin's response
    fn finalize(&self, ctx: &RequestContext, mut response: GatewayResponse) -> Result<GatewayResponse> {
        if ctx.req_format.is_none() {
            if let Some(content_type) = response.content_type() {
                if !ctx.accept.permits(content_type) {
                    return Err(GatewayError::NotRepresentable(format!(
                        "{} does not satisfy the Accept header",
                        content_type
                    )));
                }
            }
        }

        response.set_header(X_IPFS_PATH, &ctx.parsed.requested_path)?;
        if let Some(details) = &ctx.path_details {
            response.set_header(X_IPFS_ROOTS, &details.roots_header())?;
        }

        let tag = etag(&ctx.terminal_cid(), &self.etag_options(ctx));
        response.set_header(ETAG, &tag)?;
        response.set_header(
            CACHE_CONTROL,
            &self.services.cache_policy.cache_control(ctx.parsed.mutable.as_ref()),
        )?;
        response.set_header(VARY, "Accept")?;

        if let Some(disposition) = disposition(ctx) {
            response.set_header(CONTENT_DISPOSITION, &disposition)?;
        }
        if self.services.config.server_timing {
            response.set_header(SERVER_TIMING, &server_timing(&ctx.timings))?;
        }

        if let Some(metrics) = &self.metrics {
            if let Some(plugin) = &ctx.handled_by {
                metrics.record_dispatch(plugin);
            }
            let format = ctx.req_format.map(|f| f.as_str()).unwrap_or("unset");
            metrics.record_duration(format, ctx.elapsed());
        }

        info!(
            "Request served: resource={}, status={}, plugin={}, elapsed={:?}",
            ctx.resource,
            response.status,
            ctx.handled_by.as_deref().unwrap_or("-"),
            ctx.elapsed()
        );

        let not_modified = response.status == StatusCode::OK
            && ctx
                .options
                .header(IF_NONE_MATCH.as_str())
                .map(|header| if_none_match(header, &tag))
                .unwrap_or(false);
        if not_modified {
            debug!("Not modified: resource={}, etag={}", ctx.resource, tag);
            return Ok(not_modified_response(&response));
        }

        Ok(response)
    }

    fn etag_options(&self, ctx: &RequestContext) -> EtagOptions {
        let mut content_prefix = ctx.cache_hints.content_prefix.clone();
        if content_prefix.is_none() {
            if let Some(details) = &ctx.path_details {
                if !details.terminal.is_whole_block() {
                    let inner = details.terminal.inner_path.join("/");
                    content_prefix = Some(format!("Path-{}_CID-", fingerprint(inner.as_bytes())));
                }
            }
        }
        EtagOptions {
            format: ctx.req_format,
            weak: is_weak(
                ctx.req_format,
                ctx.parsed.mutable.is_some(),
                ctx.cache_hints.generated,
            ),
            range: ctx.served_window,
            content_prefix,
        }
    }

    fn error_response(&self, err: GatewayError, resource: &str) -> GatewayResponse {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(err.kind());
        }
        match err {
            GatewayError::PluginFatal {
                plugin,
                message,
                response: Some(response),
            } => {
                warn!(
                    "Plugin ended the request: plugin={}, message={}, status={}",
                    plugin, message, response.status
                );
                *response
            }
            err => {
                let status = err.to_http_status();
                if status >= 500 {
                    warn!(
                        "Request failed: resource={}, kind={}, error={}",
                        resource,
                        err.kind(),
                        err
                    );
                } else {
                    debug!(
                        "Request rejected: resource={}, kind={}, error={}",
                        resource,
                        err.kind(),
                        err
                    );
                }
                GatewayResponse::from_error(&err, Some(resource))
            }
        }
    }
}

/// `Content-Disposition` for the response, when one applies
///
/// Export formats download as `<cid>.<ext>`; rendered formats are inline.
/// `filename` replaces the derived name and `download=true` forces an
/// attachment.
fn disposition(ctx: &RequestContext) -> Option<String> {
    let format = ctx.req_format;
    let attachment = ctx.query.download || format.map(|f| f.is_export()).unwrap_or(false);

    let filename = match (&ctx.query.filename, format) {
        (Some(name), _) => name.clone(),
        (None, Some(ReqFormat::IpnsRecord)) => {
            let name = ctx
                .parsed
                .mutable
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_else(|| ctx.cid.to_string());
            format!("{}.{}", name, ReqFormat::IpnsRecord.file_extension())
        }
        (None, Some(format)) => format!("{}.{}", ctx.terminal_cid(), format.file_extension()),
        (None, None) if attachment => ctx
            .parsed
            .graph_path
            .segments()
            .last()
            .cloned()
            .unwrap_or_else(|| ctx.terminal_cid().to_string()),
        (None, None) => return None,
    };
    Some(content_disposition(attachment, &filename))
}

fn server_timing(timings: &[StageTiming]) -> String {
    timings
        .iter()
        .map(|t| format!("{};dur={:.3}", t.name, t.duration.as_secs_f64() * 1000.0))
        .collect::<Vec<_>>()
        .join(", ")
}

fn not_modified_response(original: &GatewayResponse) -> GatewayResponse {
    let mut response = GatewayResponse::new(StatusCode::NOT_MODIFIED);
    for name in NOT_MODIFIED_HEADERS {
        if let Some(value) = original.headers.get(name) {
            response.headers.insert(
                http::header::HeaderName::from_static(name),
                value.clone(),
            );
        }
    }
    response
}

/// Assembles a [`Gateway`] from configuration and optional collaborators
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn BlockStore>>,
    resolver: Option<Arc<dyn NameResolver>>,
    codecs: CodecRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        GatewayBuilder {
            config,
            store: None,
            resolver: None,
            codecs: CodecRegistry::new(),
            plugins: Vec::new(),
            metrics: None,
        }
    }

    /// Use `store` instead of the configured upstream gateways
    pub fn with_store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `resolver` instead of the configured static and HTTP resolvers
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn NodeCodec>) -> Self {
        self.codecs.register(codec);
        self
    }

    /// Append a plugin after the built-ins
    pub fn with_plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Traced::wrap(plugin));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and assemble the gateway
    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(
                HttpBlockStore::from_config(&config)?
                    .with_local_store(Arc::new(MemoryBlockStore::new())),
            ),
        };

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => {
                let mut names = StaticNameResolver::from_config(&config);
                if !config.offline {
                    names = names.with_fallback(Arc::new(HttpNameResolver::from_config(&config)?));
                }
                Arc::new(CachingNameResolver::new(
                    Arc::new(names),
                    NameCache::new(config.name_cache_ttl(), config.name_cache_max_entries),
                    config.default_mutable_ttl(),
                ))
            }
        };

        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if config.metrics_enabled => Some(Arc::new(GatewayMetrics::new().map_err(
                |e| GatewayError::Internal(format!("Failed to create metrics: {}", e)),
            )?)),
            None => None,
        };

        let mut plugins = default_plugins();
        plugins.extend(self.plugins);
        let pipeline = Pipeline::new(plugins);

        let cache_policy = CachePolicy::new(
            Duration::from_secs(config.immutable_max_age_secs),
            config.default_mutable_ttl(),
        );

        info!(
            "Gateway ready: offline={}, upstreams={}, plugins={:?}",
            config.offline,
            config.upstream_gateways.len(),
            pipeline.plugin_ids()
        );

        Ok(Gateway {
            services: Arc::new(GatewayServices {
                store,
                resolver,
                codecs: self.codecs,
                config,
                cache_policy,
            }),
            pipeline,
            metrics,
        })
    }
}
