//! Error types for the gateway

use crate::models::StageTiming;
use crate::response::GatewayResponse;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Diagnostics collected up to the moment a request's cancellation was observed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbortDiagnostics {
    /// Stage that observed the cancellation (e.g. "walk", "fetch", "resolve")
    pub stage: String,
    /// Time elapsed since the request entered the gateway
    pub elapsed: Duration,
    /// Stage timings recorded before the abort
    pub timings: Vec<StageTiming>,
}

impl AbortDiagnostics {
    /// Diagnostics for a cancellation seen by `stage`, without timings yet
    pub fn at(stage: impl Into<String>) -> Self {
        AbortDiagnostics {
            stage: stage.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for AbortDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage={} elapsed={:?}", self.stage, self.elapsed)?;
        for timing in &self.timings {
            write!(f, " {}={:?}", timing.name, timing.duration)?;
        }
        Ok(())
    }
}

/// Error types that can occur while serving a gateway request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Unsatisfiable range for content of size {total_size:?}")]
    UnsatisfiableRange { total_size: Option<u64> },

    #[error("No terminal element at path {path}: {reason}")]
    PathNotFound { path: String, reason: String },

    #[error("Malformed path element: {0}")]
    MalformedPath(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Name resolution failed: {0}")]
    NameResolution(String),

    #[error("Request aborted ({0})")]
    Aborted(AbortDiagnostics),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Content unavailable offline: {0}")]
    ContentUnavailableOffline(String),

    #[error("Block store error: {0}")]
    Store(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Not representable: {0}")]
    NotRepresentable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Plugin {plugin} failed: {message}")]
    PluginFatal {
        plugin: String,
        message: String,
        response: Option<Box<GatewayResponse>>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl GatewayError {
    /// Stable kebab-case name of the error kind, used in error bodies and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidResource(_) => "invalid-resource",
            GatewayError::InvalidRange(_) => "invalid-range",
            GatewayError::UnsatisfiableRange { .. } => "unsatisfiable-range",
            GatewayError::PathNotFound { .. } => "path-not-found",
            GatewayError::MalformedPath(_) => "malformed-path",
            GatewayError::RecordNotFound(_) => "record-not-found",
            GatewayError::NameResolution(_) => "name-resolution",
            GatewayError::Aborted(_) => "aborted",
            GatewayError::UpstreamTimeout(_) => "upstream-timeout",
            GatewayError::UpstreamUnavailable(_) => "upstream-unavailable",
            GatewayError::ContentUnavailableOffline(_) => "content-unavailable-offline",
            GatewayError::Store(_) => "store",
            GatewayError::Codec(_) => "codec",
            GatewayError::NotRepresentable(_) => "not-representable",
            GatewayError::BadRequest(_) => "bad-request",
            GatewayError::PluginFatal { .. } => "plugin-fatal",
            GatewayError::Config(_) => "config",
            GatewayError::Io(_) => "io",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Whether this error is a cancellation.
    ///
    /// Cancellations are never converted into content-layer failures; callers
    /// that catch errors generically must check this first and re-raise.
    pub fn is_aborted(&self) -> bool {
        matches!(self, GatewayError::Aborted(_))
    }

    /// Determine if this error should trigger a retry against an upstream
    ///
    /// Timeouts, connection failures and generic store errors are transient.
    /// Everything else is a property of the request or the content and will
    /// not change by asking again.
    pub fn should_retry(&self) -> bool {
        match self {
            GatewayError::UpstreamTimeout(_) => true,
            GatewayError::UpstreamUnavailable(_) => true,
            GatewayError::Io(_) => true,

            // A block that failed verification may come back intact from a retry
            GatewayError::Store(_) => true,

            GatewayError::Aborted(_) => false,
            GatewayError::ContentUnavailableOffline(_) => false,
            GatewayError::PathNotFound { .. } => false,
            GatewayError::RecordNotFound(_) => false,
            _ => false,
        }
    }

    /// Convert error to HTTP status code
    ///
    /// Maps internal errors to the status codes the gateway exposes:
    /// - Malformed input: 400
    /// - Missing paths and records: 404
    /// - No acceptable representation: 406
    /// - Range errors: 416
    /// - Upstream failures: 502, timeouts 504
    /// - Other errors: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidResource(_) => 400,
            GatewayError::BadRequest(_) => 400,

            GatewayError::PathNotFound { .. } => 404,
            GatewayError::MalformedPath(_) => 404,
            GatewayError::RecordNotFound(_) => 404,

            GatewayError::NotRepresentable(_) => 406,

            GatewayError::InvalidRange(_) => 416,
            GatewayError::UnsatisfiableRange { .. } => 416,

            // Client went away; only the HTTP server ever renders this
            GatewayError::Aborted(_) => 499,

            GatewayError::UpstreamUnavailable(_) => 502,
            GatewayError::ContentUnavailableOffline(_) => 502,
            GatewayError::Store(_) => 502,
            GatewayError::Codec(_) => 502,
            GatewayError::NameResolution(_) => 502,

            GatewayError::UpstreamTimeout(_) => 504,

            GatewayError::PluginFatal { .. } => 500,
            GatewayError::Config(_) => 500,
            GatewayError::Io(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Create an Aborted error for the given stage
    pub fn aborted(stage: impl Into<String>) -> Self {
        GatewayError::Aborted(AbortDiagnostics::at(stage))
    }

    /// Create a PathNotFound error
    pub fn path_not_found(path: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::PathNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a PluginFatal error, optionally carrying a pre-built response
    pub fn plugin_fatal(
        plugin: impl Into<String>,
        message: impl Into<String>,
        response: Option<GatewayResponse>,
    ) -> Self {
        GatewayError::PluginFatal {
            plugin: plugin.into(),
            message: message.into(),
            response: response.map(Box::new),
        }
    }

    /// Create an error from an upstream HTTP status code
    ///
    /// 404/410 mean the upstream does not have the content, 408/429/5xx are
    /// transient unavailability, 504 is a timeout.
    pub fn from_upstream_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            504 | 408 => GatewayError::UpstreamTimeout(format!("HTTP {}: {}", status, message)),
            429 | 500..=599 => {
                GatewayError::UpstreamUnavailable(format!("HTTP {}: {}", status, message))
            }
            _ => GatewayError::Store(format!("HTTP {}: {}", status, message)),
        }
    }
}
