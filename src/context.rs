//! Per-request state threaded through the plugin pipeline

use crate::accept::{AcceptSpec, CarOptions, DagScope, Negotiation};
use crate::byte_range::{ByteRangeContext, RangeBody};
use crate::cache_identity::CachePolicy;
use crate::codec::CodecRegistry;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::models::{ParsedResource, PathWalkResult, QueryOptions, ReqFormat, StageTiming};
use crate::name_resolver::{NameResolver, ResolveOptions};
use crate::response::{GatewayResponse, ResponseBody};
use crate::store::{BlockFetcher, BlockStore};
use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use libipld::Cid;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every request
pub struct GatewayServices {
    pub store: Arc<dyn BlockStore>,
    pub resolver: Arc<dyn NameResolver>,
    pub codecs: CodecRegistry,
    pub config: GatewayConfig,
    pub cache_policy: CachePolicy,
}

/// Caller-supplied request options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    /// Fires when the caller no longer wants the response
    pub cancel: CancellationToken,
    /// Open a store session for the request's fetches
    pub session: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            method: Method::GET,
            headers: HeaderMap::new(),
            cancel: CancellationToken::new(),
            session: true,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn head() -> Self {
        RequestOptions {
            method: Method::HEAD,
            ..Self::default()
        }
    }

    /// Add a request header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_session(mut self, session: bool) -> Self {
        self.session = session;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// Hints from the rendering plugin to the cache-identity stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHints {
    /// The body was generated rather than read from a block
    pub generated: bool,
    /// Prefix placed before the identifier inside the ETag
    pub content_prefix: Option<String>,
}

/// The unit of work for one request
///
/// Owned by the orchestrator and passed by `&mut` to each plugin in turn.
/// Late-bound state lives in explicit `Option` slots.
pub struct RequestContext {
    /// Resource as the caller supplied it
    pub resource: String,
    /// Parsed and resolved resource
    pub parsed: ParsedResource,
    /// Root identifier before walking
    pub cid: Cid,
    /// Remaining path below `cid`
    pub path: String,
    pub query: QueryOptions,
    /// Constraint on the final content type when no format was negotiated
    pub accept: AcceptSpec,
    pub req_format: Option<ReqFormat>,
    pub car: CarOptions,
    pub dag_scope: DagScope,
    pub options: RequestOptions,
    /// Set once by the path-walking plugin
    pub path_details: Option<PathWalkResult>,
    /// Set once by the range plugin
    pub byte_range_context: Option<ByteRangeContext>,
    /// A UnixFS directory without `index.html` needs a generated listing
    pub needs_dir_index: bool,
    pub cache_hints: CacheHints,
    /// Inclusive byte window the response body covers, when partial
    pub served_window: Option<(u64, u64)>,
    /// Plugin that produced the response
    pub handled_by: Option<String>,
    /// Bumped by every plugin that changes the context; diagnostics only
    pub modified: u64,
    pub timings: Vec<StageTiming>,
    services: Arc<GatewayServices>,
    fetcher: BlockFetcher,
    started: Instant,
}

impl RequestContext {
    pub fn new(
        resource: String,
        parsed: ParsedResource,
        negotiation: Negotiation,
        options: RequestOptions,
        services: Arc<GatewayServices>,
        fetcher: BlockFetcher,
        started: Instant,
    ) -> Self {
        RequestContext {
            resource,
            cid: parsed.cid,
            path: parsed.path.clone(),
            query: parsed.query.clone(),
            parsed,
            accept: negotiation.accept,
            req_format: negotiation.req_format,
            car: negotiation.car,
            dag_scope: negotiation.dag_scope,
            options,
            path_details: None,
            byte_range_context: None,
            needs_dir_index: false,
            cache_hints: CacheHints::default(),
            served_window: None,
            handled_by: None,
            modified: 0,
            timings: Vec::new(),
            services,
            fetcher,
            started,
        }
    }

    pub fn services(&self) -> &GatewayServices {
        &self.services
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.services.codecs
    }

    pub fn resolver(&self) -> &Arc<dyn NameResolver> {
        &self.services.resolver
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.services.config
    }

    /// Fetcher bound to this request's cancellation, session and permits
    pub fn fetcher(&self) -> &BlockFetcher {
        &self.fetcher
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.options.cancel
    }

    /// Fetch a block on behalf of this request
    pub async fn fetch_block(&self, cid: &Cid) -> Result<Bytes> {
        self.fetcher.get(cid).await
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            cancel: self.options.cancel.clone(),
            nocache: false,
        }
    }

    pub fn mark_modified(&mut self) {
        self.modified += 1;
    }

    pub fn record_timing(&mut self, name: &str, duration: Duration) {
        self.timings.push(StageTiming::new(name, duration));
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Identifier the response describes: the terminal node once walked
    pub fn terminal_cid(&self) -> Cid {
        self.path_details
            .as_ref()
            .map(|details| details.terminal.cid)
            .unwrap_or(self.cid)
    }

    /// Last path segment, used for content-type lookup and download names
    pub fn filename_hint(&self) -> Option<&str> {
        self.query
            .filename
            .as_deref()
            .or_else(|| self.parsed.graph_path.segments().last().map(String::as_str))
    }

    /// Frame a body through the range context and build the response
    ///
    /// # Returns
    /// * 200 or 206 response carrying `Content-Type`, and `Content-Length`
    ///   and `Accept-Ranges` when the size is known
    /// * `Err(UnsatisfiableRange)` / `Err(InvalidRange)` from the range context
    pub fn respond(&mut self, body: RangeBody, content_type: &str) -> Result<GatewayResponse> {
        let ranges = self
            .byte_range_context
            .get_or_insert_with(|| ByteRangeContext::from_headers(&self.options.headers));
        let framed = ranges.set_body(body)?;
        self.served_window = framed.window;

        let mut response = GatewayResponse::new(framed.status);
        response.set_header(CONTENT_TYPE, content_type)?;
        if let Some(length) = framed.content_length {
            response.set_header(CONTENT_LENGTH, &length.to_string())?;
            response.set_header(ACCEPT_RANGES, "bytes")?;
        }
        if let Some(range) = &framed.content_range {
            response.set_header(CONTENT_RANGE, range)?;
        }
        response.body = framed.body;
        Ok(response)
    }

    /// Respond with an in-memory body
    pub fn respond_bytes(&mut self, body: Bytes, content_type: &str) -> Result<GatewayResponse> {
        self.respond(RangeBody::Bytes(body), content_type)
    }

    /// Respond with a stream of unknown length; ranges are ignored
    pub fn respond_stream(
        &mut self,
        body: crate::response::BodyStream,
        content_type: &str,
    ) -> Result<GatewayResponse> {
        let mut response = GatewayResponse::new(http::StatusCode::OK);
        response.set_header(CONTENT_TYPE, content_type)?;
        response.body = ResponseBody::Stream(body);
        Ok(response)
    }
}
