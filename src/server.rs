//! HTTP/1.1 front end
//!
//! Serves the gateway for path (`/ipfs/<cid>/...`) and subdomain
//! (`<cid>.ipfs.<host>`) requests, plus `/metrics` and `/health`.
//! A client that disconnects cancels its request: the cancellation token is
//! guarded by the request future and then by the streamed body.

use crate::context::RequestOptions;
use crate::gateway::Gateway;
use crate::response::GatewayResponse;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

pub type ServerBody = UnsyncBoxBody<Bytes, io::Error>;

/// Status reported when the client went away before the response was ready
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Gateway HTTP server
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>, addr: SocketAddr) -> Self {
        Self { gateway, addr }
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Gateway listening on http://{}", listener.local_addr()?);
        serve(listener, self.gateway).await
    }
}

/// Accept connections on `listener` forever
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(handle_request(req, gateway).await) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: peer={}, error={:?}", peer, err);
            }
        });
    }
}

/// Route one request; the request body is never read
pub async fn handle_request<B>(req: Request<B>, gateway: Arc<Gateway>) -> Response<ServerBody> {
    match req.uri().path() {
        "/metrics" => metrics_response(&gateway),
        "/health" => text_response(StatusCode::OK, "text/plain", "OK"),
        _ => gateway_response(req, gateway).await,
    }
}

async fn gateway_response<B>(req: Request<B>, gateway: Arc<Gateway>) -> Response<ServerBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "only GET and HEAD are supported",
        );
    }

    let resource = request_url(&req, &gateway.config().listen_address);
    let cancel = CancellationToken::new();
    let options = RequestOptions {
        method: req.method().clone(),
        headers: req.headers().clone(),
        cancel: cancel.clone(),
        session: true,
    };

    // cancels the request if this future is dropped before it completes
    let guard = cancel.drop_guard();

    match gateway.fetch(resource.as_str(), options).await {
        Ok(response) => into_http(response, guard),
        Err(err) => {
            debug!("Request ended without a response: resource={}, error={}", resource, err);
            let body = GatewayResponse::from_error(&err, Some(resource.as_str()));
            let mut response = into_http(body, guard);
            *response.status_mut() = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            response
        }
    }
}

/// `http://<Host><path-and-query>` for the request
fn request_url<B>(req: &Request<B>, fallback_host: &str) -> String {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or(fallback_host);
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{}{}", host, path)
}

/// Convert a gateway response, keeping `guard` alive as long as the body
fn into_http(response: GatewayResponse, guard: DropGuard) -> Response<ServerBody> {
    let stream = response.body.into_stream().map(move |chunk| {
        let _ = &guard;
        chunk
            .map(Frame::data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    });
    let mut http_response = Response::new(StreamBody::new(stream).boxed_unsync());
    *http_response.status_mut() = response.status;
    *http_response.headers_mut() = response.headers;
    http_response
}

fn metrics_response(gateway: &Gateway) -> Response<ServerBody> {
    match gateway.metrics().map(|m| m.render()) {
        Some(Ok(body)) => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            body,
        ),
        Some(Err(err)) => {
            error!("Failed to render metrics: {}", err);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable")
        }
        None => text_response(StatusCode::NOT_FOUND, "text/plain", "metrics disabled"),
    }
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<ServerBody> {
    let body = Full::new(body.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::store::MemoryBlockStore;

    fn gateway(store: Arc<MemoryBlockStore>) -> Arc<Gateway> {
        Arc::new(
            Gateway::builder(GatewayConfig::offline())
                .with_store(store)
                .build()
                .unwrap(),
        )
    }

    async fn body_bytes(response: Response<ServerBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_request_url_uses_host_header() {
        let req = Request::builder()
            .uri("/ipfs/bafy/a.txt?format=raw")
            .header(HOST, "bafy.ipfs.localhost:8080")
            .body(())
            .unwrap();
        assert_eq!(
            request_url(&req, "127.0.0.1:8080"),
            "http://bafy.ipfs.localhost:8080/ipfs/bafy/a.txt?format=raw"
        );
    }

    #[tokio::test]
    async fn test_path_request_is_served() {
        let store = Arc::new(MemoryBlockStore::new());
        let cid = store.put(&b"hello gateway"[..], crate::models::codecs::RAW);
        let req = Request::builder()
            .uri(format!("/ipfs/{}", cid))
            .header(HOST, "localhost")
            .body(())
            .unwrap();

        let response = handle_request(req, gateway(store)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], b"hello gateway");
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let gateway = gateway(Arc::new(MemoryBlockStore::new()));
        let health = handle_request(Request::get("/health").body(()).unwrap(), gateway.clone()).await;
        assert_eq!(health.status(), StatusCode::OK);

        let metrics = handle_request(Request::get("/metrics").body(()).unwrap(), gateway).await;
        assert_eq!(metrics.status(), StatusCode::OK);
        assert_eq!(
            metrics.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_rejects_other_methods() {
        let gateway = gateway(Arc::new(MemoryBlockStore::new()));
        let req = Request::post("/ipfs/bafy").body(()).unwrap();
        let response = handle_request(req, gateway).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
