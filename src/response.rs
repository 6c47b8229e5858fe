//! Response type produced by the gateway and helpers for assembling headers

use crate::error::{GatewayError, Result};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::fmt;
use std::pin::Pin;

/// A pull-based body stream; bytes are produced only when polled
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Body of a gateway response
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    /// Length of the body when it is known without consuming it
    pub fn known_len(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Full(bytes) => Some(bytes.len() as u64),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Drain the body into memory
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Turn the body into a stream regardless of its shape
    pub fn into_stream(self) -> BodyStream {
        match self {
            ResponseBody::Empty => Box::pin(futures::stream::empty()),
            ResponseBody::Full(bytes) => Box::pin(futures::stream::once(async move { Ok(bytes) })),
            ResponseBody::Stream(stream) => stream,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// An HTTP-shaped response produced by the pipeline
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl GatewayResponse {
    /// Create an empty response with the given status
    pub fn new(status: StatusCode) -> Self {
        GatewayResponse {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// 200 response with an in-memory body and content type
    pub fn full(body: impl Into<Bytes>, content_type: &str) -> Result<Self> {
        let body = body.into();
        let mut response = GatewayResponse::new(StatusCode::OK);
        response.set_header(CONTENT_TYPE, content_type)?;
        response.set_header(CONTENT_LENGTH, &body.len().to_string())?;
        response.body = ResponseBody::Full(body);
        Ok(response)
    }

    /// 200 response with a streamed body of unknown length
    pub fn stream(body: BodyStream, content_type: &str) -> Result<Self> {
        let mut response = GatewayResponse::new(StatusCode::OK);
        response.set_header(CONTENT_TYPE, content_type)?;
        response.body = ResponseBody::Stream(body);
        Ok(response)
    }

    /// Set (replace) a header
    pub fn set_header<K>(&mut self, name: K, value: &str) -> Result<()>
    where
        K: TryInto<HeaderName>,
        K::Error: fmt::Display,
    {
        let name = name
            .try_into()
            .map_err(|e| GatewayError::Internal(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Internal(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Drop the body, keeping status and headers (HEAD, 304)
    pub fn without_body(mut self) -> Self {
        self.body = ResponseBody::Empty;
        self
    }

    /// Collect the body into memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        self.body.collect().await
    }

    /// Build a JSON error body describing `err`
    ///
    /// # Arguments
    /// * `err` - The error to describe
    /// * `resource` - The offending resource, when known
    pub fn from_error(err: &GatewayError, resource: Option<&str>) -> Self {
        let status = StatusCode::from_u16(err.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": err.kind(),
            "message": err.to_string(),
            "resource": resource,
        });
        let body = Bytes::from(body.to_string());

        let mut response = GatewayResponse::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        if let GatewayError::UnsatisfiableRange {
            total_size: Some(total),
        } = err
        {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                response.headers.insert(http::header::CONTENT_RANGE, value);
            }
        }
        response.body = ResponseBody::Full(body);
        response
    }
}

/// `Content-Range` value for an inclusive window
pub fn content_range(start: u64, end: u64, total: u64) -> String {
    format!("bytes {}-{}/{}", start, end, total)
}

/// `Content-Disposition` value
///
/// ASCII-only names are quoted directly; anything else gets an ASCII fallback
/// plus an RFC 5987 `filename*` parameter.
pub fn content_disposition(attachment: bool, filename: &str) -> String {
    let kind = if attachment { "attachment" } else { "inline" };
    let is_plain = filename
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\');

    if is_plain {
        format!("{}; filename=\"{}\"", kind, filename)
    } else {
        let fallback: String = filename
            .chars()
            .map(|c| {
                if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!(
            "{}; filename=\"{}\"; filename*=UTF-8''{}",
            kind,
            fallback,
            urlencoding::encode(filename)
        )
    }
}
