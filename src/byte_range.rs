//! Byte-range context for partial content responses
//!
//! A `ByteRangeContext` is built from the request's `Range` header before any
//! content is fetched. It classifies the header immediately, so an invalid
//! header can short-circuit to 416, and later, once a body and its total size
//! are attached, computes the effective window and frames the response body.
//!
//! Only single ranges are accepted: `bytes=<start>-<end>`, `bytes=<start>-`
//! and `bytes=-<suffix>`.

use crate::error::{GatewayError, Result};
use crate::response::{content_range, BodyStream, ResponseBody};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::debug;

/// A syntactically valid single range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=<start>-<end>`
    Bounded { start: u64, end: u64 },
    /// `bytes=<start>-`
    From { start: u64 },
    /// `bytes=-<suffix>`
    Suffix { length: u64 },
}

impl RangeSpec {
    /// Parse a `Range` header value
    ///
    /// # Returns
    /// * `Ok(RangeSpec)` for a single well-formed range
    /// * `Err(GatewayError::InvalidRange)` for multi-range lists, non-numeric
    ///   bounds, `start > end` or an empty suffix
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| GatewayError::InvalidRange(format!("unsupported unit in '{}'", header)))?;

        if spec.contains(',') {
            return Err(GatewayError::InvalidRange(format!(
                "multiple ranges are not supported: '{}'",
                header
            )));
        }

        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| GatewayError::InvalidRange(format!("missing '-' in '{}'", header)))?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(GatewayError::InvalidRange(format!(
                "empty range in '{}'",
                header
            ))),
            (true, false) => {
                let length = parse_bound(end, header)?;
                if length == 0 {
                    return Err(GatewayError::InvalidRange(format!(
                        "zero-length suffix in '{}'",
                        header
                    )));
                }
                Ok(RangeSpec::Suffix { length })
            }
            (false, true) => Ok(RangeSpec::From {
                start: parse_bound(start, header)?,
            }),
            (false, false) => {
                let start = parse_bound(start, header)?;
                let end = parse_bound(end, header)?;
                if start > end {
                    return Err(GatewayError::InvalidRange(format!(
                        "start {} is after end {}",
                        start, end
                    )));
                }
                Ok(RangeSpec::Bounded { start, end })
            }
        }
    }

    /// Resolve against a known total size into `(offset, length)`
    ///
    /// The end of a bounded range is clamped to the last byte; a suffix longer
    /// than the content selects the whole content. A start at or past the end
    /// (or any range over empty content) is unsatisfiable.
    pub fn window(&self, total_size: u64) -> Result<(u64, u64)> {
        let unsatisfiable = || GatewayError::UnsatisfiableRange {
            total_size: Some(total_size),
        };

        if total_size == 0 {
            return Err(unsatisfiable());
        }

        match *self {
            RangeSpec::Bounded { start, end } => {
                if start >= total_size {
                    return Err(unsatisfiable());
                }
                let end = end.min(total_size - 1);
                Ok((start, end - start + 1))
            }
            RangeSpec::From { start } => {
                if start >= total_size {
                    return Err(unsatisfiable());
                }
                Ok((start, total_size - start))
            }
            RangeSpec::Suffix { length } => {
                let length = length.min(total_size);
                Ok((total_size - length, length))
            }
        }
    }
}

fn parse_bound(value: &str, header: &str) -> Result<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::InvalidRange(format!(
            "non-numeric bound '{}' in '{}'",
            value, header
        )));
    }
    value
        .parse::<u64>()
        .map_err(|_| GatewayError::InvalidRange(format!("bound out of range in '{}'", header)))
}

/// Content that can produce an arbitrary byte window of itself on demand
///
/// Implementations should fetch only what the window needs.
pub trait RangeSource: Send {
    /// Stream `length` bytes starting at `offset`
    fn read_window(self: Box<Self>, offset: u64, length: u64) -> BodyStream;
}

/// A body handed to the range context
pub enum RangeBody {
    /// Fully materialised content
    Bytes(Bytes),
    /// Content of known size that can be windowed lazily
    Sized {
        total_size: u64,
        source: Box<dyn RangeSource>,
    },
    /// A stream whose size is not known up front
    Unsized(BodyStream),
}

/// Body framing decided by the range context
#[derive(Debug)]
pub struct FramedBody {
    pub status: StatusCode,
    pub content_range: Option<String>,
    pub content_length: Option<u64>,
    /// Inclusive window actually served, for range-qualified ETags
    pub window: Option<(u64, u64)>,
    pub body: ResponseBody,
}

/// Per-request range state
#[derive(Debug, Clone, Default)]
pub struct ByteRangeContext {
    header: Option<String>,
    spec: Option<RangeSpec>,
    invalid_reason: Option<String>,
    total_size: Option<u64>,
    offset: Option<u64>,
    length: Option<u64>,
}

impl ByteRangeContext {
    /// Classify the `Range` header of a request
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = headers
            .get(http::header::RANGE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        Self::new(header.as_deref())
    }

    /// Classify a raw `Range` header value (`None` when absent)
    pub fn new(header: Option<&str>) -> Self {
        let mut context = ByteRangeContext {
            header: header.map(str::to_string),
            ..Default::default()
        };

        if let Some(value) = header {
            match RangeSpec::parse(value) {
                Ok(spec) => context.spec = Some(spec),
                Err(e) => {
                    debug!("Rejecting range header: value={}, error={}", value, e);
                    context.invalid_reason = Some(e.to_string());
                }
            }
        }

        context
    }

    pub fn is_range_request(&self) -> bool {
        self.header.is_some()
    }

    pub fn is_valid_range_request(&self) -> bool {
        self.spec.is_some()
    }

    pub fn spec(&self) -> Option<RangeSpec> {
        self.spec
    }

    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Start offset, once a sized body has been attached
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Window length, once a sized body has been attached
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn suffix_length(&self) -> Option<u64> {
        match self.spec {
            Some(RangeSpec::Suffix { length }) => Some(length),
            _ => None,
        }
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// The error to short-circuit with when the header did not parse
    pub fn validation_error(&self) -> Option<GatewayError> {
        self.invalid_reason
            .as_ref()
            .map(|reason| GatewayError::InvalidRange(reason.clone()))
    }

    /// Attach the body, fix the total size and frame the response
    ///
    /// # Returns
    /// * 200 with the whole body when no range was requested, or when the
    ///   body's size cannot be known
    /// * 206 with the windowed body and `Content-Range` otherwise
    /// * `Err(UnsatisfiableRange)` when the window falls outside the content
    /// * `Err(InvalidRange)` when the header never parsed
    pub fn set_body(&mut self, body: RangeBody) -> Result<FramedBody> {
        if let Some(err) = self.validation_error() {
            return Err(err);
        }

        let total_size = match &body {
            RangeBody::Bytes(bytes) => Some(bytes.len() as u64),
            RangeBody::Sized { total_size, .. } => Some(*total_size),
            RangeBody::Unsized(_) => None,
        };
        self.total_size = total_size;

        let (spec, total) = match (self.spec, total_size) {
            (Some(spec), Some(total)) => (spec, total),
            _ => return Ok(Self::full(body, total_size)),
        };

        let (offset, length) = spec.window(total)?;
        self.offset = Some(offset);
        self.length = Some(length);
        let end = offset + length - 1;

        debug!(
            "Serving partial content: range={}-{}, total_size={}",
            offset, end, total
        );

        let body = match body {
            RangeBody::Bytes(bytes) => {
                ResponseBody::Full(bytes.slice(offset as usize..(end + 1) as usize))
            }
            RangeBody::Sized { source, .. } => {
                ResponseBody::Stream(source.read_window(offset, length))
            }
            RangeBody::Unsized(stream) => ResponseBody::Stream(stream),
        };

        Ok(FramedBody {
            status: StatusCode::PARTIAL_CONTENT,
            content_range: Some(content_range(offset, end, total)),
            content_length: Some(length),
            window: Some((offset, end)),
            body,
        })
    }

    fn full(body: RangeBody, total_size: Option<u64>) -> FramedBody {
        let body = match body {
            RangeBody::Bytes(bytes) => ResponseBody::Full(bytes),
            RangeBody::Sized { total_size, source } => {
                ResponseBody::Stream(source.read_window(0, total_size))
            }
            RangeBody::Unsized(stream) => ResponseBody::Stream(stream),
        };
        FramedBody {
            status: StatusCode::OK,
            content_range: None,
            content_length: total_size,
            window: None,
            body,
        }
    }
}
