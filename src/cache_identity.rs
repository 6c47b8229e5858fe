//! Cache identity: `ETag` and `Cache-Control` derivation
//!
//! ETags have the shape `{W/}"{prefix}{cid}{.format}{.start-end}"`. Format and
//! range suffixes keep distinct representations of one identifier apart in
//! shared caches.

use crate::models::{MutableName, ReqFormat};
use libipld::Cid;
use std::time::Duration;

/// Inputs to an ETag besides the identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtagOptions {
    pub format: Option<ReqFormat>,
    pub weak: bool,
    /// Inclusive byte window served
    pub range: Option<(u64, u64)>,
    /// Prefix identifying generated content (e.g. directory listings)
    pub content_prefix: Option<String>,
}

/// Build an ETag for `cid`
pub fn etag(cid: &Cid, options: &EtagOptions) -> String {
    let mut tag = String::new();
    if options.weak {
        tag.push_str("W/");
    }
    tag.push('"');
    if let Some(prefix) = &options.content_prefix {
        tag.push_str(prefix);
    }
    tag.push_str(&cid.to_string());
    if let Some(format) = options.format {
        tag.push('.');
        tag.push_str(format.etag_suffix());
    }
    if let Some((start, end)) = options.range {
        tag.push_str(&format!(".{}-{}", start, end));
    }
    tag.push('"');
    tag
}

/// Whether a representation must be weak-quoted
///
/// Strong ETags are reserved for content reached by hash and rendered in a
/// byte-deterministic format. Archive exports, block/record exports,
/// generated pages and anything reached through a mutable name are weak.
pub fn is_weak(format: Option<ReqFormat>, mutable: bool, generated: bool) -> bool {
    if mutable || generated {
        return true;
    }
    matches!(
        format,
        Some(ReqFormat::Car | ReqFormat::Tar | ReqFormat::Raw | ReqFormat::IpnsRecord)
    )
}

/// Weak comparison of an `If-None-Match` header against an ETag
pub fn if_none_match(header: &str, etag: &str) -> bool {
    let strip = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let wanted = strip(etag);
    header.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || strip(candidate) == wanted
    })
}

/// Cache-Control policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub immutable_max_age: Duration,
    pub default_mutable_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            immutable_max_age: Duration::from_secs(2 * 365 * 24 * 60 * 60),
            default_mutable_ttl: Duration::from_secs(300),
        }
    }
}

impl CachePolicy {
    pub fn new(immutable_max_age: Duration, default_mutable_ttl: Duration) -> Self {
        CachePolicy {
            immutable_max_age,
            default_mutable_ttl,
        }
    }

    /// `Cache-Control` for a resolution; `None` means direct hash addressing
    pub fn cache_control(&self, mutable: Option<&MutableName>) -> String {
        match mutable {
            None => format!(
                "public, max-age={}, immutable",
                self.immutable_max_age.as_secs()
            ),
            Some(name) => {
                let ttl = name.ttl.unwrap_or(self.default_mutable_ttl);
                format!("public, max-age={}", ttl.as_secs())
            }
        }
    }
}
