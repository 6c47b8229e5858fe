//! Resource parser
//!
//! Turns the resource strings a client can send into a canonical `/ipfs/`
//! path. Accepted shapes:
//!
//! * a bare content identifier, optionally followed by `/path`
//! * `ipfs://<cid>[/path]` and `ipns://<name>[/path]`
//! * `http(s)://host/ipfs/<cid>[/path]` and `http(s)://host/ipns/<name>[/path]`
//! * `http(s)://<cid>.ipfs.<host>[/path]` and `http(s)://<name>.ipns.<host>[/path]`
//! * `/ipfs/<cid>[/path]` and `/ipns/<name>[/path]`
//!
//! Mutable names are resolved through a `NameResolver`, recursively, before
//! the canonical path is produced.

use crate::error::{GatewayError, Result};
use crate::models::{GraphPath, MutableName, ParsedResource, Protocol, QueryOptions};
use crate::name_resolver::{NameResolver, ResolveOptions};
use libipld::Cid;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Maximum chain of names resolving to other names
const MAX_RESOLVE_DEPTH: usize = 32;

/// What a caller hands to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Cid(Cid),
    Text(String),
}

impl From<Cid> for Resource {
    fn from(cid: Cid) -> Self {
        Resource::Cid(cid)
    }
}

impl From<&Cid> for Resource {
    fn from(cid: &Cid) -> Self {
        Resource::Cid(*cid)
    }
}

impl From<&str> for Resource {
    fn from(text: &str) -> Self {
        Resource::Text(text.to_string())
    }
}

impl From<String> for Resource {
    fn from(text: String) -> Self {
        Resource::Text(text)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Cid(cid) => write!(f, "{}", cid),
            Resource::Text(text) => f.write_str(text),
        }
    }
}

/// A resource split into its addressing parts, before any resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    pub protocol: Protocol,
    /// Content identifier (`/ipfs/`) or name (`/ipns/`)
    pub id: String,
    /// Decoded path segments; empty segments are dropped
    pub segments: Vec<String>,
    pub trailing_slash: bool,
    pub query: QueryOptions,
}

impl RawResource {
    /// Path as requested, `/ipfs/...` or `/ipns/...`
    pub fn requested_path(&self) -> String {
        join_path(self.protocol.as_str(), &self.id, &self.segments, self.trailing_slash)
    }
}

fn join_path(protocol: &str, id: &str, segments: &[String], trailing_slash: bool) -> String {
    let mut out = format!("/{}/{}", protocol, id);
    for segment in segments {
        out.push('/');
        out.push_str(&urlencoding::encode(segment));
    }
    if trailing_slash {
        out.push('/');
    }
    out
}

/// Split a resource string into its addressing parts
///
/// Pure syntax: nothing is resolved and identifiers are not validated here.
pub fn split_resource(resource: &str) -> Result<RawResource> {
    let invalid = || GatewayError::InvalidResource(resource.to_string());

    let trimmed = resource.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return split_http(trimmed).ok_or_else(invalid);
    }

    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let (protocol, rest) = if let Some(rest) = strip_prefix_ci(path, "ipfs://") {
        (Protocol::Ipfs, rest)
    } else if let Some(rest) = strip_prefix_ci(path, "ipns://") {
        (Protocol::Ipns, rest)
    } else if let Some(rest) = path.strip_prefix("/ipfs/") {
        (Protocol::Ipfs, rest)
    } else if let Some(rest) = path.strip_prefix("/ipns/") {
        (Protocol::Ipns, rest)
    } else {
        // Bare identifier
        let id = path.split('/').next().unwrap_or_default();
        if Cid::try_from(id).is_err() {
            return Err(invalid());
        }
        (Protocol::Ipfs, path)
    };

    let (id, remainder) = match rest.split_once('/') {
        Some((id, remainder)) => (id, remainder),
        None => (rest, ""),
    };
    if id.is_empty() {
        return Err(invalid());
    }

    let (segments, trailing_slash) = split_segments(remainder)?;
    Ok(RawResource {
        protocol,
        id: id.to_string(),
        segments,
        trailing_slash,
        query: parse_query(query),
    })
}

fn split_http(resource: &str) -> Option<RawResource> {
    let url = Url::parse(resource).ok()?;
    let host = url.host_str()?;
    let query = parse_query(url.query());

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        let protocol = match labels[1] {
            "ipfs" => Some(Protocol::Ipfs),
            "ipns" => Some(Protocol::Ipns),
            _ => None,
        };
        if let Some(protocol) = protocol {
            let id = match protocol {
                Protocol::Ipfs => labels[0].to_string(),
                Protocol::Ipns => decode_dnslink_label(labels[0]),
            };
            let (segments, trailing_slash) = split_segments(url.path()).ok()?;
            return Some(RawResource {
                protocol,
                id,
                segments,
                trailing_slash,
                query,
            });
        }
    }

    let path = url.path();
    let (protocol, rest) = if let Some(rest) = path.strip_prefix("/ipfs/") {
        (Protocol::Ipfs, rest)
    } else if let Some(rest) = path.strip_prefix("/ipns/") {
        (Protocol::Ipns, rest)
    } else {
        return None;
    };

    let (id, remainder) = rest.split_once('/').unwrap_or((rest, ""));
    if id.is_empty() {
        return None;
    }
    let id = urlencoding::decode(id).ok()?.into_owned();
    let (segments, trailing_slash) = split_segments(remainder).ok()?;
    Some(RawResource {
        protocol,
        id,
        segments,
        trailing_slash,
        query,
    })
}

/// Decode a DNSLink name inlined into a single DNS label
///
/// `en-wikipedia--on--ipfs-org` becomes `en.wikipedia-on-ipfs.org`. Labels that
/// already parse as identifiers (key names) are returned unchanged.
pub fn decode_dnslink_label(label: &str) -> String {
    if Cid::try_from(label).is_ok() || !label.contains('-') {
        return label.to_string();
    }
    label
        .split("--")
        .map(|part| part.replace('-', "."))
        .collect::<Vec<_>>()
        .join("-")
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Split and percent-decode a path, collapsing repeated slashes
///
/// A trailing slash is only recorded when at least one segment remains, so
/// `/ipfs/<cid>` and `/ipfs/<cid>/` normalise to the same path.
fn split_segments(path: &str) -> Result<(Vec<String>, bool)> {
    let mut segments = Vec::new();
    for raw in path.split('/').filter(|s| !s.is_empty()) {
        let decoded = urlencoding::decode(raw).map_err(|_| {
            GatewayError::InvalidResource(format!("path segment '{}' is not valid UTF-8", raw))
        })?;
        segments.push(decoded.into_owned());
    }
    let trailing_slash = !segments.is_empty() && path.ends_with('/');
    Ok((segments, trailing_slash))
}

fn parse_query(query: Option<&str>) -> QueryOptions {
    match query {
        Some(query) => QueryOptions::from_pairs(url::form_urlencoded::parse(query.as_bytes())),
        None => QueryOptions::default(),
    }
}

/// Parse a content identifier, mapping failures to `InvalidResource`
pub fn parse_cid(id: &str) -> Result<Cid> {
    Cid::try_from(id)
        .map_err(|e| GatewayError::InvalidResource(format!("'{}' is not a content identifier: {}", id, e)))
}

/// Resolves resource strings into canonical paths
pub struct ResourceParser<'a> {
    resolver: &'a dyn NameResolver,
    timeout: Duration,
}

impl<'a> ResourceParser<'a> {
    /// Create a parser
    ///
    /// # Arguments
    /// * `resolver` - Resolver for mutable names
    /// * `timeout` - Budget for the whole resolution chain of one resource
    pub fn new(resolver: &'a dyn NameResolver, timeout: Duration) -> Self {
        ResourceParser { resolver, timeout }
    }

    /// Parse a resource, resolving any mutable name it contains
    ///
    /// # Returns
    /// * `Ok(ParsedResource)` rooted at a concrete identifier
    /// * `Err(InvalidResource)` when the input matches no accepted shape
    /// * `Err(RecordNotFound)`/`Err(NameResolution)` from the resolver
    /// * `Err(Aborted)` when `options.cancel` fires during resolution
    /// * `Err(UpstreamTimeout)` when resolution exceeds the budget
    pub async fn parse(&self, resource: &Resource, options: &ResolveOptions) -> Result<ParsedResource> {
        let raw = match resource {
            Resource::Cid(cid) => RawResource {
                protocol: Protocol::Ipfs,
                id: cid.to_string(),
                segments: Vec::new(),
                trailing_slash: false,
                query: QueryOptions::default(),
            },
            Resource::Text(text) => split_resource(text)?,
        };
        self.resolve(raw, options).await
    }

    /// Resolve an already split resource
    pub async fn resolve(&self, raw: RawResource, options: &ResolveOptions) -> Result<ParsedResource> {
        let requested_path = raw.requested_path();

        let (cid, segments, mutable) = match raw.protocol {
            Protocol::Ipfs => (parse_cid(&raw.id)?, raw.segments.clone(), None),
            Protocol::Ipns => {
                let resolution = self.resolve_name(&raw.id, options);
                let (cid, mut prefix, ttl) = tokio::select! {
                    biased;
                    _ = options.cancel.cancelled() => return Err(GatewayError::aborted("resolve")),
                    result = tokio::time::timeout(self.timeout, resolution) => match result {
                        Ok(result) => result?,
                        Err(_) => {
                            warn!("Name resolution timed out: name={}, timeout={:?}", raw.id, self.timeout);
                            return Err(GatewayError::UpstreamTimeout(format!(
                                "resolving {} took longer than {:?}",
                                raw.id, self.timeout
                            )));
                        }
                    },
                };
                prefix.extend(raw.segments.iter().cloned());
                let mutable = MutableName {
                    name: raw.id.clone(),
                    ttl,
                };
                (cid, prefix, Some(mutable))
            }
        };

        let graph_path = GraphPath::new(cid, segments.clone(), raw.trailing_slash, mutable.is_some());
        let ipfs_path = graph_path.to_ipfs_path();

        debug!(
            "Parsed resource: requested={}, ipfs_path={}, mutable={}",
            requested_path,
            ipfs_path,
            mutable.is_some()
        );

        Ok(ParsedResource {
            cid,
            path: segments.join("/"),
            query: raw.query,
            ipfs_path,
            requested_path,
            protocol: raw.protocol,
            mutable,
            graph_path,
        })
    }

    /// Follow a name until it lands on `/ipfs/`
    ///
    /// # Returns
    /// The root identifier, the path segments accumulated from every hop, and
    /// the shortest TTL seen along the chain
    async fn resolve_name(
        &self,
        name: &str,
        options: &ResolveOptions,
    ) -> Result<(Cid, Vec<String>, Option<Duration>)> {
        let mut current = name.to_string();
        let mut suffix: Vec<Vec<String>> = Vec::new();
        let mut ttl: Option<Duration> = None;

        for _ in 0..MAX_RESOLVE_DEPTH {
            let resolved = self.resolver.resolve(&current, options).await?;
            debug!(
                "Resolved name: name={}, path={}, ttl={:?}",
                current, resolved.path, resolved.ttl
            );
            if let Some(record_ttl) = resolved.ttl {
                ttl = Some(ttl.map_or(record_ttl, |t| t.min(record_ttl)));
            }

            let target = split_resource(&resolved.path).map_err(|_| {
                GatewayError::NameResolution(format!(
                    "{} resolved to an unusable path '{}'",
                    current, resolved.path
                ))
            })?;
            suffix.push(target.segments);

            match target.protocol {
                Protocol::Ipfs => {
                    let cid = parse_cid(&target.id).map_err(|_| {
                        GatewayError::NameResolution(format!(
                            "{} resolved to an invalid identifier '{}'",
                            current, target.id
                        ))
                    })?;
                    // Innermost hop's path comes first
                    let segments = suffix.into_iter().rev().flatten().collect();
                    return Ok((cid, segments, ttl));
                }
                Protocol::Ipns => current = target.id,
            }
        }

        Err(GatewayError::NameResolution(format!(
            "{} did not resolve within {} hops",
            name, MAX_RESOLVE_DEPTH
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::codecs;
    use crate::name_resolver::StaticNameResolver;
    use crate::store::cid_for;

    fn cid() -> Cid {
        cid_for(b"resource", codecs::RAW)
    }

    #[test]
    fn test_split_shapes_agree() {
        let id = cid().to_string();
        let shapes = [
            id.clone(),
            format!("ipfs://{}", id),
            format!("http://example.com/ipfs/{}", id),
            format!("https://{}.ipfs.example.com", id),
            format!("/ipfs/{}", id),
        ];
        for shape in shapes {
            let raw = split_resource(&shape).unwrap();
            assert_eq!(raw.protocol, Protocol::Ipfs, "{}", shape);
            assert_eq!(raw.id, id, "{}", shape);
            assert!(raw.segments.is_empty(), "{}", shape);
            assert!(!raw.trailing_slash, "{}", shape);
        }
    }

    #[test]
    fn test_split_path_and_query() {
        let id = cid().to_string();
        let raw = split_resource(&format!("ipfs://{}//a%20b///c/?format=car&foo=1#frag", id)).unwrap();
        assert_eq!(raw.segments, vec!["a b".to_string(), "c".to_string()]);
        assert!(raw.trailing_slash);
        assert_eq!(raw.query.format.as_deref(), Some("car"));
        assert_eq!(raw.query.passthrough.get("foo").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_split_rejects_unknown_shapes() {
        assert!(split_resource("").is_err());
        assert!(split_resource("not-a-cid").is_err());
        assert!(split_resource("http://example.com/other/path").is_err());
        assert!(split_resource("ipfs://").is_err());
    }

    #[test]
    fn test_dnslink_label_decoding() {
        assert_eq!(
            decode_dnslink_label("en-wikipedia--on--ipfs-org"),
            "en.wikipedia-on-ipfs.org"
        );
        assert_eq!(decode_dnslink_label("example"), "example");
    }

    #[tokio::test]
    async fn test_parse_ipns_through_resolver() {
        let target = cid();
        let mut resolver = StaticNameResolver::new();
        resolver.insert(
            "example.org",
            &format!("/ipfs/{}/docs", target),
            Some(Duration::from_secs(60)),
        );
        let parser = ResourceParser::new(&resolver, Duration::from_secs(1));

        let parsed = parser
            .parse(&Resource::from("ipns://example.org/readme.md"), &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(parsed.cid, target);
        assert_eq!(parsed.path, "docs/readme.md");
        assert_eq!(parsed.ipfs_path, format!("/ipfs/{}/docs/readme.md", target));
        assert_eq!(parsed.requested_path, "/ipns/example.org/readme.md");
        assert_eq!(parsed.protocol, Protocol::Ipns);
        assert_eq!(
            parsed.mutable.as_ref().and_then(|m| m.ttl),
            Some(Duration::from_secs(60))
        );
        assert!(parsed.graph_path.is_mutable());
    }

    #[tokio::test]
    async fn test_parse_recursive_names() {
        let target = cid();
        let mut resolver = StaticNameResolver::new();
        resolver.insert("outer.example", "/ipns/inner.example/a", Some(Duration::from_secs(30)));
        resolver.insert("inner.example", &format!("/ipfs/{}/b", target), Some(Duration::from_secs(90)));
        let parser = ResourceParser::new(&resolver, Duration::from_secs(1));

        let parsed = parser
            .parse(&Resource::from("/ipns/outer.example/c"), &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(parsed.path, "b/a/c");
        assert_eq!(parsed.mutable.and_then(|m| m.ttl), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_unknown_name_is_record_not_found() {
        let resolver = StaticNameResolver::new();
        let parser = ResourceParser::new(&resolver, Duration::from_secs(1));
        let err = parser
            .parse(&Resource::from("ipns://missing.example"), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancelled_resolution_is_aborted() {
        let resolver = StaticNameResolver::new();
        let parser = ResourceParser::new(&resolver, Duration::from_secs(1));
        let options = ResolveOptions::default();
        options.cancel.cancel();
        let err = parser
            .parse(&Resource::from("ipns://any.example"), &options)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_invalid_ipfs_id() {
        let resolver = StaticNameResolver::new();
        let parser = ResourceParser::new(&resolver, Duration::from_secs(1));
        let err = parser
            .parse(&Resource::from("/ipfs/nope"), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResource(_)));
    }
}
