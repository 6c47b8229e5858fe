//! Mutable name resolution
//!
//! A `NameResolver` turns a mutable name into an `/ipfs/...` or `/ipns/...`
//! path plus an optional TTL. Names containing a dot are DNSLink names and are
//! looked up through DNS-over-HTTPS; other names are keys whose signed record
//! is fetched from an upstream trustless gateway. Record signatures are not
//! verified here.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::name_cache::NameCache;
use async_trait::async_trait;
use bytes::Bytes;
use libipld::codec::Codec;
use libipld::{Ipld, IpldCodec};
use prost::Message;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Options for one resolution
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub cancel: CancellationToken,
    /// Bypass caches
    pub nocache: bool,
}

/// What a mutable name points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// `/ipfs/<cid>[/path]` or `/ipns/<name>[/path]`
    pub path: String,
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str, options: &ResolveOptions) -> Result<ResolvedName>;

    /// The raw signed record for `name`, for record exports
    async fn fetch_record(&self, name: &str, _options: &ResolveOptions) -> Result<Bytes> {
        Err(GatewayError::NotRepresentable(format!(
            "no record available for {}",
            name
        )))
    }
}

/// Resolves names from a fixed table, optionally deferring misses to another resolver
pub struct StaticNameResolver {
    names: HashMap<String, ResolvedName>,
    fallback: Option<Arc<dyn NameResolver>>,
}

impl StaticNameResolver {
    pub fn new() -> Self {
        StaticNameResolver {
            names: HashMap::new(),
            fallback: None,
        }
    }

    /// Build from the `static_names` table of the configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut resolver = Self::new();
        for (name, path) in &config.static_names {
            resolver.insert(name, path, None);
        }
        resolver
    }

    pub fn insert(&mut self, name: &str, path: &str, ttl: Option<Duration>) {
        self.names.insert(
            name.to_string(),
            ResolvedName {
                path: path.to_string(),
                ttl,
            },
        );
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn NameResolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl Default for StaticNameResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NameResolver for StaticNameResolver {
    async fn resolve(&self, name: &str, options: &ResolveOptions) -> Result<ResolvedName> {
        if let Some(resolved) = self.names.get(name) {
            debug!("Static name hit: name={}, path={}", name, resolved.path);
            return Ok(resolved.clone());
        }
        match &self.fallback {
            Some(fallback) => fallback.resolve(name, options).await,
            None => Err(GatewayError::RecordNotFound(name.to_string())),
        }
    }

    async fn fetch_record(&self, name: &str, options: &ResolveOptions) -> Result<Bytes> {
        match &self.fallback {
            Some(fallback) => fallback.fetch_record(name, options).await,
            None => Err(GatewayError::NotRepresentable(format!(
                "no record available for {}",
                name
            ))),
        }
    }
}

/// A name record as served by trustless gateways (fields the gateway reads)
#[derive(Clone, PartialEq, prost::Message)]
pub struct NameRecord {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub value: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub sequence: Option<u64>,
    /// Nanoseconds
    #[prost(uint64, optional, tag = "6")]
    pub ttl: Option<u64>,
    /// DAG-CBOR document duplicating the signed fields
    #[prost(bytes = "vec", optional, tag = "9")]
    pub data: Option<Vec<u8>>,
}

/// Extract the target path and TTL from a serialized name record
pub fn decode_record(name: &str, bytes: &[u8]) -> Result<ResolvedName> {
    let record = NameRecord::decode(bytes)
        .map_err(|e| GatewayError::NameResolution(format!("invalid record for {}: {}", name, e)))?;

    let mut value = record.value.clone();
    let mut ttl_ns = record.ttl;

    if let Some(data) = &record.data {
        if let Ok(Ipld::Map(fields)) = IpldCodec::DagCbor.decode::<Ipld>(data) {
            if let Some(Ipld::Bytes(v)) = fields.get("Value") {
                value = Some(v.clone());
            }
            if let Some(Ipld::Integer(t)) = fields.get("TTL") {
                ttl_ns = u64::try_from(*t).ok();
            }
        }
    }

    let value = value
        .ok_or_else(|| GatewayError::NameResolution(format!("record for {} has no value", name)))?;
    let path = String::from_utf8(value).map_err(|_| {
        GatewayError::NameResolution(format!("record value for {} is not utf-8", name))
    })?;
    if !path.starts_with("/ipfs/") && !path.starts_with("/ipns/") {
        return Err(GatewayError::NameResolution(format!(
            "record for {} points at unsupported path {}",
            name, path
        )));
    }

    Ok(ResolvedName {
        path,
        ttl: ttl_ns.map(Duration::from_nanos),
    })
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    #[serde(rename = "TTL", default)]
    ttl: u64,
    data: String,
}

const TXT_RECORD: u16 = 16;

/// Pick the DNSLink path out of TXT answers
fn dnslink_from_answers(answers: &[DohAnswer]) -> Option<ResolvedName> {
    answers
        .iter()
        .filter(|a| a.record_type == TXT_RECORD)
        .filter_map(|a| {
            // TXT data may be split into several quoted strings
            let text: String = a.data.split('"').filter(|s| !s.trim().is_empty()).collect();
            let path = text.trim().strip_prefix("dnslink=")?.trim().to_string();
            if path.starts_with("/ipfs/") || path.starts_with("/ipns/") {
                Some(ResolvedName {
                    path,
                    ttl: Some(Duration::from_secs(a.ttl)),
                })
            } else {
                None
            }
        })
        .min_by(|a, b| a.path.cmp(&b.path))
}

/// Resolves DNSLink names over DNS-over-HTTPS and key names via upstream record exports
pub struct HttpNameResolver {
    client: Client,
    doh_endpoint: String,
    gateways: Vec<String>,
}

impl HttpNameResolver {
    /// Create a new HttpNameResolver
    ///
    /// # Arguments
    /// * `doh_endpoint` - DNS-over-HTTPS JSON endpoint
    /// * `gateways` - Trustless gateways serving `?format=ipns-record`
    /// * `timeout` - Budget for each HTTP request
    pub fn new(doh_endpoint: &str, gateways: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpNameResolver {
            client,
            doh_endpoint: doh_endpoint.to_string(),
            gateways: gateways
                .into_iter()
                .map(|g| g.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::new(
            &config.doh_endpoint,
            config.upstream_gateways.clone(),
            config.resolver_timeout(),
        )
    }

    async fn resolve_dnslink(&self, name: &str) -> Result<ResolvedName> {
        let query_name = format!("_dnslink.{}", name);
        debug!("Resolving DNSLink: name={}", query_name);

        let response = self
            .client
            .get(&self.doh_endpoint)
            .query(&[("name", query_name.as_str()), ("type", "TXT")])
            .header("accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| request_error("DNS-over-HTTPS", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                format!("DNS-over-HTTPS lookup of {}", query_name),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error("DNS-over-HTTPS", e))?;
        let body: DohResponse = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::NameResolution(format!("invalid DoH response: {}", e)))?;

        // NOERROR (0) or NXDOMAIN (3) without a usable record both mean "no link"
        if body.status != 0 && body.status != 3 {
            return Err(GatewayError::NameResolution(format!(
                "DNS lookup of {} failed with status {}",
                query_name, body.status
            )));
        }

        dnslink_from_answers(&body.answer)
            .ok_or_else(|| GatewayError::RecordNotFound(format!("no DNSLink record for {}", name)))
    }

    async fn fetch_record_from(&self, gateway: &str, name: &str) -> Result<Bytes> {
        let url = format!("{}/ipns/{}?format=ipns-record", gateway, name);
        let response = self
            .client
            .get(&url)
            .header("accept", "application/vnd.ipfs.ipns-record")
            .send()
            .await
            .map_err(|e| request_error("record fetch", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::RecordNotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                format!("record fetch for {}", name),
            ));
        }

        response
            .bytes()
            .await
            .map_err(|e| request_error("record fetch", e))
    }
}

fn request_error(what: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout(format!("{}: {}", what, err))
    } else {
        GatewayError::UpstreamUnavailable(format!("{}: {}", what, err))
    }
}

#[async_trait]
impl NameResolver for HttpNameResolver {
    async fn resolve(&self, name: &str, options: &ResolveOptions) -> Result<ResolvedName> {
        if name.contains('.') {
            return self.resolve_dnslink(name).await;
        }
        let record = self.fetch_record(name, options).await?;
        decode_record(name, &record)
    }

    async fn fetch_record(&self, name: &str, _options: &ResolveOptions) -> Result<Bytes> {
        if name.contains('.') {
            return Err(GatewayError::NotRepresentable(format!(
                "{} is a DNSLink name and has no signed record",
                name
            )));
        }

        let mut last_error = GatewayError::UpstreamUnavailable("no upstream gateways".to_string());
        for gateway in &self.gateways {
            match self.fetch_record_from(gateway, name).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!(
                        "Record fetch failed: gateway={}, name={}, error={}",
                        gateway, name, e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Wraps a resolver with a `NameCache`
pub struct CachingNameResolver {
    inner: Arc<dyn NameResolver>,
    cache: NameCache,
    default_ttl: Duration,
}

impl CachingNameResolver {
    /// # Arguments
    /// * `inner` - Resolver consulted on a miss
    /// * `cache` - Cache holding resolutions
    /// * `default_ttl` - TTL for results whose record carries none
    pub fn new(inner: Arc<dyn NameResolver>, cache: NameCache, default_ttl: Duration) -> Self {
        CachingNameResolver {
            inner,
            cache,
            default_ttl,
        }
    }

    pub fn cache(&self) -> &NameCache {
        &self.cache
    }
}

#[async_trait]
impl NameResolver for CachingNameResolver {
    async fn resolve(&self, name: &str, options: &ResolveOptions) -> Result<ResolvedName> {
        if !options.nocache {
            if let Some(hit) = self.cache.get(name) {
                debug!("Name cache hit: name={}", name);
                return Ok(hit);
            }
        }

        let resolved = self.inner.resolve(name, options).await?;
        let ttl = resolved.ttl.unwrap_or(self.default_ttl);
        self.cache.set(name, resolved.clone(), ttl);
        Ok(resolved)
    }

    async fn fetch_record(&self, name: &str, options: &ResolveOptions) -> Result<Bytes> {
        self.inner.fetch_record(name, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_static_resolver() {
        let mut resolver = StaticNameResolver::new();
        resolver.insert("example.com", "/ipfs/bafyexample", Some(Duration::from_secs(10)));

        let resolved = resolver
            .resolve("example.com", &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.path, "/ipfs/bafyexample");

        let err = resolver
            .resolve("other.com", &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RecordNotFound(_)));
    }

    #[test]
    fn test_decode_record_prefers_cbor_data() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "Value".to_string(),
            Ipld::Bytes(b"/ipfs/bafynew".to_vec()),
        );
        fields.insert("TTL".to_string(), Ipld::Integer(30_000_000_000));
        let data = IpldCodec::DagCbor.encode(&Ipld::Map(fields)).unwrap();

        let record = NameRecord {
            value: Some(b"/ipfs/bafyold".to_vec()),
            sequence: Some(1),
            ttl: Some(1),
            data: Some(data),
        };
        let resolved = decode_record("k51", &record.encode_to_vec()).unwrap();
        assert_eq!(resolved.path, "/ipfs/bafynew");
        assert_eq!(resolved.ttl, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_decode_record_v1_only() {
        let record = NameRecord {
            value: Some(b"/ipfs/bafyold".to_vec()),
            sequence: None,
            ttl: None,
            data: None,
        };
        let resolved = decode_record("k51", &record.encode_to_vec()).unwrap();
        assert_eq!(resolved.path, "/ipfs/bafyold");
        assert_eq!(resolved.ttl, None);
    }

    #[test]
    fn test_dnslink_answer_parsing() {
        let answers = vec![
            DohAnswer {
                record_type: TXT_RECORD,
                ttl: 120,
                data: "\"dnslink=/ipfs/bafydns\"".to_string(),
            },
            DohAnswer {
                record_type: TXT_RECORD,
                ttl: 120,
                data: "\"v=spf1 -all\"".to_string(),
            },
        ];
        let resolved = dnslink_from_answers(&answers).unwrap();
        assert_eq!(resolved.path, "/ipfs/bafydns");
        assert_eq!(resolved.ttl, Some(Duration::from_secs(120)));
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NameResolver for CountingResolver {
        async fn resolve(&self, _name: &str, _options: &ResolveOptions) -> Result<ResolvedName> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedName {
                path: "/ipfs/bafycounted".to_string(),
                ttl: None,
            })
        }
    }

    #[tokio::test]
    async fn test_caching_resolver() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingNameResolver::new(
            inner.clone(),
            NameCache::new(Duration::from_secs(60), 10),
            Duration::from_secs(300),
        );

        let options = ResolveOptions::default();
        resolver.resolve("a.com", &options).await.unwrap();
        resolver.resolve("a.com", &options).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let nocache = ResolveOptions {
            nocache: true,
            ..Default::default()
        };
        resolver.resolve("a.com", &nocache).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
