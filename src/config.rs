//! Configuration management for the gateway

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to (default: 127.0.0.1:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Trustless gateways blocks are fetched from, tried in order
    #[serde(default = "default_upstream_gateways")]
    pub upstream_gateways: Vec<String>,

    /// Never reach the network; serve only locally held blocks (default: false)
    #[serde(default)]
    pub offline: bool,

    /// Budget for a single block fetch in milliseconds (default: 30s)
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Budget for a single name resolution in milliseconds (default: 10s)
    #[serde(default = "default_resolver_timeout_ms")]
    pub resolver_timeout_ms: u64,

    /// Retries for transient upstream failures (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Block fetches a single request may have outstanding (default: 1)
    #[serde(default = "default_max_outstanding_fetches")]
    pub max_outstanding_fetches: usize,

    /// max-age for mutable names whose record carries no TTL (default: 300s)
    #[serde(default = "default_mutable_ttl_secs")]
    pub default_mutable_ttl_secs: u64,

    /// max-age for immutable content (default: two years)
    #[serde(default = "default_immutable_max_age_secs")]
    pub immutable_max_age_secs: u64,

    /// Upper bound on how long a resolved name is cached (default: 60s)
    #[serde(default = "default_name_cache_ttl_secs")]
    pub name_cache_ttl_secs: u64,

    /// Maximum number of cached name resolutions (default: 1000)
    #[serde(default = "default_name_cache_max_entries")]
    pub name_cache_max_entries: usize,

    /// DNS-over-HTTPS JSON endpoint used for DNSLink lookups
    #[serde(default = "default_doh_endpoint")]
    pub doh_endpoint: String,

    /// Names resolved without touching the network, name -> /ipfs/... path
    #[serde(default)]
    pub static_names: BTreeMap<String, String>,

    /// Emit a Server-Timing header (default: false)
    #[serde(default)]
    pub server_timing: bool,

    /// Log level for the binary (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics on /metrics (default: true)
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_upstream_gateways() -> Vec<String> {
    vec!["https://trustless-gateway.link".to_string()]
}

fn default_store_timeout_ms() -> u64 {
    30_000
}

fn default_resolver_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> usize {
    2
}

fn default_max_outstanding_fetches() -> usize {
    1
}

fn default_mutable_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_immutable_max_age_secs() -> u64 {
    2 * 365 * 24 * 60 * 60
}

fn default_name_cache_ttl_secs() -> u64 {
    60
}

fn default_name_cache_max_entries() -> usize {
    1000
}

fn default_doh_endpoint() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_address: default_listen_address(),
            upstream_gateways: default_upstream_gateways(),
            offline: false,
            store_timeout_ms: default_store_timeout_ms(),
            resolver_timeout_ms: default_resolver_timeout_ms(),
            max_retries: default_max_retries(),
            max_outstanding_fetches: default_max_outstanding_fetches(),
            default_mutable_ttl_secs: default_mutable_ttl_secs(),
            immutable_max_age_secs: default_immutable_max_age_secs(),
            name_cache_ttl_secs: default_name_cache_ttl_secs(),
            name_cache_max_entries: default_name_cache_max_entries(),
            doh_endpoint: default_doh_endpoint(),
            static_names: BTreeMap::new(),
            server_timing: false,
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(GatewayConfig)` if loading and validation succeed
    /// * `Err(GatewayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content).map_err(|e| {
            GatewayError::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - at least one upstream gateway unless offline, each an http(s) URL
    /// - timeouts must be > 0
    /// - max_outstanding_fetches must be between 1 and 64
    /// - default_mutable_ttl_secs must be > 0
    /// - static names must map to /ipfs/ or /ipns/ paths
    pub fn validate(&self) -> Result<()> {
        const MAX_OUTSTANDING_FETCHES: usize = 64;

        if !self.offline && self.upstream_gateways.is_empty() {
            return Err(GatewayError::Config(
                "upstream_gateways must not be empty unless offline is set".to_string(),
            ));
        }

        for gateway in &self.upstream_gateways {
            let parsed = url::Url::parse(gateway).map_err(|e| {
                GatewayError::Config(format!("Invalid upstream gateway '{}': {}", gateway, e))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(GatewayError::Config(format!(
                    "Upstream gateway '{}' must use http or https",
                    gateway
                )));
            }
        }

        if self.store_timeout_ms == 0 || self.resolver_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "store_timeout_ms and resolver_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_outstanding_fetches == 0
            || self.max_outstanding_fetches > MAX_OUTSTANDING_FETCHES
        {
            return Err(GatewayError::Config(format!(
                "max_outstanding_fetches must be between 1 and {}, got {}",
                MAX_OUTSTANDING_FETCHES, self.max_outstanding_fetches
            )));
        }

        if self.default_mutable_ttl_secs == 0 {
            return Err(GatewayError::Config(
                "default_mutable_ttl_secs must be greater than 0".to_string(),
            ));
        }

        for (name, path) in &self.static_names {
            if !path.starts_with("/ipfs/") && !path.starts_with("/ipns/") {
                return Err(GatewayError::Config(format!(
                    "static name '{}' must map to an /ipfs/ or /ipns/ path, got '{}'",
                    name, path
                )));
            }
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver_timeout_ms)
    }

    pub fn default_mutable_ttl(&self) -> Duration {
        Duration::from_secs(self.default_mutable_ttl_secs)
    }

    pub fn name_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.name_cache_ttl_secs)
    }

    /// Offline configuration with no upstreams, used by tests and local serving
    pub fn offline() -> Self {
        GatewayConfig {
            offline: true,
            upstream_gateways: Vec::new(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_mutable_ttl(), Duration::from_secs(300));
        assert_eq!(config.max_outstanding_fetches, 1);
    }

    #[test]
    fn test_offline_config_without_upstreams() {
        let config = GatewayConfig::offline();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_online_config_requires_upstreams() {
        let config = GatewayConfig {
            upstream_gateways: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_http_upstream() {
        let config = GatewayConfig {
            upstream_gateways: vec!["ftp://example.com".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_rejects_outstanding_fetch_bounds() {
        let mut config = GatewayConfig::default();
        config.max_outstanding_fetches = 0;
        assert!(config.validate().is_err());
        config.max_outstanding_fetches = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_static_name() {
        let mut config = GatewayConfig::offline();
        config
            .static_names
            .insert("example.com".to_string(), "bafy".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_uses_defaults() {
        let config = GatewayConfig::from_yaml("offline: true\nupstream_gateways: []\n").unwrap();
        assert!(config.offline);
        assert_eq!(config.store_timeout_ms, 30_000);
        assert_eq!(config.listen_address, "127.0.0.1:8080");
    }
}
