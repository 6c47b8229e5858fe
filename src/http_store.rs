//! Block store backed by upstream trustless gateways
//!
//! Blocks are requested as `GET {gateway}/ipfs/{cid}?format=raw` and verified
//! against their identifier before use. Transient failures are retried with
//! exponential backoff; each gateway is tried in turn. A session remembers
//! which gateway served it last and tries that one first.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::store::{verify_block, BlockStore, FetchOptions, MemoryBlockStore, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use libipld::Cid;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry policy for upstream requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_retries: usize) -> Self {
        // 100ms, 200ms, 400ms, ...
        let backoff_ms = (0..max_retries)
            .map(|i| 100 * 2u64.pow(i as u32))
            .collect();

        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    /// Check if we should retry based on the attempt number and error
    pub fn should_retry(&self, attempt: usize, error: &GatewayError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    /// Get the backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// Block store fetching from upstream gateways
pub struct HttpBlockStore {
    client: Client,
    gateways: Vec<String>,
    retry_policy: RetryPolicy,
    local: Option<Arc<MemoryBlockStore>>,
    offline: bool,
    sessions: RwLock<HashMap<SessionId, usize>>,
    next_session: AtomicU64,
}

impl HttpBlockStore {
    /// Create a new HttpBlockStore
    ///
    /// # Arguments
    /// * `gateways` - Base URLs of trustless gateways, tried in order
    /// * `timeout` - Budget for a single HTTP request
    /// * `max_retries` - Retries per gateway for transient failures
    pub fn new(gateways: Vec<String>, timeout: Duration, max_retries: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpBlockStore {
            client,
            gateways: gateways
                .into_iter()
                .map(|g| g.trim_end_matches('/').to_string())
                .collect(),
            retry_policy: RetryPolicy::new(max_retries),
            local: None,
            offline: false,
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let store = Self::new(
            config.upstream_gateways.clone(),
            config.store_timeout(),
            config.max_retries,
        )?;
        Ok(store.with_offline(config.offline))
    }

    /// Serve from and write through to a local store
    pub fn with_local_store(mut self, local: Arc<MemoryBlockStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Never reach the network; only the local store is consulted
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn gateways(&self) -> &[String] {
        &self.gateways
    }

    /// Gateway indices in the order they should be tried
    fn gateway_order(&self, session: Option<SessionId>) -> Vec<usize> {
        let preferred = session.and_then(|id| {
            self.sessions
                .read()
                .ok()
                .and_then(|sessions| sessions.get(&id).copied())
        });

        let mut order: Vec<usize> = (0..self.gateways.len()).collect();
        if let Some(first) = preferred.filter(|i| *i < self.gateways.len()) {
            order.retain(|i| *i != first);
            order.insert(0, first);
        }
        order
    }

    fn remember(&self, session: Option<SessionId>, gateway: usize) {
        if let Some(id) = session {
            if let Ok(mut sessions) = self.sessions.write() {
                if let Some(slot) = sessions.get_mut(&id) {
                    *slot = gateway;
                }
            }
        }
    }

    /// Try to fetch a block from one gateway (single attempt, no retry)
    async fn try_fetch(&self, gateway: &str, cid: &Cid) -> Result<Bytes> {
        let url = format!("{}/ipfs/{}?format=raw", gateway, cid);

        let response = self
            .client
            .get(&url)
            .header("accept", "application/vnd.ipld.raw")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::UpstreamTimeout(format!("Request to {} timed out", url))
                } else {
                    GatewayError::UpstreamUnavailable(format!("Request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                format!("block {} from {}", cid, gateway),
            ));
        }

        let bytes = response.bytes().await.map_err(|e| {
            GatewayError::UpstreamUnavailable(format!("Failed to read body from {}: {}", url, e))
        })?;

        verify_block(cid, &bytes)?;
        Ok(bytes)
    }

    /// Fetch from one gateway, retrying transient failures
    async fn fetch_with_retry(
        &self,
        gateway: &str,
        cid: &Cid,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let mut attempt = 0;

        loop {
            match self.try_fetch(gateway, cid).await {
                Ok(bytes) => {
                    if attempt > 0 {
                        info!(
                            "Block fetched after retry: cid={}, gateway={}, attempts={}",
                            cid,
                            gateway,
                            attempt + 1
                        );
                    }
                    return Ok(bytes);
                }
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt, &e) {
                        return Err(e);
                    }

                    let backoff = self.retry_policy.backoff_duration(attempt);
                    warn!(
                        "Block fetch failed, retrying: cid={}, gateway={}, attempt={}, backoff={:?}, error={}",
                        cid, gateway, attempt + 1, backoff, e
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GatewayError::aborted("fetch")),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl BlockStore for HttpBlockStore {
    async fn get(&self, cid: &Cid, options: &FetchOptions) -> Result<Bytes> {
        if let Some(local) = &self.local {
            if let Some(bytes) = local.block(cid) {
                debug!("Local block hit: cid={}", cid);
                return Ok(bytes);
            }
        }

        if self.offline {
            return Err(GatewayError::ContentUnavailableOffline(format!(
                "block {} is not held locally",
                cid
            )));
        }

        let mut last_error =
            GatewayError::UpstreamUnavailable("no upstream gateways configured".to_string());

        for index in self.gateway_order(options.session) {
            let gateway = &self.gateways[index];
            match self.fetch_with_retry(gateway, cid, &options.cancel).await {
                Ok(bytes) => {
                    debug!(
                        "Fetched block: cid={}, gateway={}, size={}",
                        cid,
                        gateway,
                        bytes.len()
                    );
                    self.remember(options.session, index);
                    if let Some(local) = &self.local {
                        local.put_keyed(*cid, bytes.clone());
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    warn!(
                        "Gateway could not serve block: cid={}, gateway={}, error={}",
                        cid, gateway, e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn start_session(&self, root: &Cid) -> Option<SessionId> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(id, 0);
        }
        debug!("Started session: id={:?}, root={}", id, root);
        Some(id)
    }

    async fn end_session(&self, session: SessionId) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.backoff_ms, vec![100, 200, 400]);
        assert_eq!(policy.backoff_duration(5), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::new(2);
        let transient = GatewayError::UpstreamUnavailable("503".into());
        let permanent = GatewayError::ContentUnavailableOffline("x".into());
        assert!(policy.should_retry(0, &transient));
        assert!(policy.should_retry(1, &transient));
        assert!(!policy.should_retry(2, &transient));
        assert!(!policy.should_retry(0, &permanent));
    }

    #[tokio::test]
    async fn test_session_prefers_last_gateway() {
        let store = HttpBlockStore::new(
            vec!["http://a".to_string(), "http://b/".to_string()],
            Duration::from_secs(1),
            0,
        )
        .unwrap();
        assert_eq!(store.gateways()[1], "http://b");

        let root = crate::store::cid_for(b"root", crate::models::codecs::RAW);
        let session = store.start_session(&root).await;
        assert_eq!(store.gateway_order(session), vec![0, 1]);
        store.remember(session, 1);
        assert_eq!(store.gateway_order(session), vec![1, 0]);

        if let Some(id) = session {
            store.end_session(id).await;
        }
        assert_eq!(store.gateway_order(session), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_offline_serves_local_only() {
        let local = Arc::new(MemoryBlockStore::new());
        let cid = local.put(Bytes::from_static(b"local"), crate::models::codecs::RAW);
        let store = HttpBlockStore::new(Vec::new(), Duration::from_secs(1), 0)
            .unwrap()
            .with_local_store(local)
            .with_offline(true);

        let options = FetchOptions::default();
        assert_eq!(&store.get(&cid, &options).await.unwrap()[..], b"local");

        let missing = crate::store::cid_for(b"missing", crate::models::codecs::RAW);
        assert!(matches!(
            store.get(&missing, &options).await,
            Err(GatewayError::ContentUnavailableOffline(_))
        ));
    }
}
