//! Block store boundary
//!
//! The gateway never talks to the network directly; it asks a `BlockStore`
//! for the bytes of a block. Every fetch made for a request goes through a
//! `BlockFetcher`, which races the store against the request's cancellation
//! token, applies the fetch timeout and bounds the number of outstanding
//! fetches.

use crate::error::{GatewayError, Result};
use crate::models::codecs;
use async_trait::async_trait;
use bytes::Bytes;
use libipld::multihash::{Code, MultihashDigest};
use libipld::Cid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Affinity token for a sequence of related fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Options passed with every block fetch
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub cancel: CancellationToken,
    pub session: Option<SessionId>,
}

/// Source of verified block bytes
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Fetch the bytes of the block identified by `cid`
    async fn get(&self, cid: &Cid, options: &FetchOptions) -> Result<Bytes>;

    /// Open a session rooted at `root`; stores without affinity return `None`
    async fn start_session(&self, _root: &Cid) -> Option<SessionId> {
        None
    }

    /// Close a session opened by `start_session`
    async fn end_session(&self, _session: SessionId) {}
}

/// Hash `bytes` with sha2-256 into a CIDv1 of the given codec
pub fn cid_for(bytes: &[u8], codec: u64) -> Cid {
    Cid::new_v1(codec, Code::Sha2_256.digest(bytes))
}

/// Bytes inlined in an identity-multihash CID, if it is one
pub fn identity_bytes(cid: &Cid) -> Option<Bytes> {
    if cid.hash().code() == codecs::IDENTITY_HASH {
        Some(Bytes::copy_from_slice(cid.hash().digest()))
    } else {
        None
    }
}

/// Check that `bytes` hash to the multihash inside `cid`
pub fn verify_block(cid: &Cid, bytes: &[u8]) -> Result<()> {
    if cid.hash().code() == codecs::IDENTITY_HASH {
        return if cid.hash().digest() == bytes {
            Ok(())
        } else {
            Err(GatewayError::Store(format!("identity block mismatch for {}", cid)))
        };
    }

    let code = Code::try_from(cid.hash().code()).map_err(|_| {
        GatewayError::Store(format!(
            "unsupported hash function 0x{:x} in {}",
            cid.hash().code(),
            cid
        ))
    })?;
    let digest = code.digest(bytes);
    if &digest != cid.hash() {
        return Err(GatewayError::Store(format!(
            "block does not match its identifier {}",
            cid
        )));
    }
    Ok(())
}

/// In-process block store
///
/// Used as the local layer of the HTTP store and as the fixture store in tests.
/// A miss is `ContentUnavailableOffline`.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
    fetches: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under a sha2-256 CIDv1 of `codec`
    pub fn put(&self, bytes: impl Into<Bytes>, codec: u64) -> Cid {
        let bytes = bytes.into();
        let cid = cid_for(&bytes, codec);
        self.put_keyed(cid, bytes);
        cid
    }

    /// Store `bytes` under an identifier computed elsewhere
    pub fn put_keyed(&self, cid: Cid, bytes: impl Into<Bytes>) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(cid, bytes.into());
        }
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.blocks
            .read()
            .map(|b| b.contains_key(cid))
            .unwrap_or(false)
    }

    pub fn remove(&self, cid: &Cid) -> bool {
        self.blocks
            .write()
            .map(|mut b| b.remove(cid).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `get` calls served so far, hits and misses alike
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Block bytes, without counting as a fetch
    pub fn block(&self, cid: &Cid) -> Option<Bytes> {
        self.blocks.read().ok().and_then(|b| b.get(cid).cloned())
    }

    pub fn block_len(&self, cid: &Cid) -> Option<u64> {
        self.blocks
            .read()
            .ok()
            .and_then(|b| b.get(cid).map(|bytes| bytes.len() as u64))
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid, options: &FetchOptions) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if options.cancel.is_cancelled() {
            return Err(GatewayError::aborted("fetch"));
        }
        self.block(cid).ok_or_else(|| {
            GatewayError::ContentUnavailableOffline(format!("block {} is not held locally", cid))
        })
    }
}

/// Per-request handle used for every block fetch
///
/// Cheap to clone; clones share the request's cancellation token and
/// outstanding-fetch permits, so streamed bodies can keep fetching after the
/// pipeline has returned.
#[derive(Clone)]
pub struct BlockFetcher {
    store: Arc<dyn BlockStore>,
    cancel: CancellationToken,
    session: Option<SessionId>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl BlockFetcher {
    /// Create a new BlockFetcher
    ///
    /// # Arguments
    /// * `store` - Block store to fetch from
    /// * `cancel` - The request's cancellation token
    /// * `timeout` - Budget for a single fetch
    /// * `max_outstanding` - Fetches allowed in flight at once
    pub fn new(
        store: Arc<dyn BlockStore>,
        cancel: CancellationToken,
        timeout: Duration,
        max_outstanding: usize,
    ) -> Self {
        BlockFetcher {
            store,
            cancel,
            session: None,
            timeout,
            permits: Arc::new(Semaphore::new(max_outstanding.max(1))),
        }
    }

    pub fn with_session(mut self, session: Option<SessionId>) -> Self {
        self.session = session;
        self
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Fetch a block on behalf of the request
    ///
    /// # Returns
    /// * `Ok(Bytes)` with the block's bytes
    /// * `Err(GatewayError::Aborted)` if the request was cancelled first
    /// * `Err(GatewayError::UpstreamTimeout)` if the store exceeded the budget
    /// * Any error the store reported
    pub async fn get(&self, cid: &Cid) -> Result<Bytes> {
        if let Some(bytes) = identity_bytes(cid) {
            return Ok(bytes);
        }
        if self.cancel.is_cancelled() {
            return Err(GatewayError::aborted("fetch"));
        }

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(GatewayError::aborted("fetch")),
            permit = self.permits.acquire() => permit
                .map_err(|_| GatewayError::Internal("fetch permits closed".to_string()))?,
        };

        let options = FetchOptions {
            cancel: self.cancel.clone(),
            session: self.session,
        };

        debug!("Fetching block: cid={}, session={:?}", cid, self.session);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::aborted("fetch")),
            result = tokio::time::timeout(self.timeout, self.store.get(cid, &options)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::UpstreamTimeout(format!(
                        "block {} not retrieved within {:?}",
                        cid, self.timeout
                    ))),
                }
            }
        }
    }
}
