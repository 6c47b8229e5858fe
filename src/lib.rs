//! Trustless Gateway
//!
//! A content-addressed HTTP gateway. Requests name content by a content
//! identifier (or a mutable name resolving to one) plus an optional graph
//! path; the gateway fetches verified blocks from a block store, walks the
//! path and renders the terminal node in the negotiated format.
//!
//! # Overview
//!
//! A request flows one way through the crate:
//!
//! - [`resource`] parses the resource (CID, `ipfs://`, `ipns://`, `/ipfs/`,
//!   `/ipns/`, path or subdomain gateway URL) and resolves mutable names
//! - [`accept`] negotiates the output format from `?format=` and `Accept`
//! - [`gateway::Gateway`] seeds a [`context::RequestContext`] and runs the
//!   [`pipeline::Pipeline`] of [`plugins`]
//! - [`byte_range`] frames the body for `Range` requests
//! - [`cache_identity`] stamps `ETag` and `Cache-Control`
//!
//! # Formats
//!
//! - UnixFS files and directories (with a generated listing when a directory
//!   has no `index.html`)
//! - Raw blocks, CAR and TAR exports, IPNS record exports
//! - DAG-JSON, DAG-CBOR, JSON and CBOR, transcoded where needed
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trustless_gateway::{Gateway, GatewayConfig, MemoryBlockStore, RequestOptions};
//!
//! # async fn run() -> Result<(), trustless_gateway::GatewayError> {
//! let store = Arc::new(MemoryBlockStore::new());
//! let cid = store.put(&b"hello"[..], trustless_gateway::models::codecs::RAW);
//!
//! let gateway = Gateway::builder(GatewayConfig::offline())
//!     .with_store(store)
//!     .build()?;
//!
//! let response = gateway
//!     .fetch(format!("/ipfs/{}?format=raw", cid), RequestOptions::get())
//!     .await?;
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! The binary reads a YAML file:
//!
//! ```yaml
//! listen_address: "127.0.0.1:8080"
//! upstream_gateways:
//!   - "https://trustless-gateway.link"
//! store_timeout_ms: 30000
//! max_outstanding_fetches: 4
//! server_timing: true
//! static_names:
//!   example.org: "/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi"
//! ```
//!
//! See [`GatewayConfig`] for every option.
//!
//! # Error Handling
//!
//! Every failure is a [`GatewayError`] with a fixed HTTP status. The gateway
//! turns them into JSON error responses; only cancellations are returned to
//! the caller as `Err`.

pub mod accept;
pub mod byte_range;
pub mod cache_identity;
pub mod codec;
pub mod config;
pub mod content_type;
pub mod context;
pub mod dag_builder;
pub mod error;
pub mod gateway;
pub mod http_store;
pub mod metrics;
pub mod models;
pub mod name_cache;
pub mod name_resolver;
pub mod path_walker;
pub mod pipeline;
pub mod plugins;
pub mod resource;
pub mod response;
pub mod server;
pub mod store;
pub mod unixfs;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use context::{RequestContext, RequestOptions};
pub use error::{AbortDiagnostics, GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use metrics::GatewayMetrics;
pub use models::{ParsedResource, PathWalkResult, ReqFormat};
pub use pipeline::{Pipeline, Plugin, PluginError, PluginResult};
pub use resource::Resource;
pub use response::{GatewayResponse, ResponseBody};
pub use server::GatewayServer;
pub use store::{BlockStore, MemoryBlockStore};
