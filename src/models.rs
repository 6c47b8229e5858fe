//! Core data models for the gateway

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use libipld::{Cid, Ipld};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Multicodec codes the gateway knows by name
pub mod codecs {
    pub const RAW: u64 = 0x55;
    pub const DAG_PB: u64 = 0x70;
    pub const DAG_CBOR: u64 = 0x71;
    pub const DAG_JSON: u64 = 0x0129;
    pub const JSON: u64 = 0x0200;
    pub const CBOR: u64 = 0x51;

    /// Multihash code for the identity "hash" (bytes inlined in the CID)
    pub const IDENTITY_HASH: u64 = 0x00;
}

/// Output format explicitly requested through `?format=` or `Accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReqFormat {
    Raw,
    Car,
    Tar,
    IpnsRecord,
    DagJson,
    DagCbor,
    Json,
    Cbor,
}

impl ReqFormat {
    /// Every format, in the order they are tried when matching a MIME type
    pub const ALL: [ReqFormat; 8] = [
        ReqFormat::Raw,
        ReqFormat::Car,
        ReqFormat::Tar,
        ReqFormat::IpnsRecord,
        ReqFormat::DagJson,
        ReqFormat::DagCbor,
        ReqFormat::Json,
        ReqFormat::Cbor,
    ];

    /// Value of the `format` query parameter naming this format
    pub fn as_str(&self) -> &'static str {
        match self {
            ReqFormat::Raw => "raw",
            ReqFormat::Car => "car",
            ReqFormat::Tar => "tar",
            ReqFormat::IpnsRecord => "ipns-record",
            ReqFormat::DagJson => "dag-json",
            ReqFormat::DagCbor => "dag-cbor",
            ReqFormat::Json => "json",
            ReqFormat::Cbor => "cbor",
        }
    }

    /// MIME essence (no parameters) identifying this format in `Accept`
    pub fn mime_essence(&self) -> &'static str {
        match self {
            ReqFormat::Raw => "application/vnd.ipld.raw",
            ReqFormat::Car => "application/vnd.ipld.car",
            ReqFormat::Tar => "application/x-tar",
            ReqFormat::IpnsRecord => "application/vnd.ipfs.ipns-record",
            ReqFormat::DagJson => "application/vnd.ipld.dag-json",
            ReqFormat::DagCbor => "application/vnd.ipld.dag-cbor",
            ReqFormat::Json => "application/json",
            ReqFormat::Cbor => "application/cbor",
        }
    }

    /// `Content-Type` header value for a response in this format
    pub fn content_type(&self) -> &'static str {
        match self {
            ReqFormat::Car => "application/vnd.ipld.car; version=1",
            other => other.mime_essence(),
        }
    }

    /// Format matching a MIME essence, if any
    pub fn from_mime(essence: &str) -> Option<ReqFormat> {
        ReqFormat::ALL
            .into_iter()
            .find(|f| f.mime_essence().eq_ignore_ascii_case(essence))
    }

    /// Suffix appended to ETags so representations never collide
    pub fn etag_suffix(&self) -> &'static str {
        self.as_str()
    }

    /// File extension used for derived download names
    pub fn file_extension(&self) -> &'static str {
        match self {
            ReqFormat::Raw => "bin",
            ReqFormat::Car => "car",
            ReqFormat::Tar => "tar",
            ReqFormat::IpnsRecord => "ipns-record",
            ReqFormat::DagJson | ReqFormat::Json => "json",
            ReqFormat::DagCbor | ReqFormat::Cbor => "cbor",
        }
    }

    /// Whether responses in this format are downloads rather than renderings
    pub fn is_export(&self) -> bool {
        matches!(
            self,
            ReqFormat::Raw | ReqFormat::Car | ReqFormat::Tar | ReqFormat::IpnsRecord
        )
    }

    /// Multicodec this format corresponds to, for the structured-data formats
    pub fn codec(&self) -> Option<u64> {
        match self {
            ReqFormat::DagJson => Some(codecs::DAG_JSON),
            ReqFormat::DagCbor => Some(codecs::DAG_CBOR),
            ReqFormat::Json => Some(codecs::JSON),
            ReqFormat::Cbor => Some(codecs::CBOR),
            _ => None,
        }
    }
}

impl fmt::Display for ReqFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReqFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        ReqFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| GatewayError::BadRequest(format!("unsupported format '{}'", s)))
    }
}

/// How the resource reached its content identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Direct hash addressing (`/ipfs/`)
    Ipfs,
    /// Mutable name resolution (`/ipns/`)
    Ipns,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ipfs => "ipfs",
            Protocol::Ipns => "ipns",
        }
    }
}

/// A mutable name and what it resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableName {
    /// The name as it appeared in the resource
    pub name: String,
    /// TTL of the resolved record, if it carried one
    pub ttl: Option<Duration>,
}

/// Query options recognised by the gateway; everything else passes through
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub format: Option<String>,
    pub filename: Option<String>,
    pub download: bool,
    pub dag_scope: Option<String>,
    pub passthrough: BTreeMap<String, String>,
}

impl QueryOptions {
    /// Build from decoded `key=value` pairs, first occurrence wins
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = QueryOptions::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "format" if options.format.is_none() => options.format = Some(value.to_string()),
                "filename" if options.filename.is_none() => {
                    options.filename = Some(value.to_string())
                }
                "download" => options.download = value == "true",
                "dag-scope" if options.dag_scope.is_none() => {
                    options.dag_scope = Some(value.to_string())
                }
                _ => {
                    options
                        .passthrough
                        .entry(key.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }
        options
    }
}

/// A graph path: segments relative to a root content identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPath {
    root: Cid,
    segments: Vec<String>,
    trailing_slash: bool,
    mutable: bool,
}

impl GraphPath {
    pub fn new(root: Cid, segments: Vec<String>, trailing_slash: bool, mutable: bool) -> Self {
        GraphPath {
            root,
            segments,
            trailing_slash,
            mutable,
        }
    }

    pub fn root(&self) -> &Cid {
        &self.root
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether the path arrived through mutable-name resolution
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Canonical `/ipfs/<cid>[/seg...]` form
    pub fn to_ipfs_path(&self) -> String {
        let mut out = format!("/ipfs/{}", self.root);
        for segment in &self.segments {
            out.push('/');
            out.push_str(&urlencoding::encode(segment));
        }
        if self.trailing_slash {
            out.push('/');
        }
        out
    }
}

/// Output of the resource parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResource {
    /// Root content identifier of the canonical path
    pub cid: Cid,
    /// Remaining path below `cid`, without leading slash, percent-decoded
    pub path: String,
    /// Parsed query parameters
    pub query: QueryOptions,
    /// Canonical `/ipfs/...` path
    pub ipfs_path: String,
    /// Path as requested (`/ipfs/...` or `/ipns/...`)
    pub requested_path: String,
    /// How the content was addressed
    pub protocol: Protocol,
    /// Present when a mutable name was resolved
    pub mutable: Option<MutableName>,
    /// Structured form of the canonical path
    pub graph_path: GraphPath,
}

/// Duration of one named stage, rendered into `Server-Timing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTiming {
    pub name: String,
    pub duration: Duration,
}

impl StageTiming {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        StageTiming {
            name: name.into(),
            duration,
        }
    }
}

/// The node a path walk ended on
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalNode {
    /// Identifier of the block holding the terminal value
    pub cid: Cid,
    /// Raw block bytes
    pub block: Bytes,
    /// The whole block, decoded
    pub node: Ipld,
    /// Path consumed inside the block (structured-data nodes only)
    pub inner_path: Vec<String>,
    /// Value at `inner_path` (equal to `node` when `inner_path` is empty)
    pub value: Ipld,
}

impl TerminalNode {
    pub fn new(cid: Cid, block: Bytes, node: Ipld) -> Self {
        TerminalNode {
            cid,
            block,
            value: node.clone(),
            node,
            inner_path: Vec::new(),
        }
    }

    pub fn codec(&self) -> u64 {
        self.cid.codec()
    }

    /// True when the terminal is a whole block rather than a value inside one
    pub fn is_whole_block(&self) -> bool {
        self.inner_path.is_empty()
    }
}

/// Result of walking a graph path
#[derive(Debug, Clone, PartialEq)]
pub struct PathWalkResult {
    /// Every identifier visited, root first, terminal last
    pub visited_roots: Vec<Cid>,
    /// Every block fetched while walking, including intermediate directory shards
    pub path_blocks: Vec<Cid>,
    /// Node the walk ended on
    pub terminal: TerminalNode,
}

impl PathWalkResult {
    /// `X-Ipfs-Roots` header value
    pub fn roots_header(&self) -> String {
        self.visited_roots
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
