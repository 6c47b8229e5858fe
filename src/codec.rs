//! Codec registry: decoding and encoding graph nodes by multicodec
//!
//! The dag codecs come from `libipld`; plain JSON goes through `serde_json`
//! and plain CBOR reuses the DAG-CBOR decoder. Extension codecs can be
//! registered at runtime.

use crate::error::{GatewayError, Result};
use crate::models::codecs;
use libipld::codec::Codec;
use libipld::{Cid, Ipld, IpldCodec};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A graph-node format
pub trait NodeCodec: Send + Sync {
    /// Multicodec code handled by this codec
    fn code(&self) -> u64;

    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8]) -> Result<Ipld>;

    fn encode(&self, node: &Ipld) -> Result<Vec<u8>>;

    /// Links held by the block, in encoding order
    fn links(&self, bytes: &[u8]) -> Result<Vec<Cid>> {
        let node = self.decode(bytes)?;
        let mut links = Vec::new();
        collect_links(&node, &mut links);
        Ok(links)
    }
}

/// Append every link found in `node` (depth first) to `out`
pub fn collect_links(node: &Ipld, out: &mut Vec<Cid>) {
    match node {
        Ipld::Link(cid) => out.push(*cid),
        Ipld::List(items) => items.iter().for_each(|item| collect_links(item, out)),
        Ipld::Map(entries) => entries.values().for_each(|value| collect_links(value, out)),
        _ => {}
    }
}

/// Whether `node` contains a link anywhere
pub fn has_links(node: &Ipld) -> bool {
    match node {
        Ipld::Link(_) => true,
        Ipld::List(items) => items.iter().any(has_links),
        Ipld::Map(entries) => entries.values().any(has_links),
        _ => false,
    }
}

fn codec_error(codec: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Codec(format!("{}: {}", codec, err))
}

/// One of the dag codecs implemented by `libipld`
struct DagCodec {
    codec: IpldCodec,
    name: &'static str,
}

impl NodeCodec for DagCodec {
    fn code(&self) -> u64 {
        self.codec.into()
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ipld> {
        self.codec
            .decode::<Ipld>(bytes)
            .map_err(|e| codec_error(self.name, e))
    }

    fn encode(&self, node: &Ipld) -> Result<Vec<u8>> {
        self.codec.encode(node).map_err(|e| codec_error(self.name, e))
    }
}

struct RawCodec;

impl NodeCodec for RawCodec {
    fn code(&self) -> u64 {
        codecs::RAW
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ipld> {
        Ok(Ipld::Bytes(bytes.to_vec()))
    }

    fn encode(&self, node: &Ipld) -> Result<Vec<u8>> {
        match node {
            Ipld::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(GatewayError::NotRepresentable(
                "only byte strings can be encoded as raw".to_string(),
            )),
        }
    }

    fn links(&self, _bytes: &[u8]) -> Result<Vec<Cid>> {
        Ok(Vec::new())
    }
}

/// Plain JSON (0x0200); no links and no byte strings
struct JsonCodec;

impl NodeCodec for JsonCodec {
    fn code(&self) -> u64 {
        codecs::JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ipld> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| codec_error("json", e))?;
        Ok(json_to_ipld(value))
    }

    fn encode(&self, node: &Ipld) -> Result<Vec<u8>> {
        let value = ipld_to_json(node)?;
        serde_json::to_vec(&value).map_err(|e| codec_error("json", e))
    }

    fn links(&self, _bytes: &[u8]) -> Result<Vec<Cid>> {
        Ok(Vec::new())
    }
}

/// Plain CBOR (0x51), decoded with the DAG-CBOR decoder; links are rejected
struct CborCodec;

impl NodeCodec for CborCodec {
    fn code(&self) -> u64 {
        codecs::CBOR
    }

    fn name(&self) -> &'static str {
        "cbor"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ipld> {
        IpldCodec::DagCbor
            .decode::<Ipld>(bytes)
            .map_err(|e| codec_error("cbor", e))
    }

    fn encode(&self, node: &Ipld) -> Result<Vec<u8>> {
        if has_links(node) {
            return Err(GatewayError::NotRepresentable(
                "links cannot be encoded as plain cbor".to_string(),
            ));
        }
        IpldCodec::DagCbor
            .encode(node)
            .map_err(|e| codec_error("cbor", e))
    }

    fn links(&self, _bytes: &[u8]) -> Result<Vec<Cid>> {
        Ok(Vec::new())
    }
}

fn json_to_ipld(value: serde_json::Value) -> Ipld {
    use serde_json::Value;
    match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ipld::Integer(u as i128)
            } else {
                Ipld::Float(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Ipld::String(s),
        Value::Array(items) => Ipld::List(items.into_iter().map(json_to_ipld).collect()),
        Value::Object(entries) => Ipld::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, json_to_ipld(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}

fn ipld_to_json(node: &Ipld) -> Result<serde_json::Value> {
    use serde_json::Value;
    Ok(match node {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => {
            if let Ok(v) = i64::try_from(*i) {
                Value::from(v)
            } else if let Ok(v) = u64::try_from(*i) {
                Value::from(v)
            } else {
                return Err(GatewayError::NotRepresentable(format!(
                    "integer {} does not fit in json",
                    i
                )));
            }
        }
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| {
                GatewayError::NotRepresentable(format!("float {} is not representable", f))
            })?,
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(_) => {
            return Err(GatewayError::NotRepresentable(
                "byte strings cannot be encoded as plain json".to_string(),
            ))
        }
        Ipld::Link(_) => {
            return Err(GatewayError::NotRepresentable(
                "links cannot be encoded as plain json".to_string(),
            ))
        }
        Ipld::List(items) => Value::Array(items.iter().map(ipld_to_json).collect::<Result<_>>()?),
        Ipld::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), ipld_to_json(v)?)))
                .collect::<Result<serde_json::Map<_, _>>>()?,
        ),
    })
}

/// Registry of codecs keyed by multicodec code
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<u64, Arc<dyn NodeCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = CodecRegistry {
            codecs: HashMap::new(),
        };
        registry.register(Arc::new(RawCodec));
        registry.register(Arc::new(DagCodec {
            codec: IpldCodec::DagPb,
            name: "dag-pb",
        }));
        registry.register(Arc::new(DagCodec {
            codec: IpldCodec::DagCbor,
            name: "dag-cbor",
        }));
        registry.register(Arc::new(DagCodec {
            codec: IpldCodec::DagJson,
            name: "dag-json",
        }));
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(CborCodec));
        registry
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a codec
    pub fn register(&mut self, codec: Arc<dyn NodeCodec>) {
        self.codecs.insert(codec.code(), codec);
    }

    pub fn supports(&self, code: u64) -> bool {
        self.codecs.contains_key(&code)
    }

    pub fn get(&self, code: u64) -> Result<&Arc<dyn NodeCodec>> {
        self.codecs
            .get(&code)
            .ok_or_else(|| GatewayError::Codec(format!("unsupported codec 0x{:x}", code)))
    }

    pub fn decode(&self, code: u64, bytes: &[u8]) -> Result<Ipld> {
        self.get(code)?.decode(bytes)
    }

    pub fn encode(&self, code: u64, node: &Ipld) -> Result<Vec<u8>> {
        self.get(code)?.encode(node)
    }

    pub fn links(&self, code: u64, bytes: &[u8]) -> Result<Vec<Cid>> {
        self.get(code)?.links(bytes)
    }
}
