//! Helpers that build UnixFS and structured-data DAGs into a `MemoryBlockStore`
//!
//! Used to seed local content and as the fixture source for tests.

use crate::error::Result;
use crate::models::codecs;
use crate::store::MemoryBlockStore;
use crate::unixfs::{Data, DataType, PbLink, PbNode};
use libipld::codec::Codec;
use libipld::{Cid, Ipld, IpldCodec};
use prost::Message;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds DAGs into a shared in-memory store
#[derive(Clone)]
pub struct DagBuilder {
    store: Arc<MemoryBlockStore>,
}

impl DagBuilder {
    pub fn new(store: Arc<MemoryBlockStore>) -> Self {
        DagBuilder { store }
    }

    pub fn store(&self) -> &Arc<MemoryBlockStore> {
        &self.store
    }

    /// A raw block
    pub fn add_raw(&self, bytes: &[u8]) -> Cid {
        self.store.put(bytes.to_vec(), codecs::RAW)
    }

    /// A single-block UnixFS file
    pub fn add_file(&self, content: &[u8]) -> Result<Cid> {
        let data = Data {
            r#type: DataType::File as i32,
            data: Some(content.to_vec()),
            filesize: Some(content.len() as u64),
            ..Default::default()
        };
        self.put_pb(&data, Vec::new())
    }

    /// A UnixFS file split into raw leaves of `chunk_size` bytes under one root
    pub fn add_chunked_file(&self, content: &[u8], chunk_size: usize) -> Result<Cid> {
        let chunk_size = chunk_size.max(1);
        let mut links = Vec::new();
        let mut blocksizes = Vec::new();
        for chunk in content.chunks(chunk_size) {
            let cid = self.add_raw(chunk);
            links.push(PbLink {
                cid,
                name: String::new(),
                tsize: Some(chunk.len() as u64),
            });
            blocksizes.push(chunk.len() as u64);
        }

        let data = Data {
            r#type: DataType::File as i32,
            filesize: Some(content.len() as u64),
            blocksizes,
            ..Default::default()
        };
        self.put_pb(&data, links)
    }

    /// A UnixFS symlink pointing at `target`
    pub fn add_symlink(&self, target: &str) -> Result<Cid> {
        let data = Data {
            r#type: DataType::Symlink as i32,
            data: Some(target.as_bytes().to_vec()),
            ..Default::default()
        };
        self.put_pb(&data, Vec::new())
    }

    /// A plain UnixFS directory; entries are sorted by name as dag-pb requires
    pub fn add_directory(&self, entries: &[(String, Cid)]) -> Result<Cid> {
        let mut links: Vec<PbLink> = entries
            .iter()
            .map(|(name, cid)| PbLink {
                cid: *cid,
                name: name.clone(),
                tsize: self.block_len(cid),
            })
            .collect();
        links.sort_by(|a, b| a.name.cmp(&b.name));

        let data = Data {
            r#type: DataType::Directory as i32,
            ..Default::default()
        };
        self.put_pb(&data, links)
    }

    /// A HAMT-sharded UnixFS directory
    ///
    /// Buckets are chosen with FNV-1a over the entry name; a bucket holding
    /// more than `fanout` entries becomes a sub-shard.
    pub fn add_hamt_directory(&self, entries: &[(String, Cid)], fanout: u64) -> Result<Cid> {
        self.add_hamt_level(entries, fanout.max(2), 0)
    }

    fn add_hamt_level(&self, entries: &[(String, Cid)], fanout: u64, level: u32) -> Result<Cid> {
        let width = format!("{:X}", fanout - 1).len();
        let mut buckets: BTreeMap<u64, Vec<(String, Cid)>> = BTreeMap::new();
        for (name, cid) in entries {
            let bucket = (fnv1a(name.as_bytes()) >> (level * 8)) % fanout;
            buckets.entry(bucket).or_default().push((name.clone(), *cid));
        }

        let mut links = Vec::new();
        for (bucket, members) in buckets {
            let prefix = format!("{:0width$X}", bucket, width = width);
            if members.len() as u64 > fanout && level < 4 {
                let child = self.add_hamt_level(&members, fanout, level + 1)?;
                links.push(PbLink {
                    cid: child,
                    name: prefix,
                    tsize: self.block_len(&child),
                });
            } else {
                for (name, cid) in members {
                    links.push(PbLink {
                        cid,
                        name: format!("{}{}", prefix, name),
                        tsize: self.block_len(&cid),
                    });
                }
            }
        }
        links.sort_by(|a, b| a.name.cmp(&b.name));

        let data = Data {
            r#type: DataType::HamtShard as i32,
            fanout: Some(fanout),
            hash_type: Some(0x22),
            ..Default::default()
        };
        self.put_pb(&data, links)
    }

    /// A DAG-CBOR node
    pub fn add_dag_cbor(&self, node: &Ipld) -> Result<Cid> {
        self.put_ipld(IpldCodec::DagCbor, node)
    }

    /// A DAG-JSON node
    pub fn add_dag_json(&self, node: &Ipld) -> Result<Cid> {
        self.put_ipld(IpldCodec::DagJson, node)
    }

    /// A plain JSON document (multicodec 0x0200)
    pub fn add_json(&self, value: &serde_json::Value) -> Result<Cid> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| crate::error::GatewayError::Codec(format!("json: {}", e)))?;
        Ok(self.store.put(bytes, codecs::JSON))
    }

    fn put_ipld(&self, codec: IpldCodec, node: &Ipld) -> Result<Cid> {
        let bytes = codec
            .encode(node)
            .map_err(|e| crate::error::GatewayError::Codec(e.to_string()))?;
        Ok(self.store.put(bytes, codec.into()))
    }

    fn put_pb(&self, data: &Data, links: Vec<PbLink>) -> Result<Cid> {
        let node = PbNode {
            data: Some(data.encode_to_vec()),
            links,
        };
        Ok(self.store.put(node.encode()?, codecs::DAG_PB))
    }

    fn block_len(&self, cid: &Cid) -> Option<u64> {
        self.store.block_len(cid)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unixfs::UnixFsNode;

    #[test]
    fn test_directory_links_sorted() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let a = builder.add_file(b"a").unwrap();
        let b = builder.add_file(b"b").unwrap();
        let dir = builder
            .add_directory(&[("zeta".to_string(), a), ("alpha".to_string(), b)])
            .unwrap();

        let block = store.block(&dir).unwrap();
        let node = UnixFsNode::from_block(&dir, &block).unwrap();
        assert!(node.is_directory());
        assert_eq!(node.links[0].name, "alpha");
        assert_eq!(node.links[1].name, "zeta");
    }

    #[test]
    fn test_chunked_file_metadata() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let root = builder.add_chunked_file(&[7u8; 25], 10).unwrap();
        let node = UnixFsNode::from_block(&root, &store.block(&root).unwrap()).unwrap();
        assert_eq!(node.file_size().unwrap(), 25);
        assert_eq!(node.meta.blocksizes, vec![10, 10, 5]);
        assert_eq!(node.links.len(), 3);
    }
}
