//! UnixFS on top of dag-pb: file and directory semantics
//!
//! Covers the `Data` protobuf carried in dag-pb nodes, plain and HAMT-sharded
//! directory lookup and listing, and a pull-based file reader that streams an
//! arbitrary byte window of a multi-block file, fetching only the blocks that
//! overlap the window.

use crate::byte_range::RangeSource;
use crate::error::{GatewayError, Result};
use crate::models::codecs;
use crate::response::BodyStream;
use crate::store::BlockFetcher;
use bytes::Bytes;
use libipld::codec::Codec;
use libipld::{Cid, Ipld, IpldCodec};
use prost::Message;
use std::collections::BTreeMap;
use tracing::debug;

/// UnixFS node type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DataType {
    Raw = 0,
    Directory = 1,
    File = 2,
    Metadata = 3,
    Symlink = 4,
    HamtShard = 5,
}

/// The UnixFS `Data` message stored in a dag-pb node's data field
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(enumeration = "DataType", required, tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "3")]
    pub filesize: Option<u64>,
    #[prost(uint64, repeated, packed = "false", tag = "4")]
    pub blocksizes: Vec<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub hash_type: Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub fanout: Option<u64>,
    #[prost(uint32, optional, tag = "7")]
    pub mode: Option<u32>,
}

/// A dag-pb link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbLink {
    pub cid: Cid,
    pub name: String,
    pub tsize: Option<u64>,
}

/// A dag-pb node in structured form
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PbNode {
    pub data: Option<Vec<u8>>,
    pub links: Vec<PbLink>,
}

impl PbNode {
    /// Read the `{Data, Links}` shape a dag-pb block decodes to
    pub fn from_ipld(node: &Ipld) -> Result<Self> {
        let map = match node {
            Ipld::Map(map) => map,
            _ => return Err(GatewayError::Codec("dag-pb node is not a map".to_string())),
        };

        let data = match map.get("Data") {
            Some(Ipld::Bytes(bytes)) => Some(bytes.clone()),
            None | Some(Ipld::Null) => None,
            Some(_) => return Err(GatewayError::Codec("dag-pb Data is not bytes".to_string())),
        };

        let mut links = Vec::new();
        if let Some(Ipld::List(items)) = map.get("Links") {
            for item in items {
                let link = match item {
                    Ipld::Map(link) => link,
                    _ => return Err(GatewayError::Codec("dag-pb link is not a map".to_string())),
                };
                let cid = match link.get("Hash") {
                    Some(Ipld::Link(cid)) => *cid,
                    _ => return Err(GatewayError::Codec("dag-pb link without Hash".to_string())),
                };
                let name = match link.get("Name") {
                    Some(Ipld::String(name)) => name.clone(),
                    _ => String::new(),
                };
                let tsize = match link.get("Tsize") {
                    Some(Ipld::Integer(size)) => u64::try_from(*size).ok(),
                    _ => None,
                };
                links.push(PbLink { cid, name, tsize });
            }
        }

        Ok(PbNode { data, links })
    }

    pub fn to_ipld(&self) -> Ipld {
        let links = self
            .links
            .iter()
            .map(|link| {
                let mut entry = BTreeMap::new();
                entry.insert("Hash".to_string(), Ipld::Link(link.cid));
                entry.insert("Name".to_string(), Ipld::String(link.name.clone()));
                if let Some(size) = link.tsize {
                    entry.insert("Tsize".to_string(), Ipld::Integer(size as i128));
                }
                Ipld::Map(entry)
            })
            .collect();

        let mut map = BTreeMap::new();
        map.insert("Links".to_string(), Ipld::List(links));
        if let Some(data) = &self.data {
            map.insert("Data".to_string(), Ipld::Bytes(data.clone()));
        }
        Ipld::Map(map)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        IpldCodec::DagPb
            .encode(&self.to_ipld())
            .map_err(|e| GatewayError::Codec(format!("dag-pb: {}", e)))
    }
}

/// A UnixFS node (or a raw leaf, which behaves as a file)
#[derive(Debug, Clone, PartialEq)]
pub struct UnixFsNode {
    pub kind: DataType,
    pub meta: Data,
    pub links: Vec<PbLink>,
}

impl UnixFsNode {
    /// Interpret a block as UnixFS
    ///
    /// Raw blocks are file leaves. dag-pb blocks must carry a `Data` message.
    pub fn from_block(cid: &Cid, bytes: &[u8]) -> Result<Self> {
        match cid.codec() {
            codecs::RAW => Ok(Self::raw_leaf(bytes)),
            codecs::DAG_PB => {
                let node = IpldCodec::DagPb
                    .decode::<Ipld>(bytes)
                    .map_err(|e| GatewayError::Codec(format!("dag-pb: {}", e)))?;
                Self::from_ipld(&node)
            }
            other => Err(GatewayError::NotRepresentable(format!(
                "codec 0x{:x} is not UnixFS",
                other
            ))),
        }
    }

    /// Interpret an already decoded dag-pb node
    pub fn from_ipld(node: &Ipld) -> Result<Self> {
        let pb = PbNode::from_ipld(node)?;
        let data = pb
            .data
            .as_deref()
            .ok_or_else(|| GatewayError::Codec("dag-pb node has no UnixFS data".to_string()))?;
        let meta = Data::decode(data)
            .map_err(|e| GatewayError::Codec(format!("unixfs: {}", e)))?;
        let kind = DataType::try_from(meta.r#type).map_err(|_| {
            GatewayError::Codec(format!("unknown UnixFS type {}", meta.r#type))
        })?;
        Ok(UnixFsNode {
            kind,
            meta,
            links: pb.links,
        })
    }

    fn raw_leaf(bytes: &[u8]) -> Self {
        UnixFsNode {
            kind: DataType::Raw,
            meta: Data {
                r#type: DataType::Raw as i32,
                data: Some(bytes.to_vec()),
                filesize: Some(bytes.len() as u64),
                ..Default::default()
            },
            links: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, DataType::Directory | DataType::HamtShard)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, DataType::File | DataType::Raw | DataType::Symlink)
    }

    /// Bytes stored in this node itself
    pub fn inline_data(&self) -> &[u8] {
        self.meta.data.as_deref().unwrap_or_default()
    }

    /// Logical size of the file rooted at this node
    ///
    /// A declared `filesize` must agree with the inline bytes plus the child
    /// block sizes, or the node cannot be framed.
    pub fn file_size(&self) -> Result<u64> {
        let counted = self
            .meta
            .blocksizes
            .iter()
            .try_fold(self.inline_data().len() as u64, |acc, size| acc.checked_add(*size))
            .ok_or_else(|| GatewayError::Codec("UnixFS block sizes overflow".to_string()))?;
        match self.meta.filesize {
            Some(declared) if declared != counted => Err(GatewayError::Codec(format!(
                "UnixFS filesize {} disagrees with {} stored bytes",
                declared, counted
            ))),
            _ => Ok(counted),
        }
    }

    /// Width of the bucket prefix in HAMT link names
    fn hamt_prefix_len(&self) -> usize {
        let fanout = self.meta.fanout.unwrap_or(256).max(2);
        format!("{:X}", fanout - 1).len()
    }

    /// Children that belong to the same entity: file chunks or HAMT sub-shards
    pub fn entity_children(&self) -> Vec<Cid> {
        match self.kind {
            DataType::File | DataType::Raw => self.links.iter().map(|l| l.cid).collect(),
            DataType::HamtShard => {
                let width = self.hamt_prefix_len();
                self.links
                    .iter()
                    .filter(|l| l.name.len() == width)
                    .map(|l| l.cid)
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub cid: Cid,
    pub size: Option<u64>,
}

/// Find `name` in a directory node
///
/// # Returns
/// The entry's identifier, if present, and every shard block fetched on the
/// way (empty for plain directories)
pub async fn lookup(
    fetcher: &BlockFetcher,
    dir: &UnixFsNode,
    name: &str,
) -> Result<(Option<Cid>, Vec<Cid>)> {
    match dir.kind {
        DataType::Directory => Ok((
            dir.links.iter().find(|l| l.name == name).map(|l| l.cid),
            Vec::new(),
        )),
        DataType::HamtShard => {
            // Linear scan over every bucket; the bucket hash is never computed
            let mut shards = Vec::new();
            let mut pending = vec![dir.clone()];
            while let Some(shard) = pending.pop() {
                let width = shard.hamt_prefix_len();
                for link in &shard.links {
                    if link.name.len() == width {
                        let bytes = fetcher.get(&link.cid).await?;
                        shards.push(link.cid);
                        pending.push(UnixFsNode::from_block(&link.cid, &bytes)?);
                    } else if link.name.get(width..) == Some(name) {
                        return Ok((Some(link.cid), shards));
                    }
                }
            }
            Ok((None, shards))
        }
        _ => Err(GatewayError::Internal(
            "lookup called on a non-directory node".to_string(),
        )),
    }
}

/// List a directory, flattening HAMT shards; entries are sorted by name
pub async fn list_directory(fetcher: &BlockFetcher, dir: &UnixFsNode) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    match dir.kind {
        DataType::Directory => {
            for link in &dir.links {
                entries.push(DirEntry {
                    name: link.name.clone(),
                    cid: link.cid,
                    size: link.tsize,
                });
            }
        }
        DataType::HamtShard => {
            let mut pending = vec![dir.clone()];
            while let Some(shard) = pending.pop() {
                let width = shard.hamt_prefix_len();
                for link in &shard.links {
                    if link.name.len() == width {
                        let bytes = fetcher.get(&link.cid).await?;
                        pending.push(UnixFsNode::from_block(&link.cid, &bytes)?);
                    } else {
                        entries.push(DirEntry {
                            name: link.name.get(width..).unwrap_or_default().to_string(),
                            cid: link.cid,
                            size: link.tsize,
                        });
                    }
                }
            }
        }
        _ => {
            return Err(GatewayError::Internal(
                "list_directory called on a non-directory node".to_string(),
            ))
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

struct PendingBlock {
    cid: Cid,
    block: Option<Bytes>,
    /// File offset at which this node's content starts
    offset: u64,
}

struct ReadState {
    fetcher: BlockFetcher,
    stack: Vec<PendingBlock>,
    start: u64,
    end: u64,
}

impl ReadState {
    /// Pop blocks until one contributes bytes to the window
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        while let Some(pending) = self.stack.pop() {
            let bytes = match pending.block {
                Some(bytes) => bytes,
                None => self.fetcher.get(&pending.cid).await?,
            };
            let node = UnixFsNode::from_block(&pending.cid, &bytes)?;

            let data = node.inline_data();
            let data_end = pending
                .offset
                .checked_add(data.len() as u64)
                .ok_or_else(|| GatewayError::Codec(format!("file node {} overflows", pending.cid)))?;
            let mut chunk = None;
            let (lo, hi) = (self.start.max(pending.offset), self.end.min(data_end));
            if lo < hi {
                let from = (lo - pending.offset) as usize;
                let to = (hi - pending.offset) as usize;
                chunk = Some(Bytes::copy_from_slice(&data[from..to]));
            }

            if !node.links.is_empty() && node.meta.blocksizes.len() != node.links.len() {
                return Err(GatewayError::Codec(format!(
                    "file node {} has {} links but {} block sizes",
                    pending.cid,
                    node.links.len(),
                    node.meta.blocksizes.len()
                )));
            }

            let mut child_offset = data_end;
            let mut children = Vec::new();
            for (link, size) in node.links.iter().zip(node.meta.blocksizes.iter()) {
                let child_end = child_offset.checked_add(*size).ok_or_else(|| {
                    GatewayError::Codec(format!("file node {} block sizes overflow", pending.cid))
                })?;
                if child_offset < self.end && child_end > self.start {
                    children.push(PendingBlock {
                        cid: link.cid,
                        block: None,
                        offset: child_offset,
                    });
                }
                child_offset = child_end;
            }
            self.stack.extend(children.into_iter().rev());

            if chunk.is_some() {
                return Ok(chunk);
            }
        }
        Ok(None)
    }
}

/// Streams bytes of a UnixFS file
pub struct FileReader {
    fetcher: BlockFetcher,
    root: Cid,
    root_block: Bytes,
    size: u64,
}

impl FileReader {
    /// Create a reader for the file whose root block is already in hand
    pub fn new(fetcher: BlockFetcher, root: Cid, root_block: Bytes) -> Result<Self> {
        let node = UnixFsNode::from_block(&root, &root_block)?;
        if !node.is_file() {
            return Err(GatewayError::NotRepresentable(format!(
                "{} is not a file",
                root
            )));
        }
        let size = node.file_size()?;
        Ok(FileReader {
            fetcher,
            root,
            size,
            root_block,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn state(&self, offset: u64, length: u64) -> ReadState {
        ReadState {
            fetcher: self.fetcher.clone(),
            stack: vec![PendingBlock {
                cid: self.root,
                block: Some(self.root_block.clone()),
                offset: 0,
            }],
            start: offset,
            end: offset.saturating_add(length).min(self.size),
        }
    }

    /// Read a window fully into memory
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut state = self.state(offset, length);
        let mut out = Vec::new();
        while let Some(chunk) = state.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }

    /// Stream a window, fetching blocks only as the consumer pulls
    pub fn stream(&self, offset: u64, length: u64) -> BodyStream {
        debug!(
            "Streaming file window: root={}, offset={}, length={}",
            self.root, offset, length
        );
        let state = self.state(offset, length);
        Box::pin(futures::stream::try_unfold(state, |mut state| async move {
            let chunk = state.next_chunk().await?;
            Ok::<_, GatewayError>(chunk.map(|chunk| (chunk, state)))
        }))
    }
}

impl RangeSource for FileReader {
    fn read_window(self: Box<Self>, offset: u64, length: u64) -> BodyStream {
        self.stream(offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_builder::DagBuilder;
    use crate::store::{BlockStore, MemoryBlockStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn fetcher(store: Arc<MemoryBlockStore>) -> BlockFetcher {
        BlockFetcher::new(store, CancellationToken::new(), Duration::from_secs(5), 1)
    }

    #[test]
    fn test_data_message_round_trip() {
        let data = Data {
            r#type: DataType::File as i32,
            data: Some(b"abc".to_vec()),
            filesize: Some(3),
            ..Default::default()
        };
        let decoded = Data::decode(data.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(DataType::try_from(decoded.r#type).unwrap(), DataType::File);
    }

    #[tokio::test]
    async fn test_chunked_file_window_reads_only_needed_blocks() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let content: Vec<u8> = (0..100u8).collect();
        let root = builder.add_chunked_file(&content, 10).unwrap();

        let root_block = store
            .get(&root, &Default::default())
            .await
            .unwrap();
        let before = store.fetch_count();
        let reader = FileReader::new(fetcher(store.clone()), root, root_block).unwrap();
        assert_eq!(reader.size(), 100);

        let window = reader.read(25, 10).await.unwrap();
        assert_eq!(&window[..], &content[25..35]);
        // two 10-byte leaves overlap [25, 35)
        assert_eq!(store.fetch_count() - before, 2);
    }

    #[tokio::test]
    async fn test_stream_whole_file() {
        use futures::TryStreamExt;
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let content = b"the quick brown fox jumps over the lazy dog".to_vec();
        let root = builder.add_chunked_file(&content, 7).unwrap();
        let root_block = store.get(&root, &Default::default()).await.unwrap();

        let reader = FileReader::new(fetcher(store), root, root_block).unwrap();
        let chunks: Vec<Bytes> = reader.stream(0, reader.size()).try_collect().await.unwrap();
        assert_eq!(chunks.concat(), content);
    }

    fn put_file_node(store: &MemoryBlockStore, meta: Data, links: Vec<PbLink>) -> (Cid, Bytes) {
        let node = PbNode {
            data: Some(meta.encode_to_vec()),
            links,
        };
        let bytes = Bytes::from(node.encode().unwrap());
        let cid = store.put(bytes.clone(), codecs::DAG_PB);
        (cid, bytes)
    }

    #[test]
    fn test_block_size_overflow_is_codec_error() {
        let store = Arc::new(MemoryBlockStore::new());
        let leaf = crate::store::cid_for(b"x", codecs::RAW);
        let link = PbLink {
            cid: leaf,
            name: String::new(),
            tsize: None,
        };
        let links = vec![link.clone(), link];
        let meta = Data {
            r#type: DataType::File as i32,
            blocksizes: vec![u64::MAX, 5],
            ..Default::default()
        };
        let (cid, block) = put_file_node(&store, meta, links);

        let err = FileReader::new(fetcher(store), cid, block).err().unwrap();
        assert!(matches!(err, GatewayError::Codec(_)));
        assert_eq!(err.to_http_status(), 502);
    }

    #[test]
    fn test_declared_filesize_must_match_content() {
        let store = Arc::new(MemoryBlockStore::new());
        let meta = Data {
            r#type: DataType::File as i32,
            data: Some(b"hi".to_vec()),
            filesize: Some(100),
            ..Default::default()
        };
        let (cid, block) = put_file_node(&store, meta, Vec::new());
        let err = FileReader::new(fetcher(store.clone()), cid, block).err().unwrap();
        assert!(matches!(err, GatewayError::Codec(_)));

        let honest = Data {
            r#type: DataType::File as i32,
            data: Some(b"hi".to_vec()),
            filesize: Some(2),
            ..Default::default()
        };
        let (cid, block) = put_file_node(&store, honest, Vec::new());
        let reader = FileReader::new(fetcher(store), cid, block).unwrap();
        assert_eq!(reader.size(), 2);
    }

    #[tokio::test]
    async fn test_hamt_lookup_and_listing() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let mut entries = Vec::new();
        for i in 0..20 {
            let cid = builder.add_file(format!("file {}", i).as_bytes()).unwrap();
            entries.push((format!("f{:02}.txt", i), cid));
        }
        let root = builder.add_hamt_directory(&entries, 4).unwrap();
        let root_block = store.get(&root, &Default::default()).await.unwrap();
        let dir = UnixFsNode::from_block(&root, &root_block).unwrap();
        assert_eq!(dir.kind, DataType::HamtShard);

        let fetcher = fetcher(store);
        let (found, _) = lookup(&fetcher, &dir, "f13.txt").await.unwrap();
        assert_eq!(found, Some(entries[13].1));
        let (missing, _) = lookup(&fetcher, &dir, "nope").await.unwrap();
        assert!(missing.is_none());

        let listing = list_directory(&fetcher, &dir).await.unwrap();
        assert_eq!(listing.len(), 20);
        assert_eq!(listing[0].name, "f00.txt");
    }
}
