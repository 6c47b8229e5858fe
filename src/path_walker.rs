//! Walks a graph path from its root identifier to the terminal node
//!
//! UnixFS directories resolve segments by entry name (HAMT shards included).
//! Structured-data nodes resolve segments as map keys or list indices, and a
//! link reached that way continues the walk in the linked block. Raw blocks
//! and UnixFS files have no children.

use crate::codec::CodecRegistry;
use crate::error::{GatewayError, Result};
use crate::models::{codecs, GraphPath, PathWalkResult, TerminalNode};
use crate::store::BlockFetcher;
use crate::unixfs::{self, PbNode, UnixFsNode};
use libipld::{Cid, Ipld};
use tracing::debug;

/// Where a segment led
enum Step {
    /// Into another block
    Link(Cid),
    /// Path fully consumed inside the current block
    Inner { inner_path: Vec<String>, value: Ipld },
}

/// Walks paths using the request's fetcher
pub struct PathWalker<'a> {
    fetcher: &'a BlockFetcher,
    codecs: &'a CodecRegistry,
}

impl<'a> PathWalker<'a> {
    pub fn new(fetcher: &'a BlockFetcher, codecs: &'a CodecRegistry) -> Self {
        PathWalker { fetcher, codecs }
    }

    /// Walk `path` to its terminal node
    ///
    /// # Returns
    /// * `Ok(PathWalkResult)` with every visited identifier, root first
    /// * `Err(PathNotFound)` when a segment has no matching link
    /// * `Err(MalformedPath)` for `.` or `..` segments
    /// * `Err(Aborted)` when the request is cancelled mid-walk
    /// * Store and codec errors as reported
    pub async fn walk(&self, path: &GraphPath) -> Result<PathWalkResult> {
        let display = path.to_ipfs_path();
        let segments = path.segments();

        for segment in segments {
            if segment == "." || segment == ".." {
                return Err(GatewayError::MalformedPath(format!(
                    "'{}' in {}",
                    segment, display
                )));
            }
        }

        let mut visited_roots = Vec::new();
        let mut path_blocks = Vec::new();
        let mut current = *path.root();
        let mut consumed = 0;

        loop {
            if self.fetcher.cancel_token().is_cancelled() {
                return Err(GatewayError::aborted("walk"));
            }

            let block = self.fetcher.get(&current).await?;
            visited_roots.push(current);
            path_blocks.push(current);
            let node = match self.codecs.decode(current.codec(), &block) {
                Ok(node) => node,
                // Opaque terminal; raw and CAR exports still work
                Err(_) if !self.codecs.supports(current.codec()) && consumed == segments.len() => {
                    Ipld::Bytes(block.to_vec())
                }
                Err(err) => return Err(err),
            };

            if consumed == segments.len() {
                // tracing's macro brings `field::display` into scope, shadowing the local
                let walked_path = &display;
                debug!(
                    "Path walk finished: path={}, terminal={}, visited={}",
                    walked_path,
                    current,
                    visited_roots.len()
                );
                return Ok(PathWalkResult {
                    visited_roots,
                    path_blocks,
                    terminal: TerminalNode::new(current, block, node),
                });
            }

            let remaining = &segments[consumed..];
            let (step, used) = match current.codec() {
                codecs::DAG_PB => {
                    let (next, shards) = self.step_dag_pb(&node, &remaining[0], &display).await?;
                    path_blocks.extend(shards);
                    (Step::Link(next), 1)
                }
                codecs::RAW => {
                    return Err(GatewayError::path_not_found(
                        display,
                        format!("{} is a raw block and has no links", current),
                    ))
                }
                _ => step_structured(&node, remaining, &display)?,
            };
            consumed += used;

            match step {
                Step::Link(next) => {
                    debug!(
                        "Path walk step: from={}, to={}, consumed={}",
                        current, next, consumed
                    );
                    current = next;
                }
                Step::Inner { inner_path, value } => {
                    let mut terminal = TerminalNode::new(current, block, node);
                    terminal.inner_path = inner_path;
                    terminal.value = value;
                    return Ok(PathWalkResult {
                        visited_roots,
                        path_blocks,
                        terminal,
                    });
                }
            }
        }
    }

    async fn step_dag_pb(&self, node: &Ipld, segment: &str, display: &str) -> Result<(Cid, Vec<Cid>)> {
        match UnixFsNode::from_ipld(node) {
            Ok(dir) if dir.is_directory() => {
                let (found, shards) = unixfs::lookup(self.fetcher, &dir, segment).await?;
                match found {
                    Some(cid) => Ok((cid, shards)),
                    None => Err(GatewayError::path_not_found(
                        display,
                        format!("no entry named '{}'", segment),
                    )),
                }
            }
            Ok(_) => Err(GatewayError::path_not_found(
                display,
                format!("'{}' is below a node that is not a directory", segment),
            )),
            // dag-pb without UnixFS data: plain named links
            Err(_) => {
                let pb = PbNode::from_ipld(node)?;
                pb.links
                    .iter()
                    .find(|l| l.name == segment)
                    .map(|l| (l.cid, Vec::new()))
                    .ok_or_else(|| {
                        GatewayError::path_not_found(display, format!("no link named '{}'", segment))
                    })
            }
        }
    }
}

/// Descend into a structured-data node as far as the segments allow
///
/// Returns the step and how many segments it used.
fn step_structured(node: &Ipld, segments: &[String], display: &str) -> Result<(Step, usize)> {
    let mut value = node;
    for (index, segment) in segments.iter().enumerate() {
        let next = match value {
            Ipld::Map(map) => map.get(segment.as_str()),
            Ipld::List(list) => segment.parse::<usize>().ok().and_then(|i| list.get(i)),
            _ => None,
        };
        let next = next.ok_or_else(|| {
            GatewayError::path_not_found(display, format!("no field or index '{}'", segment))
        })?;

        if let Ipld::Link(cid) = next {
            return Ok((Step::Link(*cid), index + 1));
        }
        value = next;
    }

    Ok((
        Step::Inner {
            inner_path: segments.to_vec(),
            value: value.clone(),
        },
        segments.len(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_builder::DagBuilder;
    use crate::store::MemoryBlockStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Arc<MemoryBlockStore>, DagBuilder, BlockFetcher) {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let fetcher = BlockFetcher::new(
            store.clone(),
            CancellationToken::new(),
            Duration::from_secs(5),
            1,
        );
        (store, builder, fetcher)
    }

    fn path(root: Cid, segments: &[&str]) -> GraphPath {
        GraphPath::new(
            root,
            segments.iter().map(|s| s.to_string()).collect(),
            false,
            false,
        )
    }

    #[tokio::test]
    async fn test_walk_unixfs_directories() {
        let (_, builder, fetcher) = setup();
        let file = builder.add_file(b"hello").unwrap();
        let inner = builder.add_directory(&[("hello.txt".to_string(), file)]).unwrap();
        let root = builder.add_directory(&[("docs".to_string(), inner)]).unwrap();

        let codecs = CodecRegistry::default();
        let result = PathWalker::new(&fetcher, &codecs)
            .walk(&path(root, &["docs", "hello.txt"]))
            .await
            .unwrap();
        assert_eq!(result.visited_roots, vec![root, inner, file]);
        assert_eq!(result.terminal.cid, file);
        assert!(result.terminal.is_whole_block());
    }

    #[tokio::test]
    async fn test_walk_missing_entry_is_not_found() {
        let (_, builder, fetcher) = setup();
        let root = builder.add_directory(&[]).unwrap();
        let codecs = CodecRegistry::default();
        let err = PathWalker::new(&fetcher, &codecs)
            .walk(&path(root, &["missing"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PathNotFound { .. }));
        assert_eq!(err.to_http_status(), 404);
    }

    #[tokio::test]
    async fn test_walk_below_file_is_not_found() {
        let (_, builder, fetcher) = setup();
        let file = builder.add_file(b"x").unwrap();
        let raw = builder.add_raw(b"y");
        let codecs = CodecRegistry::default();
        let walker = PathWalker::new(&fetcher, &codecs);
        assert!(matches!(
            walker.walk(&path(file, &["a"])).await,
            Err(GatewayError::PathNotFound { .. })
        ));
        assert!(matches!(
            walker.walk(&path(raw, &["a"])).await,
            Err(GatewayError::PathNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_walk_rejects_dot_segments() {
        let (_, builder, fetcher) = setup();
        let root = builder.add_directory(&[]).unwrap();
        let codecs = CodecRegistry::default();
        let err = PathWalker::new(&fetcher, &codecs)
            .walk(&path(root, &[".."]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPath(_)));
    }

    #[tokio::test]
    async fn test_walk_hamt_directory() {
        let (_, builder, fetcher) = setup();
        let entries: Vec<(String, Cid)> = (0..40)
            .map(|i| {
                let name = format!("file-{}.txt", i);
                let cid = builder.add_file(name.as_bytes()).unwrap();
                (name, cid)
            })
            .collect();
        let root = builder.add_hamt_directory(&entries, 4).unwrap();

        let codecs = CodecRegistry::default();
        let result = PathWalker::new(&fetcher, &codecs)
            .walk(&path(root, &["file-17.txt"]))
            .await
            .unwrap();
        assert_eq!(result.terminal.cid, entries[17].1);
        assert_eq!(result.visited_roots.first(), Some(&root));
        assert_eq!(result.visited_roots.last(), Some(&entries[17].1));
        assert!(result.path_blocks.len() >= result.visited_roots.len());
    }

    #[tokio::test]
    async fn test_walk_structured_data_across_links() {
        let (_, builder, fetcher) = setup();
        let mut leaf = BTreeMap::new();
        leaf.insert("name".to_string(), Ipld::String("leaf".to_string()));
        leaf.insert(
            "tags".to_string(),
            Ipld::List(vec![Ipld::String("a".into()), Ipld::String("b".into())]),
        );
        let leaf_cid = builder.add_dag_cbor(&Ipld::Map(leaf)).unwrap();

        let mut root = BTreeMap::new();
        root.insert("child".to_string(), Ipld::Link(leaf_cid));
        let root_cid = builder.add_dag_json(&Ipld::Map(root)).unwrap();

        let codecs = CodecRegistry::default();
        let walker = PathWalker::new(&fetcher, &codecs);

        let result = walker.walk(&path(root_cid, &["child", "tags", "1"])).await.unwrap();
        assert_eq!(result.visited_roots, vec![root_cid, leaf_cid]);
        assert_eq!(result.terminal.cid, leaf_cid);
        assert_eq!(result.terminal.inner_path, vec!["tags".to_string(), "1".to_string()]);
        assert_eq!(result.terminal.value, Ipld::String("b".to_string()));

        let err = walker.walk(&path(root_cid, &["child", "tags", "9"])).await.unwrap_err();
        assert!(matches!(err, GatewayError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_walk_cancelled_is_aborted() {
        let (_, builder, fetcher) = setup();
        let root = builder.add_directory(&[]).unwrap();
        fetcher.cancel_token().cancel();
        let codecs = CodecRegistry::default();
        let err = PathWalker::new(&fetcher, &codecs)
            .walk(&path(root, &[]))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_walk_missing_block_is_store_error() {
        let (store, builder, fetcher) = setup();
        let file = builder.add_file(b"gone").unwrap();
        let root = builder.add_directory(&[("f".to_string(), file)]).unwrap();
        store.remove(&file);

        let codecs = CodecRegistry::default();
        let err = PathWalker::new(&fetcher, &codecs)
            .walk(&path(root, &["f"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_http_status(), 502);
    }
}
