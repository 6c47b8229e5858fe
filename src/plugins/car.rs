use super::piped_body;
use crate::accept::DagScope;
use crate::codec::CodecRegistry;
use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::models::{codecs, ReqFormat};
use crate::pipeline::{Plugin, PluginResult};
use crate::store::BlockFetcher;
use crate::unixfs::UnixFsNode;
use async_trait::async_trait;
use bytes::Bytes;
use iroh_car::{CarHeader, CarWriter};
use libipld::Cid;
use std::collections::HashSet;
use tokio::io::AsyncWrite;
use tracing::debug;

/// Exports the path and the terminal's subgraph as a CARv1 stream
pub struct CarPlugin;

#[async_trait]
impl Plugin for CarPlugin {
    fn id(&self) -> &str {
        "car"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.req_format == Some(ReqFormat::Car) && ctx.path_details.is_some()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let details = match &ctx.path_details {
            Some(details) => details,
            None => return Ok(None),
        };
        let root = details.visited_roots.first().copied().unwrap_or(ctx.cid);
        let plan = CarPlan {
            root,
            path_blocks: details.path_blocks.clone(),
            terminal: details.terminal.cid,
            scope: ctx.dag_scope,
            dups: ctx.car.dups,
        };
        debug!(
            "Exporting CAR: root={}, terminal={}, scope={:?}, dups={}",
            plan.root, plan.terminal, plan.scope, plan.dups
        );

        let fetcher = ctx.fetcher().clone();
        let codecs = ctx.codecs().clone();
        let body = piped_body(move |writer| async move {
            plan.write(writer, &fetcher, &codecs).await
        });

        let response = ctx.respond_stream(body, ReqFormat::Car.content_type())?;
        Ok(Some(response))
    }
}

/// Everything the producer task needs to write one CAR
struct CarPlan {
    root: Cid,
    path_blocks: Vec<Cid>,
    terminal: Cid,
    scope: DagScope,
    dups: bool,
}

impl CarPlan {
    async fn write<W>(self, writer: W, fetcher: &BlockFetcher, codecs: &CodecRegistry) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut car = CarWriter::new(CarHeader::new_v1(vec![self.root]), writer);
        car.write_header().await.map_err(car_error)?;

        let mut seen = HashSet::new();
        let mut written = 0usize;

        for cid in self.path_blocks.iter().filter(|cid| **cid != self.terminal) {
            if !self.dups && !seen.insert(*cid) {
                continue;
            }
            let block = fetcher.get(cid).await?;
            car.write(*cid, &block).await.map_err(car_error)?;
            written += 1;
        }

        let mut stack = vec![self.terminal];
        while let Some(cid) = stack.pop() {
            if !self.dups && !seen.insert(cid) {
                continue;
            }
            let block = fetcher.get(&cid).await?;
            let mut children = self.children(&cid, &block, codecs)?;
            car.write(cid, &block).await.map_err(car_error)?;
            written += 1;

            // reversed so the first link is visited first
            children.reverse();
            stack.extend(children);
        }

        car.finish().await.map_err(car_error)?;
        debug!("CAR export finished: root={}, blocks={}", self.root, written);
        Ok(())
    }

    /// Links of `cid` that belong in the export for the requested scope
    fn children(&self, cid: &Cid, block: &Bytes, codecs: &CodecRegistry) -> Result<Vec<Cid>> {
        match self.scope {
            DagScope::Block => Ok(Vec::new()),
            DagScope::Entity => match cid.codec() {
                codecs::DAG_PB => Ok(UnixFsNode::from_block(cid, block)?.entity_children()),
                _ => Ok(Vec::new()),
            },
            DagScope::All => {
                if codecs.supports(cid.codec()) {
                    codecs.links(cid.codec(), block)
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }
}

fn car_error(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Io(format!("CAR encoding failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_builder::DagBuilder;
    use crate::store::MemoryBlockStore;
    use iroh_car::CarReader;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn export(plan: CarPlan, store: Arc<MemoryBlockStore>) -> (Vec<Cid>, Vec<Cid>) {
        let fetcher = BlockFetcher::new(store, CancellationToken::new(), Duration::from_secs(5), 4);
        let mut out = Vec::new();
        plan.write(&mut out, &fetcher, &CodecRegistry::new())
            .await
            .unwrap();

        let mut reader = CarReader::new(Cursor::new(out)).await.unwrap();
        let roots = reader.header().roots().to_vec();
        let mut blocks = Vec::new();
        while let Some((cid, _)) = reader.next_block().await.unwrap() {
            blocks.push(cid);
        }
        (roots, blocks)
    }

    #[tokio::test]
    async fn test_scope_all_walks_depth_first() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let a = builder.add_file(b"alpha").unwrap();
        let b = builder.add_file(b"beta").unwrap();
        let dir = builder
            .add_directory(&[("a".to_string(), a), ("b".to_string(), b)])
            .unwrap();

        let plan = CarPlan {
            root: dir,
            path_blocks: vec![dir],
            terminal: dir,
            scope: DagScope::All,
            dups: false,
        };
        let (roots, blocks) = export(plan, store).await;
        assert_eq!(roots, vec![dir]);
        assert_eq!(blocks, vec![dir, a, b]);
    }

    #[tokio::test]
    async fn test_scope_block_and_path_prefix() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let file = builder.add_chunked_file(b"0123456789", 4).unwrap();
        let dir = builder.add_directory(&[("f".to_string(), file)]).unwrap();

        let plan = CarPlan {
            root: dir,
            path_blocks: vec![dir, file],
            terminal: file,
            scope: DagScope::Block,
            dups: false,
        };
        let (roots, blocks) = export(plan, store).await;
        assert_eq!(roots, vec![dir]);
        assert_eq!(blocks, vec![dir, file]);
    }

    #[tokio::test]
    async fn test_duplicates_only_when_requested() {
        let store = Arc::new(MemoryBlockStore::new());
        let builder = DagBuilder::new(store.clone());
        let same = builder.add_file(b"same").unwrap();
        let dir = builder
            .add_directory(&[("x".to_string(), same), ("y".to_string(), same)])
            .unwrap();

        let plan = |dups| CarPlan {
            root: dir,
            path_blocks: vec![dir],
            terminal: dir,
            scope: DagScope::All,
            dups,
        };
        let (_, deduped) = export(plan(false), store.clone()).await;
        assert_eq!(deduped, vec![dir, same]);
        let (_, with_dups) = export(plan(true), store).await;
        assert_eq!(with_dups, vec![dir, same, same]);
    }
}
