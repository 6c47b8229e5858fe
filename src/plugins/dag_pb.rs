use crate::byte_range::RangeBody;
use crate::content_type::{self, HTML_UTF8, OCTET_STREAM};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::models::codecs;
use crate::pipeline::{Plugin, PluginResult};
use crate::unixfs::{self, FileReader, UnixFsNode};
use async_trait::async_trait;
use tracing::debug;

/// Bytes inspected when sniffing a file's content type
const SNIFF_LEN: u64 = 512;

/// Renders UnixFS content when no format was negotiated
///
/// Files are served with a sniffed content type and honour ranges.
/// Directories serve their `index.html`; a directory without one is flagged
/// for the directory-listing plugin.
pub struct DagPbPlugin;

#[async_trait]
impl Plugin for DagPbPlugin {
    fn id(&self) -> &str {
        "dag-pb"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        if ctx.req_format.is_some() || ctx.needs_dir_index {
            return false;
        }
        match &ctx.path_details {
            Some(details) => {
                matches!(details.terminal.codec(), codecs::DAG_PB | codecs::RAW)
                    && details.terminal.is_whole_block()
            }
            None => false,
        }
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let (cid, block) = match &ctx.path_details {
            Some(details) => (details.terminal.cid, details.terminal.block.clone()),
            None => return Ok(None),
        };

        if cid.codec() == codecs::RAW {
            let content_type = content_type::resolve(&block, ctx.filename_hint(), OCTET_STREAM);
            return Ok(Some(ctx.respond_bytes(block, &content_type)?));
        }

        let node = UnixFsNode::from_block(&cid, &block).map_err(|e| {
            GatewayError::NotRepresentable(format!("{} is not UnixFS: {}", cid, e))
        })?;

        if node.is_directory() {
            let (index, _) = unixfs::lookup(ctx.fetcher(), &node, "index.html").await?;
            let index = match index {
                Some(index) => index,
                None => {
                    debug!("Directory has no index.html: cid={}", cid);
                    ctx.needs_dir_index = true;
                    ctx.mark_modified();
                    return Ok(None);
                }
            };
            let index_block = ctx.fetch_block(&index).await?;
            let reader = FileReader::new(ctx.fetcher().clone(), index, index_block)?;
            let total_size = reader.size();
            let response = ctx.respond(
                RangeBody::Sized {
                    total_size,
                    source: Box::new(reader),
                },
                HTML_UTF8,
            )?;
            return Ok(Some(response));
        }

        if !node.is_file() {
            return Err(GatewayError::NotRepresentable(format!(
                "UnixFS node {} of type {:?} has no rendering",
                cid, node.kind
            ))
            .into());
        }

        let reader = FileReader::new(ctx.fetcher().clone(), cid, block)?;
        let head = reader.read(0, SNIFF_LEN).await?;
        let content_type = content_type::resolve(&head, ctx.filename_hint(), OCTET_STREAM);
        let total_size = reader.size();
        debug!(
            "Serving UnixFS file: cid={}, size={}, content_type={}",
            cid, total_size, content_type
        );

        let response = ctx.respond(
            RangeBody::Sized {
                total_size,
                source: Box::new(reader),
            },
            &content_type,
        )?;
        Ok(Some(response))
    }
}
