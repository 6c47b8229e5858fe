use super::piped_body;
use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::models::{codecs, ReqFormat};
use crate::pipeline::{Plugin, PluginResult};
use crate::store::BlockFetcher;
use crate::unixfs::{self, DataType, FileReader, UnixFsNode};
use async_trait::async_trait;
use futures::TryStreamExt;
use libipld::Cid;
use tar::{EntryType, Header};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BLOCK_SIZE: usize = 512;

/// Longest name that fits the fixed header field
const NAME_FIELD_LEN: usize = 100;

/// Exports a UnixFS file or directory tree as a TAR stream
pub struct TarPlugin;

#[async_trait]
impl Plugin for TarPlugin {
    fn id(&self) -> &str {
        "tar"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.req_format == Some(ReqFormat::Tar) && ctx.path_details.is_some()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let terminal = match &ctx.path_details {
            Some(details) => details.terminal.cid,
            None => return Ok(None),
        };
        let whole_block = ctx
            .path_details
            .as_ref()
            .map(|details| details.terminal.is_whole_block())
            .unwrap_or(false);
        if !whole_block || !matches!(terminal.codec(), codecs::DAG_PB | codecs::RAW) {
            return Err(GatewayError::NotRepresentable(format!(
                "{} is not UnixFS and cannot be exported as TAR",
                terminal
            ))
            .into());
        }

        let root_name = ctx
            .parsed
            .graph_path
            .segments()
            .last()
            .cloned()
            .unwrap_or_else(|| terminal.to_string());
        debug!("Exporting TAR: root={}, name={}", terminal, root_name);

        let fetcher = ctx.fetcher().clone();
        check_tree_names(&fetcher, terminal).await?;
        let body = piped_body(move |writer| async move {
            write_archive(writer, &fetcher, terminal, root_name).await
        });

        let response = ctx.respond_stream(body, ReqFormat::Tar.content_type())?;
        Ok(Some(response))
    }
}

/// Write every entry under `root` depth-first, then the end-of-archive marker
async fn write_archive<W>(mut out: W, fetcher: &BlockFetcher, root: Cid, name: String) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut stack = vec![(name, root)];
    let mut entries = 0usize;

    while let Some((path, cid)) = stack.pop() {
        let block = fetcher.get(&cid).await?;
        let node = UnixFsNode::from_block(&cid, &block)?;

        match node.kind {
            DataType::Directory | DataType::HamtShard => {
                append_header(&mut out, &format!("{}/", path), EntryType::Directory, 0, 0o755, None)
                    .await?;
                let listing = unixfs::list_directory(fetcher, &node).await?;
                for entry in listing.into_iter().rev() {
                    check_entry_name(&entry.name)?;
                    stack.push((format!("{}/{}", path, entry.name), entry.cid));
                }
            }
            DataType::Symlink => {
                let target = String::from_utf8_lossy(node.inline_data()).into_owned();
                append_header(&mut out, &path, EntryType::Symlink, 0, 0o777, Some(&target)).await?;
            }
            DataType::File | DataType::Raw => {
                let reader = FileReader::new(fetcher.clone(), cid, block)?;
                let size = reader.size();
                append_header(&mut out, &path, EntryType::Regular, size, 0o644, None).await?;
                let mut chunks = reader.stream(0, size);
                while let Some(chunk) = chunks.try_next().await? {
                    out.write_all(&chunk).await?;
                }
                pad(&mut out, size).await?;
            }
            DataType::Metadata => {
                debug!("Skipping UnixFS metadata node in TAR: cid={}", cid);
                continue;
            }
        }
        entries += 1;
    }

    out.write_all(&[0u8; BLOCK_SIZE * 2]).await?;
    out.flush().await?;
    debug!("TAR export finished: root={}, entries={}", root, entries);
    Ok(())
}

/// Reject an unrepresentable entry anywhere below `root` before any byte is sent
async fn check_tree_names(fetcher: &BlockFetcher, root: Cid) -> Result<()> {
    let mut pending = vec![root];
    while let Some(cid) = pending.pop() {
        if cid.codec() != codecs::DAG_PB {
            continue;
        }
        let block = fetcher.get(&cid).await?;
        let node = UnixFsNode::from_block(&cid, &block)?;
        if !node.is_directory() {
            continue;
        }
        for entry in unixfs::list_directory(fetcher, &node).await? {
            check_entry_name(&entry.name)?;
            pending.push(entry.cid);
        }
    }
    Ok(())
}

/// Entry names may not climb out of the archive root
fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(GatewayError::NotRepresentable(format!(
            "directory entry '{}' cannot be placed in a TAR",
            name
        )));
    }
    Ok(())
}

async fn append_header<W>(
    out: &mut W,
    path: &str,
    entry_type: EntryType,
    size: u64,
    mode: u32,
    link_name: Option<&str>,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    if path.len() > NAME_FIELD_LEN {
        append_long_record(out, EntryType::GNULongName, path).await?;
    }
    if let Some(target) = link_name.filter(|t| t.len() > NAME_FIELD_LEN) {
        append_long_record(out, EntryType::GNULongLink, target).await?;
    }

    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    if let Some(gnu) = header.as_gnu_mut() {
        copy_truncated(&mut gnu.name, path);
        if let Some(target) = link_name {
            copy_truncated(&mut gnu.linkname, target);
        }
    }
    header.set_cksum();
    out.write_all(header.as_bytes()).await?;
    Ok(())
}

/// GNU extension record carrying a name too long for the header field
async fn append_long_record<W>(out: &mut W, kind: EntryType, value: &str) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let size = value.len() as u64 + 1;
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    if let Some(gnu) = header.as_gnu_mut() {
        copy_truncated(&mut gnu.name, "././@LongLink");
    }
    header.set_cksum();

    out.write_all(header.as_bytes()).await?;
    out.write_all(value.as_bytes()).await?;
    out.write_all(&[0]).await?;
    pad(out, size).await
}

fn copy_truncated(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Zero-fill up to the next block boundary after `written` bytes
async fn pad<W>(out: &mut W, written: u64) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let rem = (written % BLOCK_SIZE as u64) as usize;
    if rem != 0 {
        out.write_all(&[0u8; BLOCK_SIZE][..BLOCK_SIZE - rem]).await?;
    }
    Ok(())
}
