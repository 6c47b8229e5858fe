//! Shared rendering for the structured-data formats

use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::models::ReqFormat;
use crate::pipeline::PluginResult;
use bytes::Bytes;
use tracing::debug;

/// The format among `candidates` this request should be rendered in
///
/// An explicit format must be one of the candidates. Without one, the
/// terminal block's own codec decides.
pub(super) fn target_format(ctx: &RequestContext, candidates: &[ReqFormat]) -> Option<ReqFormat> {
    let details = ctx.path_details.as_ref()?;
    match ctx.req_format {
        Some(format) => candidates.contains(&format).then_some(format),
        None => candidates
            .iter()
            .copied()
            .find(|format| format.codec() == Some(details.terminal.codec())),
    }
}

/// Render the terminal value in `format`
///
/// Same-codec requests for a whole block return the block unchanged; anything
/// else is transcoded through the codec registry.
pub(super) fn render(ctx: &mut RequestContext, format: ReqFormat) -> PluginResult {
    let target = format
        .codec()
        .ok_or_else(|| GatewayError::Internal(format!("{} is not a structured format", format)))?;
    let terminal = match &ctx.path_details {
        Some(details) => &details.terminal,
        None => return Ok(None),
    };

    let body = if terminal.is_whole_block() && terminal.codec() == target {
        terminal.block.clone()
    } else {
        debug!(
            "Transcoding terminal: cid={}, from=0x{:x}, to={}",
            terminal.cid,
            terminal.codec(),
            format
        );
        Bytes::from(ctx.codecs().encode(target, &terminal.value)?)
    };

    let response = ctx.respond_bytes(body, format.content_type())?;
    Ok(Some(response))
}
