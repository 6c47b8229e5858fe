use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::models::ReqFormat;
use crate::pipeline::{Plugin, PluginResult};
use async_trait::async_trait;

/// Serves the terminal block's bytes verbatim (`application/vnd.ipld.raw`)
pub struct RawPlugin;

#[async_trait]
impl Plugin for RawPlugin {
    fn id(&self) -> &str {
        "raw"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.req_format == Some(ReqFormat::Raw) && ctx.path_details.is_some()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let terminal = match &ctx.path_details {
            Some(details) => &details.terminal,
            None => return Ok(None),
        };
        if !terminal.is_whole_block() {
            return Err(GatewayError::NotRepresentable(format!(
                "/{} is a value inside block {}, not a block",
                terminal.inner_path.join("/"),
                terminal.cid
            ))
            .into());
        }

        let block = terminal.block.clone();
        let response = ctx.respond_bytes(block, ReqFormat::Raw.content_type())?;
        Ok(Some(response))
    }
}
