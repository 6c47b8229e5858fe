use crate::context::RequestContext;
use crate::models::ReqFormat;
use crate::path_walker::PathWalker;
use crate::pipeline::{Plugin, PluginResult};
use async_trait::async_trait;
use std::time::Instant;

/// Walks the request path and stores the result in `path_details`
pub struct DagWalkPlugin;

#[async_trait]
impl Plugin for DagWalkPlugin {
    fn id(&self) -> &str {
        "dag-walk"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.byte_range_context.is_some()
            && ctx.path_details.is_none()
            && ctx.req_format != Some(ReqFormat::IpnsRecord)
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let start = Instant::now();
        let result = PathWalker::new(ctx.fetcher(), ctx.codecs())
            .walk(&ctx.parsed.graph_path)
            .await;
        ctx.record_timing("walk", start.elapsed());

        ctx.path_details = Some(result?);
        ctx.mark_modified();
        Ok(None)
    }
}
