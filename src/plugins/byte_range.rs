use crate::byte_range::ByteRangeContext;
use crate::context::RequestContext;
use crate::pipeline::{Plugin, PluginResult};
use async_trait::async_trait;
use tracing::debug;

/// Attaches the range state; an unparseable `Range` header fails the request
/// with 416 before any content is fetched
pub struct ByteRangeContextPlugin;

#[async_trait]
impl Plugin for ByteRangeContextPlugin {
    fn id(&self) -> &str {
        "byte-range-context"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.byte_range_context.is_none()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let ranges = ByteRangeContext::from_headers(&ctx.options.headers);
        if ranges.is_range_request() {
            debug!(
                "Range requested: header={:?}, valid={}",
                ranges.header(),
                ranges.is_valid_range_request()
            );
        }
        let invalid = ranges.validation_error();
        ctx.byte_range_context = Some(ranges);
        ctx.mark_modified();

        match invalid {
            Some(err) => Err(err.into()),
            None => Ok(None),
        }
    }
}
