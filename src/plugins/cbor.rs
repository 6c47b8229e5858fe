use super::structured::{render, target_format};
use crate::context::RequestContext;
use crate::models::ReqFormat;
use crate::pipeline::{Plugin, PluginResult};
use async_trait::async_trait;

const FORMATS: [ReqFormat; 2] = [ReqFormat::DagCbor, ReqFormat::Cbor];

/// Renders DAG-CBOR and plain CBOR
pub struct CborPlugin;

#[async_trait]
impl Plugin for CborPlugin {
    fn id(&self) -> &str {
        "cbor"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        target_format(ctx, &FORMATS).is_some()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        match target_format(ctx, &FORMATS) {
            Some(format) => render(ctx, format),
            None => Ok(None),
        }
    }
}
