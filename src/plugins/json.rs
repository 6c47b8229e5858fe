use super::structured::{render, target_format};
use crate::context::RequestContext;
use crate::models::ReqFormat;
use crate::pipeline::{Plugin, PluginResult};
use async_trait::async_trait;

const FORMATS: [ReqFormat; 2] = [ReqFormat::DagJson, ReqFormat::Json];

/// Renders DAG-JSON and plain JSON
pub struct JsonPlugin;

#[async_trait]
impl Plugin for JsonPlugin {
    fn id(&self) -> &str {
        "json"
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
