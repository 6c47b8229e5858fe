use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::models::{Protocol, ReqFormat};
use crate::pipeline::{Plugin, PluginResult};
use async_trait::async_trait;
use tracing::debug;

/// Exports the signed record behind a mutable name
pub struct IpnsRecordPlugin;

#[async_trait]
impl Plugin for IpnsRecordPlugin {
    fn id(&self) -> &str {
        "ipns-record"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.req_format == Some(ReqFormat::IpnsRecord) && ctx.byte_range_context.is_some()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let name = match (&ctx.parsed.protocol, &ctx.parsed.mutable) {
            (Protocol::Ipns, Some(mutable)) => mutable.name.clone(),
            _ => {
                return Err(GatewayError::BadRequest(
                    "ipns-record is only available for /ipns/ resources".to_string(),
                )
                .into())
            }
        };
        if has_content_path(&ctx.parsed.requested_path) {
            return Err(GatewayError::BadRequest(
                "ipns-record cannot be combined with a content path".to_string(),
            )
            .into());
        }

        let record = ctx
            .resolver()
            .fetch_record(&name, &ctx.resolve_options())
            .await?;
        debug!("Exporting name record: name={}, size={}", name, record.len());

        ctx.cache_hints.generated = true;
        let response = ctx.respond_bytes(record, ReqFormat::IpnsRecord.content_type())?;
        Ok(Some(response))
    }
}

/// Whether `/ipns/<name>/...` carries segments after the name
fn has_content_path(requested_path: &str) -> bool {
    requested_path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .count()
        > 2
}
