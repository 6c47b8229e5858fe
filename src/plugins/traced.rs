use crate::context::RequestContext;
use crate::pipeline::{Plugin, PluginError, PluginResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Logs the decisions and timing of the plugin it wraps
pub struct Traced {
    inner: Arc<dyn Plugin>,
}

impl Traced {
    /// Wrap a plugin for insertion into a pipeline
    pub fn wrap<P: Plugin + 'static>(plugin: P) -> Arc<dyn Plugin> {
        Arc::new(Traced {
            inner: Arc::new(plugin),
        })
    }
}

#[async_trait]
impl Plugin for Traced {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        let accepted = self.inner.can_handle(ctx);
        trace!("can_handle: plugin={}, accepted={}", self.inner.id(), accepted);
        accepted
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let start = Instant::now();
        let modified_before = ctx.modified;
        let result = self.inner.handle(ctx).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(Some(response)) => debug!(
                "Plugin responded: plugin={}, status={}, elapsed={:?}",
                self.inner.id(),
                response.status,
                elapsed
            ),
            Ok(None) => debug!(
                "Plugin passed: plugin={}, modified={}, elapsed={:?}",
                self.inner.id(),
                ctx.modified - modified_before,
                elapsed
            ),
            Err(PluginError::Recoverable(message)) => warn!(
                "Plugin error (recoverable): plugin={}, error={}, elapsed={:?}",
                self.inner.id(),
                message,
                elapsed
            ),
            Err(PluginError::Fatal(err)) if err.is_aborted() => debug!(
                "Plugin aborted: plugin={}, elapsed={:?}",
                self.inner.id(),
                elapsed
            ),
            Err(PluginError::Fatal(err)) => warn!(
                "Plugin error (fatal): plugin={}, kind={}, error={}, elapsed={:?}",
                self.inner.id(),
                err.kind(),
                err,
                elapsed
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::RawPlugin;

    #[test]
    fn test_wrapper_keeps_inner_id() {
        let traced = Traced::wrap(RawPlugin);
        assert_eq!(traced.id(), "raw");
    }
}
