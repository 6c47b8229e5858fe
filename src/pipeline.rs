//! Ordered plugin dispatch
//!
//! Each round scans the plugin list from the head and dispatches to the first
//! plugin whose `can_handle` accepts the context. A plugin that returns no
//! response has usually enriched the context (walked the path, attached the
//! range state), so the scan restarts from the head. The number of rounds is
//! bounded by the number of plugins.

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::response::GatewayResponse;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a plugin can fail
#[derive(Debug)]
pub enum PluginError {
    /// Logged; the plugin is treated as declining for the rest of the request
    Recoverable(String),
    /// Stops dispatch. A `PluginFatal` carrying a response makes that the final
    /// response; any other error is mapped to a status by the orchestrator.
    Fatal(GatewayError),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::Recoverable(message) => write!(f, "recoverable: {}", message),
            PluginError::Fatal(err) => write!(f, "fatal: {}", err),
        }
    }
}

impl From<GatewayError> for PluginError {
    fn from(err: GatewayError) -> Self {
        PluginError::Fatal(err)
    }
}

pub type PluginResult = std::result::Result<Option<GatewayResponse>, PluginError>;

/// A format handler or context-enrichment stage
///
/// Plugins are shared across requests and must keep per-request state in the
/// context, never in themselves.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name used in logs and metrics
    fn id(&self) -> &str;

    /// Whether this plugin applies to the context as it stands
    fn can_handle(&self, ctx: &RequestContext) -> bool;

    /// Handle the request, returning `None` to let the scan restart
    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Scanning,
    Dispatched(usize),
    Exhausted,
}

/// An ordered, immutable list of plugins
#[derive(Clone, Default)]
pub struct Pipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Pipeline { plugins }
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Dispatch the context to the plugins
    ///
    /// # Returns
    /// * `Ok(response)` from the first plugin that produced one; its id is
    ///   stored in `ctx.handled_by`
    /// * `Err(NotRepresentable)` when no plugin is left to try
    /// * `Err(Internal)` when plugins keep declining past the round bound
    /// * Any fatal plugin error
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<GatewayResponse> {
        let max_rounds = self.plugins.len();
        let mut declined: HashSet<usize> = HashSet::new();
        let mut rounds = 0;
        let mut state = DispatchState::Scanning;

        loop {
            state = match state {
                DispatchState::Scanning => {
                    let view: &RequestContext = ctx;
                    self.plugins
                        .iter()
                        .enumerate()
                        .find(|(index, plugin)| !declined.contains(index) && plugin.can_handle(view))
                        .map(|(index, _)| DispatchState::Dispatched(index))
                        .unwrap_or(DispatchState::Exhausted)
                }

                DispatchState::Dispatched(index) => {
                    let plugin = &self.plugins[index];
                    match plugin.handle(ctx).await {
                        Ok(Some(response)) => {
                            ctx.handled_by = Some(plugin.id().to_string());
                            return Ok(response);
                        }
                        Ok(None) => {
                            rounds += 1;
                            if rounds > max_rounds {
                                return Err(GatewayError::Internal(format!(
                                    "plugin dispatch did not settle within {} rounds (last plugin {})",
                                    max_rounds,
                                    plugin.id()
                                )));
                            }
                            debug!(
                                "Plugin yielded without a response: plugin={}, round={}, modified={}",
                                plugin.id(),
                                rounds,
                                ctx.modified
                            );
                            DispatchState::Scanning
                        }
                        Err(PluginError::Recoverable(message)) => {
                            warn!(
                                "Plugin declined after an error: plugin={}, error={}",
                                plugin.id(),
                                message
                            );
                            declined.insert(index);
                            DispatchState::Scanning
                        }
                        Err(PluginError::Fatal(err)) => return Err(err),
                    }
                }

                DispatchState::Exhausted => {
                    debug!(
                        "No plugin could handle the request: resource={}, format={:?}",
                        ctx.resource, ctx.req_format
                    );
                    return Err(GatewayError::NotRepresentable(match ctx.req_format {
                        Some(format) => format!("cannot render {} as {}", ctx.resource, format),
                        None => format!("cannot render {}", ctx.resource),
                    }));
                }
            };
        }
    }
}
