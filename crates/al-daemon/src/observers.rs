use std::sync::Arc;

use al_agents::hooks::{HookContext, HookDispatcher, HookHandle, HookHandler, HookType};
use serde_json::{json, Value};
use tracing::info;

/// Logs every lifecycle event it receives and echoes a short summary back
/// as its hook result.
pub struct LifecycleLogger {
    hook_type: HookType,
}

impl LifecycleLogger {
    pub fn new(hook_type: HookType) -> Self {
        Self { hook_type }
    }
}

#[async_trait::async_trait]
impl HookHandler for LifecycleLogger {
    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<Value> {
        let Some(agent) = ctx.agent.as_ref() else {
            info!(hook = %self.hook_type, "lifecycle event without agent");
            return Ok(Value::Null);
        };

        info!(
            hook = %self.hook_type,
            id = %agent.id,
            name = %agent.name,
            status = %agent.status(),
            reason = ctx.reason.as_deref().unwrap_or("-"),
            timeout_secs = ctx.timeout.map(|t| t.as_secs()),
            "agent lifecycle event"
        );
        Ok(json!({ "id": agent.id, "status": agent.status() }))
    }
}

/// Attach a [`LifecycleLogger`] to every hook type.
pub fn register_lifecycle_logger(hooks: &HookDispatcher) -> Vec<HookHandle> {
    HookType::ALL
        .into_iter()
        .map(|hook_type| hook_type_logger(hooks, hook_type))
        .collect()
}

fn hook_type_logger(hooks: &HookDispatcher, hook_type: HookType) -> HookHandle {
    hooks.register_hook(hook_type, Arc::new(LifecycleLogger::new(hook_type)))
}
