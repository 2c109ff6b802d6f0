use std::sync::Arc;

use al_core::config::ReclaimerConfig;
use al_core::types::AgentStatus;
use tracing::info;
use uuid::Uuid;

use crate::hooks::{HookContext, HookDispatcher, HookOutcome, HookType};
use crate::reclaimer::Reclaimer;
use crate::registry::{AgentRecord, AgentRegistry, RegistryError};

pub type Result<T> = std::result::Result<T, RegistryError>;

/// The one owner of the registry, the hook dispatcher and the reclaimer.
///
/// Build it once at startup and hand out clones of the `Arc`s it exposes
/// (or an `Arc<LifecycleService>`) to collaborators.
pub struct LifecycleService {
    registry: Arc<AgentRegistry>,
    hooks: Arc<HookDispatcher>,
    reclaimer: Arc<Reclaimer>,
}

impl LifecycleService {
    pub fn new(config: &ReclaimerConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let hooks = Arc::new(HookDispatcher::new());
        let reclaimer = Arc::new(Reclaimer::from_config(
            Arc::clone(&registry),
            Arc::clone(&hooks),
            config,
        ));
        Self {
            registry,
            hooks,
            reclaimer,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    /// `pending -> running`, then `onStart`.
    pub async fn start_agent(&self, id: Uuid) -> Result<(AgentRecord, Vec<HookOutcome>)> {
        self.transition_and_notify(id, AgentStatus::Running, HookType::OnStart, None)
            .await
    }

    /// `running -> completed`, then `onComplete`.
    pub async fn complete_agent(&self, id: Uuid) -> Result<(AgentRecord, Vec<HookOutcome>)> {
        self.transition_and_notify(id, AgentStatus::Completed, HookType::OnComplete, None)
            .await
    }

    /// `running -> failed`, then `onError` with `error` as the reason.
    pub async fn fail_agent(
        &self,
        id: Uuid,
        error: impl Into<String>,
    ) -> Result<(AgentRecord, Vec<HookOutcome>)> {
        self.transition_and_notify(id, AgentStatus::Failed, HookType::OnError, Some(error.into()))
            .await
    }

    /// `pending|running -> cancelled`, then `onCancel`.
    pub async fn cancel_agent(
        &self,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(AgentRecord, Vec<HookOutcome>)> {
        self.transition_and_notify(
            id,
            AgentStatus::Cancelled,
            HookType::OnCancel,
            Some(reason.into()),
        )
        .await
    }

    async fn transition_and_notify(
        &self,
        id: Uuid,
        to: AgentStatus,
        hook: HookType,
        reason: Option<String>,
    ) -> Result<(AgentRecord, Vec<HookOutcome>)> {
        let record = self.registry.transition(id, to)?;
        let mut ctx = HookContext::for_agent(record.clone());
        ctx.reason = reason;
        let outcomes = self.hooks.trigger_hook(hook, &ctx).await;
        Ok((record, outcomes))
    }

    /// Stop the schedule, zero the stats, drop every hook and agent.
    pub fn reset(&self) {
        self.reclaimer.reset_cleanup();
        self.hooks.clear_hooks(None);
        self.registry.clear();
        info!("lifecycle service reset");
    }
}

impl Default for LifecycleService {
    fn default() -> Self {
        Self::new(&ReclaimerConfig::default())
    }
}
