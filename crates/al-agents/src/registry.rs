use std::time::Duration;

use al_core::types::{duration_ms_opt, AgentFilter, AgentStatus, HistoryEntry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::state_machine::{AgentStateMachine, StateMachineError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

// ---------------------------------------------------------------------------
// AgentRecord
// ---------------------------------------------------------------------------

/// One tracked agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    #[serde(flatten)]
    pub(crate) state: AgentStateMachine,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub registered_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
    /// Overrides the reclaimer's default inactivity timeout for this agent.
    #[serde(default, with = "duration_ms_opt", skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<Duration>,
    /// Caller-supplied fields this crate never interprets
    /// (capabilities, token/cost counters, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentRecord {
    pub fn status(&self) -> AgentStatus {
        self.state.status()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.state.history()
    }

    /// Time since the agent last reported activity, as seen at `now`.
    /// Zero when `last_activity` lies in the future.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn matches(&self, filter: &AgentFilter) -> bool {
        filter.matches(
            self.status(),
            self.model.as_deref(),
            self.agent_type.as_deref(),
        )
    }
}

// ---------------------------------------------------------------------------
// NewAgent / AgentPatch
// ---------------------------------------------------------------------------

/// Registration input. Everything except `name` is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, with = "duration_ms_opt")]
    pub grace_period: Option<Duration>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = Some(at);
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Partial update applied by [`AgentRegistry::update_agent`].
///
/// Status is deliberately absent: it only changes through
/// [`AgentRegistry::transition`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, with = "duration_ms_opt")]
    pub grace_period: Option<Duration>,
    /// Merged key by key into the record's metadata; `null` removes a key.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = Some(at);
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn apply(self, record: &mut AgentRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(model) = self.model {
            record.model = Some(model);
        }
        if let Some(agent_type) = self.agent_type {
            record.agent_type = Some(agent_type);
        }
        if let Some(at) = self.last_activity {
            record.last_activity = at;
        }
        if let Some(grace) = self.grace_period {
            record.grace_period = Some(grace);
        }
        for (key, value) in self.metadata {
            if value.is_null() {
                record.metadata.remove(&key);
            } else {
                record.metadata.insert(key, value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Authoritative in-memory store of agent records.
///
/// Every operation is synchronous and runs under the map's per-entry lock,
/// so readers never observe a half-applied update or transition.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<Uuid, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Store a new agent and return its freshly generated id.
    pub fn register_agent(&self, data: NewAgent) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let status = data.status.unwrap_or_default();

        let record = AgentRecord {
            id,
            name: data.name,
            model: data.model,
            agent_type: data.agent_type,
            state: AgentStateMachine::new(status, now),
            registered_at: now,
            last_activity: data.last_activity.unwrap_or(now),
            grace_period: data.grace_period,
            metadata: data.metadata,
        };

        info!(id = %id, name = %record.name, status = %status, "agent registered");
        self.agents.insert(id, record);
        id
    }

    /// List agents matching `filter` (all agents when `None`), oldest first.
    pub fn list_agents(&self, filter: Option<&AgentFilter>) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .agents
            .iter()
            .filter(|entry| filter.map_or(true, |f| entry.value().matches(f)))
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        agents
    }

    /// Snapshot of a single agent.
    pub fn get_agent(&self, id: Uuid) -> Option<AgentRecord> {
        self.agents.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.agents.contains_key(&id)
    }

    /// Merge `patch` into the stored record. Returns `false` for an unknown id.
    pub fn update_agent(&self, id: Uuid, patch: AgentPatch) -> bool {
        match self.agents.get_mut(&id) {
            Some(mut entry) => {
                patch.apply(entry.value_mut());
                debug!(id = %id, "agent updated");
                true
            }
            None => false,
        }
    }

    /// Record activity for `id` now. Returns `false` for an unknown id.
    pub fn touch(&self, id: Uuid) -> bool {
        self.update_agent(id, AgentPatch::new().last_activity(Utc::now()))
    }

    /// Apply a status transition and return the updated record.
    pub fn transition(&self, id: Uuid, to: AgentStatus) -> Result<AgentRecord, RegistryError> {
        let mut entry = self
            .agents
            .get_mut(&id)
            .ok_or(RegistryError::AgentNotFound(id))?;
        entry.value_mut().state.transition(to, Utc::now())?;
        Ok(entry.value().clone())
    }

    /// Like [`transition`](Self::transition), but only when `pred` holds for
    /// the record as it is under the entry lock. Returns `Ok(None)` when the
    /// predicate rejects it; nothing is changed in that case.
    pub fn transition_if<P>(
        &self,
        id: Uuid,
        to: AgentStatus,
        pred: P,
    ) -> Result<Option<AgentRecord>, RegistryError>
    where
        P: FnOnce(&AgentRecord) -> bool,
    {
        let mut entry = self
            .agents
            .get_mut(&id)
            .ok_or(RegistryError::AgentNotFound(id))?;
        if !pred(entry.value()) {
            return Ok(None);
        }
        entry.value_mut().state.transition(to, Utc::now())?;
        Ok(Some(entry.value().clone()))
    }

    /// Delete an agent. Returns `false` if it was not present.
    pub fn remove_agent(&self, id: Uuid) -> bool {
        let removed = self.agents.remove(&id).is_some();
        if removed {
            debug!(id = %id, "agent removed");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.agents.clear();
    }
}
