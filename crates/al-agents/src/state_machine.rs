use al_core::types::{AgentStatus, HistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during agent state machine transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// The requested status is not reachable from the current one.
    ///
    /// Legal edges are `pending -> running`, `pending -> cancelled`,
    /// `running -> completed`, `running -> failed` and
    /// `running -> cancelled`. The machine is left unchanged.
    #[error("invalid transition: cannot move from {from} to {to}")]
    InvalidTransition {
        /// The current status when the transition was attempted.
        from: AgentStatus,
        /// The status that was requested.
        to: AgentStatus,
    },
}

// ---------------------------------------------------------------------------
// AgentStateMachine
// ---------------------------------------------------------------------------

/// Current status of an agent together with every status it has held.
///
/// Both fields live in one value so a status change and its history entry
/// are always applied together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateMachine {
    status: AgentStatus,
    history: Vec<HistoryEntry>,
}

impl AgentStateMachine {
    /// Create a machine in `initial`, seeding the history with that status.
    pub fn new(initial: AgentStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: initial,
            history: vec![HistoryEntry::new(initial, at)],
        }
    }

    /// Return the current status.
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// Return the full status history, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Returns `true` if `to` is reachable from the current status.
    pub fn can_transition(&self, to: AgentStatus) -> bool {
        self.status.can_transition_to(&to)
    }

    /// Move to `to`, appending a history entry stamped `at`.
    ///
    /// History timestamps never go backwards: an `at` earlier than the last
    /// entry is clamped to it.
    pub fn transition(
        &mut self,
        to: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<AgentStatus, StateMachineError> {
        if !self.can_transition(to) {
            return Err(StateMachineError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        let at = match self.history.last() {
            Some(last) if last.timestamp > at => last.timestamp,
            _ => at,
        };

        let from = self.status;
        self.status = to;
        self.history.push(HistoryEntry::new(to, at));
        tracing::debug!(from = %from, to = %to, "agent state transition");
        Ok(to)
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new(AgentStatus::Pending, Utc::now())
    }
}
