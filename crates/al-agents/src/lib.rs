//! Lifecycle tracking for dispatched agent executions.
//!
//! - [`state_machine`]: legal status transitions and the append-only history.
//! - [`registry`]: the in-memory store of agent records.
//! - [`hooks`]: ordered, failure-isolated lifecycle observers.
//! - [`reclaimer`]: periodic cancellation of orphaned running agents.
//! - [`service`]: the single owner wiring the above together.

pub mod hooks;
pub mod reclaimer;
pub mod registry;
pub mod service;
pub mod state_machine;
