//! Logging setup shared by agent-lifecycle binaries.
//!
//! Everything logs through `tracing`; this crate only installs the
//! `tracing-subscriber` formatter, human-readable or JSON.

pub mod logging;
