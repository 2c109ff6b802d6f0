//! agent-lifecycle daemon — tracks agent executions and reclaims orphans
//! until ctrl-c.

use std::path::PathBuf;

use al_core::config::Config;
use al_daemon::daemon::Daemon;
use al_telemetry::logging::{self, LogFormat};
use anyhow::{Context, Result};
use tracing::warn;

/// Overrides `~/.agent-lifecycle/config.toml`.
const CONFIG_ENV: &str = "AGENT_LIFECYCLE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => Config::load_from(PathBuf::from(path))
            .with_context(|| format!("failed to load config from ${CONFIG_ENV}"))?,
        None => Config::load().context("failed to load config")?,
    };

    logging::init(
        "al-daemon",
        &config.general.log_level,
        LogFormat::from_name(&config.general.log_format),
    );

    let daemon = Daemon::new(config);
    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await;
    Ok(())
}
