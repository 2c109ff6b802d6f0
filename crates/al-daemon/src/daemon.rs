use std::future::Future;
use std::sync::Arc;

use al_agents::reclaimer::{CleanupOptions, CleanupStats};
use al_agents::service::LifecycleService;
use al_core::config::Config;
use tracing::info;

use crate::observers::register_lifecycle_logger;

/// Long-running host for the lifecycle service: wires the logging observer,
/// drives the orphan reclaimer on its interval and stops it on shutdown.
pub struct Daemon {
    config: Config,
    service: Arc<LifecycleService>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let service = Arc::new(LifecycleService::new(&config.reclaimer));
        Self { config, service }
    }

    /// Returns the shared service for collaborators to register agents and
    /// hooks against.
    pub fn service(&self) -> &Arc<LifecycleService> {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register observers and, when enabled, schedule cleanup passes.
    pub fn start(&self) {
        register_lifecycle_logger(self.service.hooks());

        if self.config.reclaimer.enabled {
            self.service.reclaimer().schedule_cleanup(CleanupOptions {
                timeout: Some(self.config.reclaimer.timeout()),
                interval: Some(self.config.reclaimer.interval()),
            });
        } else {
            info!("orphan reclamation disabled by config");
        }

        info!(
            timeout_secs = self.config.reclaimer.timeout_secs,
            interval_secs = self.config.reclaimer.interval_secs,
            "lifecycle daemon started"
        );
    }

    /// Start, wait for `shutdown`, then stop the schedule. Returns the
    /// final cleanup counters.
    pub async fn run_until<F>(&self, shutdown: F) -> CleanupStats
    where
        F: Future<Output = ()>,
    {
        self.start();
        shutdown.await;
        info!("shutdown signal received, stopping cleanup schedule");
        self.service.reclaimer().stop_cleanup();

        let stats = self.service.reclaimer().get_cleanup_stats();
        info!(
            total_cleaned = stats.total_cleaned,
            cleanup_runs = stats.cleanup_runs,
            "lifecycle daemon stopped"
        );
        stats
    }
}
