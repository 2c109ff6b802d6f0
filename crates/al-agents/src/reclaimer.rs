use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use al_core::config::ReclaimerConfig;
use al_core::types::{AgentFilter, AgentStatus};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::hooks::{HookContext, HookDispatcher, HookType};
use crate::registry::{AgentRecord, AgentRegistry};

/// Inactivity after which a running agent is reclaimed when neither the
/// agent nor the caller specify a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Delay between scheduled cleanup passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Reason attached to cancellations performed by the reclaimer.
pub const ORPHAN_REASON: &str = "orphaned";

// ---------------------------------------------------------------------------
// Options / results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Overrides the reclaimer's default timeout (an agent's own grace
    /// period still wins).
    pub timeout: Option<Duration>,
    /// Tick period for [`Reclaimer::schedule_cleanup`].
    pub interval: Option<Duration>,
}

impl CleanupOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            interval: None,
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            timeout: None,
            interval: Some(interval),
        }
    }
}

/// Process-wide cleanup counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub total_cleaned: u64,
    pub cleanup_runs: u64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupErrorKind {
    /// The agent could not be moved to `cancelled`.
    Transition,
    /// An `onCancel` handler failed after the agent was cancelled.
    Hook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupError {
    pub id: Uuid,
    pub error: String,
    #[serde(rename = "type")]
    pub kind: CleanupErrorKind,
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub cleaned: Vec<AgentRecord>,
    pub errors: Vec<CleanupError>,
}

struct Schedule {
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Reclaimer
// ---------------------------------------------------------------------------

/// Finds running agents that stopped reporting activity and cancels them.
///
/// Passes never overlap: a pass started while another is running waits for
/// it and then scans the registry afresh.
pub struct Reclaimer {
    registry: Arc<AgentRegistry>,
    hooks: Arc<HookDispatcher>,
    default_timeout: Duration,
    default_interval: Duration,
    stats: Mutex<CleanupStats>,
    /// Bumped by `reset_cleanup`; a pass started before a reset does not
    /// count towards the fresh stats.
    stats_epoch: AtomicU64,
    pass_lock: tokio::sync::Mutex<()>,
    schedule: Mutex<Option<Schedule>>,
}

impl Reclaimer {
    pub fn new(registry: Arc<AgentRegistry>, hooks: Arc<HookDispatcher>) -> Self {
        Self {
            registry,
            hooks,
            default_timeout: DEFAULT_TIMEOUT,
            default_interval: DEFAULT_INTERVAL,
            stats: Mutex::new(CleanupStats::default()),
            stats_epoch: AtomicU64::new(0),
            pass_lock: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(None),
        }
    }

    pub fn from_config(
        registry: Arc<AgentRegistry>,
        hooks: Arc<HookDispatcher>,
        config: &ReclaimerConfig,
    ) -> Self {
        let mut reclaimer = Self::new(registry, hooks);
        reclaimer.default_timeout = config.timeout();
        reclaimer.default_interval = config.interval();
        reclaimer
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Timeout that applies to `agent`: its grace period, else the
    /// caller's override, else the configured default.
    pub fn effective_timeout(&self, agent: &AgentRecord, opts: &CleanupOptions) -> Duration {
        agent
            .grace_period
            .or(opts.timeout)
            .unwrap_or(self.default_timeout)
    }

    /// Running agents idle for strictly longer than their effective timeout.
    pub fn find_orphaned_agents(&self, opts: &CleanupOptions) -> Vec<AgentRecord> {
        self.find_orphaned_agents_at(Utc::now(), opts)
    }

    /// Same as [`find_orphaned_agents`](Self::find_orphaned_agents), measured
    /// against `now`.
    pub fn find_orphaned_agents_at(
        &self,
        now: DateTime<Utc>,
        opts: &CleanupOptions,
    ) -> Vec<AgentRecord> {
        let running = AgentFilter::new().status(AgentStatus::Running);
        self.registry
            .list_agents(Some(&running))
            .into_iter()
            .filter(|agent| agent.idle_for(now) > self.effective_timeout(agent, opts))
            .collect()
    }

    /// Cancel every orphan and notify `onCancel` observers.
    ///
    /// Per-agent failures land in [`CleanupReport::errors`]; an agent whose
    /// handlers failed is still reported as cleaned. Staleness is checked
    /// again under the entry lock right before each cancellation, so an agent
    /// that reported activity during the pass is skipped.
    pub async fn cleanup_orphans(&self, opts: &CleanupOptions) -> CleanupReport {
        let _pass = self.pass_lock.lock().await;
        let epoch = self.stats_epoch.load(Ordering::Acquire);
        let mut report = CleanupReport::default();

        for orphan in self.find_orphaned_agents(opts) {
            let mut timeout = self.effective_timeout(&orphan, opts);
            let mut idle = Duration::ZERO;
            // Earlier onCancel handlers may have run since the scan; re-check
            // staleness against the live record.
            let still_stale = |current: &AgentRecord| {
                timeout = self.effective_timeout(current, opts);
                idle = current.idle_for(Utc::now());
                idle > timeout
            };
            let cancelled = match self.registry.transition_if(
                orphan.id,
                AgentStatus::Cancelled,
                still_stale,
            ) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(
                        id = %orphan.id,
                        idle_secs = idle.as_secs(),
                        timeout_secs = timeout.as_secs(),
                        "agent reported activity since the scan; skipped"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(id = %orphan.id, error = %e, "failed to cancel orphaned agent");
                    report.errors.push(CleanupError {
                        id: orphan.id,
                        error: e.to_string(),
                        kind: CleanupErrorKind::Transition,
                    });
                    continue;
                }
            };

            info!(
                id = %cancelled.id,
                name = %cancelled.name,
                idle_secs = idle.as_secs(),
                timeout_secs = timeout.as_secs(),
                "orphaned agent cancelled"
            );

            let ctx = HookContext::for_agent(cancelled.clone())
                .with_reason(ORPHAN_REASON)
                .with_timeout(timeout);
            for outcome in self.hooks.trigger_hook(HookType::OnCancel, &ctx).await {
                if let Some(error) = outcome.error() {
                    report.errors.push(CleanupError {
                        id: cancelled.id,
                        error: error.to_string(),
                        kind: CleanupErrorKind::Hook,
                    });
                }
            }
            report.cleaned.push(cancelled);
        }

        self.record_run(epoch, report.cleaned.len());
        debug!(
            cleaned = report.cleaned.len(),
            errors = report.errors.len(),
            "cleanup pass completed"
        );
        report
    }

    fn record_run(&self, epoch: u64, cleaned: usize) {
        let mut stats = self.stats_lock();
        if self.stats_epoch.load(Ordering::Acquire) != epoch {
            debug!(cleaned, "stats reset during cleanup pass; run not counted");
            return;
        }
        stats.cleanup_runs += 1;
        stats.total_cleaned += cleaned as u64;
        stats.last_cleanup_at = Some(Utc::now());
    }

    /// Run [`cleanup_orphans`](Self::cleanup_orphans) every interval on a
    /// background task, replacing any previous schedule.
    ///
    /// Must be called from within a tokio runtime. The first pass runs one
    /// interval from now. A zero interval falls back to the default.
    pub fn schedule_cleanup(self: &Arc<Self>, opts: CleanupOptions) {
        self.stop_cleanup();

        let period = match opts.interval.unwrap_or(self.default_interval) {
            p if p.is_zero() => {
                let fallback = if self.default_interval.is_zero() {
                    DEFAULT_INTERVAL
                } else {
                    self.default_interval
                };
                warn!(
                    fallback_secs = fallback.as_secs_f64(),
                    "cleanup interval must be non-zero; using fallback"
                );
                fallback
            }
            p => p,
        };
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (stop, mut stop_rx) = broadcast::channel(1);
        let reclaimer: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        // A stop may land between the tick and this point.
                        if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                            break;
                        }
                        let Some(reclaimer) = reclaimer.upgrade() else {
                            break;
                        };
                        let pass = AssertUnwindSafe(reclaimer.cleanup_orphans(&opts));
                        if pass.catch_unwind().await.is_err() {
                            error!("scheduled cleanup pass panicked; continuing");
                        }
                    }
                }
            }
            debug!("cleanup schedule stopped");
        });

        info!(interval_secs = period.as_secs_f64(), "cleanup scheduled");
        *self.schedule_lock() = Some(Schedule { stop, task });
    }

    /// Cancel the schedule, if any. A pass already running is allowed to
    /// finish, but no further pass starts after this returns.
    pub fn stop_cleanup(&self) {
        if let Some(schedule) = self.schedule_lock().take() {
            let _ = schedule.stop.send(());
            info!("cleanup schedule cancelled");
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule_lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Snapshot of the counters.
    pub fn get_cleanup_stats(&self) -> CleanupStats {
        self.stats_lock().clone()
    }

    /// Stop the schedule and zero the counters. A pass still in flight is
    /// not counted.
    pub fn reset_cleanup(&self) {
        self.stop_cleanup();
        let mut stats = self.stats_lock();
        self.stats_epoch.fetch_add(1, Ordering::AcqRel);
        *stats = CleanupStats::default();
    }

    fn stats_lock(&self) -> MutexGuard<'_, CleanupStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_lock(&self) -> MutexGuard<'_, Option<Schedule>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}
