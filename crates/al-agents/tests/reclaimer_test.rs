use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use al_agents::hooks::{hook_fn, HookContext, HookDispatcher, HookType};
use al_agents::reclaimer::{
    CleanupErrorKind, CleanupOptions, Reclaimer, DEFAULT_INTERVAL, DEFAULT_TIMEOUT, ORPHAN_REASON,
};
use al_agents::registry::{AgentRegistry, NewAgent};
use al_core::config::ReclaimerConfig;
use al_core::types::AgentStatus;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

fn setup() -> (Arc<AgentRegistry>, Arc<HookDispatcher>, Arc<Reclaimer>) {
    let registry = Arc::new(AgentRegistry::new());
    let hooks = Arc::new(HookDispatcher::new());
    let reclaimer = Arc::new(Reclaimer::new(Arc::clone(&registry), Arc::clone(&hooks)));
    (registry, hooks, reclaimer)
}

fn running_idle_for(registry: &AgentRegistry, name: &str, minutes: i64) -> Uuid {
    registry.register_agent(
        NewAgent::new(name)
            .status(AgentStatus::Running)
            .last_activity(Utc::now() - chrono::Duration::minutes(minutes)),
    )
}

#[test]
fn default_timeout_is_thirty_minutes() {
    let (_, _, reclaimer) = setup();
    assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(30 * 60));
    assert_eq!(reclaimer.default_timeout(), DEFAULT_TIMEOUT);
}

#[test]
fn stale_running_agent_is_orphaned() {
    let (registry, _, reclaimer) = setup();
    let stuck = running_idle_for(&registry, "stuck", 35);
    running_idle_for(&registry, "busy", 10);

    let orphans = reclaimer.find_orphaned_agents(&CleanupOptions::default());
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, stuck);
}

#[test]
fn grace_period_suppresses_orphan_classification() {
    let (registry, _, reclaimer) = setup();
    registry.register_agent(
        NewAgent::new("long-runner")
            .status(AgentStatus::Running)
            .last_activity(Utc::now() - chrono::Duration::minutes(35))
            .grace_period(Duration::from_secs(60 * 60)),
    );

    assert!(reclaimer
        .find_orphaned_agents(&CleanupOptions::default())
        .is_empty());
}

#[test]
fn grace_period_wins_over_caller_timeout() {
    let (registry, _, reclaimer) = setup();
    let short = running_idle_for(&registry, "short", 15);
    registry.register_agent(
        NewAgent::new("patient")
            .status(AgentStatus::Running)
            .last_activity(Utc::now() - chrono::Duration::minutes(15))
            .grace_period(Duration::from_secs(60 * 60)),
    );

    let orphans =
        reclaimer.find_orphaned_agents(&CleanupOptions::with_timeout(Duration::from_secs(600)));
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, short);
}

#[test]
fn staleness_equal_to_timeout_is_not_orphaned() {
    let (registry, _, reclaimer) = setup();
    let now = Utc::now();
    registry.register_agent(
        NewAgent::new("edge")
            .status(AgentStatus::Running)
            .last_activity(now - chrono::Duration::minutes(30)),
    );

    let opts = CleanupOptions::default();
    assert!(reclaimer.find_orphaned_agents_at(now, &opts).is_empty());
    assert_eq!(
        reclaimer
            .find_orphaned_agents_at(now + chrono::Duration::milliseconds(1), &opts)
            .len(),
        1
    );
}

#[test]
fn only_running_agents_are_orphaned() {
    let (registry, _, reclaimer) = setup();
    let old = Utc::now() - chrono::Duration::hours(5);
    registry.register_agent(NewAgent::new("pending").last_activity(old));
    let done = registry.register_agent(
        NewAgent::new("done")
            .status(AgentStatus::Running)
            .last_activity(old),
    );
    registry.transition(done, AgentStatus::Completed).unwrap();

    assert!(reclaimer
        .find_orphaned_agents(&CleanupOptions::default())
        .is_empty());
}

#[test]
fn config_defaults_are_applied() {
    let registry = Arc::new(AgentRegistry::new());
    let hooks = Arc::new(HookDispatcher::new());
    let config = ReclaimerConfig {
        enabled: true,
        timeout_secs: 60,
        interval_secs: 5,
    };
    let reclaimer = Reclaimer::from_config(Arc::clone(&registry), hooks, &config);
    assert_eq!(reclaimer.default_timeout(), Duration::from_secs(60));
    assert_eq!(reclaimer.default_interval(), Duration::from_secs(5));

    running_idle_for(&registry, "two-minutes", 2);
    assert_eq!(
        reclaimer
            .find_orphaned_agents(&CleanupOptions::default())
            .len(),
        1
    );
}

#[tokio::test]
async fn cleanup_cancels_stuck_agent() {
    let (registry, _, reclaimer) = setup();
    let id = running_idle_for(&registry, "stuck-agent", 35);

    let report = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;

    assert_eq!(report.cleaned.len(), 1);
    assert_eq!(report.cleaned[0].id, id);
    assert!(report.errors.is_empty());

    let agent = registry.get_agent(id).unwrap();
    assert_eq!(agent.status(), AgentStatus::Cancelled);
    let states: Vec<AgentStatus> = agent.history().iter().map(|e| e.state).collect();
    assert_eq!(states, vec![AgentStatus::Running, AgentStatus::Cancelled]);
}

#[tokio::test]
async fn second_pass_cleans_nothing_but_counts_run() {
    let (registry, _, reclaimer) = setup();
    running_idle_for(&registry, "stuck", 35);

    let first = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;
    assert_eq!(first.cleaned.len(), 1);

    let second = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;
    assert!(second.cleaned.is_empty());

    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 2);
    assert_eq!(stats.total_cleaned, 1);
    assert!(stats.last_cleanup_at.is_some());
}

#[tokio::test]
async fn on_cancel_receives_agent_reason_and_timeout() {
    let (registry, hooks, reclaimer) = setup();
    let id = running_idle_for(&registry, "stuck", 35);

    let seen: Arc<Mutex<Vec<HookContext>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(move |ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(ctx);
                Ok(Value::Null)
            }
        }),
    );

    reclaimer.cleanup_orphans(&CleanupOptions::default()).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let ctx = &seen[0];
    let agent = ctx.agent.as_ref().expect("agent in context");
    assert_eq!(agent.id, id);
    assert_eq!(agent.status(), AgentStatus::Cancelled);
    assert_eq!(ctx.reason.as_deref(), Some(ORPHAN_REASON));
    assert_eq!(ctx.timeout, Some(DEFAULT_TIMEOUT));
}

#[tokio::test]
async fn failing_on_cancel_handler_is_captured_and_agent_still_cleaned() {
    let (registry, hooks, reclaimer) = setup();
    let id = running_idle_for(&registry, "stuck", 35);
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(|_ctx| async { Err::<Value, _>(anyhow::anyhow!("webhook rejected")) }),
    );

    let report = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;

    assert_eq!(report.cleaned.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].id, id);
    assert_eq!(report.errors[0].kind, CleanupErrorKind::Hook);
    assert!(report.errors[0].error.contains("webhook rejected"));
    assert_eq!(
        registry.get_agent(id).unwrap().status(),
        AgentStatus::Cancelled
    );
    assert_eq!(reclaimer.get_cleanup_stats().total_cleaned, 1);
}

#[tokio::test]
async fn transition_failure_is_isolated_per_agent() {
    let (registry, hooks, reclaimer) = setup();
    running_idle_for(&registry, "first", 40);
    running_idle_for(&registry, "second", 40);

    // Whichever orphan is cancelled first completes the other one, so the
    // second cancellation hits an invalid transition.
    let reg = Arc::clone(&registry);
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(move |_ctx| {
            let reg = Arc::clone(&reg);
            async move {
                for other in reg.list_agents(None) {
                    if other.status() == AgentStatus::Running {
                        reg.transition(other.id, AgentStatus::Completed)?;
                    }
                }
                Ok(Value::Null)
            }
        }),
    );

    let report = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;

    assert_eq!(report.cleaned.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, CleanupErrorKind::Transition);
    assert!(report.errors[0].error.contains("invalid transition"));
    assert_eq!(reclaimer.get_cleanup_stats().total_cleaned, 1);
}

#[tokio::test]
async fn agent_reporting_activity_mid_pass_is_spared() {
    let (registry, hooks, reclaimer) = setup();
    running_idle_for(&registry, "first", 40);
    running_idle_for(&registry, "second", 40);

    // Whichever orphan is cancelled first touches the other one, which is no
    // longer stale by the time the pass reaches it.
    let reg = Arc::clone(&registry);
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(move |_ctx| {
            let reg = Arc::clone(&reg);
            async move {
                for other in reg.list_agents(None) {
                    if other.status() == AgentStatus::Running {
                        reg.touch(other.id);
                    }
                }
                Ok(Value::Null)
            }
        }),
    );

    let report = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;

    assert_eq!(report.cleaned.len(), 1);
    assert!(report.errors.is_empty());
    let survivor = registry
        .list_agents(None)
        .into_iter()
        .find(|a| a.id != report.cleaned[0].id)
        .unwrap();
    assert_eq!(survivor.status(), AgentStatus::Running);
    assert!(survivor.idle_for(Utc::now()) < Duration::from_secs(60));
    assert_eq!(reclaimer.get_cleanup_stats().total_cleaned, 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_passes_are_serialized() {
    let (registry, hooks, reclaimer) = setup();
    running_idle_for(&registry, "stuck", 35);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );

    let opts = CleanupOptions::default();
    let (a, b) = tokio::join!(
        reclaimer.cleanup_orphans(&opts),
        reclaimer.cleanup_orphans(&opts)
    );

    assert_eq!(a.cleaned.len() + b.cleaned.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 2);
    assert_eq!(stats.total_cleaned, 1);
}

#[tokio::test(start_paused = true)]
async fn scheduled_tick_cleans_orphans() {
    let (registry, _, reclaimer) = setup();
    running_idle_for(&registry, "stuck-1", 35);
    running_idle_for(&registry, "stuck-2", 45);

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_millis(1000)));
    assert!(reclaimer.is_scheduled());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(reclaimer.get_cleanup_stats().cleanup_runs, 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 1);
    assert_eq!(stats.total_cleaned, 2);

    // A new orphan is picked up on the following tick.
    running_idle_for(&registry, "stuck-3", 60);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 2);
    assert_eq!(stats.total_cleaned, 3);

    reclaimer.stop_cleanup();
}

#[tokio::test(start_paused = true)]
async fn stop_cleanup_halts_ticks_and_is_idempotent() {
    let (_, _, reclaimer) = setup();
    reclaimer.stop_cleanup();

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_millis(100)));
    tokio::time::sleep(Duration::from_millis(250)).await;
    let runs = reclaimer.get_cleanup_stats().cleanup_runs;
    assert_eq!(runs, 2);

    reclaimer.stop_cleanup();
    reclaimer.stop_cleanup();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(reclaimer.get_cleanup_stats().cleanup_runs, runs);
    assert!(!reclaimer.is_scheduled());
}

fn slow_on_cancel(hooks: &HookDispatcher, delay: Duration) {
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(move |_ctx| async move {
            tokio::time::sleep(delay).await;
            Ok(Value::Null)
        }),
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_slow_pass_prevents_later_passes() {
    let (registry, hooks, reclaimer) = setup();
    slow_on_cancel(&hooks, Duration::from_secs(5));
    running_idle_for(&registry, "stuck", 35);

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_secs(1)));
    // The first pass starts at 1s and sits in its handler until 6s.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    reclaimer.stop_cleanup();

    let late = running_idle_for(&registry, "late", 35);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 1);
    assert_eq!(stats.total_cleaned, 1);
    assert_eq!(
        registry.get_agent(late).unwrap().status(),
        AgentStatus::Running
    );
    assert!(!reclaimer.is_scheduled());
}

#[tokio::test(start_paused = true)]
async fn reset_during_slow_pass_leaves_stats_zeroed() {
    let (registry, hooks, reclaimer) = setup();
    slow_on_cancel(&hooks, Duration::from_secs(5));
    let stuck = running_idle_for(&registry, "stuck", 35);

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    reclaimer.reset_cleanup();

    let late = running_idle_for(&registry, "late", 35);
    tokio::time::sleep(Duration::from_secs(30)).await;

    // The in-flight pass finished its work but is not counted.
    assert_eq!(
        registry.get_agent(stuck).unwrap().status(),
        AgentStatus::Cancelled
    );
    assert_eq!(
        registry.get_agent(late).unwrap().status(),
        AgentStatus::Running
    );
    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 0);
    assert_eq!(stats.total_cleaned, 0);
    assert!(stats.last_cleanup_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn zero_interval_falls_back_to_default() {
    let (registry, _, reclaimer) = setup();
    running_idle_for(&registry, "stuck", 35);

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::ZERO));
    assert!(reclaimer.is_scheduled());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(reclaimer.get_cleanup_stats().cleanup_runs, 0);

    tokio::time::sleep(DEFAULT_INTERVAL).await;
    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 1);
    assert_eq!(stats.total_cleaned, 1);
    reclaimer.stop_cleanup();
}

#[tokio::test(start_paused = true)]
async fn zero_configured_interval_falls_back_to_builtin_default() {
    let registry = Arc::new(AgentRegistry::new());
    let hooks = Arc::new(HookDispatcher::new());
    let config = ReclaimerConfig {
        interval_secs: 0,
        ..ReclaimerConfig::default()
    };
    let reclaimer = Arc::new(Reclaimer::from_config(registry, hooks, &config));

    reclaimer.schedule_cleanup(CleanupOptions::default());
    tokio::time::sleep(DEFAULT_INTERVAL + Duration::from_secs(1)).await;
    assert_eq!(reclaimer.get_cleanup_stats().cleanup_runs, 1);
    reclaimer.stop_cleanup();
}

#[tokio::test(start_paused = true)]
async fn rescheduling_replaces_previous_timer() {
    let (_, _, reclaimer) = setup();

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_millis(100)));
    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_millis(1000)));

    tokio::time::sleep(Duration::from_millis(550)).await;
    assert_eq!(reclaimer.get_cleanup_stats().cleanup_runs, 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(reclaimer.get_cleanup_stats().cleanup_runs, 1);
    reclaimer.stop_cleanup();
}

#[tokio::test(start_paused = true)]
async fn failing_handlers_never_break_the_schedule() {
    let (registry, hooks, reclaimer) = setup();
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(|_ctx| async {
            let reply: Option<Value> = None;
            Ok(reply.expect("observer crashed"))
        }),
    );
    running_idle_for(&registry, "stuck-1", 35);

    reclaimer.schedule_cleanup(CleanupOptions::with_interval(Duration::from_millis(100)));
    tokio::time::sleep(Duration::from_millis(150)).await;
    running_idle_for(&registry, "stuck-2", 35);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 2);
    assert_eq!(stats.total_cleaned, 2);
    assert!(reclaimer.is_scheduled());
    reclaimer.stop_cleanup();
}

#[tokio::test]
async fn reset_zeroes_stats() {
    let (registry, _, reclaimer) = setup();
    running_idle_for(&registry, "stuck", 35);
    reclaimer.cleanup_orphans(&CleanupOptions::default()).await;
    reclaimer.schedule_cleanup(CleanupOptions::default());

    let snapshot = reclaimer.get_cleanup_stats();
    reclaimer.reset_cleanup();

    assert_eq!(snapshot.cleanup_runs, 1);
    let stats = reclaimer.get_cleanup_stats();
    assert_eq!(stats.cleanup_runs, 0);
    assert_eq!(stats.total_cleaned, 0);
    assert!(stats.last_cleanup_at.is_none());
    assert!(!reclaimer.is_scheduled());
}

#[tokio::test]
async fn report_serializes_errors_with_type_key() {
    let (registry, hooks, reclaimer) = setup();
    running_idle_for(&registry, "stuck", 35);
    hooks.register_hook(
        HookType::OnCancel,
        hook_fn(|_ctx| async { Err::<Value, _>(anyhow::anyhow!("nope")) }),
    );

    let report = reclaimer.cleanup_orphans(&CleanupOptions::default()).await;
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["errors"][0]["type"], json!("hook"));
    assert_eq!(value["cleaned"][0]["status"], json!("cancelled"));
}
