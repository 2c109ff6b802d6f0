use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::AgentRecord;

// ---------------------------------------------------------------------------
// HookType
// ---------------------------------------------------------------------------

/// Lifecycle events observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookType {
    OnStart,
    OnComplete,
    OnError,
    OnCancel,
}

impl HookType {
    pub const ALL: [HookType; 4] = [
        HookType::OnStart,
        HookType::OnComplete,
        HookType::OnError,
        HookType::OnCancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::OnStart => "onStart",
            HookType::OnComplete => "onComplete",
            HookType::OnError => "onError",
            HookType::OnCancel => "onCancel",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onStart" | "on_start" => Ok(HookType::OnStart),
            "onComplete" | "on_complete" => Ok(HookType::OnComplete),
            "onError" | "on_error" => Ok(HookType::OnError),
            "onCancel" | "on_cancel" => Ok(HookType::OnCancel),
            other => Err(HookError::UnknownHookType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("unknown hook type `{0}`; expected one of onStart, onComplete, onError, onCancel")]
    UnknownHookType(String),
}

// ---------------------------------------------------------------------------
// HookContext / HookOutcome
// ---------------------------------------------------------------------------

/// Payload handed to every handler of a triggered hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Effective inactivity timeout, set when the reclaimer cancels an agent.
    #[serde(
        default,
        with = "al_core::types::duration_ms_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub data: Value,
}

impl HookContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_agent(agent: AgentRecord) -> Self {
        Self {
            agent: Some(agent),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// What a single handler produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HookOutcome {
    Completed { value: Value },
    Failed { error: String },
}

impl HookOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, HookOutcome::Failed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            HookOutcome::Failed { error } => Some(error),
            HookOutcome::Completed { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// HookHandler
// ---------------------------------------------------------------------------

/// An observer of lifecycle events.
#[async_trait::async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`HookHandler`].
pub struct FnHook<F>(F);

#[async_trait::async_trait]
impl<F, Fut> HookHandler for FnHook<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<Value> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// dispatcher.register_hook(HookType::OnCancel, hook_fn(|ctx| async move {
///     tracing::info!(reason = ?ctx.reason, "agent cancelled");
///     Ok(serde_json::Value::Null)
/// }));
/// ```
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

// ---------------------------------------------------------------------------
// HookDispatcher
// ---------------------------------------------------------------------------

/// Token returned by [`HookDispatcher::register_hook`]; pass it to
/// [`HookDispatcher::unregister`] to remove exactly that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    hook_type: HookType,
    id: u64,
}

impl HookHandle {
    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }
}

struct RegisteredHook {
    id: u64,
    handler: Arc<dyn HookHandler>,
}

/// Ordered, failure-isolated fan-out of lifecycle events.
///
/// Handlers of one type run one after another in registration order; each
/// is awaited before the next starts. A handler that errors or panics is
/// reported as [`HookOutcome::Failed`] and the remaining handlers still run.
pub struct HookDispatcher {
    handlers: Mutex<HashMap<HookType, Vec<RegisteredHook>>>,
    next_id: AtomicU64,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HookType, Vec<RegisteredHook>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `handler` to the list for `hook_type`.
    pub fn register_hook(&self, hook_type: HookType, handler: Arc<dyn HookHandler>) -> HookHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(hook_type)
            .or_default()
            .push(RegisteredHook { id, handler });
        debug!(hook = %hook_type, id, "hook registered");
        HookHandle { hook_type, id }
    }

    /// Register by type name, rejecting unknown names up front.
    pub fn register_hook_named(
        &self,
        hook_type: &str,
        handler: Arc<dyn HookHandler>,
    ) -> Result<HookHandle, HookError> {
        let hook_type = hook_type.parse::<HookType>()?;
        Ok(self.register_hook(hook_type, handler))
    }

    /// Remove the handler behind `handle`. Returns `false` if it was already
    /// removed (or cleared).
    pub fn unregister(&self, handle: &HookHandle) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(&handle.hook_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h.id != handle.id);
        let removed = list.len() != before;
        if removed {
            debug!(hook = %handle.hook_type, id = handle.id, "hook unregistered");
        }
        removed
    }

    /// Run every handler for `hook_type` in registration order.
    ///
    /// The handler list is snapshotted before the first handler runs, so
    /// registrations made by a handler take effect on the next trigger.
    pub async fn trigger_hook(&self, hook_type: HookType, ctx: &HookContext) -> Vec<HookOutcome> {
        let handlers = self.get_handlers(hook_type);
        let mut outcomes = Vec::with_capacity(handlers.len());

        for (index, handler) in handlers.into_iter().enumerate() {
            let outcome = match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
                Ok(Ok(value)) => HookOutcome::Completed { value },
                Ok(Err(e)) => HookOutcome::Failed {
                    error: format!("{e:#}"),
                },
                Err(panic) => HookOutcome::Failed {
                    error: panic_message(panic.as_ref()),
                },
            };
            if let Some(error) = outcome.error() {
                warn!(hook = %hook_type, index, error = %error, "hook handler failed");
            }
            outcomes.push(outcome);
        }

        debug!(hook = %hook_type, handlers = outcomes.len(), "hook dispatched");
        outcomes
    }

    /// Handlers currently registered for `hook_type`, in order.
    pub fn get_handlers(&self, hook_type: HookType) -> Vec<Arc<dyn HookHandler>> {
        self.lock()
            .get(&hook_type)
            .map(|list| list.iter().map(|h| Arc::clone(&h.handler)).collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, hook_type: HookType) -> usize {
        self.lock().get(&hook_type).map_or(0, Vec::len)
    }

    /// Clear one type's handlers, or every type's when `None`.
    pub fn clear_hooks(&self, hook_type: Option<HookType>) {
        let mut handlers = self.lock();
        match hook_type {
            Some(t) => {
                handlers.remove(&t);
            }
            None => handlers.clear(),
        }
    }
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.lock();
        let counts: HashMap<HookType, usize> =
            handlers.iter().map(|(t, list)| (*t, list.len())).collect();
        f.debug_struct("HookDispatcher")
            .field("handlers", &counts)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
