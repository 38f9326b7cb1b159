//! Composed helper carrying the state every worker shares.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::lifecycle::shutdown::{ShutdownController, ShutdownListener};
use crate::resource::{Resource, ResourceRegistry};

/// Name given to workers and jobs constructed with a blank name.
pub const DEFAULT_WORKER_NAME: &str = "default";

/// Worker lifecycle position, advanced by the orchestrator.
///
/// `Constructed -> ResourcesReady -> Configured -> Running -> Stopping ->
/// Stopped -> ResourcesClosed`, or `Failed` from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Constructed,
    ResourcesReady,
    Configured,
    Running,
    Stopping,
    Stopped,
    ResourcesClosed,
    Failed,
}

impl WorkerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::ResourcesReady => "resources_ready",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ResourcesClosed => "resources_closed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("argument {0} is not found")]
pub struct ArgumentNotFound(pub String);

/// Name, resources, flags, arguments and stop signal of one worker.
///
/// Concrete workers hold a `WorkerBase` as a field and expose it through
/// [`Worker::base`](super::Worker::base).
#[derive(Debug)]
pub struct WorkerBase {
    name: String,
    resources: Arc<ResourceRegistry>,
    monitoring: AtomicBool,
    claimed: AtomicBool,
    arguments: RwLock<HashMap<String, String>>,
    state: ArcSwap<WorkerState>,
    stop: ShutdownController,
}

impl WorkerBase {
    /// Creates a base with an empty resource registry. A blank name becomes
    /// [`DEFAULT_WORKER_NAME`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            DEFAULT_WORKER_NAME.to_owned()
        } else {
            name
        };
        Self {
            name,
            resources: Arc::new(ResourceRegistry::new()),
            monitoring: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            arguments: RwLock::new(HashMap::new()),
            state: ArcSwap::from_pointee(WorkerState::Constructed),
            stop: ShutdownController::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the worker's resource registry.
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    /// Registers a resource binding (last write wins by name).
    pub fn register_resource<T: Resource>(&self, resource: T) {
        self.resources.register(resource);
    }

    /// Enables or disables metrics recording for this worker.
    pub fn set_monitoring(&self, enabled: bool) {
        self.monitoring.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.load(Ordering::Relaxed)
    }

    pub fn set_argument(&self, name: impl Into<String>, value: impl Into<String>) {
        self.arguments.write().insert(name.into(), value.into());
    }

    /// # Errors
    ///
    /// [`ArgumentNotFound`] if no argument is set under `name`.
    pub fn argument(&self, name: &str) -> Result<String, ArgumentNotFound> {
        self.arguments
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ArgumentNotFound(name.to_owned()))
    }

    /// Marks the worker as taken by a run. Returns false if an earlier run
    /// already claimed it; a worker is run at most once per process.
    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        **self.state.load()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(Arc::new(state));
    }

    /// Fires the stop signal; moves a running worker to `Stopping`.
    pub fn request_stop(&self) {
        self.state.rcu(|current| {
            if **current == WorkerState::Running {
                Arc::new(WorkerState::Stopping)
            } else {
                Arc::clone(current)
            }
        });
        self.stop.trigger();
    }

    /// Resolves once [`request_stop`](Self::request_stop) has been called.
    /// `run` implementations park on this.
    pub async fn stopped(&self) {
        self.stop.listener().wait().await;
    }

    /// Owned handle on the stop signal, for tasks spawned by `run`.
    #[must_use]
    pub fn stop_listener(&self) -> ShutdownListener {
        self.stop.listener()
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn blank_name_becomes_default() {
        assert_eq!(WorkerBase::new("").name(), DEFAULT_WORKER_NAME);
        assert_eq!(WorkerBase::new("  ").name(), DEFAULT_WORKER_NAME);
        assert_eq!(WorkerBase::new("rest").name(), "rest");
    }

    #[test]
    fn arguments_round_trip_and_report_missing() {
        let base = WorkerBase::new("w");
        base.set_argument("queue", "orders");
        assert_eq!(base.argument("queue").unwrap(), "orders");

        let err = base.argument("absent").unwrap_err();
        assert_eq!(err.to_string(), "argument absent is not found");
    }

    #[test]
    fn monitoring_flag_defaults_off() {
        let base = WorkerBase::new("w");
        assert!(!base.monitoring_enabled());
        base.set_monitoring(true);
        assert!(base.monitoring_enabled());
    }

    #[test]
    fn claim_succeeds_once() {
        let base = WorkerBase::new("w");
        assert!(base.try_claim());
        assert!(!base.try_claim());
        assert!(base.is_claimed());

        base.release_claim();
        assert!(base.try_claim());
    }

    #[test]
    fn request_stop_moves_running_to_stopping_only() {
        let base = WorkerBase::new("w");
        base.request_stop();
        assert_eq!(base.state(), WorkerState::Constructed);

        let base = WorkerBase::new("w");
        base.set_state(WorkerState::Running);
        base.request_stop();
        assert_eq!(base.state(), WorkerState::Stopping);
        assert!(base.stop_requested());
    }

    #[tokio::test]
    async fn stopped_resolves_after_request_stop() {
        let base = Arc::new(WorkerBase::new("w"));
        let waiter = {
            let base = Arc::clone(&base);
            tokio::spawn(async move { base.stopped().await })
        };

        base.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stopped() should resolve")
            .unwrap();
    }
}
