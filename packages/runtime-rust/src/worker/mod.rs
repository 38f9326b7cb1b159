//! Long-running workers, bounded jobs and the built-in worker kinds.
//!
//! - [`Worker`]: setup/run/stop contract driven by a microservice
//! - [`Job`]: run-once unit for pre/post lifecycle actions
//! - [`ScheduleWorker`]: periodic tasks until stopped
//! - [`RestWorker`]: `axum` listener with caller-supplied routes
//! - [`MonitoringWorker`]: Prometheus `/metrics` endpoint

pub mod base;
pub mod job;
pub mod monitoring;
pub mod rest;
pub mod schedule;

use async_trait::async_trait;

pub use base::{ArgumentNotFound, WorkerBase, WorkerState, DEFAULT_WORKER_NAME};
pub use job::{Job, JobContext};
pub use monitoring::{MonitoringConfig, MonitoringWorker};
pub use rest::{HandlerError, RestConfig, RestState, RestWorker};
pub use schedule::{Schedule, ScheduleWorker, TaskContext};

/// Lifecycle contract of a long-running unit of execution.
///
/// The orchestrator drives each worker exactly once:
/// resources `setup_all` -> [`setup`](Self::setup) -> [`run`](Self::run)
/// (blocks) -> resources `close_all`. [`stop`](Self::stop) is called from
/// another task and must make a blocked `run` return promptly.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn base(&self) -> &WorkerBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Prepares the worker after its resources are set up.
    async fn setup(&self) -> anyhow::Result<()>;

    /// Runs until stopped. Must not return early on its own.
    async fn run(&self) -> anyhow::Result<()>;

    /// Signals `run` to return. The default fires the base stop signal,
    /// which `run` implementations await via [`WorkerBase::stopped`].
    fn stop(&self) {
        self.base().request_stop();
    }
}
