//! Run-once jobs executed before workers start or after they drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{error, info};

use super::base::DEFAULT_WORKER_NAME;
use crate::lifecycle::shutdown::ShutdownListener;
use crate::resource::{Resource, ResourceError, ResourceRegistry};

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type JobHandler = Box<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// Execution context handed to a job handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<str>,
    resources: Arc<ResourceRegistry>,
    cancel: ShutdownListener,
}

impl JobContext {
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// # Errors
    ///
    /// [`ResourceError::NotFound`] if the job has no resource named `name`.
    pub fn resource(&self, name: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        self.resources.get(name)
    }

    /// # Errors
    ///
    /// See [`ResourceRegistry::get_as`].
    pub fn resource_as<T: Resource>(&self, name: &str) -> Result<Arc<T>, ResourceError> {
        self.resources.get_as(name)
    }

    /// True once the process has been asked to shut down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_triggered()
    }

    /// Resolves when the process is asked to shut down. Long jobs select on
    /// this to bail out early.
    pub async fn cancelled(&self) {
        self.cancel.wait().await;
    }
}

/// Named, bounded unit of work with its own resource registry.
pub struct Job {
    name: Arc<str>,
    resources: Arc<ResourceRegistry>,
    handler: JobHandler,
}

impl Job {
    /// Creates a job. A blank name becomes
    /// [`DEFAULT_WORKER_NAME`](super::DEFAULT_WORKER_NAME).
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let name = if name.trim().is_empty() {
            DEFAULT_WORKER_NAME.to_owned()
        } else {
            name
        };
        Self {
            name: name.into(),
            resources: Arc::new(ResourceRegistry::new()),
            handler: Box::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    pub fn register_resource<T: Resource>(&self, resource: T) {
        self.resources.register(resource);
    }

    /// # Errors
    ///
    /// First resource setup failure.
    pub async fn setup_resources(&self) -> Result<(), ResourceError> {
        self.resources.setup_all().await
    }

    /// Invokes the handler once.
    ///
    /// # Errors
    ///
    /// Whatever the handler returns.
    pub async fn run(&self, cancel: ShutdownListener) -> anyhow::Result<()> {
        info!(job = %self.name, "running job");
        let ctx = JobContext {
            job: Arc::clone(&self.name),
            resources: Arc::clone(&self.resources),
            cancel,
        };

        match (self.handler)(ctx).await {
            Ok(()) => {
                info!(job = %self.name, "job completed successfully");
                Ok(())
            }
            Err(err) => {
                error!(job = %self.name, error = %err, "job completed with error");
                Err(err)
            }
        }
    }

    /// # Errors
    ///
    /// First resource close failure.
    pub async fn close_resources(&self) -> Result<(), ResourceError> {
        self.resources.close_all().await
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}
