use std::fmt;

use radian_core::ConfigError;

/// Which job list a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pre,
    Post,
}

impl JobPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "prejob",
            Self::Post => "postjob",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of a job's run in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    SetupResources,
    Run,
    CloseResources,
}

/// Step of a worker's lifecycle in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    SetupResources,
    Setup,
    Run,
    CloseResources,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SetupResources => "resource setup",
            Self::Run => "run",
            Self::CloseResources => "resource close",
        })
    }
}

impl fmt::Display for WorkerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SetupResources => "resource setup",
            Self::Setup => "setup",
            Self::Run => "run",
            Self::CloseResources => "resource close",
        })
    }
}

/// Failures of a microservice's startup, run or teardown sequence.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown {phase} {name:?}, available: {available:?}")]
    UnknownJob {
        phase: JobPhase,
        name: String,
        available: Vec<String>,
    },
    #[error("unknown worker {name:?}, available: {available:?}")]
    UnknownWorker {
        name: String,
        available: Vec<String>,
    },
    #[error("{kind} {name:?} is already registered")]
    Duplicate { kind: &'static str, name: String },
    #[error("worker {name:?} has already been run")]
    WorkerReused { name: String },
    #[error("{phase} {job:?} failed during {stage}: {source}")]
    Job {
        phase: JobPhase,
        job: String,
        stage: JobStage,
        #[source]
        source: anyhow::Error,
    },
    #[error("worker {worker:?} failed during {stage}: {source}")]
    Worker {
        worker: String,
        stage: WorkerStage,
        #[source]
        source: anyhow::Error,
    },
    #[error("worker {worker:?} panicked")]
    WorkerPanicked { worker: String },
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

impl LifecycleError {
    pub(crate) fn job(
        phase: JobPhase,
        job: &str,
        stage: JobStage,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Job {
            phase,
            job: job.to_owned(),
            stage,
            source: source.into(),
        }
    }

    pub(crate) fn worker(worker: &str, stage: WorkerStage, source: impl Into<anyhow::Error>) -> Self {
        Self::Worker {
            worker: worker.to_owned(),
            stage,
            source: source.into(),
        }
    }
}

/// Failures of the service manager's registration, resolution and run.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("microservice {name:?} is already registered")]
    AlreadyRegistered { name: String },
    #[error("unknown microservice {name:?}, known: {available:?}")]
    UnknownMicroservice {
        name: String,
        available: Vec<String>,
    },
    #[error("creating microservice {name:?} failed: {source}")]
    Factory {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("microservice {name:?} failed: {source}")]
    Lifecycle {
        name: String,
        #[source]
        source: LifecycleError,
    },
    #[error("microservice {name:?} task panicked")]
    Panicked { name: String },
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}
