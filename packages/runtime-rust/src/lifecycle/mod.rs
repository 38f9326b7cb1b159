//! Microservice orchestration: run-mode resolution, the service manager,
//! per-microservice startup/shutdown sequencing and the stop signals that
//! tie them together.

pub mod error;
pub mod manager;
pub mod microservice;
pub mod run_mode;
pub mod shutdown;
pub mod signals;

pub use error::{JobPhase, JobStage, LifecycleError, ManagerError, WorkerStage};
pub use manager::{MicroserviceFactory, ServiceManager};
pub use microservice::{Microservice, MicroserviceState};
pub use run_mode::RunMode;
pub use shutdown::{ShutdownController, ShutdownListener};
pub use signals::trigger_on_signal;
