//! Radian runtime: composes workers, jobs and resource bindings into
//! microservices and drives their lifecycle under OS termination signals.

pub mod lifecycle;
pub mod logging;
pub mod resource;
pub mod worker;

pub use lifecycle::{
    LifecycleError, ManagerError, Microservice, MicroserviceState, RunMode, ServiceManager,
    ShutdownController, ShutdownListener,
};
pub use resource::{Resource, ResourceError, ResourceRegistry};
pub use worker::monitoring;
pub use worker::{Job, JobContext, Worker, WorkerBase, WorkerState};
