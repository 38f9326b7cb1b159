//! Named external-resource bindings and the per-worker registry that owns them.
//!
//! A binding wraps one configured connection (a queue client, a database
//! handle, ...). Concrete adapters live outside this crate; they only need
//! to implement [`Resource`].

pub mod registry;

use std::any::Any;

use async_trait::async_trait;

pub use registry::{ResourceError, ResourceRegistry};

/// Setup/close lifecycle of one external-resource handle.
///
/// `setup` moves the handle into a usable state; `close` releases it and is
/// invoked at most once by the orchestrator. Implementations that are not
/// safe for concurrent use must serialize access internally.
#[async_trait]
pub trait Resource: Send + Sync + Any {
    /// Unique name within the owning registry.
    fn name(&self) -> &str;

    async fn setup(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}
