use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::Resource;

// ---------------------------------------------------------------------------
// ResourceError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource {name} is not found")]
    NotFound { name: String },
    #[error("resource {name} is not a {requested}")]
    TypeMismatch {
        name: String,
        requested: &'static str,
    },
    #[error("resource {name} setup failed: {source}")]
    Setup {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("resource {name} close failed: {source}")]
    Close {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

struct Entry {
    binding: Arc<dyn Resource>,
    /// Same allocation as `binding`, kept as `Any` for typed lookup.
    any: Arc<dyn Any + Send + Sync>,
}

/// Name-keyed collection of resource bindings owned by one worker or job.
///
/// Registering a name twice replaces the earlier binding (last write wins)
/// without closing it. Bulk setup and close walk bindings in first
/// registration order and stop at the first failure, with no rollback.
#[derive(Default)]
pub struct ResourceRegistry {
    by_name: DashMap<String, Entry>,
    /// First-registration order for deterministic setup/close sequencing.
    order: RwLock<Vec<String>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a binding under its own name.
    pub fn register<T: Resource>(&self, resource: T) {
        self.register_shared(Arc::new(resource));
    }

    /// Registers an already shared binding under its own name.
    pub fn register_shared<T: Resource>(&self, resource: Arc<T>) {
        let name = resource.name().to_owned();
        let entry = Entry {
            binding: resource.clone(),
            any: resource,
        };
        if self.by_name.insert(name.clone(), entry).is_some() {
            debug!(resource = %name, "replacing previously registered resource");
        } else {
            self.order.write().push(name);
        }
    }

    /// Looks a binding up by name.
    ///
    /// # Errors
    ///
    /// [`ResourceError::NotFound`] if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        self.by_name
            .get(name)
            .map(|entry| entry.binding.clone())
            .ok_or_else(|| ResourceError::NotFound {
                name: name.to_owned(),
            })
    }

    /// Looks a binding up by name and downcasts it to its concrete type.
    ///
    /// # Errors
    ///
    /// [`ResourceError::NotFound`] if absent, [`ResourceError::TypeMismatch`]
    /// if the binding is of another type.
    pub fn get_as<T: Resource>(&self, name: &str) -> Result<Arc<T>, ResourceError> {
        let any = self
            .by_name
            .get(name)
            .map(|entry| entry.any.clone())
            .ok_or_else(|| ResourceError::NotFound {
                name: name.to_owned(),
            })?;
        any.downcast::<T>().map_err(|_| ResourceError::TypeMismatch {
            name: name.to_owned(),
            requested: std::any::type_name::<T>(),
        })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registered names in first-registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Resource>> {
        let order = self.order.read().clone();
        order
            .iter()
            .filter_map(|name| self.by_name.get(name).map(|e| e.binding.clone()))
            .collect()
    }

    /// Sets every binding up in registration order, stopping at the first
    /// failure. Bindings already set up stay set up.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Setup`] naming the first binding that failed.
    pub async fn setup_all(&self) -> Result<(), ResourceError> {
        for binding in self.snapshot() {
            debug!(resource = binding.name(), "setting up resource");
            binding
                .setup()
                .await
                .map_err(|source| ResourceError::Setup {
                    name: binding.name().to_owned(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Closes every binding in registration order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Close`] naming the first binding that failed.
    pub async fn close_all(&self) -> Result<(), ResourceError> {
        for binding in self.snapshot() {
            debug!(resource = binding.name(), "closing resource");
            binding
                .close()
                .await
                .map_err(|source| ResourceError::Close {
                    name: binding.name().to_owned(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("names", &*self.order.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
