//! Process-level registry, resolver and launcher of microservices.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use radian_core::ConfigStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{LifecycleError, ManagerError};
use super::microservice::Microservice;
use super::run_mode::RunMode;
use super::shutdown::{ShutdownController, ShutdownListener, TriggerOnPanic};
use super::signals;

/// Lazy constructor of a microservice. Receives the registered name and the
/// configuration subtree stored under that name, if any.
pub type MicroserviceFactory =
    Box<dyn FnOnce(&str, Option<ConfigStore>) -> anyhow::Result<Microservice> + Send>;

/// Registry of eager microservices and lazy factories, plus the merged
/// configuration and the resolved run mode.
///
/// A name lives in at most one of the two maps. A factory is invoked at most
/// once; its result replaces it as an eager microservice.
#[derive(Default)]
pub struct ServiceManager {
    microservices: HashMap<String, Arc<Microservice>>,
    creators: HashMap<String, MicroserviceFactory>,
    /// Registration order across both maps.
    order: Vec<String>,
    config: ConfigStore,
    run_mode: RunMode,
}

impl ServiceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- registration -------------------------------------------------------

    fn claim(&mut self, name: &str) -> Result<(), ManagerError> {
        if self.microservices.contains_key(name) || self.creators.contains_key(name) {
            return Err(ManagerError::AlreadyRegistered {
                name: name.to_owned(),
            });
        }
        self.order.push(name.to_owned());
        Ok(())
    }

    /// Registers an already constructed microservice under its own name.
    ///
    /// # Errors
    ///
    /// [`ManagerError::AlreadyRegistered`] if the name is taken by a
    /// microservice or a factory.
    pub fn add_microservice(&mut self, microservice: Microservice) -> Result<(), ManagerError> {
        let name = microservice.name().to_owned();
        self.claim(&name)?;
        self.microservices.insert(name, Arc::new(microservice));
        Ok(())
    }

    /// Registers a factory that builds the microservice on first use.
    ///
    /// # Errors
    ///
    /// [`ManagerError::AlreadyRegistered`] if the name is taken by a
    /// microservice or a factory.
    pub fn add_microservice_creator<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), ManagerError>
    where
        F: FnOnce(&str, Option<ConfigStore>) -> anyhow::Result<Microservice> + Send + 'static,
    {
        let name = name.into();
        self.claim(&name)?;
        self.creators.insert(name, Box::new(factory));
        Ok(())
    }

    /// Every registered name in registration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.microservices.contains_key(name) || self.creators.contains_key(name)
    }

    /// The materialized microservice registered under `name`, if any.
    #[must_use]
    pub fn microservice(&self, name: &str) -> Option<Arc<Microservice>> {
        self.microservices.get(name).cloned()
    }

    // -- configuration ------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigStore {
        &mut self.config
    }

    /// Loads a JSON configuration file, replacing the current tree.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Config`] if the file cannot be read or parsed.
    pub fn load_configuration(&mut self, path: impl AsRef<Path>) -> Result<(), ManagerError> {
        Ok(self.config.load_from_file(path)?)
    }

    /// Merges `PREFIX_seg1_seg2=value` environment variables.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Config`] on a path conflict.
    pub fn load_from_env(&mut self, prefix: &str) -> Result<usize, ManagerError> {
        Ok(self.config.load_from_env(prefix)?)
    }

    /// Merges `PREFIX_seg1_seg2=value` entries from an explicit list.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Config`] on a path conflict.
    pub fn load_from_vars<I, S>(&mut self, prefix: &str, vars: I) -> Result<usize, ManagerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.config.load_from_vars(prefix, vars)?)
    }

    /// Merges `-prefix-seg1-seg2=value` arguments.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Config`] on a path conflict.
    pub fn load_from_args<I, S>(&mut self, prefix: &str, args: I) -> Result<usize, ManagerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.config.load_from_args(prefix, args)?)
    }

    // -- run mode -----------------------------------------------------------

    /// Parses and stores the run mode consulted by
    /// [`run_desired`](Self::run_desired).
    pub fn resolve_run_mode(&mut self, mode: &str) -> &RunMode {
        self.run_mode = RunMode::parse(mode);
        info!(mode = ?self.run_mode, "run mode resolved");
        &self.run_mode
    }

    #[must_use]
    pub fn run_mode(&self) -> &RunMode {
        &self.run_mode
    }

    /// Names selected by the current run mode.
    #[must_use]
    pub fn desired_names(&self) -> Vec<String> {
        self.run_mode.resolve(&self.order)
    }

    // -- materialization ----------------------------------------------------

    /// Returns the microservices for `names`, building any that are still
    /// factories. Every name is checked before any factory runs; a name
    /// listed twice resolves once.
    ///
    /// # Errors
    ///
    /// [`ManagerError::UnknownMicroservice`] listing the known names, or
    /// [`ManagerError::Factory`] if a factory fails.
    pub fn materialize<S: AsRef<str>>(
        &mut self,
        names: &[S],
    ) -> Result<Vec<Arc<Microservice>>, ManagerError> {
        if let Some(unknown) = names.iter().find(|name| !self.contains(name.as_ref())) {
            return Err(ManagerError::UnknownMicroservice {
                name: unknown.as_ref().to_owned(),
                available: self.order.clone(),
            });
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if !seen.insert(name) {
                debug!(microservice = name, "ignoring repeated microservice name");
                continue;
            }
            if let Some(factory) = self.creators.remove(name) {
                let subtree = self.config.get_subtree(&[name]).ok();
                if subtree.is_none() {
                    warn!(microservice = name, "no configuration subtree for microservice");
                }
                info!(microservice = name, "creating microservice");
                let microservice = factory(name, subtree).map_err(|source| ManagerError::Factory {
                    name: name.to_owned(),
                    source,
                })?;
                self.microservices
                    .insert(name.to_owned(), Arc::new(microservice));
            }
            if let Some(microservice) = self.microservices.get(name) {
                resolved.push(Arc::clone(microservice));
            }
        }
        Ok(resolved)
    }

    // -- running ------------------------------------------------------------

    /// Runs the microservices selected by the run mode until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run_desired(&mut self) -> Result<(), ManagerError> {
        let names = self.desired_names();
        self.run(&names).await
    }

    /// Runs the microservices selected by the run mode until `shutdown`
    /// fires.
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run_desired_until(&mut self, shutdown: ShutdownListener) -> Result<(), ManagerError> {
        let names = self.desired_names();
        self.run_until(&names, shutdown).await
    }

    /// Runs the named microservices until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Signal`] if the handlers cannot be installed,
    /// otherwise see [`run_until`](Self::run_until).
    pub async fn run<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ManagerError> {
        let controller = Arc::new(ShutdownController::new());
        let signal_task = signals::trigger_on_signal(Arc::clone(&controller))?;
        let result = self.run_until(names, controller.listener()).await;
        signal_task.abort();
        result
    }

    /// Materializes the named microservices and runs each on its own task
    /// until `shutdown` fires. A failing microservice stops the others.
    ///
    /// # Errors
    ///
    /// Resolution errors before anything runs, otherwise the first
    /// microservice failure in launch order.
    pub async fn run_until<S: AsRef<str>>(
        &mut self,
        names: &[S],
        shutdown: ShutdownListener,
    ) -> Result<(), ManagerError> {
        let microservices = self.materialize(names)?;
        info!(
            microservices = ?microservices.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "starting microservices"
        );

        let stop_all = Arc::new(ShutdownController::new());
        let handles: Vec<(String, JoinHandle<Result<(), LifecycleError>>)> = microservices
            .into_iter()
            .map(|microservice| {
                let name = microservice.name().to_owned();
                let listener = stop_all.listener();
                let on_failure = Arc::clone(&stop_all);
                let task = async move {
                    let result = microservice.run_all_until(listener).await;
                    if result.is_err() {
                        on_failure.trigger();
                    }
                    result
                };
                (name, tokio::spawn(TriggerOnPanic::new(task, Arc::clone(&stop_all))))
            })
            .collect();

        let stopped = stop_all.listener();
        tokio::select! {
            () = shutdown.wait() => info!("shutdown requested, stopping microservices"),
            () = stopped.wait() => warn!("microservice failed, stopping the rest"),
        }
        stop_all.trigger();

        let mut first_error = None;
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(ManagerError::Lifecycle {
                    name: name.clone(),
                    source,
                }),
                Err(join_err) => {
                    error!(microservice = %name, error = %join_err, "microservice task panicked");
                    Err(ManagerError::Panicked { name: name.clone() })
                }
            };
            match outcome {
                Ok(()) => info!(microservice = %name, "microservice finished"),
                Err(err) => {
                    error!(microservice = %name, error = %err, "microservice failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("names", &self.order)
            .field("materialized", &self.microservices.keys().collect::<Vec<_>>())
            .field("run_mode", &self.run_mode)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
