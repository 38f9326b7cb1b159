//! A named aggregate of pre-jobs, workers and post-jobs sharing one
//! startup/shutdown sequence.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use super::error::{JobPhase, JobStage, LifecycleError, WorkerStage};
use super::shutdown::{ShutdownController, ShutdownListener, TriggerOnPanic};
use super::signals;
use crate::worker::{Job, Worker, WorkerState};

// ---------------------------------------------------------------------------
// MicroserviceState
// ---------------------------------------------------------------------------

/// Observable position of a microservice in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroserviceState {
    /// Constructed, not yet run.
    Idle,
    /// Running pre-jobs and launching workers.
    Starting,
    /// All workers launched; waiting for shutdown.
    Ready,
    /// Workers asked to stop; waiting for the barrier.
    Draining,
    /// Post-jobs completed.
    Stopped,
    /// A fatal lifecycle error ended the run.
    Failed,
}

// ---------------------------------------------------------------------------
// NamedList
// ---------------------------------------------------------------------------

/// Name-keyed entries plus their registration order. Duplicate names are
/// rejected.
struct NamedList<T> {
    kind: &'static str,
    by_name: HashMap<String, T>,
    order: Vec<String>,
}

impl<T: Clone> NamedList<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            by_name: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, name: &str, entry: T) -> Result<(), LifecycleError> {
        if self.by_name.contains_key(name) {
            return Err(LifecycleError::Duplicate {
                kind: self.kind,
                name: name.to_owned(),
            });
        }
        self.by_name.insert(name.to_owned(), entry);
        self.order.push(name.to_owned());
        Ok(())
    }

    fn get(&self, name: &str) -> Option<T> {
        self.by_name.get(name).cloned()
    }
}

/// Workers and jobs a single run resolved to, in execution order.
struct RunPlan {
    pre_jobs: Vec<Arc<Job>>,
    workers: Vec<Arc<dyn Worker>>,
    post_jobs: Vec<Arc<Job>>,
}

// ---------------------------------------------------------------------------
// Microservice
// ---------------------------------------------------------------------------

/// Deployable unit: pre-jobs run sequentially, then every worker runs
/// concurrently until shutdown, then post-jobs run sequentially.
pub struct Microservice {
    name: Arc<str>,
    pre_jobs: NamedList<Arc<Job>>,
    workers: NamedList<Arc<dyn Worker>>,
    post_jobs: NamedList<Arc<Job>>,
    state: ArcSwap<MicroserviceState>,
}

impl Microservice {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().into(),
            pre_jobs: NamedList::new("prejob"),
            workers: NamedList::new("worker"),
            post_jobs: NamedList::new("postjob"),
            state: ArcSwap::from_pointee(MicroserviceState::Idle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> MicroserviceState {
        **self.state.load()
    }

    fn set_state(&self, state: MicroserviceState) {
        self.state.store(Arc::new(state));
    }

    /// Adds a worker and returns a shared handle to it.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Duplicate`] if a worker with the same name exists.
    pub fn add_worker<W: Worker>(&mut self, worker: W) -> Result<Arc<W>, LifecycleError> {
        let worker = Arc::new(worker);
        self.add_shared_worker(Arc::clone(&worker) as Arc<dyn Worker>)?;
        Ok(worker)
    }

    /// # Errors
    ///
    /// [`LifecycleError::Duplicate`] if a worker with the same name exists.
    pub fn add_shared_worker(&mut self, worker: Arc<dyn Worker>) -> Result<(), LifecycleError> {
        let name = worker.name().to_owned();
        self.workers.insert(&name, worker)
    }

    /// Appends a job to the pre-job list. Registration order is execution
    /// order.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Duplicate`] if a pre-job with the same name exists.
    pub fn add_pre_job(&mut self, job: Job) -> Result<(), LifecycleError> {
        let name = job.name().to_owned();
        self.pre_jobs.insert(&name, Arc::new(job))
    }

    /// Appends a job to the post-job list. Registration order is execution
    /// order.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Duplicate`] if a post-job with the same name exists.
    pub fn add_post_job(&mut self, job: Job) -> Result<(), LifecycleError> {
        let name = job.name().to_owned();
        self.post_jobs.insert(&name, Arc::new(job))
    }

    #[must_use]
    pub fn worker(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name)
    }

    #[must_use]
    pub fn worker_names(&self) -> &[String] {
        &self.workers.order
    }

    #[must_use]
    pub fn pre_job_names(&self) -> &[String] {
        &self.pre_jobs.order
    }

    #[must_use]
    pub fn post_job_names(&self) -> &[String] {
        &self.post_jobs.order
    }

    // -- run entry points ---------------------------------------------------

    /// Runs every registered job and worker until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// See [`run_with_jobs_until`](Self::run_with_jobs_until).
    pub async fn run_all(&self) -> Result<(), LifecycleError> {
        let (pre, workers, post) = self.all_names();
        self.run_with_jobs(&pre, &workers, &post).await
    }

    /// Runs every registered job and worker until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// See [`run_with_jobs_until`](Self::run_with_jobs_until).
    pub async fn run_all_until(&self, shutdown: ShutdownListener) -> Result<(), LifecycleError> {
        let (pre, workers, post) = self.all_names();
        self.run_with_jobs_until(&pre, &workers, &post, shutdown)
            .await
    }

    /// Runs the named jobs and workers until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Signal`] if the signal handlers cannot be
    /// installed, otherwise see
    /// [`run_with_jobs_until`](Self::run_with_jobs_until).
    pub async fn run_with_jobs<S: AsRef<str>>(
        &self,
        pre_jobs: &[S],
        workers: &[S],
        post_jobs: &[S],
    ) -> Result<(), LifecycleError> {
        let controller = Arc::new(ShutdownController::new());
        let signal_task = signals::trigger_on_signal(Arc::clone(&controller))?;
        let result = self
            .run_with_jobs_until(pre_jobs, workers, post_jobs, controller.listener())
            .await;
        signal_task.abort();
        result
    }

    /// Runs the named pre-jobs, workers and post-jobs, treating `shutdown`
    /// as the termination signal.
    ///
    /// 1. Every name is validated before anything runs.
    /// 2. Pre-jobs run one after another; the first failure aborts the run.
    /// 3. Each worker is driven on its own task: resource setup, setup,
    ///    run, resource close.
    /// 4. The call suspends until `shutdown` fires or a worker fails.
    /// 5. Every worker is stopped in registration order and all worker
    ///    tasks are joined.
    /// 6. If no worker failed, post-jobs run one after another.
    ///
    /// # Errors
    ///
    /// Unknown names and reused workers fail before any side effect. Job
    /// failures, worker failures and worker panics are returned after the
    /// remaining workers have drained; post-jobs are skipped in that case.
    pub async fn run_with_jobs_until<S: AsRef<str>>(
        &self,
        pre_jobs: &[S],
        workers: &[S],
        post_jobs: &[S],
        shutdown: ShutdownListener,
    ) -> Result<(), LifecycleError> {
        let plan = self.plan(pre_jobs, workers, post_jobs)?;

        let span = info_span!("microservice", name = %self.name);
        let result = self.execute(plan, shutdown).instrument(span).await;
        if result.is_err() {
            self.set_state(MicroserviceState::Failed);
        }
        result
    }

    fn all_names(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        (
            self.pre_jobs.order.clone(),
            self.workers.order.clone(),
            self.post_jobs.order.clone(),
        )
    }

    // -- orchestration ------------------------------------------------------

    fn plan<S: AsRef<str>>(
        &self,
        pre_jobs: &[S],
        workers: &[S],
        post_jobs: &[S],
    ) -> Result<RunPlan, LifecycleError> {
        let resolve_jobs = |phase: JobPhase, list: &NamedList<Arc<Job>>, names: &[S]| {
            names
                .iter()
                .map(|name| {
                    list.get(name.as_ref())
                        .ok_or_else(|| LifecycleError::UnknownJob {
                            phase,
                            name: name.as_ref().to_owned(),
                            available: list.order.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let pre_jobs = resolve_jobs(JobPhase::Pre, &self.pre_jobs, pre_jobs)?;
        let post_jobs = resolve_jobs(JobPhase::Post, &self.post_jobs, post_jobs)?;

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(workers.len());
        for name in workers {
            let name = name.as_ref();
            let worker = self
                .workers
                .get(name)
                .ok_or_else(|| LifecycleError::UnknownWorker {
                    name: name.to_owned(),
                    available: self.workers.order.clone(),
                })?;
            if !seen.insert(name) || worker.base().is_claimed() {
                return Err(LifecycleError::WorkerReused {
                    name: name.to_owned(),
                });
            }
            resolved.push(worker);
        }

        // Claim only after every name validated; a lost race releases the
        // claims already taken.
        for (index, worker) in resolved.iter().enumerate() {
            if !worker.base().try_claim() {
                for taken in &resolved[..index] {
                    taken.base().release_claim();
                }
                return Err(LifecycleError::WorkerReused {
                    name: worker.name().to_owned(),
                });
            }
        }

        Ok(RunPlan {
            pre_jobs,
            workers: resolved,
            post_jobs,
        })
    }

    async fn execute(&self, plan: RunPlan, shutdown: ShutdownListener) -> Result<(), LifecycleError> {
        self.set_state(MicroserviceState::Starting);
        info!(
            pre_jobs = plan.pre_jobs.len(),
            workers = plan.workers.len(),
            post_jobs = plan.post_jobs.len(),
            "starting microservice"
        );

        for job in &plan.pre_jobs {
            self.run_job(JobPhase::Pre, job, shutdown.clone()).await?;
        }

        let abort = Arc::new(ShutdownController::new());
        let handles: Vec<(String, JoinHandle<Result<(), LifecycleError>>)> = plan
            .workers
            .iter()
            .map(|worker| {
                let task = drive_worker(Arc::clone(worker), Arc::clone(&self.name), Arc::clone(&abort))
                    .instrument(info_span!("worker", name = worker.name()));
                (
                    worker.name().to_owned(),
                    tokio::spawn(TriggerOnPanic::new(task, Arc::clone(&abort))),
                )
            })
            .collect();

        self.set_state(MicroserviceState::Ready);
        info!("microservice ready");

        let aborted = abort.listener();
        tokio::select! {
            () = shutdown.wait() => info!("shutdown requested, stopping workers"),
            () = aborted.wait() => warn!("worker failed, stopping remaining workers"),
        }

        self.set_state(MicroserviceState::Draining);
        for worker in &plan.workers {
            info!(worker = worker.name(), "stopping worker");
            worker.stop();
        }

        let mut first_error = None;
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(worker = %name, error = %join_err, "worker task panicked");
                    Err(LifecycleError::WorkerPanicked { worker: name })
                }
            };
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            error!(error = %err, "skipping post-jobs after worker failure");
            return Err(err);
        }
        info!("all workers drained");

        // Post-jobs run after shutdown, so they get a listener that never fires.
        let post_cancel = ShutdownController::new();
        for job in &plan.post_jobs {
            self.run_job(JobPhase::Post, job, post_cancel.listener())
                .await?;
        }

        self.set_state(MicroserviceState::Stopped);
        info!("microservice stopped");
        Ok(())
    }

    async fn run_job(
        &self,
        phase: JobPhase,
        job: &Job,
        cancel: ShutdownListener,
    ) -> Result<(), LifecycleError> {
        let name = job.name();
        let span = info_span!("job", name = name, phase = phase.as_str());
        async {
            info!("setting up resources");
            job.setup_resources()
                .await
                .map_err(|err| LifecycleError::job(phase, name, JobStage::SetupResources, err))?;
            job.run(cancel)
                .await
                .map_err(|err| LifecycleError::job(phase, name, JobStage::Run, err))?;
            info!("closing resources");
            job.close_resources()
                .await
                .map_err(|err| LifecycleError::job(phase, name, JobStage::CloseResources, err))?;

            metrics::counter!(
                "radian_jobs_completed_total",
                "microservice" => self.name.to_string(),
                "phase" => phase.as_str()
            )
            .increment(1);
            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for Microservice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microservice")
            .field("name", &self.name)
            .field("pre_jobs", &self.pre_jobs.order)
            .field("workers", &self.workers.order)
            .field("post_jobs", &self.post_jobs.order)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker driver
// ---------------------------------------------------------------------------

/// Drives one worker through its lifecycle on its own task. Any failure
/// fires `abort` so the orchestrator stops the siblings.
async fn drive_worker(
    worker: Arc<dyn Worker>,
    microservice: Arc<str>,
    abort: Arc<ShutdownController>,
) -> Result<(), LifecycleError> {
    let result = run_worker_stages(worker.as_ref(), &microservice).await;
    if let Err(err) = &result {
        error!(error = %err, "worker failed");
        worker.base().set_state(WorkerState::Failed);
        abort.trigger();
    }
    result
}

async fn run_worker_stages(worker: &dyn Worker, microservice: &str) -> Result<(), LifecycleError> {
    let base = worker.base();
    let name = worker.name();

    info!("setting up resources");
    base.resources()
        .setup_all()
        .await
        .map_err(|err| LifecycleError::worker(name, WorkerStage::SetupResources, err))?;
    base.set_state(WorkerState::ResourcesReady);

    info!("setting up worker");
    if let Err(err) = worker.setup().await {
        close_after_failure(worker).await;
        return Err(LifecycleError::worker(name, WorkerStage::Setup, err));
    }
    base.set_state(WorkerState::Configured);

    info!("running");
    base.set_state(WorkerState::Running);
    let running = metrics::gauge!("radian_workers_running", "microservice" => microservice.to_owned());
    running.increment(1.0);
    let run_result = AssertUnwindSafe(worker.run()).catch_unwind().await;
    running.decrement(1.0);

    let run_result = match run_result {
        Ok(outcome) => outcome.map_err(|err| LifecycleError::worker(name, WorkerStage::Run, err)),
        Err(_) => {
            error!("worker panicked while running");
            Err(LifecycleError::WorkerPanicked {
                worker: name.to_owned(),
            })
        }
    };
    if let Err(err) = run_result {
        close_after_failure(worker).await;
        return Err(err);
    }
    if !base.stop_requested() {
        warn!("worker returned before it was asked to stop");
    }
    base.set_state(WorkerState::Stopped);
    info!("stopped");

    info!("closing resources");
    base.resources()
        .close_all()
        .await
        .map_err(|err| LifecycleError::worker(name, WorkerStage::CloseResources, err))?;
    base.set_state(WorkerState::ResourcesClosed);
    Ok(())
}

/// Releases resources after a setup or run failure. The original failure
/// is what gets reported, so close errors are only logged.
async fn close_after_failure(worker: &dyn Worker) {
    if let Err(err) = worker.base().resources().close_all().await {
        warn!(error = %err, "closing resources after failure");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
