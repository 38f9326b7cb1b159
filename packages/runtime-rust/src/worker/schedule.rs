//! Worker that runs periodic tasks until stopped.
//!
//! Tasks run at a fixed rate (period measured between starts), with a fixed
//! delay (pause measured from the end of the previous run) or on a cron
//! expression. A task's error is logged and the task keeps its schedule.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use super::base::WorkerBase;
use super::Worker;
use crate::lifecycle::shutdown::ShutdownListener;
use crate::resource::{Resource, ResourceError, ResourceRegistry};

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskHandler = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// When a scheduled task fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Every `period`, measured from the previous start. A run that
    /// overruns delays the next tick instead of bursting.
    FixedRate(Duration),
    /// `delay` after the previous run completes.
    FixedDelay(Duration),
    /// Each UTC instant matched by a cron expression with a seconds field,
    /// e.g. `0 */5 * * * *`.
    Cron(String),
}

impl Schedule {
    fn validate(&self) -> anyhow::Result<()> {
        match self {
            Self::FixedRate(period) | Self::FixedDelay(period) => {
                anyhow::ensure!(!period.is_zero(), "zero period");
            }
            Self::Cron(expression) => {
                cron::Schedule::from_str(expression)
                    .with_context(|| format!("invalid cron expression {expression:?}"))?;
            }
        }
        Ok(())
    }
}

/// Context handed to each task invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Arc<str>,
    resources: Arc<ResourceRegistry>,
}

impl TaskContext {
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task
    }

    /// # Errors
    ///
    /// [`ResourceError::NotFound`] if the worker has no resource named `name`.
    pub fn resource(&self, name: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        self.resources.get(name)
    }

    /// # Errors
    ///
    /// See [`ResourceRegistry::get_as`].
    pub fn resource_as<T: Resource>(&self, name: &str) -> Result<Arc<T>, ResourceError> {
        self.resources.get_as(name)
    }
}

struct ScheduledTask {
    name: Arc<str>,
    schedule: Schedule,
    handler: TaskHandler,
}

/// Runs each registered task on its own schedule until the worker is
/// stopped. An in-flight run completes before its loop exits.
pub struct ScheduleWorker {
    base: WorkerBase,
    tasks: Vec<ScheduledTask>,
}

impl ScheduleWorker {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: WorkerBase::new(name),
            tasks: Vec::new(),
        }
    }

    /// Adds a task that starts every `period`.
    pub fn add_fixed_rate_task<F, Fut>(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_task(name, Schedule::FixedRate(period), handler)
    }

    /// Adds a task that starts `delay` after its previous run finished.
    pub fn add_fixed_delay_task<F, Fut>(
        &mut self,
        name: impl Into<String>,
        delay: Duration,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_task(name, Schedule::FixedDelay(delay), handler)
    }

    /// Adds a task fired at each instant matched by `expression`.
    pub fn add_cron_task<F, Fut>(
        &mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_task(name, Schedule::Cron(expression.into()), handler)
    }

    pub fn add_task<F, Fut>(
        &mut self,
        name: impl Into<String>,
        schedule: Schedule,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.push(ScheduledTask {
            name: name.into().into(),
            schedule,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        });
        self
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| &*task.name).collect()
    }
}

#[async_trait]
impl Worker for ScheduleWorker {
    fn base(&self) -> &WorkerBase {
        &self.base
    }

    async fn setup(&self) -> anyhow::Result<()> {
        info!(tasks = self.tasks.len(), "setting up task scheduler");
        for task in &self.tasks {
            task.schedule
                .validate()
                .with_context(|| format!("task {} has an invalid schedule", task.name))?;
        }
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        info!("running task scheduler");
        if self.tasks.is_empty() {
            self.base.stopped().await;
            return Ok(());
        }

        let mut loops = JoinSet::new();
        for task in &self.tasks {
            let ctx = TaskContext {
                task: Arc::clone(&task.name),
                resources: Arc::clone(self.base.resources()),
            };
            let runner = TaskRunner {
                worker: self.base.name().to_owned(),
                schedule: task.schedule.clone(),
                handler: Arc::clone(&task.handler),
                monitored: self.base.monitoring_enabled(),
            };
            let stop = self.base.stop_listener();
            loops.spawn(
                runner
                    .run(ctx, stop)
                    .instrument(info_span!("task", name = %task.name)),
            );
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                anyhow::bail!("scheduled task loop failed: {err}");
            }
        }
        info!("task scheduler stopped");
        Ok(())
    }
}

struct TaskRunner {
    worker: String,
    schedule: Schedule,
    handler: TaskHandler,
    monitored: bool,
}

impl TaskRunner {
    async fn run(self, ctx: TaskContext, stop: ShutdownListener) {
        match self.schedule {
            Schedule::FixedRate(period) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // Skip the first immediate tick so the task doesn't fire at startup.
                interval.tick().await;
                loop {
                    tokio::select! {
                        () = stop.wait() => break,
                        _ = interval.tick() => self.execute(&ctx).await,
                    }
                }
            }
            Schedule::FixedDelay(delay) => loop {
                tokio::select! {
                    () = stop.wait() => break,
                    () = tokio::time::sleep(delay) => self.execute(&ctx).await,
                }
            },
            Schedule::Cron(ref expression) => match cron::Schedule::from_str(expression) {
                Ok(schedule) => self.run_cron(&schedule, &ctx, &stop).await,
                Err(err) => warn!(error = %err, "cron expression rejected, task disabled"),
            },
        }
    }

    /// Wall time is projected from the tokio clock anchored at start, so
    /// fire instants follow the runtime's timers.
    async fn run_cron(&self, schedule: &cron::Schedule, ctx: &TaskContext, stop: &ShutdownListener) {
        let anchor_wall = Utc::now();
        let anchor = Instant::now();
        let wall_now = || anchor_wall + TimeDelta::from_std(anchor.elapsed()).unwrap_or(TimeDelta::zero());

        let mut cursor: DateTime<Utc> = anchor_wall;
        loop {
            let from = cursor.max(wall_now());
            let Some(next) = schedule.after(&from).next() else {
                info!("cron schedule exhausted");
                stop.wait().await;
                break;
            };
            let offset = (next - anchor_wall).to_std().unwrap_or_default();
            tokio::select! {
                () = stop.wait() => break,
                () = tokio::time::sleep_until(anchor + offset) => self.execute(ctx).await,
            }
            cursor = next;
        }
    }

    async fn execute(&self, ctx: &TaskContext) {
        let outcome = match (self.handler)(ctx.clone()).await {
            Ok(()) => {
                debug!("scheduled task completed");
                "ok"
            }
            Err(err) => {
                warn!(error = %err, "scheduled task completed with error");
                "error"
            }
        };
        if self.monitored {
            metrics::counter!(
                "radian_scheduled_task_runs_total",
                "worker" => self.worker.clone(),
                "task" => ctx.task_name().to_owned(),
                "outcome" => outcome
            )
            .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicU32>) -> impl Fn(TaskContext) -> TaskFuture + Send + Sync {
        let counter = Arc::clone(counter);
        move |_ctx| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
        }
    }

    async fn run_for(worker: ScheduleWorker, elapsed: Duration) {
        let worker = Arc::new(worker);
        worker.setup().await.unwrap();
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        tokio::time::sleep(elapsed).await;
        worker.stop();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_task_fires_each_period() {
        let count = Arc::new(AtomicU32::new(0));
        let mut worker = ScheduleWorker::new("scheduler");
        worker.add_fixed_rate_task("tick", Duration::from_millis(10), counting(&count));

        run_for(worker, Duration::from_millis(55)).await;
        let runs = count.load(Ordering::SeqCst);
        assert!((4..=6).contains(&runs), "runs = {runs}");
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_waits_for_previous_run() {
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        let mut worker = ScheduleWorker::new("scheduler");
        worker.add_fixed_delay_task("slow", Duration::from_millis(10), move |_ctx| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        run_for(worker, Duration::from_millis(55)).await;
        let runs = count.load(Ordering::SeqCst);
        assert!((2..=3).contains(&runs), "runs = {runs}");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_keeps_its_schedule() {
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        let mut worker = ScheduleWorker::new("scheduler");
        worker.add_fixed_rate_task("flaky", Duration::from_millis(10), move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("upstream unavailable") }
        });

        run_for(worker, Duration::from_millis(35)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn zero_period_is_rejected_at_setup() {
        let mut worker = ScheduleWorker::new("scheduler");
        worker.add_fixed_delay_task("busy", Duration::ZERO, |_ctx| async { Ok(()) });
        let err = worker.setup().await.unwrap_err();
        assert!(err.to_string().contains("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn cron_task_fires_each_matching_second() {
        let count = Arc::new(AtomicU32::new(0));
        let mut worker = ScheduleWorker::new("scheduler");
        worker.add_cron_task("every-second", "* * * * * *", counting(&count));

        run_for(worker, Duration::from_millis(3500)).await;
        let runs = count.load(Ordering::SeqCst);
        assert!((3..=4).contains(&runs), "runs = {runs}");
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected_at_setup() {
        let mut worker = ScheduleWorker::new("scheduler");
        worker.add_cron_task("nightly", "not a cron line", |_ctx| async { Ok(()) });
        let err = worker.setup().await.unwrap_err();
        assert!(err.to_string().contains("nightly"));
        assert!(format!("{err:#}").contains("invalid cron expression"));
    }

    #[tokio::test]
    async fn run_without_tasks_returns_on_stop() {
        let worker = ScheduleWorker::new("idle");
        worker.stop();
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("run should return after stop")
            .unwrap();
    }

    #[test]
    fn task_names_in_registration_order() {
        let mut worker = ScheduleWorker::new("scheduler");
        worker
            .add_fixed_rate_task("a", Duration::from_secs(1), |_ctx| async { Ok(()) })
            .add_fixed_delay_task("b", Duration::from_secs(1), |_ctx| async { Ok(()) })
            .add_cron_task("c", "0 0 * * * *", |_ctx| async { Ok(()) });
        assert_eq!(worker.task_names(), vec!["a", "b", "c"]);
    }
}
