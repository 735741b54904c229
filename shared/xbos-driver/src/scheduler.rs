//! Task scheduler
//!
//! Owns every long-running task of a driver (poll loops, the report loop,
//! subscription readers, socket listeners) and runs them side by side until
//! they have all exited. Tasks are never restarted.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::{DriverError, Result};

type PeriodicJob = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

enum Task {
    Periodic { interval: Duration, job: PeriodicJob },
    Stream(BoxFuture<'static, Result<()>>),
}

struct NamedTask {
    name: String,
    task: Task,
}

/// How a task ended
#[derive(Debug)]
pub enum TaskExit {
    Completed,
    Failed(DriverError),
    Panicked,
}

/// Tally of task exits once [`TaskScheduler::run`] returns
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub panicked: usize,
}

#[derive(Default)]
pub struct TaskScheduler {
    tasks: Vec<NamedTask>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` once per `interval`, the first time after one full interval.
    ///
    /// A transient error from `job` is logged and the loop keeps going; any
    /// other error ends the task.
    pub fn register_periodic<F, Fut>(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        mut job: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if interval.is_zero() {
            return Err(DriverError::Validation(format!(
                "interval for task {} must be greater than zero",
                name
            )));
        }

        self.tasks.push(NamedTask {
            name,
            task: Task::Periodic {
                interval,
                job: Box::new(move || job().boxed()),
            },
        });
        Ok(())
    }

    /// Run a task that drives its own loop, such as a subscription reader
    pub fn register_stream<Fut>(&mut self, name: impl Into<String>, task: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(NamedTask {
            name: name.into(),
            task: Task::Stream(task.boxed()),
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Start every registered task and wait for all of them to exit
    pub async fn run(self) -> RunSummary {
        let mut set = JoinSet::new();
        let total = self.tasks.len();

        for NamedTask { name, task } in self.tasks {
            set.spawn(async move {
                let work = match task {
                    Task::Periodic { interval, job } => {
                        run_periodic(name.clone(), interval, job).boxed()
                    }
                    Task::Stream(fut) => fut,
                };
                let exit = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(Ok(())) => TaskExit::Completed,
                    Ok(Err(e)) => TaskExit::Failed(e),
                    Err(_) => TaskExit::Panicked,
                };
                (name, exit)
            });
        }

        info!(tasks = total, "Scheduler started");

        let mut summary = RunSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, TaskExit::Completed)) => {
                    info!(task = %name, "Task finished");
                    summary.completed += 1;
                }
                Ok((name, TaskExit::Failed(e))) => {
                    error!(task = %name, error = %e, code = e.error_code(), "Task stopped");
                    summary.failed += 1;
                }
                Ok((name, TaskExit::Panicked)) => {
                    error!(task = %name, "Task panicked");
                    summary.panicked += 1;
                }
                Err(e) => {
                    error!(error = %e, "Task could not be joined");
                    summary.panicked += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            panicked = summary.panicked,
            "All tasks exited"
        );
        summary
    }
}

async fn run_periodic(name: String, period: Duration, mut job: PeriodicJob) -> Result<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match job().await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(task = %name, error = %e, "Periodic task failed, will retry next interval");
            }
            Err(e) => return Err(e),
        }
    }
}
