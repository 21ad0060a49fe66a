//! Task Executor
//!
//! Runs task jobs and records their lifecycle in the registry. Three modes:
//! `serial` (one worker), `pool` (`task_max_workers` workers) and `parallel`
//! (one tokio task per submission). Workers take submissions from a shared
//! FIFO queue, so tasks start in submission order; there are no priorities.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ExecutorMode};
use crate::error::{Result, ServiceError};
use crate::registry::Registry;
use crate::tasks::Task;

/// Work attached to a task. Its output becomes the task result, its error
/// the task message.
pub type Job = BoxFuture<'static, Result<Value>>;

struct Submission {
    task: Task,
    job: Job,
    done: oneshot::Sender<Task>,
}

/// Completion handle for a submitted task.
pub struct TaskHandle {
    id: Uuid,
    done: oneshot::Receiver<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the task to reach a terminal state.
    pub async fn wait(self) -> Result<Task> {
        self.done
            .await
            .map_err(|_| ServiceError::Internal(format!("task {} was dropped", self.id)))
    }
}

struct Runner {
    registry: Arc<Registry>,
    ttl: Duration,
}

impl Runner {
    async fn run(&self, submission: Submission) {
        let Submission {
            mut task,
            job,
            done,
        } = submission;

        if let Err(e) = task.begin() {
            warn!(task_id = %task.id, error = %e, "task not runnable");
            let _ = done.send(task);
            return;
        }
        self.save(&task);
        info!(task_id = %task.id, task_type = %task.task_type, "task started");

        let outcome = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(ServiceError::Internal("task job panicked".to_string())),
        };

        let finished = match outcome {
            Ok(result) => task.succeed(result, self.ttl),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "task failed");
                task.fail(e.to_string(), self.ttl)
            }
        };
        if let Err(e) = finished {
            error!(task_id = %task.id, error = %e, "task state transition rejected");
        }
        self.save(&task);
        info!(task_id = %task.id, status = %task.status, "task finished");

        let _ = done.send(task);
    }

    fn save(&self, task: &Task) {
        if let Err(e) = self.registry.save_task(task) {
            error!(task_id = %task.id, error = %e, "failed to persist task state");
        }
    }
}

// == Task Executor ==
pub struct TaskExecutor {
    mode: ExecutorMode,
    runner: Arc<Runner>,
    queue: Option<mpsc::UnboundedSender<Submission>>,
    closed: AtomicBool,
}

impl TaskExecutor {
    /// Creates the executor and, for queued modes, spawns its workers. Must
    /// be called inside a tokio runtime.
    pub fn new(
        mode: ExecutorMode,
        max_workers: usize,
        registry: Arc<Registry>,
        ttl: Duration,
    ) -> Self {
        let runner = Arc::new(Runner { registry, ttl });

        let workers = match mode {
            ExecutorMode::Serial => 1,
            ExecutorMode::Pool => max_workers.max(1),
            ExecutorMode::Parallel => 0,
        };

        let queue = (workers > 0).then(|| {
            let (tx, rx) = mpsc::unbounded_channel::<Submission>();
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..workers {
                let rx = rx.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    debug!(worker, "task worker started");
                    loop {
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(submission) => runner.run(submission).await,
                            None => break,
                        }
                    }
                    debug!(worker, "task worker stopped");
                });
            }
            tx
        });

        info!(?mode, workers, "task executor started");
        Self {
            mode,
            runner,
            queue,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config, registry: Arc<Registry>) -> Self {
        Self::new(
            config.task_executor,
            config.task_max_workers,
            registry,
            Duration::hours(config.task_time_to_live as i64),
        )
    }

    pub fn mode(&self) -> ExecutorMode {
        self.mode
    }

    /// Refuses further submissions. Queued and running tasks are left to
    /// finish.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("task executor closed to new submissions");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hands a task that already exists in the registry to the executor.
    pub fn submit(&self, task: Task, job: Job) -> Result<TaskHandle> {
        if self.is_shut_down() {
            return Err(ServiceError::Internal("task executor is shut down".to_string()));
        }
        let (done, rx) = oneshot::channel();
        let id = task.id;
        let submission = Submission { task, job, done };

        match &self.queue {
            Some(queue) => queue
                .send(submission)
                .map_err(|_| ServiceError::Internal("task executor is shut down".to_string()))?,
            None => {
                let runner = self.runner.clone();
                tokio::spawn(async move { runner.run(submission).await });
            }
        }

        debug!(task_id = %id, "task submitted");
        Ok(TaskHandle { id, done: rx })
    }
}
