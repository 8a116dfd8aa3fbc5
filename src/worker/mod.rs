//! Worker runtime: poll for work, execute it, report back.
//!
//! A worker only ever talks to a [`TaskQueue`], so the same loop runs next
//! to the store or on a remote machine.

pub mod executor;

pub use executor::{CommandExecutor, Executor, ProgressReporter};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Caller, PullRequest, Task, TaskState, WorkerId};
use crate::queue::TaskQueue;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ProfileFile {
    worker: WorkerProfile,
}

/// A worker's identity, capabilities and engine hook, loaded from TOML:
///
/// ```toml
/// [worker]
/// id = "gpu-1"
/// user_id = "render-farm"
/// capabilities = ["sdxl_lightning", "upscale"]
/// command = "./bin/run-flow"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerProfile {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub admin: bool,
    /// Flow names this worker can execute.
    pub capabilities: Vec<String>,
    pub command: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("genq-work")
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl WorkerProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker profile {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad worker profile {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: ProfileFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        if file.worker.capabilities.is_empty() {
            return Err(Error::Config("worker has no capabilities".into()));
        }
        Ok(file.worker)
    }

    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.user_id.clone(),
            is_admin: self.admin,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self
                .id
                .clone()
                .map(WorkerId::new)
                .unwrap_or_else(WorkerId::generate),
            capabilities: self.capabilities.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(&self.command, &self.work_dir)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub capabilities: Vec<String>,
    pub poll_interval: Duration,
}

/// What one pass of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to pull.
    Idle,
    Completed,
    Failed,
    /// The queue took the task away (deleted, unlocked or restarted).
    Abandoned,
}

pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    executor: Arc<dyn Executor>,
    caller: Caller,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    last_task_name: Mutex<String>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        executor: Arc<dyn Executor>,
        caller: Caller,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            caller,
            config,
            shutdown: Arc::new(Notify::new()),
            last_task_name: Mutex::new(String::new()),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Signal the loop to stop after the current task.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`Worker::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker = %self.config.worker_id,
            capabilities = ?self.config.capabilities,
            "worker started"
        );

        loop {
            let idle = match self.run_once().await {
                Ok(outcome) => outcome == Outcome::Idle,
                Err(e) => {
                    error!(worker = %self.config.worker_id, "worker pass failed: {e}");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!(worker = %self.config.worker_id, "worker shutting down");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            } else if tokio::time::timeout(Duration::ZERO, self.shutdown.notified())
                .await
                .is_ok()
            {
                info!(worker = %self.config.worker_id, "worker shutting down");
                return Ok(());
            }
        }
    }

    /// Pull one task and see it through.
    pub async fn run_once(&self) -> Result<Outcome> {
        let affinity = self
            .last_task_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let request = PullRequest::new(self.config.worker_id.clone(), self.config.capabilities.clone())
            .affinity(affinity);

        let Some(task) = self.queue.pull_next(&self.caller, &request).await? else {
            return Ok(Outcome::Idle);
        };

        *self.last_task_name.lock().unwrap_or_else(|e| e.into_inner()) = task.name.clone();

        let span = start_task_span(&task.name, task.task_id);
        self.process(task, &span).instrument(span.clone()).await
    }

    async fn process(&self, task: Task, span: &tracing::Span) -> Result<Outcome> {
        let task_id = task.task_id;
        let reporter = ProgressReporter::new(
            Arc::clone(&self.queue),
            self.caller.clone(),
            self.config.worker_id.clone(),
            task_id,
        );
        record_state_transition(span, TaskState::Unassigned, TaskState::Locked);

        let result = match self.executor.execute(&task, &reporter).await {
            Ok(files) if task.outputs.is_empty() => Ok(files),
            Ok(files) => self
                .queue
                .submit_results(&self.caller, task_id, files)
                .await
                .map(|_| Vec::new()),
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => match reporter.report(crate::model::PROGRESS_DONE).await {
                Ok(()) => {
                    record_state_transition(span, TaskState::Progressing, TaskState::Completed);
                    info!(task_id = %task_id, execution_time = reporter.elapsed(), "task finished");
                    Ok(Outcome::Completed)
                }
                Err(Error::NotFound(_)) => Ok(self.abandon(&task)),
                Err(e) => Err(e),
            },
            Err(Error::NotFound(_)) => Ok(self.abandon(&task)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task execution failed");
                match reporter.fail(&e.to_string()).await {
                    Ok(()) => {
                        record_state_transition(span, TaskState::Progressing, TaskState::Errored);
                        Ok(Outcome::Failed)
                    }
                    Err(Error::NotFound(_)) => Ok(self.abandon(&task)),
                    Err(report_err) => Err(report_err),
                }
            }
        }
    }

    fn abandon(&self, task: &Task) -> Outcome {
        warn!(
            task_id = %task.task_id,
            worker = %self.config.worker_id,
            "task no longer held by this worker, abandoning"
        );
        Outcome::Abandoned
    }
}
