//! Running a claimed task's graph.
//!
//! The graph itself is executed by an external engine; [`CommandExecutor`]
//! hands it over through a per-task working directory and reads progress
//! back from the command's stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Caller, ProgressReport, Task, TaskId, UploadFile, WorkerId};
use crate::queue::TaskQueue;

/// Stdout line prefix a command uses to report progress, e.g. `PROGRESS 42.5`.
pub const PROGRESS_PREFIX: &str = "PROGRESS ";

/// Reports progress for one claimed task on behalf of its worker.
///
/// A `NotFound` from [`ProgressReporter::report`] means the worker lost the
/// task; the executor must stop and return that error.
pub struct ProgressReporter {
    queue: Arc<dyn TaskQueue>,
    caller: Caller,
    worker_id: WorkerId,
    task_id: TaskId,
    started: Instant,
    last: Mutex<f64>,
}

impl ProgressReporter {
    pub fn new(queue: Arc<dyn TaskQueue>, caller: Caller, worker_id: WorkerId, task_id: TaskId) -> Self {
        Self {
            queue,
            caller,
            worker_id,
            task_id,
            started: Instant::now(),
            last: Mutex::new(0.0),
        }
    }

    /// Seconds since the task was claimed.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Last progress value the store accepted.
    pub fn last(&self) -> f64 {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn report(&self, progress: f64) -> Result<()> {
        let report = ProgressReport::new(self.task_id, self.worker_id.clone(), progress, self.elapsed());
        self.queue.report_progress(&self.caller, &report).await?;
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = progress;
        Ok(())
    }

    pub async fn fail(&self, error: &str) -> Result<()> {
        let report = ProgressReport::new(self.task_id, self.worker_id.clone(), self.last(), self.elapsed())
            .failed(error);
        self.queue.report_progress(&self.caller, &report).await
    }
}

/// Executes a task and returns its result files.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> Result<Vec<UploadFile>>;
}

/// Runs an external command per task.
///
/// The command runs inside `{work_dir}/{task_id}` next to a `task.json`
/// holding the full task, and must leave its results in `$GENQ_OUTPUT_DIR`
/// named with the `{task_id}_{node_id}_` prefix from the graph.
pub struct CommandExecutor {
    command: PathBuf,
    work_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
        }
    }

    async fn prepare(&self, task: &Task) -> Result<PathBuf> {
        let dir = self.work_dir.join(task.task_id.to_string());
        tokio::fs::create_dir_all(dir.join("output")).await?;
        let task_json = serde_json::to_vec_pretty(task)?;
        tokio::fs::write(dir.join("task.json"), task_json).await?;
        debug!(task_id = %task.task_id, dir = %dir.display(), "task directory created");
        Ok(dir)
    }

    async fn run(&self, task: &Task, dir: &Path, progress: &ProgressReporter) -> Result<Vec<UploadFile>> {
        // Relative commands resolve against our cwd, not the task directory.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };
        let output_dir = dir.join("output");

        let mut child = Command::new(&command)
            .current_dir(dir)
            .env("GENQ_TASK_ID", task.task_id.to_string())
            .env("GENQ_TASK_NAME", &task.name)
            .env("GENQ_TASK_DIR", dir)
            .env("GENQ_OUTPUT_DIR", &output_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("command stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("command stderr not captured".into()))?;
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(value) = line.strip_prefix(PROGRESS_PREFIX) else {
                continue;
            };
            match value.trim().parse::<f64>() {
                // Completion is reported by the worker after results are in.
                // On error, dropping the child kills it.
                Ok(p) if p < 100.0 && p > progress.last() => progress.report(p).await?,
                Ok(_) => {}
                Err(_) => warn!(task_id = %task.task_id, line = %line, "ignoring malformed progress line"),
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_reader.await.unwrap_or_default();
        if !status.success() {
            let tail: String = stderr.lines().last().unwrap_or_default().to_string();
            return Err(Error::Other(format!("command exited with {status}: {tail}")));
        }

        collect_results(&output_dir, task.task_id).await
    }
}

async fn collect_results(output_dir: &Path, task_id: TaskId) -> Result<Vec<UploadFile>> {
    let prefix = format!("{task_id}_");
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && entry.file_type().await?.is_file() {
            let data = tokio::fs::read(entry.path()).await?;
            files.push(UploadFile::new(name, data));
        }
    }
    files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(files)
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> Result<Vec<UploadFile>> {
        let dir = self.prepare(task).await?;
        let result = self.run(task, &dir, progress).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(task_id = %task.task_id, "cleanup error: {e}");
        }
        result
    }
}
