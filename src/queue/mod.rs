//! The logical queue API and its two deployments.
//!
//! [`TaskQueue`] is the only thing producers and workers talk to.
//! [`LocalQueue`] runs every operation against a store this process owns;
//! [`RemoteQueue`] forwards the same operations to a server that owns one.
//! Both report the same errors for the same situations, so callers never
//! need to know which one they hold.

mod local;
mod remote;

pub use local::LocalQueue;
pub use remote::RemoteQueue;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::{Config, Mode};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::files::DirFileStore;
use crate::flows::FlowDirectory;
use crate::model::*;
use crate::notify::Notifier;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Whether the backing store (local or remote) is reachable.
    async fn health(&self) -> Result<()>;

    /// Create one task from a flow and make it selectable. Input files
    /// travel inside `task`; `task.count` is not consulted.
    async fn create_task(&self, caller: &Caller, task: NewTask) -> Result<TaskId>;

    /// Create `task.count` tasks from one request, stepping a numeric `seed`
    /// parameter for each task after the first. Ids come back in creation
    /// order; tasks created before a failure are kept.
    async fn create_tasks(&self, caller: &Caller, task: NewTask) -> Result<Vec<TaskId>>;

    /// Hand an already prepared task to the queue.
    async fn enqueue_task(&self, caller: &Caller, task_id: TaskId, prepared: PreparedTask) -> Result<()>;

    /// Claim the best eligible task for `request.worker_id`, or `None`.
    async fn pull_next(&self, caller: &Caller, request: &PullRequest) -> Result<Option<Task>>;

    /// Record progress or a final error. `NotFound` means: stop working on it.
    async fn report_progress(&self, caller: &Caller, report: &ProgressReport) -> Result<()>;

    /// Upload result files. Returns the task with aggregated outputs.
    async fn submit_results(&self, caller: &Caller, task_id: TaskId, files: Vec<UploadFile>) -> Result<Task>;

    async fn release_lock(&self, caller: &Caller, task_id: TaskId) -> Result<()>;

    async fn restart_task(&self, caller: &Caller, task_id: TaskId, force: bool) -> Result<()>;

    async fn update_task(&self, caller: &Caller, task_id: TaskId, update: &TaskUpdate) -> Result<()>;

    async fn get_task(&self, caller: &Caller, task_id: TaskId, fetch_child: bool) -> Result<Task>;

    /// One result file of an output node. `batch_index` picks among the
    /// files of a node that produced several, in name order.
    async fn get_result(&self, caller: &Caller, task_id: TaskId, node_id: i64, batch_index: usize) -> Result<UploadFile>;

    /// A stored input file of a task, by slot.
    async fn get_input(&self, caller: &Caller, task_id: TaskId, index: usize) -> Result<UploadFile>;

    async fn list_tasks(&self, caller: &Caller, filter: &TaskFilter) -> Result<BTreeMap<TaskId, Task>>;

    /// Delete tasks together with their descendants. Returns every id removed.
    async fn delete_tasks(&self, caller: &Caller, task_ids: &[TaskId]) -> Result<Vec<TaskId>>;

    /// Delete the caller's finished top-level tasks of one flow and scope,
    /// with their children.
    async fn clear_finished(&self, caller: &Caller, name: &str, group_scope: i32) -> Result<Vec<TaskId>>;

    /// Delete the caller's unfinished top-level tasks of one flow and scope.
    async fn dequeue_unfinished(&self, caller: &Caller, name: &str, group_scope: i32) -> Result<Vec<TaskId>>;

    /// Delete one unfinished task.
    async fn dequeue_task(&self, caller: &Caller, task_id: TaskId) -> Result<()>;
}

/// Build the queue implementation this process's configuration calls for.
pub async fn open(config: &Config) -> Result<Arc<dyn TaskQueue>> {
    match config.mode {
        Mode::Worker => {
            let url = config
                .server_url
                .as_deref()
                .ok_or_else(|| Error::Config("GENQ_SERVER_URL is not set".into()))?;
            let queue = RemoteQueue::new(url, config.auth_token.clone(), config.net_timeout)?;
            Ok(Arc::new(queue))
        }
        Mode::Local | Mode::Server => Ok(Arc::new(open_local(config).await?)),
    }
}

/// The store-owning queue, for processes that also serve it.
pub async fn open_local(config: &Config) -> Result<LocalQueue> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let files = DirFileStore::open(&config.files_dir).await?;
    let flows = FlowDirectory::new(&config.flows_dir);
    let notifier = Notifier::new(config.webhook_timeout)?;
    Ok(LocalQueue::new(
        Arc::new(db),
        Arc::new(files),
        Arc::new(flows),
        notifier,
    ))
}
