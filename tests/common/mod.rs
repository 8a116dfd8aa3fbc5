//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use genq::db::Db;
use genq::error::{Error, Result};
use genq::files::DirFileStore;
use genq::flows::{CompileRequest, FlowCompiler};
use genq::model::*;
use genq::notify::{DEFAULT_TIMEOUT, Notifier};
use genq::queue::{LocalQueue, TaskQueue};
use serde_json::json;
use tempfile::TempDir;

/// Compiles every flow to a one-node graph with a single image output on
/// node 9. Flow names starting with `broken` fail to compile.
pub struct StubFlows;

#[async_trait]
impl FlowCompiler for StubFlows {
    async fn compile(&self, request: CompileRequest<'_>) -> Result<PreparedTask> {
        if request.name.starts_with("broken") {
            return Err(Error::Validation(format!("flow `{}` is broken", request.name)));
        }
        Ok(PreparedTask {
            flow_comfy: json!({
                "9": {
                    "class_type": "SaveImage",
                    "inputs": { "filename_prefix": format!("{}_9", request.task_id) }
                }
            }),
            outputs: vec![TaskOutput::pending(9, "image")],
            input_files: request.input_files.to_vec(),
        })
    }
}

/// A local queue over an in-memory store. Keep `dir` alive for the test.
pub struct Harness {
    pub queue: LocalQueue,
    pub dir: TempDir,
}

impl Harness {
    pub fn shared(&self) -> Arc<dyn TaskQueue> {
        Arc::new(self.queue.clone())
    }
}

pub async fn harness() -> Harness {
    let db = Db::in_memory().await.unwrap();
    harness_with(db).await
}

/// Harness over a file-backed store, for tests that need real concurrency.
pub async fn file_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("genq.db").display());
    let db = Db::connect(&url).await.unwrap();
    db.migrate().await.unwrap();
    build(db, dir).await
}

pub async fn harness_with(db: Db) -> Harness {
    build(db, tempfile::tempdir().unwrap()).await
}

async fn build(db: Db, dir: TempDir) -> Harness {
    let files = DirFileStore::open(dir.path().join("files")).await.unwrap();
    let queue = LocalQueue::new(
        Arc::new(db),
        Arc::new(files),
        Arc::new(StubFlows),
        Notifier::new(DEFAULT_TIMEOUT).unwrap(),
    );
    Harness { queue, dir }
}

pub fn alice() -> Caller {
    Caller::user("alice")
}

pub fn admin() -> Caller {
    Caller::admin("ops")
}

pub async fn create(queue: &dyn TaskQueue, caller: &Caller, name: &str, group_scope: i32, priority: i32) -> TaskId {
    queue
        .create_task(
            caller,
            NewTask::new(name).group_scope(group_scope).priority(priority),
        )
        .await
        .unwrap()
}

pub async fn pull(queue: &dyn TaskQueue, caller: &Caller, worker: &str, names: &[&str]) -> Option<Task> {
    let request = PullRequest::new(
        WorkerId::new(worker),
        names.iter().map(|n| n.to_string()).collect(),
    );
    queue.pull_next(caller, &request).await.unwrap()
}

pub async fn report(queue: &dyn TaskQueue, caller: &Caller, task_id: TaskId, worker: &str, progress: f64) -> Result<()> {
    queue
        .report_progress(
            caller,
            &ProgressReport::new(task_id, WorkerId::new(worker), progress, 1.5),
        )
        .await
}

/// Create a task, run it to completion as `worker` with one result file on
/// node 9, and return its id. Nothing else of the same flow may be waiting.
pub async fn completed(queue: &dyn TaskQueue, caller: &Caller, new: NewTask, worker: &str) -> TaskId {
    let name = new.name.clone();
    let id = queue.create_task(caller, new).await.unwrap();
    let pulled = pull(queue, caller, worker, &[name.as_str()]).await.unwrap();
    assert_eq!(pulled.task_id, id);
    queue
        .submit_results(caller, id, vec![UploadFile::new(format!("{id}_9_00001_.png"), b"png".to_vec())])
        .await
        .unwrap();
    report(queue, caller, id, worker, 100.0).await.unwrap();
    id
}
