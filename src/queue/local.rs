//! Queue over a store owned by this process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use super::TaskQueue;
use crate::db::Db;
use crate::db::lineage::descendant_ids;
use crate::error::{Error, Result};
use crate::files::FileStore;
use crate::flows::{CompileRequest, FlowCompiler};
use crate::model::*;
use crate::notify::{Notifier, ProgressEvent, WebhookTarget};
use crate::telemetry::metrics;
use crate::telemetry::task::count_transition;

pub struct LocalQueue {
    db: Arc<Db>,
    files: Arc<dyn FileStore>,
    flows: Arc<dyn FlowCompiler>,
    notifier: Notifier,
}

impl Clone for LocalQueue {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            files: Arc::clone(&self.files),
            flows: Arc::clone(&self.flows),
            notifier: self.notifier.clone(),
        }
    }
}

fn not_found(task_id: TaskId) -> Error {
    Error::NotFound(format!("task {task_id} was not found"))
}

impl LocalQueue {
    pub fn new(
        db: Arc<Db>,
        files: Arc<dyn FileStore>,
        flows: Arc<dyn FlowCompiler>,
        notifier: Notifier,
    ) -> Self {
        Self {
            db,
            files,
            flows,
            notifier,
        }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    /// The task as `caller` sees it. Invisible tasks do not exist.
    async fn visible_task(&self, caller: &Caller, task_id: TaskId, fetch_child: bool) -> Result<Task> {
        self.db
            .get_task(task_id, caller.owner_filter(), fetch_child)
            .await?
            .ok_or_else(|| not_found(task_id))
    }

    async fn remove_files(&self, task_ids: &[TaskId]) {
        for &task_id in task_ids {
            if let Err(e) = self.files.remove_task(task_id).await {
                warn!(task_id = %task_id, "failed to remove task files: {e}");
            }
        }
    }

    /// The first result file of a parent's output node, for a child's slot 0.
    async fn parent_output(&self, parent: &Task, node_id: i64) -> Result<UploadFile> {
        let parent_id = parent.task_id;
        let output = parent
            .outputs
            .iter()
            .find(|o| o.node_id == node_id)
            .ok_or_else(|| Error::Validation(format!("task {parent_id} has no output node {node_id}")))?;
        if !output.is_produced() {
            return Err(Error::Validation(format!(
                "output node {node_id} of task {parent_id} has no results yet"
            )));
        }
        let name = self
            .files
            .list_outputs(&output.file_prefix(parent_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Validation(format!("result file of task {parent_id}, node {node_id} not found"))
            })?;
        let data = self.files.read_output(&name).await?;
        Ok(UploadFile::new(name, data))
    }

    /// Undo a creation whose compilation failed.
    async fn discard(&self, task_id: TaskId) {
        if let Err(e) = self.db.delete_tasks(&[task_id]).await {
            warn!(task_id = %task_id, "failed to discard task record: {e}");
        }
        self.remove_files(&[task_id]).await;
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn health(&self) -> Result<()> {
        self.db.health_check().await
    }

    async fn create_task(&self, caller: &Caller, task: NewTask) -> Result<TaskId> {
        task.validate()?;
        // A child's first input slot is its parent's output.
        let mut uploads = Vec::with_capacity(task.input_files.len() + 1);
        if let Some(parent) = task.parent {
            let Ok(parent_task) = self.visible_task(caller, parent.task_id, false).await else {
                return Err(Error::Validation(format!(
                    "parent task {} was not found",
                    parent.task_id
                )));
            };
            uploads.push(self.parent_output(&parent_task, parent.node_id).await?);
        }
        uploads.extend(task.input_files.iter().cloned());

        let task_id = self.db.create_task(&caller.user_id, &task).await?;

        let mut stored = Vec::with_capacity(uploads.len());
        for (slot, file) in uploads.iter().enumerate() {
            match self.files.write_input(task_id, slot, file).await {
                Ok(input) => stored.push(input),
                Err(e) => {
                    self.discard(task_id).await;
                    return Err(e);
                }
            }
        }

        let request = CompileRequest {
            task_id,
            name: &task.name,
            params: &task.input_params,
            input_files: &stored,
        };
        let prepared = match self.flows.compile(request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.discard(task_id).await;
                debug!(task_id = %task_id, name = %task.name, "flow compilation failed: {e}");
                return Err(match e {
                    Error::Validation(_) => e,
                    other => Error::Validation(other.message()),
                });
            }
        };

        self.db.enqueue_task(task_id, &prepared).await?;
        count_transition(TaskState::Pending, TaskState::Unassigned);
        info!(task_id = %task_id, name = %task.name, user = %caller.user_id, "task created");
        Ok(task_id)
    }

    async fn create_tasks(&self, caller: &Caller, task: NewTask) -> Result<Vec<TaskId>> {
        task.validate()?;
        let count = task.count;
        let mut next = task;
        next.count = 1;

        let mut ids = Vec::with_capacity(count as usize);
        for n in 0..count {
            if n > 0 {
                next.advance_seed();
            }
            ids.push(self.create_task(caller, next.clone()).await?);
        }
        if count > 1 {
            info!(name = %next.name, count, user = %caller.user_id, "task batch created");
        }
        Ok(ids)
    }

    async fn enqueue_task(&self, caller: &Caller, task_id: TaskId, prepared: PreparedTask) -> Result<()> {
        self.visible_task(caller, task_id, false).await?;
        self.db.enqueue_task(task_id, &prepared).await?;
        count_transition(TaskState::Pending, TaskState::Unassigned);
        Ok(())
    }

    async fn pull_next(&self, caller: &Caller, request: &PullRequest) -> Result<Option<Task>> {
        let claimed = self
            .db
            .select_and_lock(
                &request.tasks_names,
                &request.last_task_name,
                caller.owner_filter(),
                &request.worker_id,
            )
            .await?;

        match &claimed {
            Some(task) => {
                metrics::task_pulls().add(1, &[KeyValue::new("result", "claimed")]);
                count_transition(TaskState::Unassigned, TaskState::Locked);
                info!(task_id = %task.task_id, name = %task.name, worker = %request.worker_id, "task claimed");
            }
            None => metrics::task_pulls().add(1, &[KeyValue::new("result", "empty")]),
        }
        Ok(claimed)
    }

    async fn report_progress(&self, caller: &Caller, report: &ProgressReport) -> Result<()> {
        let task_id = report.task_id;
        let task = self.visible_task(caller, task_id, false).await?;

        if task.lock_owner != report.worker_id.as_str() {
            metrics::rejected_reports().add(1, &[]);
            warn!(task_id = %task_id, worker = %report.worker_id, "progress from a worker that does not hold the task");
            return Err(not_found(task_id));
        }
        if task.is_finished() {
            return Err(Error::Conflict(format!("task {task_id} already finished")));
        }
        if task.has_error() {
            return Err(Error::Conflict(format!(
                "task {task_id} failed and must be restarted before it takes progress"
            )));
        }
        if !(0.0..=PROGRESS_DONE).contains(&report.progress) {
            return Err(Error::Validation(format!(
                "progress must be between 0 and {PROGRESS_DONE}, got {}",
                report.progress
            )));
        }
        if report.error.is_empty() && report.progress < task.progress {
            return Err(Error::Conflict(format!(
                "progress of task {task_id} can not go back from {} to {}",
                task.progress, report.progress
            )));
        }

        let accepted = self
            .db
            .set_progress(
                task_id,
                report.progress,
                &report.error,
                report.execution_time,
                &report.worker_id,
            )
            .await?;
        if !accepted {
            // Lost the race against an unlock, a restart or an error report.
            metrics::rejected_reports().add(1, &[]);
            return Err(not_found(task_id));
        }

        let from = task.state();
        let mut updated = task;
        updated.progress = report.progress;
        updated.error = report.error.clone();
        updated.execution_time = report.execution_time;
        let to = updated.state();
        count_transition(from, to);

        if to == TaskState::Completed {
            metrics::task_execution_time_s().record(
                report.execution_time,
                &[KeyValue::new("name", updated.name.clone())],
            );
            info!(task_id = %task_id, execution_time = report.execution_time, "task completed");
        } else if to == TaskState::Errored {
            warn!(task_id = %task_id, error = %report.error, "task failed");
        }

        if let Some(target) = WebhookTarget::of(&updated) {
            self.notifier.notify(
                target,
                ProgressEvent {
                    task_id,
                    progress: report.progress,
                    execution_time: report.execution_time,
                    error: report.error.clone(),
                },
            );
        }
        Ok(())
    }

    async fn submit_results(&self, caller: &Caller, task_id: TaskId, files: Vec<UploadFile>) -> Result<Task> {
        let mut task = self.visible_task(caller, task_id, false).await?;
        let declared = task.outputs.clone();

        // Check every output before claiming or writing anything.
        let mut grouped = Vec::with_capacity(task.outputs.len());
        for output in &task.outputs {
            let prefix = output.file_prefix(task_id);
            let relevant: Vec<&UploadFile> = files
                .iter()
                .filter(|f| f.file_name.starts_with(&prefix))
                .collect();
            if relevant.is_empty() {
                return Err(Error::Conflict(format!("no results found for: {prefix}")));
            }
            grouped.push(relevant);
        }
        for (output, relevant) in task.outputs.iter_mut().zip(&grouped) {
            output.file_size = relevant.iter().map(|f| f.size()).sum();
            output.batch_size = relevant.len() as i64;
        }

        if !self.db.set_outputs(task_id, &task.outputs).await? {
            return Err(Error::Conflict(format!(
                "results of task {task_id} were already submitted"
            )));
        }

        for file in grouped.iter().flatten() {
            if let Err(e) = self.files.write_output(file).await {
                warn!(task_id = %task_id, "failed to store result file, upload undone: {e}");
                self.db.reset_outputs(task_id, &declared).await?;
                return Err(e);
            }
        }
        debug!(task_id = %task_id, files = files.len(), "results stored");
        Ok(task)
    }

    async fn release_lock(&self, caller: &Caller, task_id: TaskId) -> Result<()> {
        self.visible_task(caller, task_id, false).await?;
        self.db.release_lock(task_id).await
    }

    async fn restart_task(&self, caller: &Caller, task_id: TaskId, force: bool) -> Result<()> {
        let task = self.visible_task(caller, task_id, false).await?;
        if task.is_finished() {
            return Err(Error::Conflict(format!("task {task_id} already finished")));
        }
        if !task.has_error() && !force {
            return Err(Error::Conflict(format!("task {task_id} has no error set")));
        }
        let pending: Vec<TaskOutput> = task
            .outputs
            .iter()
            .map(|o| TaskOutput::pending(o.node_id, o.output_type.clone()))
            .collect();
        if !self.db.restart_task(task_id, &pending).await? {
            return Err(Error::Conflict(format!("task {task_id} already finished")));
        }
        if let Err(e) = self.files.remove_outputs(task_id).await {
            warn!(task_id = %task_id, "failed to remove stale result files: {e}");
        }
        count_transition(task.state(), TaskState::Unassigned);
        info!(task_id = %task_id, force, "task restarted");
        Ok(())
    }

    async fn update_task(&self, caller: &Caller, task_id: TaskId, update: &TaskUpdate) -> Result<()> {
        let task = self.visible_task(caller, task_id, false).await?;
        update.validate()?;
        if task.is_started() || !self.db.update_task_fields(task_id, update).await? {
            return Err(Error::Conflict(format!(
                "task {task_id} has already started and can not be updated"
            )));
        }
        Ok(())
    }

    async fn get_task(&self, caller: &Caller, task_id: TaskId, fetch_child: bool) -> Result<Task> {
        self.visible_task(caller, task_id, fetch_child).await
    }

    async fn get_result(&self, caller: &Caller, task_id: TaskId, node_id: i64, batch_index: usize) -> Result<UploadFile> {
        let task = self.visible_task(caller, task_id, false).await?;
        let output = task
            .outputs
            .iter()
            .find(|o| o.node_id == node_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id} has no output node {node_id}")))?;
        let name = self
            .files
            .list_outputs(&output.file_prefix(task_id))
            .await?
            .into_iter()
            .nth(batch_index)
            .ok_or_else(|| {
                Error::NotFound(format!("missing result for task={task_id} and node={node_id}"))
            })?;
        let data = self.files.read_output(&name).await?;
        Ok(UploadFile::new(name, data))
    }

    async fn get_input(&self, caller: &Caller, task_id: TaskId, index: usize) -> Result<UploadFile> {
        let task = self.visible_task(caller, task_id, false).await?;
        let input = task
            .input_files
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("task {task_id} has no input file {index}")))?;
        let data = self.files.read_input(&input.file_name).await?;
        Ok(UploadFile::new(input.file_name.clone(), data))
    }

    async fn list_tasks(&self, caller: &Caller, filter: &TaskFilter) -> Result<BTreeMap<TaskId, Task>> {
        validate_group_scope(filter.group_scope)?;
        self.db.list_tasks(&caller.user_id, filter).await
    }

    async fn delete_tasks(&self, caller: &Caller, task_ids: &[TaskId]) -> Result<Vec<TaskId>> {
        for &task_id in task_ids {
            self.visible_task(caller, task_id, false).await?;
        }
        let deleted = self.db.delete_tasks(task_ids).await?;
        self.remove_files(&deleted).await;
        info!(count = deleted.len(), "tasks deleted");
        Ok(deleted)
    }

    async fn clear_finished(&self, caller: &Caller, name: &str, group_scope: i32) -> Result<Vec<TaskId>> {
        validate_group_scope(group_scope)?;
        let filter = TaskFilter::default()
            .name(name)
            .group_scope(group_scope)
            .only_completed()
            .only_parent()
            .with_children();
        let finished = self.db.list_tasks(&caller.user_id, &filter).await?;

        let mut ids = Vec::new();
        for task in finished.values() {
            ids.push(task.task_id);
            ids.extend(descendant_ids(task));
        }
        if ids.is_empty() {
            return Ok(ids);
        }

        let deleted = self.db.delete_tasks(&ids).await?;
        self.remove_files(&deleted).await;
        info!(flow = name, group_scope, count = deleted.len(), "finished tasks cleared");
        Ok(deleted)
    }

    async fn dequeue_unfinished(&self, caller: &Caller, name: &str, group_scope: i32) -> Result<Vec<TaskId>> {
        validate_group_scope(group_scope)?;
        let removed = self
            .db
            .remove_unfinished(name, group_scope, &caller.user_id)
            .await?;
        self.remove_files(&removed).await;
        info!(flow = name, group_scope, count = removed.len(), "unfinished tasks dequeued");
        Ok(removed)
    }

    async fn dequeue_task(&self, caller: &Caller, task_id: TaskId) -> Result<()> {
        let task = self.visible_task(caller, task_id, false).await?;
        if task.is_finished() || !self.db.remove_unfinished_task(task_id).await? {
            return Err(Error::Conflict(format!("task {task_id} already finished")));
        }
        self.remove_files(&[task_id]).await;
        info!(task_id = %task_id, "task dequeued");
        Ok(())
    }
}
