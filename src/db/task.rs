//! Task record operations: create, read, list, lifecycle writes, deletion.
//!
//! Visibility is enforced here: lookups take an optional owner, and a task
//! owned by someone else is reported exactly like a missing one.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use sqlx::types::Json;

use super::lineage::{attach_children, collect_descendants_on};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

impl super::Db {
    /// Insert a new task record. It is not selectable until enqueued.
    pub async fn create_task(&self, user_id: &str, new: &NewTask) -> Result<TaskId> {
        new.validate()?;
        let now = Utc::now();

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tasks (name, user_id, group_scope, priority, input_params, translated_input_params,
                                parent_task_id, parent_task_node_id, webhook_url, webhook_headers, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             RETURNING task_id",
        )
        .bind(&new.name)
        .bind(user_id)
        .bind(new.group_scope)
        .bind(new.priority)
        .bind(Json(&new.input_params))
        .bind(new.translated_input_params.as_ref().map(Json))
        .bind(new.parent.map(|p| p.task_id.0))
        .bind(new.parent.map(|p| p.node_id))
        .bind(&new.webhook_url)
        .bind(new.webhook_headers.as_ref().map(Json))
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        metrics::tasks_created().add(1, &[KeyValue::new("name", new.name.clone())]);
        Ok(TaskId(id))
    }

    /// Attach the compiled graph and declared outputs, making the task selectable.
    pub async fn enqueue_task(&self, id: TaskId, prepared: &PreparedTask) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET flow_comfy = ?1, outputs = ?2, input_files = ?3, queued = 1, updated_at = ?4
             WHERE task_id = ?5 AND queued = 0",
        )
        .bind(Json(&prepared.flow_comfy))
        .bind(Json(&prepared.outputs))
        .bind(Json(&prepared.input_files))
        .bind(Utc::now())
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return match self.get_task(id, None, false).await? {
                Some(_) => Err(Error::Conflict(format!("task {id} is already queued"))),
                None => Err(Error::NotFound(format!("task {id}"))),
            };
        }
        Ok(())
    }

    /// Get a task by ID, as seen by `owner` (`None` sees every task).
    pub async fn get_task(
        &self,
        id: TaskId,
        owner: Option<&str>,
        fetch_child: bool,
    ) -> Result<Option<Task>> {
        let mut conn = self.pool().acquire().await?;
        let Some(task) = fetch_task_on(&mut conn, id).await? else {
            return Ok(None);
        };
        if owner.is_some_and(|owner| task.user_id != owner) {
            return Ok(None);
        }
        if fetch_child {
            return load_subtree_on(&mut conn, task).await.map(Some);
        }
        Ok(Some(task))
    }

    /// List a user's tasks in one group scope, keyed by task id.
    pub async fn list_tasks(
        &self,
        user_id: &str,
        filter: &TaskFilter,
    ) -> Result<BTreeMap<TaskId, Task>> {
        let mut conn = self.pool().acquire().await?;
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks
             WHERE user_id = ?1 AND group_scope = ?2
             AND (?3 IS NULL OR name = ?3)
             AND (?4 = 0 OR progress >= 100.0)
             AND (?5 = 0 OR parent_task_id IS NULL)
             ORDER BY task_id ASC",
        )
        .bind(user_id)
        .bind(filter.group_scope)
        .bind(filter.name.as_deref())
        .bind(filter.only_completed)
        .bind(filter.only_parent)
        .fetch_all(&mut *conn)
        .await?;

        let mut result = BTreeMap::new();
        for row in rows {
            let mut task = row.into_task()?;
            if filter.fetch_child {
                task = load_subtree_on(&mut conn, task).await?;
            }
            result.insert(task.task_id, task);
        }
        Ok(result)
    }

    /// Ids of every task descending from `id`, parents before children.
    pub async fn collect_descendants(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let mut conn = self.pool().acquire().await?;
        collect_descendants_on(&mut conn, id).await
    }

    /// Delete tasks and their whole descendant subtrees in one transaction.
    ///
    /// Returns the ids that were actually removed.
    pub async fn delete_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskId>> {
        let mut tx = self.pool().begin().await?;

        let mut doomed = BTreeSet::new();
        for &id in ids {
            doomed.insert(id);
            doomed.extend(collect_descendants_on(&mut tx, id).await?);
        }

        let mut deleted = Vec::with_capacity(doomed.len());
        for id in doomed {
            let rows_affected = sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
                .bind(id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if rows_affected > 0 {
                deleted.push(id);
            }
        }

        tx.commit().await?;
        Ok(deleted)
    }

    /// Change editable fields. Returns `false` if the task already started.
    pub async fn update_task_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<bool> {
        update.validate()?;
        let Some(priority) = update.priority else {
            return Ok(false);
        };

        let rows_affected = sqlx::query(
            "UPDATE tasks SET priority = ?1, updated_at = ?2 WHERE task_id = ?3 AND progress = 0.0",
        )
        .bind(priority)
        .bind(Utc::now())
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Record worker progress, compare-and-set on the lock owner.
    ///
    /// Returns `false` when `worker` does not hold the lock, the task is
    /// already finished, or it carries an error that only a restart clears.
    pub async fn set_progress(
        &self,
        id: TaskId,
        progress: f64,
        error: &str,
        execution_time: f64,
        worker: &WorkerId,
    ) -> Result<bool> {
        let now = Utc::now();
        let finished_at = (progress >= PROGRESS_DONE && error.is_empty()).then_some(now);

        let rows_affected = sqlx::query(
            "UPDATE tasks SET progress = ?1, error = ?2, execution_time = ?3, updated_at = ?4,
                              finished_at = COALESCE(?5, finished_at)
             WHERE task_id = ?6 AND lock_owner = ?7 AND lock_owner != ''
             AND progress < 100.0 AND error = ''",
        )
        .bind(progress)
        .bind(error)
        .bind(execution_time)
        .bind(now)
        .bind(finished_at)
        .bind(id.0)
        .bind(worker.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Record the aggregated output sizes of a result upload.
    ///
    /// Compare-and-set on `results_submitted`: only the first upload since
    /// creation (or the last restart) wins. Returns `false` for every other.
    pub async fn set_outputs(&self, id: TaskId, outputs: &[TaskOutput]) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET outputs = ?1, results_submitted = 1, updated_at = ?2
             WHERE task_id = ?3 AND results_submitted = 0",
        )
        .bind(Json(outputs))
        .bind(Utc::now())
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Undo [`Db::set_outputs`] after the files behind it could not be stored.
    pub async fn reset_outputs(&self, id: TaskId, outputs: &[TaskOutput]) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET outputs = ?1, results_submitted = 0, updated_at = ?2 WHERE task_id = ?3",
        )
        .bind(Json(outputs))
        .bind(Utc::now())
        .bind(id.0)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Lock a specific unlocked, unfinished task. Returns `false` if someone
    /// else holds it (or it is finished).
    pub async fn acquire_lock(&self, id: TaskId, worker: &WorkerId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET lock_owner = ?1, updated_at = ?2
             WHERE task_id = ?3 AND lock_owner = '' AND progress < 100.0",
        )
        .bind(worker.as_str())
        .bind(Utc::now())
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Clear the lock owner. Unlocking an unlocked task is a no-op.
    pub async fn release_lock(&self, id: TaskId) -> Result<()> {
        sqlx::query("UPDATE tasks SET lock_owner = '', updated_at = ?1 WHERE task_id = ?2 AND lock_owner != ''")
            .bind(Utc::now())
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Put an unfinished task back in the pool: progress, error and results
    /// are reset and the lock is dropped in the same statement, so a report
    /// from the previous holder can not land in between.
    pub async fn restart_task(&self, id: TaskId, outputs: &[TaskOutput]) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET progress = 0.0, error = '', execution_time = 0.0, finished_at = NULL,
                              outputs = ?1, results_submitted = 0, lock_owner = '', updated_at = ?2
             WHERE task_id = ?3 AND progress < 100.0",
        )
        .bind(Json(outputs))
        .bind(Utc::now())
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Delete a user's unfinished top-level tasks of one flow and scope.
    /// Child tasks are left untouched.
    pub async fn remove_unfinished(
        &self,
        name: &str,
        group_scope: i32,
        user_id: &str,
    ) -> Result<Vec<TaskId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "DELETE FROM tasks
             WHERE name = ?1 AND group_scope = ?2 AND user_id = ?3
             AND progress < 100.0 AND parent_task_id IS NULL
             RETURNING task_id",
        )
        .bind(name)
        .bind(group_scope)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        Ok(ids.into_iter().map(TaskId).collect())
    }

    /// Delete one unfinished task. Returns `false` if it was finished or absent.
    pub async fn remove_unfinished_task(&self, id: TaskId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM tasks WHERE task_id = ?1 AND progress < 100.0")
            .bind(id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Inner functions: accept a connection so they work both on a pooled
// connection and inside a transaction.
// ---------------------------------------------------------------------------

pub(crate) async fn fetch_task_on(conn: &mut SqliteConnection, id: TaskId) -> Result<Option<Task>> {
    let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE task_id = ?1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task).transpose()
}

async fn load_subtree_on(conn: &mut SqliteConnection, root: Task) -> Result<Task> {
    let ids = collect_descendants_on(conn, root.task_id).await?;
    let mut descendants = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = fetch_task_on(conn, id).await? {
            descendants.push(task);
        }
    }
    Ok(attach_children(root, descendants))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: i64,
    name: String,
    user_id: String,
    group_scope: i32,
    priority: i32,
    progress: f64,
    error: String,
    execution_time: f64,
    lock_owner: String,
    input_params: Json<serde_json::Value>,
    translated_input_params: Option<Json<serde_json::Value>>,
    flow_comfy: Json<serde_json::Value>,
    input_files: Json<Vec<InputFile>>,
    outputs: Json<Vec<TaskOutput>>,
    parent_task_id: Option<i64>,
    parent_task_node_id: Option<i64>,
    webhook_url: Option<String>,
    webhook_headers: Option<Json<BTreeMap<String, String>>>,
    queued: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            task_id: TaskId(self.task_id),
            name: self.name,
            user_id: self.user_id,
            group_scope: self.group_scope,
            priority: self.priority,
            progress: self.progress,
            error: self.error,
            execution_time: self.execution_time,
            lock_owner: self.lock_owner,
            input_params: self.input_params.0,
            translated_input_params: self.translated_input_params.map(|j| j.0),
            flow_comfy: self.flow_comfy.0,
            input_files: self.input_files.0,
            outputs: self.outputs.0,
            parent_task_id: self.parent_task_id.map(TaskId),
            parent_task_node_id: self.parent_task_node_id,
            webhook_url: self.webhook_url,
            webhook_headers: self.webhook_headers.map(|j| j.0),
            queued: self.queued,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            child_tasks: Vec::new(),
        })
    }
}
