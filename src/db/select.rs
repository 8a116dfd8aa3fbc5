//! Admission: choose the next task for a worker and lock it.
//!
//! Selection and locking are one `UPDATE ... RETURNING` statement, so two
//! workers pulling at the same moment can never both win the same task.
//!
//! Ordering, highest first:
//! 1. affinity: the task's flow matches the worker's last flow
//! 2. combined priority `(group_scope - 1) * 16 + priority`
//! 3. lowest task id (FIFO)

use chrono::Utc;

use crate::error::Result;
use crate::model::{Task, TaskId, WorkerId};

impl super::Db {
    /// Lock the best eligible task to `worker` and return it.
    ///
    /// Eligible means queued, unlocked, error-free, unfinished, named in
    /// `candidate_names`, and (when `owner` is set) owned by `owner`.
    /// Returns `None` when nothing qualifies, including when
    /// `candidate_names` is empty.
    pub async fn select_and_lock(
        &self,
        candidate_names: &[String],
        affinity: &str,
        owner: Option<&str>,
        worker: &WorkerId,
    ) -> Result<Option<Task>> {
        if candidate_names.is_empty() {
            return Ok(None);
        }
        let names = serde_json::to_string(candidate_names)?;

        let claimed: Option<i64> = sqlx::query_scalar(
            "UPDATE tasks SET lock_owner = ?1, updated_at = ?2
             WHERE lock_owner = '' AND task_id = (
                 SELECT task_id FROM tasks
                 WHERE queued = 1 AND lock_owner = '' AND error = '' AND progress < 100.0
                 AND name IN (SELECT value FROM json_each(?3))
                 AND (?4 IS NULL OR user_id = ?4)
                 ORDER BY (name = ?5) DESC,
                          ((group_scope - 1) * 16 + priority) DESC,
                          task_id ASC
                 LIMIT 1
             )
             RETURNING task_id",
        )
        .bind(worker.as_str())
        .bind(Utc::now())
        .bind(names)
        .bind(owner)
        .bind(affinity)
        .fetch_optional(self.pool())
        .await?;

        match claimed {
            Some(id) => self.get_task(TaskId(id), None, false).await,
            None => Ok(None),
        }
    }
}
