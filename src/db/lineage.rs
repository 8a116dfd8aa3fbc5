//! Parent/child task relations.
//!
//! Trees are walked with an explicit worklist, never recursion, so an
//! arbitrarily deep chain of child tasks cannot overflow the stack.

use std::collections::{HashMap, HashSet};

use sqlx::SqliteConnection;

use crate::error::Result;
use crate::model::{Task, TaskId};

/// Every descendant of `root` (root excluded), parents before children.
pub(crate) async fn collect_descendants_on(
    conn: &mut SqliteConnection,
    root: TaskId,
) -> Result<Vec<TaskId>> {
    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut pending = vec![root];

    while let Some(current) = pending.pop() {
        let children: Vec<i64> = sqlx::query_scalar(
            "SELECT task_id FROM tasks WHERE parent_task_id = ?1 ORDER BY task_id ASC",
        )
        .bind(current.0)
        .fetch_all(&mut *conn)
        .await?;

        for child in children.into_iter().map(TaskId) {
            // Guards against a corrupted row pointing back up the tree.
            if seen.insert(child) {
                found.push(child);
                pending.push(child);
            }
        }
    }

    Ok(found)
}

/// Nest `descendants` under `root` by `parent_task_id`.
///
/// `descendants` must list every parent before its children, as
/// [`collect_descendants_on`] does. Siblings end up ordered by task id.
pub fn attach_children(mut root: Task, descendants: Vec<Task>) -> Task {
    let mut by_parent: HashMap<TaskId, Vec<Task>> = HashMap::new();

    // Walking backwards guarantees a node's children are complete before
    // the node itself is moved under its own parent.
    for mut task in descendants.into_iter().rev() {
        if let Some(mut children) = by_parent.remove(&task.task_id) {
            children.sort_by_key(|t| t.task_id);
            task.child_tasks = children;
        }
        if let Some(parent) = task.parent_task_id {
            by_parent.entry(parent).or_default().push(task);
        }
    }

    let mut children = by_parent.remove(&root.task_id).unwrap_or_default();
    children.sort_by_key(|t| t.task_id);
    root.child_tasks = children;
    root
}

/// Flatten a nested tree into the ids of every descendant, without recursion.
pub fn descendant_ids(task: &Task) -> Vec<TaskId> {
    let mut ids = Vec::new();
    let mut pending: Vec<&Task> = task.child_tasks.iter().collect();
    while let Some(current) = pending.pop() {
        ids.push(current.task_id);
        pending.extend(current.child_tasks.iter());
    }
    ids.sort();
    ids
}
