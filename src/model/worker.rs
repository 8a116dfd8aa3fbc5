//! Caller identity and the worker-side request shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{Task, TaskId};

/// The resolved identity of whoever is calling into the queue.
///
/// Authentication happens before the queue is reached; by the time a
/// `Caller` exists, the user id and admin flag are trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }

    /// Admins see everything; everyone else only their own tasks.
    pub fn can_see(&self, task: &Task) -> bool {
        self.is_admin || task.user_id == self.user_id
    }

    /// Owner restriction applied when this caller pulls work.
    pub fn owner_filter(&self) -> Option<&str> {
        if self.is_admin {
            None
        } else {
            Some(&self.user_id)
        }
    }
}

/// Opaque identity token of a worker process. Stored as the lock owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity, for workers that don't configure one.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker asking for its next task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub worker_id: WorkerId,
    /// Flow names this worker can execute.
    pub tasks_names: Vec<String>,
    /// Name of the last task this worker ran; its flow is served first.
    #[serde(default)]
    pub last_task_name: String,
}

impl PullRequest {
    pub fn new(worker_id: WorkerId, tasks_names: Vec<String>) -> Self {
        Self {
            worker_id,
            tasks_names,
            last_task_name: String::new(),
        }
    }

    pub fn affinity(mut self, last_task_name: impl Into<String>) -> Self {
        self.last_task_name = last_task_name.into();
        self
    }
}

/// Progress (or final error) reported by the worker holding a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub progress: f64,
    pub execution_time: f64,
    #[serde(default)]
    pub error: String,
}

impl ProgressReport {
    pub fn new(task_id: TaskId, worker_id: WorkerId, progress: f64, execution_time: f64) -> Self {
        Self {
            task_id,
            worker_id,
            progress,
            execution_time,
            error: String::new(),
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }
}
