//! Task records, admission ordering and request/update shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lowest valid group scope.
pub const GROUP_SCOPE_MIN: i32 = 1;
/// Highest valid group scope.
pub const GROUP_SCOPE_MAX: i32 = 255;
/// Highest valid priority within a group scope.
pub const PRIORITY_MAX: i32 = 15;
/// Number of priority tiers folded into one group scope step.
const PRIORITY_TIERS: i32 = PRIORITY_MAX + 1;

/// Progress value of a finished task.
pub const PROGRESS_DONE: f64 = 100.0;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for task IDs. Assigned by the store, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<i64>()
            .map(TaskId)
            .map_err(|_| Error::Validation(format!("invalid task id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Admission ordering
// ---------------------------------------------------------------------------

/// Reject a group scope outside `1..=255`.
pub fn validate_group_scope(group_scope: i32) -> Result<()> {
    if (GROUP_SCOPE_MIN..=GROUP_SCOPE_MAX).contains(&group_scope) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "group scope must be between {GROUP_SCOPE_MIN} and {GROUP_SCOPE_MAX}, got {group_scope}"
        )))
    }
}

/// Reject a priority outside `0..=15`.
pub fn validate_priority(priority: i32) -> Result<()> {
    if (0..=PRIORITY_MAX).contains(&priority) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "priority must be between 0 and {PRIORITY_MAX}, got {priority}"
        )))
    }
}

/// Ordering key used by admission: `(group_scope - 1) * 16 + priority`.
///
/// Group scope dominates priority, so scope 2 / priority 0 (16) outranks
/// scope 1 / priority 15 (15). The same expression is evaluated in SQL by
/// the selector; keep both in sync.
pub fn combined_priority(group_scope: i32, priority: i32) -> i32 {
    (group_scope - GROUP_SCOPE_MIN) * PRIORITY_TIERS + priority
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A file uploaded as task input, stored under a per-task slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub file_name: String,
    pub file_size: i64,
}

/// A declared output of the task's graph.
///
/// `file_size` and `batch_size` are -1 until results are uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub node_id: i64,
    #[serde(rename = "type")]
    pub output_type: String,
    pub file_size: i64,
    pub batch_size: i64,
}

impl TaskOutput {
    pub fn pending(node_id: i64, output_type: impl Into<String>) -> Self {
        Self {
            node_id,
            output_type: output_type.into(),
            file_size: -1,
            batch_size: -1,
        }
    }

    /// Filename prefix every result file of this output must carry.
    pub fn file_prefix(&self, task_id: TaskId) -> String {
        format!("{task_id}_{}_", self.node_id)
    }

    pub fn is_produced(&self) -> bool {
        self.batch_size >= 0
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,

    /// Flow (job template) this task was compiled from.
    pub name: String,
    pub user_id: String,

    /// Partition tag for bulk listing/deletion, 1..=255.
    pub group_scope: i32,
    /// Ordering hint within the scope, 0..=15.
    pub priority: i32,

    pub progress: f64,
    /// Empty means no error. A non-empty error makes the task retryable.
    pub error: String,
    /// Seconds, as reported by the worker.
    pub execution_time: f64,
    /// Identity of the worker holding the task. Empty means unlocked.
    pub lock_owner: String,

    pub input_params: serde_json::Value,
    pub translated_input_params: Option<serde_json::Value>,

    /// Compiled executable graph. Opaque to the scheduler.
    pub flow_comfy: serde_json::Value,
    pub input_files: Vec<InputFile>,
    pub outputs: Vec<TaskOutput>,

    pub parent_task_id: Option<TaskId>,
    pub parent_task_node_id: Option<i64>,

    pub webhook_url: Option<String>,
    pub webhook_headers: Option<BTreeMap<String, String>>,

    /// Set once the task has been handed to the queue and is selectable.
    pub queued: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Descendants, populated only when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_tasks: Vec<Task>,
}

impl Task {
    pub fn combined_priority(&self) -> i32 {
        combined_priority(self.group_scope, self.priority)
    }

    pub fn is_finished(&self) -> bool {
        self.progress >= PROGRESS_DONE
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        !self.lock_owner.is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.progress != 0.0
    }

    /// Lifecycle state as seen from a worker.
    pub fn state(&self) -> TaskState {
        if self.is_finished() {
            TaskState::Completed
        } else if self.has_error() {
            TaskState::Errored
        } else if !self.queued {
            TaskState::Pending
        } else if !self.is_locked() {
            TaskState::Unassigned
        } else if self.progress > 0.0 {
            TaskState::Progressing
        } else {
            TaskState::Locked
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state derived from a task's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, graph not yet handed to the queue.
    Pending,
    /// Selectable by workers.
    Unassigned,
    /// Claimed by a worker, no progress yet.
    Locked,
    /// Worker reported partial progress.
    Progressing,
    /// Finished. Terminal.
    Completed,
    /// Worker reported an error. Retryable via restart.
    Errored,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Unassigned => "unassigned",
            TaskState::Locked => "locked",
            TaskState::Progressing => "progressing",
            TaskState::Completed => "completed",
            TaskState::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Builders and request shapes
// ---------------------------------------------------------------------------

/// Raw bytes of a file travelling with a request (task input or result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> i64 {
        self.data.len() as i64
    }
}

/// Binding of a child task's input to an output node of its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentBinding {
    pub task_id: TaskId,
    pub node_id: i64,
}

/// Builder for creating new tasks. The producer-facing API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub input_params: serde_json::Value,
    #[serde(default)]
    pub translated_input_params: Option<serde_json::Value>,
    #[serde(default = "default_group_scope")]
    pub group_scope: i32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub parent: Option<ParentBinding>,
    /// How many tasks one creation request makes. See [`NewTask::advance_seed`].
    #[serde(default = "default_count")]
    pub count: u32,
    /// Uploaded input files, in slot order. Travels out of band.
    #[serde(skip)]
    pub input_files: Vec<UploadFile>,
}

fn default_group_scope() -> i32 {
    GROUP_SCOPE_MIN
}

fn default_count() -> u32 {
    1
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_params: serde_json::Value::Object(Default::default()),
            translated_input_params: None,
            group_scope: GROUP_SCOPE_MIN,
            priority: 0,
            webhook_url: None,
            webhook_headers: None,
            parent: None,
            count: 1,
            input_files: Vec::new(),
        }
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.input_params = params;
        self
    }

    pub fn translated_params(mut self, params: serde_json::Value) -> Self {
        self.translated_input_params = Some(params);
        self
    }

    pub fn group_scope(mut self, group_scope: i32) -> Self {
        self.group_scope = group_scope;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn webhook(mut self, url: impl Into<String>, headers: Option<BTreeMap<String, String>>) -> Self {
        self.webhook_url = Some(url.into());
        self.webhook_headers = headers;
        self
    }

    pub fn parent(mut self, task_id: TaskId, node_id: i64) -> Self {
        self.parent = Some(ParentBinding { task_id, node_id });
        self
    }

    pub fn input_file(mut self, file: UploadFile) -> Self {
        self.input_files.push(file);
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Step a numeric `seed` parameter by one, so each task of a batch
    /// renders something different. Other parameters are left alone.
    pub fn advance_seed(&mut self) {
        let Some(seed) = self.input_params.get_mut("seed") else {
            return;
        };
        let current = match seed {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        if let Some(current) = current {
            *seed = serde_json::Value::from(current.saturating_add(1));
        }
    }

    /// Admission-time checks. Out-of-range values are rejected, never clamped.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("task name must not be empty".into()));
        }
        if self.count == 0 {
            return Err(Error::Validation("count must be at least 1".into()));
        }
        validate_group_scope(self.group_scope)?;
        validate_priority(self.priority)
    }
}

/// Everything the queue needs to make a created task selectable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreparedTask {
    pub flow_comfy: serde_json::Value,
    pub outputs: Vec<TaskOutput>,
    #[serde(default)]
    pub input_files: Vec<InputFile>,
}

/// Fields a producer may change before the task starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl TaskUpdate {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Validation("no valid fields to update".into()));
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        Ok(())
    }
}

/// Filter for listing tasks. Results are always scoped to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_group_scope")]
    pub group_scope: i32,
    #[serde(default)]
    pub only_completed: bool,
    #[serde(default)]
    pub only_parent: bool,
    #[serde(default)]
    pub fetch_child: bool,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            name: None,
            group_scope: GROUP_SCOPE_MIN,
            only_completed: false,
            only_parent: false,
            fetch_child: false,
        }
    }
}

impl TaskFilter {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn group_scope(mut self, group_scope: i32) -> Self {
        self.group_scope = group_scope;
        self
    }

    pub fn only_completed(mut self) -> Self {
        self.only_completed = true;
        self
    }

    pub fn only_parent(mut self) -> Self {
        self.only_parent = true;
        self
    }

    pub fn with_children(mut self) -> Self {
        self.fetch_child = true;
        self
    }
}
