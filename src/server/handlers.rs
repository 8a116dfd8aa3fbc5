//! Route handlers. Thin: decode, call the queue, encode.

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedTasks {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FetchChild {
    #[serde(default)]
    pub fetch_child: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchIndex {
    #[serde(default)]
    pub batch_index: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct Force {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScopeQuery {
    pub name: String,
    #[serde(default = "default_group_scope")]
    pub group_scope: i32,
}

fn default_group_scope() -> i32 {
    GROUP_SCOPE_MIN
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> Error {
    Error::Validation(format!("malformed multipart body: {e}"))
}

pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    state.queue.health().await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Multipart: a `task` part holding the JSON [`NewTask`], then any number
/// of `files` parts in slot order. Creates `count` tasks.
pub async fn create_task(
    State(state): State<AppState>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<Json<CreatedTasks>> {
    let mut task: Option<NewTask> = None;
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let part = field.name().map(str::to_string);
        match part.as_deref() {
            Some("task") => {
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                let parsed = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Validation(format!("invalid `task` part: {e}")))?;
                task = Some(parsed);
            }
            Some("files") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(bad_multipart)?;
                files.push(UploadFile::new(file_name, data.to_vec()));
            }
            _ => {}
        }
    }

    let mut task = task.ok_or_else(|| Error::Validation("missing `task` part".into()))?;
    task.input_files = files;
    let task_ids = state.queue.create_tasks(&caller, task).await?;
    Ok(Json(CreatedTasks { task_ids }))
}

pub async fn enqueue_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
    Json(prepared): Json<PreparedTask>,
) -> Result<StatusCode> {
    state.queue.enqueue_task(&caller, task_id, prepared).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 200 with the claimed task, or 204 when nothing is available.
pub async fn pull_next(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<PullRequest>,
) -> Result<Response> {
    Ok(match state.queue.pull_next(&caller, &request).await? {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn report_progress(
    State(state): State<AppState>,
    caller: Caller,
    Json(report): Json<ProgressReport>,
) -> Result<StatusCode> {
    state.queue.report_progress(&caller, &report).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Multipart: every part is a result file.
pub async fn submit_results(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
    mut multipart: Multipart,
) -> Result<Json<Task>> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field.bytes().await.map_err(bad_multipart)?;
        files.push(UploadFile::new(file_name, data.to_vec()));
    }
    let task = state.queue.submit_results(&caller, task_id, files).await?;
    Ok(Json(task))
}

pub async fn release_lock(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
) -> Result<StatusCode> {
    state.queue.release_lock(&caller, task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restart_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
    Query(query): Query<Force>,
) -> Result<StatusCode> {
    state.queue.restart_task(&caller, task_id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
    Json(update): Json<TaskUpdate>,
) -> Result<StatusCode> {
    state.queue.update_task(&caller, task_id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
    Query(query): Query<FetchChild>,
) -> Result<Json<Task>> {
    let task = state.queue.get_task(&caller, task_id, query.fetch_child).await?;
    Ok(Json(task))
}

/// A stored file as a download.
fn file_response(file: UploadFile) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", file.file_name);
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.data,
    )
        .into_response()
}

pub async fn get_result(
    State(state): State<AppState>,
    caller: Caller,
    Path((task_id, node_id)): Path<(TaskId, i64)>,
    Query(query): Query<BatchIndex>,
) -> Result<Response> {
    let file = state
        .queue
        .get_result(&caller, task_id, node_id, query.batch_index)
        .await?;
    Ok(file_response(file))
}

pub async fn get_input(
    State(state): State<AppState>,
    caller: Caller,
    Path((task_id, index)): Path<(TaskId, usize)>,
) -> Result<Response> {
    let file = state.queue.get_input(&caller, task_id, index).await?;
    Ok(file_response(file))
}

/// Tasks travel as a list ordered by id; the client rebuilds the map.
pub async fn list_tasks(
    State(state): State<AppState>,
    caller: Caller,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<Vec<Task>>> {
    let tasks = state.queue.list_tasks(&caller, &filter).await?;
    Ok(Json(tasks.into_values().collect()))
}

pub async fn delete_tasks(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<Vec<TaskId>>> {
    let deleted = state.queue.delete_tasks(&caller, &request.task_ids).await?;
    Ok(Json(deleted))
}

pub async fn clear_finished(
    State(state): State<AppState>,
    caller: Caller,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Vec<TaskId>>> {
    let deleted = state
        .queue
        .clear_finished(&caller, &scope.name, scope.group_scope)
        .await?;
    Ok(Json(deleted))
}

pub async fn dequeue_unfinished(
    State(state): State<AppState>,
    caller: Caller,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Vec<TaskId>>> {
    let removed = state
        .queue
        .dequeue_unfinished(&caller, &scope.name, scope.group_scope)
        .await?;
    Ok(Json(removed))
}

pub async fn dequeue_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<TaskId>,
) -> Result<StatusCode> {
    state.queue.dequeue_task(&caller, task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
