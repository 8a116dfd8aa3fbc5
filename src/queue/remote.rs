//! Queue over HTTP, for worker processes that hold no store.
//!
//! Every call is one request against [`crate::server::router`]. Error
//! bodies are decoded back into the `Error` variant the server produced.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::TaskQueue;
use crate::error::{Error, Result};
use crate::model::*;
use crate::server::{ADMIN_HEADER, USER_HEADER};

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    error: String,
}

#[derive(Deserialize)]
struct CreatedTasks {
    task_ids: Vec<TaskId>,
}

pub struct RemoteQueue {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<SecretString>,
}

impl RemoteQueue {
    pub fn new(base_url: &str, auth_token: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str, caller: &Caller) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header(USER_HEADER, &caller.user_id)
            .header(ADMIN_HEADER, if caller.is_admin { "true" } else { "false" });
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        builder
    }

    /// Send and turn any non-success status into the matching `Error`.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(decoded) => Error::from_code(&decoded.code, decoded.error, status.as_u16()),
            // Rejected before reaching a handler (malformed request).
            Err(_) if status.is_client_error() => Error::Validation(body),
            Err(_) => Error::Remote {
                status: status.as_u16(),
                message: body,
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        Ok(self.send(builder).await?.json().await?)
    }
}

fn scope_query(name: &str, group_scope: i32) -> [(&'static str, String); 2] {
    [("name", name.to_string()), ("group_scope", group_scope.to_string())]
}

fn file_part(file: &UploadFile) -> Part {
    Part::bytes(file.data.clone()).file_name(file.file_name.clone())
}

/// `filename="..."` out of a `Content-Disposition` header.
fn attachment_name(response: &reqwest::Response) -> Option<String> {
    let value = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let (_, rest) = value.split_once("filename=")?;
    Some(rest.trim().trim_matches('"').to_string())
}

impl RemoteQueue {
    async fn download(&self, caller: &Caller, path: &str, query: &[(&str, String)]) -> Result<UploadFile> {
        let response = self
            .send(self.request(reqwest::Method::GET, path, caller).query(query))
            .await?;
        let file_name = attachment_name(&response)
            .ok_or_else(|| Error::Other(format!("{path}: response carries no file name")))?;
        let data = response.bytes().await?;
        Ok(UploadFile::new(file_name, data.to_vec()))
    }

    async fn post_task(&self, caller: &Caller, task: &NewTask) -> Result<Vec<TaskId>> {
        let mut form = Form::new().part(
            "task",
            Part::bytes(serde_json::to_vec(task)?).mime_str("application/json")?,
        );
        for file in &task.input_files {
            form = form.part("files", file_part(file));
        }
        let created: CreatedTasks = self
            .send_json(self.request(reqwest::Method::POST, "/tasks", caller).multipart(form))
            .await?;
        Ok(created.task_ids)
    }
}

#[async_trait]
impl TaskQueue for RemoteQueue {
    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Remote {
                status: response.status().as_u16(),
                message: "health check failed".into(),
            });
        }
        Ok(())
    }

    async fn create_task(&self, caller: &Caller, mut task: NewTask) -> Result<TaskId> {
        task.count = 1;
        self.post_task(caller, &task)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Other("server created no task".into()))
    }

    async fn create_tasks(&self, caller: &Caller, task: NewTask) -> Result<Vec<TaskId>> {
        self.post_task(caller, &task).await
    }

    async fn enqueue_task(&self, caller: &Caller, task_id: TaskId, prepared: PreparedTask) -> Result<()> {
        let path = format!("/tasks/{task_id}/queue");
        self.send(self.request(reqwest::Method::PUT, &path, caller).json(&prepared))
            .await?;
        Ok(())
    }

    async fn pull_next(&self, caller: &Caller, request: &PullRequest) -> Result<Option<Task>> {
        let response = self
            .send(self.request(reqwest::Method::POST, "/tasks/next", caller).json(request))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn report_progress(&self, caller: &Caller, report: &ProgressReport) -> Result<()> {
        self.send(self.request(reqwest::Method::PUT, "/tasks/progress", caller).json(report))
            .await?;
        Ok(())
    }

    async fn submit_results(&self, caller: &Caller, task_id: TaskId, files: Vec<UploadFile>) -> Result<Task> {
        let form = files
            .iter()
            .fold(Form::new(), |form, file| form.part("files", file_part(file)));
        let path = format!("/tasks/{task_id}/results");
        self.send_json(self.request(reqwest::Method::PUT, &path, caller).multipart(form))
            .await
    }

    async fn release_lock(&self, caller: &Caller, task_id: TaskId) -> Result<()> {
        let path = format!("/tasks/{task_id}/lock");
        self.send(self.request(reqwest::Method::DELETE, &path, caller))
            .await?;
        Ok(())
    }

    async fn restart_task(&self, caller: &Caller, task_id: TaskId, force: bool) -> Result<()> {
        let path = format!("/tasks/{task_id}/restart");
        self.send(
            self.request(reqwest::Method::POST, &path, caller)
                .query(&[("force", force)]),
        )
        .await?;
        Ok(())
    }

    async fn update_task(&self, caller: &Caller, task_id: TaskId, update: &TaskUpdate) -> Result<()> {
        let path = format!("/tasks/{task_id}");
        self.send(self.request(reqwest::Method::PATCH, &path, caller).json(update))
            .await?;
        Ok(())
    }

    async fn get_task(&self, caller: &Caller, task_id: TaskId, fetch_child: bool) -> Result<Task> {
        let path = format!("/tasks/{task_id}");
        self.send_json(
            self.request(reqwest::Method::GET, &path, caller)
                .query(&[("fetch_child", fetch_child)]),
        )
        .await
    }

    async fn get_result(&self, caller: &Caller, task_id: TaskId, node_id: i64, batch_index: usize) -> Result<UploadFile> {
        let path = format!("/tasks/{task_id}/results/{node_id}");
        self.download(caller, &path, &[("batch_index", batch_index.to_string())])
            .await
    }

    async fn get_input(&self, caller: &Caller, task_id: TaskId, index: usize) -> Result<UploadFile> {
        let path = format!("/tasks/{task_id}/inputs/{index}");
        self.download(caller, &path, &[]).await
    }

    async fn list_tasks(&self, caller: &Caller, filter: &TaskFilter) -> Result<BTreeMap<TaskId, Task>> {
        let tasks: Vec<Task> = self
            .send_json(self.request(reqwest::Method::GET, "/tasks", caller).query(filter))
            .await?;
        Ok(tasks.into_iter().map(|t| (t.task_id, t)).collect())
    }

    async fn delete_tasks(&self, caller: &Caller, task_ids: &[TaskId]) -> Result<Vec<TaskId>> {
        self.send_json(
            self.request(reqwest::Method::POST, "/tasks/delete", caller)
                .json(&json!({ "task_ids": task_ids })),
        )
        .await
    }

    async fn clear_finished(&self, caller: &Caller, name: &str, group_scope: i32) -> Result<Vec<TaskId>> {
        self.send_json(
            self.request(reqwest::Method::DELETE, "/tasks/finished", caller)
                .query(&scope_query(name, group_scope)),
        )
        .await
    }

    async fn dequeue_unfinished(&self, caller: &Caller, name: &str, group_scope: i32) -> Result<Vec<TaskId>> {
        self.send_json(
            self.request(reqwest::Method::DELETE, "/tasks/queue", caller)
                .query(&scope_query(name, group_scope)),
        )
        .await
    }

    async fn dequeue_task(&self, caller: &Caller, task_id: TaskId) -> Result<()> {
        let path = format!("/tasks/queue/{task_id}");
        self.send(self.request(reqwest::Method::DELETE, &path, caller))
            .await?;
        Ok(())
    }
}
