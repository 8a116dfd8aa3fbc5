//! Best-effort webhook delivery of task progress.
//!
//! Each accepted progress report carrying a webhook target triggers exactly
//! one POST to `{webhook_url}/task-progress`. Delivery runs on its own task
//! with a short timeout; failures are logged and counted, never returned.

use std::collections::BTreeMap;
use std::time::Duration;

use opentelemetry::KeyValue;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::model::{Task, TaskId};
use crate::telemetry::metrics;

/// Default bound on a single delivery attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Body of a progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub progress: f64,
    pub execution_time: f64,
    pub error: String,
}

/// Where to deliver a task's notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookTarget {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl WebhookTarget {
    /// The task's registered target, if it has one.
    pub fn of(task: &Task) -> Option<Self> {
        let url = task.webhook_url.as_deref().filter(|u| !u.is_empty())?;
        Some(Self {
            url: url.to_string(),
            headers: task.webhook_headers.clone().unwrap_or_default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/task-progress", self.url.trim_end_matches('/'))
    }
}

/// Error type for a single delivery attempt. Only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned HTTP {0}")]
    HttpStatus(u16),
}

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Fire and forget. The handle is only useful to tests that want to
    /// wait for delivery.
    pub fn notify(&self, target: WebhookTarget, event: ProgressEvent) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let task_id = event.task_id;
            match notifier.deliver(&target, &event).await {
                Ok(()) => {
                    tracing::debug!(task_id = %task_id, url = %target.url, "webhook delivered");
                    metrics::webhook_deliveries().add(1, &[KeyValue::new("result", "ok")]);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, url = %target.url, error = %e, "webhook delivery failed");
                    metrics::webhook_deliveries().add(1, &[KeyValue::new("result", "error")]);
                }
            }
        })
    }

    async fn deliver(&self, target: &WebhookTarget, event: &ProgressEvent) -> std::result::Result<(), DeliveryError> {
        let response = self
            .client
            .post(target.endpoint())
            .headers(header_map(&target.headers))
            .json(event)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Caller-supplied headers; entries that are not valid HTTP are skipped.
fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid webhook header"),
        }
    }
    map
}
