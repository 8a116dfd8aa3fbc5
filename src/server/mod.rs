//! HTTP surface over a [`TaskQueue`], used by remote workers and producers.
//!
//! Every route maps one-to-one onto a queue operation. Errors travel as
//! `{ "code": ..., "error": ... }` with a matching status, which
//! [`RemoteQueue`](crate::queue::RemoteQueue) turns back into the same
//! [`Error`] variant on the other side.

mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::secrets::token_matches;
use crate::error::{Error, Result};
use crate::model::Caller;
use crate::queue::TaskQueue;

/// Header carrying the caller's user id.
pub const USER_HEADER: &str = "x-genq-user";
/// Header carrying the caller's admin flag (`true` / `1`).
pub const ADMIN_HEADER: &str = "x-genq-admin";

/// Upper bound on request bodies; result uploads carry whole videos.
const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn TaskQueue>,
    pub auth_token: Option<Arc<SecretString>>,
}

/// Build the router.
pub fn router(queue: Arc<dyn TaskQueue>, auth_token: Option<SecretString>) -> Router {
    let state = AppState {
        queue,
        auth_token: auth_token.map(Arc::new),
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/next", post(handlers::pull_next))
        .route("/tasks/progress", put(handlers::report_progress))
        .route("/tasks/delete", post(handlers::delete_tasks))
        .route("/tasks/finished", delete(handlers::clear_finished))
        .route("/tasks/queue", delete(handlers::dequeue_unfinished))
        .route("/tasks/queue/{id}", delete(handlers::dequeue_task))
        .route(
            "/tasks/{id}",
            get(handlers::get_task).patch(handlers::update_task),
        )
        .route("/tasks/{id}/queue", put(handlers::enqueue_task))
        .route("/tasks/{id}/results", put(handlers::submit_results))
        .route("/tasks/{id}/results/{node_id}", get(handlers::get_result))
        .route("/tasks/{id}/inputs/{index}", get(handlers::get_input))
        .route("/tasks/{id}/lock", delete(handlers::release_lock))
        .route("/tasks/{id}/restart", post(handlers::restart_task))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "genq server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            other => {
                tracing::error!(error = %other, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "code": self.code(),
            "error": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        if let Some(expected) = &state.auth_token {
            let presented = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;
            if !token_matches(expected, presented) {
                return Err(Error::Unauthorized("invalid bearer token".into()));
            }
        }

        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized(format!("missing {USER_HEADER} header")))?;
        let is_admin = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");

        Ok(Caller {
            user_id: user_id.to_string(),
            is_admin,
        })
    }
}
