use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use runq_core::{Event, QueuedTask, Task, TaskId, TaskLog};
use runq_engine::{BridgeError, CreateTaskRequest, QueueError, Runtime, UpdateTaskRequest};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

const DEFAULT_LOG_LIMIT: usize = 500;
const MAX_LOG_LIMIT: usize = 5_000;

#[derive(Clone)]
pub struct AppState {
    rt: Arc<Runtime>,
}

pub fn router(rt: Arc<Runtime>) -> Router {
    let state = AppState { rt };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/{id}", get(get_task).patch(update_task))
        .route("/v1/tasks/{id}/retry", post(retry_task))
        .route("/v1/tasks/{id}/logs", get(task_logs))
        .route("/v1/queue", get(list_queue))
        .route("/v1/events/recent", get(recent_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_task(
    State(st): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = st.rt.bridge().create_task(req)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(State(st): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(st.rt.bridge().list_tasks()?))
}

async fn get_task(State(st): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    Ok(Json(st.rt.bridge().get_task(&TaskId::from_string(id))?))
}

async fn update_task(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(st.rt.bridge().update_task(&TaskId::from_string(id), req)?))
}

async fn retry_task(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = st.rt.bridge().retry_task(&TaskId::from_string(id))?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    after: i64,
    limit: Option<usize>,
}

async fn task_logs(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogQuery>,
) -> Result<Json<Vec<TaskLog>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    Ok(Json(st.rt.bridge().task_logs(&TaskId::from_string(id), q.after, limit)?))
}

async fn list_queue(State(st): State<AppState>) -> Result<Json<Vec<QueuedTask>>, ApiError> {
    Ok(Json(st.rt.queue().list()?))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    pattern: Option<String>,
    limit: Option<usize>,
}

async fn recent_events(State(st): State<AppState>, Query(q): Query<RecentQuery>) -> Json<Vec<Event>> {
    let pattern = q.pattern.as_deref().unwrap_or("*");
    Json(st.rt.bus().recent(pattern, q.limit.unwrap_or(100)))
}

/// Error response: a status code and a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let status = match &e {
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::NotRetryable { .. } => StatusCode::CONFLICT,
            BridgeError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::Queue(QueueError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            BridgeError::Queue(_) | BridgeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, error: e.into() }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        BridgeError::Queue(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.error, "request failed");
        } else {
            tracing::debug!(status = %self.status, error = %self.error, "request rejected");
        }
        let body = Json(serde_json::json!({
            "error": format!("{:#}", self.error)
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runq_core::TaskStatus;

    #[test]
    fn bridge_errors_map_to_client_statuses() {
        let cases = [
            (BridgeError::NotFound(TaskId::from_string("x")), StatusCode::NOT_FOUND),
            (
                BridgeError::NotRetryable { id: TaskId::from_string("x"), status: TaskStatus::Running },
                StatusCode::CONFLICT,
            ),
            (BridgeError::Invalid("empty title".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (BridgeError::Store(anyhow::anyhow!("disk full")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }
}
