use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use uuid::Uuid;

use crate::engine::{
    error::EngineError,
    metrics::MetricsRegistry,
    models::{
        CreateSubmissionResponse, ProgressResponse, SubmissionRecord, SubmitRequest, Verdict,
    },
    queue::{QueuedJob, Scheduler},
    store::MemoryStore,
};

const MAX_CODE_BYTES: usize = 250_000;
const MAX_ID_BYTES: usize = 128;

#[derive(Clone)]
pub struct AppState {
    store: MemoryStore,
    scheduler: Scheduler,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(store: MemoryStore, scheduler: Scheduler, metrics_registry: Arc<MetricsRegistry>) -> Router {
    let state = AppState {
        store,
        scheduler,
        metrics: metrics_registry,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/submissions", post(submit))
        .route("/v1/submissions/{id}", get(get_submission))
        .route("/v1/submissions/{id}/progress", get(get_progress))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "submissions": state.store.len(),
        "queue_depth": state.metrics.queue_depth(),
    }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<CreateSubmissionResponse>), EngineError> {
    validate_request(&request)?;

    let id = Uuid::new_v4();
    let job = QueuedJob {
        submission_id: id,
        problem_id: request.problem_id.clone(),
        language: request.language,
        code: request.code.clone(),
    };
    state.store.insert(SubmissionRecord::pending(
        id,
        request.user_id,
        request.problem_id,
        request.code,
        request.language,
        request.visibility,
    ));

    if let Err(err) = state.scheduler.submit(job) {
        state.store.remove(&id);
        tracing::warn!(submission_id = %id, error = %err, "submission rejected at intake");
        return Err(err);
    }
    tracing::info!(submission_id = %id, "submission queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateSubmissionResponse {
            pending_id: id,
            status: Verdict::Pending,
        }),
    ))
}

async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionRecord>, EngineError> {
    state.store.get(&id).map(Json).ok_or(EngineError::NotFound)
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProgressResponse>, EngineError> {
    let record = state.store.get(&id).ok_or(EngineError::NotFound)?;
    Ok(Json(ProgressResponse {
        id: record.id,
        status: record.status,
        state: record.state,
        cases_done: record.cases_done,
        cases_total: record.cases_total,
    }))
}

fn validate_request(request: &SubmitRequest) -> Result<(), EngineError> {
    if request.code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code is empty".to_string()));
    }
    if request.code.len() > MAX_CODE_BYTES {
        return Err(EngineError::InvalidRequest("code too large".to_string()));
    }
    for (field, value) in [
        ("userId", &request.user_id),
        ("problemId", &request.problem_id),
    ] {
        if value.trim().is_empty() {
            return Err(EngineError::InvalidRequest(format!("{field} is required")));
        }
        if value.len() > MAX_ID_BYTES {
            return Err(EngineError::InvalidRequest(format!("{field} too long")));
        }
    }
    if !matches!(request.visibility.as_str(), "public" | "private") {
        return Err(EngineError::InvalidRequest(
            "visibility must be public or private".to_string(),
        ));
    }
    Ok(())
}
