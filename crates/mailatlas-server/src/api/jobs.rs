use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use mailatlas_core::{AccountRepository, JobKind, JobPayload, JobStatus, SupervisorError};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::AppState;

pub fn pipeline_router() -> Router<AppState> {
    Router::new().route("/", post(start_pipeline))
}

pub fn jobs_router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(job_status))
        .route("/{id}/stop", post(stop_job))
        .route("/{id}/resume", post(resume_job))
}

#[derive(Debug, Deserialize)]
struct StartPipelineRequest {
    account_email: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct StartPipelineResponse {
    job_id: String,
    account_id: String,
}

async fn start_pipeline(
    State(state): State<AppState>,
    Json(request): Json<StartPipelineRequest>,
) -> Result<Json<StartPipelineResponse>, (StatusCode, String)> {
    let account = AccountRepository::new(state.db.clone())
        .upsert(&request.account_email, None)
        .await
        .map_err(|err| {
            error!(error = %err, "account upsert failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;

    let job = state
        .supervisor
        .submit(
            JobKind::Pipeline,
            JobPayload {
                account_id: account.id.clone(),
                force: request.force,
                resume_from: None,
            },
        )
        .await
        .map_err(map_supervisor_error)?;

    Ok(Json(StartPipelineResponse {
        job_id: job.id,
        account_id: account.id,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, (StatusCode, String)> {
    let status = state
        .supervisor
        .status(&id)
        .await
        .map_err(map_supervisor_error)?;
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopping: bool,
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, (StatusCode, String)> {
    let stopping = state
        .supervisor
        .stop(&id)
        .await
        .map_err(map_supervisor_error)?;
    Ok(Json(StopResponse { stopping }))
}

#[derive(Debug, Serialize)]
struct ResumeResponse {
    job_id: String,
}

async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResumeResponse>, (StatusCode, String)> {
    let job = state
        .supervisor
        .resume(&id)
        .await
        .map_err(map_supervisor_error)?;
    Ok(Json(ResumeResponse { job_id: job.id }))
}

fn map_supervisor_error(err: SupervisorError) -> (StatusCode, String) {
    match &err {
        SupervisorError::JobNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SupervisorError::NotResumable(_) => (StatusCode::CONFLICT, err.to_string()),
        _ => {
            error!(error = %err, "supervisor error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
