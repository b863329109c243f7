//! REST endpoints for job lifecycle and engine-wide stats (spec §6).

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::{ApiResult, IntoApiErrorOption};
use crate::api::AppState;
use crate::domain::{ChatRef, FilterPolicy, Job, JobId, RateParams};
use crate::supervisor::Stats;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/start", post(start_job))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/stats", get(stats))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_ref: ChatRef,
    pub target_ref: ChatRef,
    pub account_ids: Vec<String>,
    #[serde(default)]
    pub filter_policy: FilterPolicy,
    #[serde(default)]
    pub rate_params: Option<RateParams>,
    #[serde(default)]
    pub reset_progress: bool,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default)]
    pub schedule_cron: Option<String>,
    #[serde(default)]
    pub auto_restart: bool,
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Json<Job>> {
    let mut job = Job::new(
        Uuid::new_v4().to_string(),
        req.name,
        req.source_ref,
        req.target_ref,
        req.account_ids,
        req.filter_policy,
        req.rate_params.unwrap_or_default(),
    );
    job.description = req.description;
    job.reset_progress = req.reset_progress;
    job.schedule_enabled = req.schedule_enabled;
    job.schedule_cron = req.schedule_cron;
    job.auto_restart = req.auto_restart;

    let job = state.engine.supervisor.create_job(job).await?;
    Ok(Json(job))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.engine.supervisor.list_jobs().await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<Json<Job>> {
    let job = state
        .engine
        .supervisor
        .get_job(&id)
        .await?
        .ok_or_not_found(&format!("job not found: {id}"))?;
    Ok(Json(job))
}

async fn start_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<()> {
    state.engine.supervisor.start(&id).await?;
    Ok(())
}

async fn stop_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<()> {
    state.engine.supervisor.stop(&id).await?;
    Ok(())
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<()> {
    state.engine.supervisor.delete(&id).await?;
    Ok(())
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<Stats>> {
    Ok(Json(state.engine.supervisor.stats().await?))
}
