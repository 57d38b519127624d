use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::driver::Orchestrator;
use crate::engine::pipeline::{ReworkOutcome, ReworkRequest};
use crate::engine::stages::{self, StageSpec};
use crate::engine::types::{Score, WorkflowState};
use crate::gates::{FsArtifactChecker, GateReport, GateSummary};
use crate::storage::canonical_key;

use super::AppState;
use super::errors::AppError;
use super::runs::{RunPhase, RunRecord};

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct InitRequest {
    pub project_name: String,
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub stage: String,
    pub score: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Serialize)]
pub struct AdvanceResponse {
    pub stage: String,
    pub score: Score,
    pub next: String,
}

#[derive(Deserialize)]
pub struct ContextRequest {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Deserialize)]
pub struct BlockerRequest {
    pub text: String,
}

#[derive(Deserialize)]
pub struct EvaluateRequest {
    pub score: i64,
}

#[derive(Deserialize, Default)]
pub struct StartRunRequest {
    /// Initialize the project with this name first; otherwise resume.
    #[serde(default)]
    pub project_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct SummaryResponse {
    pub project_name: String,
    pub current_agent: String,
    pub gates: Vec<GateSummary>,
    pub blockers: Vec<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /stages
pub async fn list_stages() -> Json<serde_json::Value> {
    let stages: &[StageSpec] = stages::PIPELINE;
    Json(serde_json::json!({
        "stages": stages,
        "total": stages.len(),
    }))
}

/// GET /gates
pub async fn list_gates(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gates: Vec<serde_json::Value> = state
        .evaluator
        .registry()
        .iter()
        .map(|(stage, gate)| {
            serde_json::json!({
                "stage": stage,
                "min_score": gate.min_score,
                "required_artifacts": gate.required_artifacts,
                "description": gate.description,
            })
        })
        .collect();

    Json(serde_json::json!({
        "gates": gates,
        "total": gates.len(),
    }))
}

/// GET /gates/:stage
pub async fn get_gate(
    State(state): State<Arc<AppState>>,
    Path(stage): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let gate = state.evaluator.requirements(&stage)?;

    Ok(Json(serde_json::json!({
        "stage": stage,
        "min_score": gate.min_score,
        "required_artifacts": gate.required_artifacts,
        "description": gate.description,
    })))
}

/// GET /projects/:project/state
pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Json<WorkflowState>, AppError> {
    Ok(Json(state.engine.get_state(&project).await?))
}

/// POST /projects/:project/init
pub async fn init_project(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(req): Json<InitRequest>,
) -> Result<Json<WorkflowState>, AppError> {
    if req.project_name.trim().is_empty() {
        return Err(AppError::BadRequest("'project_name' must not be empty".to_string()));
    }
    Ok(Json(state.engine.initialize(&project, &req.project_name).await?))
}

/// POST /projects/:project/advance
pub async fn advance(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> Result<Json<AdvanceResponse>, AppError> {
    let score = Score::new(req.score)?;
    let next = state
        .engine
        .advance(&project, &req.stage, score, req.notes.as_deref())
        .await?;

    Ok(Json(AdvanceResponse {
        stage: req.stage,
        score,
        next,
    }))
}

/// POST /projects/:project/rework
pub async fn rework(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(req): Json<ReworkRequest>,
) -> Result<Json<ReworkOutcome>, AppError> {
    Ok(Json(state.engine.request_rework(&project, &req).await?))
}

/// POST /projects/:project/context
pub async fn set_context(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .engine
        .set_context(&project, &req.key, req.value)
        .await?;

    Ok(Json(serde_json::json!({ "key": req.key })))
}

/// POST /projects/:project/blockers
pub async fn add_blocker(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(req): Json<BlockerRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.engine.add_blocker(&project, &req.text).await?;
    let blockers = state.engine.get_state(&project).await?.blockers;

    Ok(Json(serde_json::json!({
        "blockers": blockers,
        "total": blockers.len(),
    })))
}

/// GET /projects/:project/summary
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Json<SummaryResponse>, AppError> {
    let workflow = state.engine.get_state(&project).await?;
    let gates = state.evaluator.registry().summary(&workflow);

    Ok(Json(SummaryResponse {
        project_name: workflow.project_name,
        current_agent: workflow.current_agent,
        gates,
        blockers: workflow.blockers,
    }))
}

/// POST /projects/:project/gates/:stage/evaluate
///
/// Artifacts are checked relative to the project's workspace directory.
pub async fn evaluate_gate(
    State(state): State<Arc<AppState>>,
    Path((project, stage)): Path<(String, String)>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<GateReport>, AppError> {
    let score = Score::new(req.score)?;
    let artifacts = FsArtifactChecker::new(state.store.project_dir(&project)?);

    Ok(Json(state.evaluator.evaluate(&stage, score, &artifacts)))
}

/// POST /projects/:project/runs
///
/// Starts a driver run in the background and returns at once. The worker
/// comes from server configuration, never from the request.
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    body: Option<Json<StartRunRequest>>,
) -> Result<(StatusCode, Json<RunRecord>), AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    if req
        .project_name
        .as_deref()
        .is_some_and(|name| name.trim().is_empty())
    {
        return Err(AppError::BadRequest("'project_name' must not be empty".to_string()));
    }

    let key = canonical_key(&project)?;
    let factory = state.worker_factory.clone().ok_or_else(|| {
        AppError::BadRequest("No worker configured; set worker_cmd in the server config".to_string())
    })?;
    let project_dir = state.store.project_dir(&key)?;

    let record = state.runs.start(&key).await.map_err(|active| {
        AppError::Conflict(format!("Project '{}' already has a run in progress: {}", key, active))
    })?;

    let orchestrator = Orchestrator::new(
        state.engine.clone(),
        state.evaluator.clone(),
        factory(project_dir.as_path()),
        Arc::new(FsArtifactChecker::new(&project_dir)),
    )
    .with_options(state.driver_options.clone());

    info!(run_id = %record.run_id, project = %key, "Run started over HTTP");

    let run_id = record.run_id.clone();
    let shared = state.clone();
    tokio::spawn(async move {
        let result = orchestrator
            .run_with_id(run_id.clone(), &key, req.project_name.as_deref())
            .await;
        if let Err(ref e) = result {
            error!(run_id = %run_id, project = %key, error = %e, "Background run aborted");
        }
        shared.runs.finish(&run_id, result).await;
    });

    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// GET /runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status_filter = params
        .status
        .as_deref()
        .map(str::parse::<RunPhase>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let runs = state.runs.list(status_filter).await;

    Ok(Json(serde_json::json!({
        "total": runs.len(),
        "runs": runs,
    })))
}

/// GET /runs/:id
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, AppError> {
    state
        .runs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Run '{}' not found", id)))
}
