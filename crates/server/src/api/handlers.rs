use crate::api::{ApiResult, EngineApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use etl_workflow_core::engine::WorkflowRef;
use etl_workflow_core::monitor::Monitor;
use etl_workflow_core::storage::WorkflowRepository;
use etl_workflow_core::types::{
    ExecutionId, Step, TriggerType, WorkflowDefinition, WorkflowErrorHandling, WorkflowExecution,
    WorkflowId,
};
use serde::Deserialize;
use uuid::Uuid;

fn parse_execution_id(raw: &str) -> anyhow::Result<ExecutionId> {
    Ok(ExecutionId(Uuid::parse_str(raw)?))
}

fn invalid_execution_id(err: anyhow::Error) -> etl_workflow_core::engine::EngineError {
    etl_workflow_core::engine::EngineError::new(
        etl_workflow_core::types::ErrorKind::ConfigurationError,
        err.to_string(),
    )
}

// ---- workflow definitions ----------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WorkflowDefinitionRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub error_handling: WorkflowErrorHandling,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_take")]
    pub take: usize,
}

fn default_take() -> usize {
    50
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    Ok(Json(state.repository.list_workflows(query.skip, query.take).await?))
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<WorkflowDefinitionRequest>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let id = WorkflowId::new(slug(&req.name));
    let definition = next_version(&state, &id, req).await?;
    state.repository.save_workflow(definition.clone()).await?;
    Ok(Json(definition))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<WorkflowDefinition>>> {
    let id = WorkflowId::new(id);
    Ok(Json(state.repository.get_workflow(&id, None).await?))
}

pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WorkflowDefinitionRequest>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let id = WorkflowId::new(id);
    let definition = next_version(&state, &id, req).await?;
    state.repository.save_workflow(definition.clone()).await?;
    Ok(Json(definition))
}

pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = WorkflowId::new(id);
    state.repository.delete_workflow(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn get_workflow_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    let id = WorkflowId::new(id);
    Ok(Json(state.repository.get_workflow_versions(&id).await?))
}

/// Every create/update is a new version; nothing is ever mutated in place so
/// executions already running against an older version keep their behavior.
async fn next_version(
    state: &AppState,
    id: &WorkflowId,
    req: WorkflowDefinitionRequest,
) -> anyhow::Result<WorkflowDefinition> {
    let existing = state.repository.get_workflow_versions(id).await?;
    let version = existing.iter().map(|d| d.version).max().unwrap_or(0) + 1;
    let now = chrono::Utc::now();
    Ok(WorkflowDefinition {
        id: id.clone(),
        version,
        name: req.name,
        description: req.description,
        steps: req.steps,
        error_handling: req.error_handling,
        variables: req.variables,
        created_at: now,
        updated_at: now,
    })
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

// ---- metrics & history --------------------------------------------------

pub async fn get_workflow_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = WorkflowId::new(id);
    let metrics = state.monitor.get_workflow_metrics(&id).await?;
    let value = serde_json::to_value(metrics).map_err(anyhow::Error::from)?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn get_workflow_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> EngineApiResult<Json<Vec<WorkflowExecution>>> {
    let id = WorkflowId::new(id);
    Ok(Json(state.engine.get_execution_history(&id, query.limit).await?))
}

pub async fn get_workflow_execution_summaries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<etl_workflow_core::types::ExecutionSummary>>> {
    let id = WorkflowId::new(id);
    Ok(Json(state.repository.get_execution_summaries(&id, query.limit).await?))
}

pub async fn get_execution_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<etl_workflow_core::events::TimelineEvent>>> {
    let execution_id = parse_execution_id(&id)?;
    Ok(Json(state.monitor.get_timeline_events(execution_id, query.limit).await?))
}

// ---- lifecycle -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Api
}

pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> EngineApiResult<Json<WorkflowExecution>> {
    let workflow_id = WorkflowId::new(id);
    let workflow_ref = match req.version {
        Some(version) => WorkflowRef::Versioned(workflow_id, version),
        None => WorkflowRef::Latest(workflow_id),
    };
    let execution = state
        .engine
        .execute_workflow(workflow_ref, req.params, req.trigger_type)
        .await?;
    Ok(Json(execution))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineApiResult<Json<WorkflowExecution>> {
    let execution_id = parse_execution_id(&id).map_err(invalid_execution_id)?;
    Ok(Json(state.engine.get_execution_status(execution_id).await?))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineApiResult<Json<serde_json::Value>> {
    let execution_id = parse_execution_id(&id).map_err(invalid_execution_id)?;
    let accepted = state.engine.cancel_execution(execution_id).await?;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

pub async fn pause_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineApiResult<Json<serde_json::Value>> {
    let execution_id = parse_execution_id(&id).map_err(invalid_execution_id)?;
    let accepted = state.engine.pause_execution(execution_id).await?;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

pub async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineApiResult<Json<serde_json::Value>> {
    let execution_id = parse_execution_id(&id).map_err(invalid_execution_id)?;
    let accepted = state.engine.resume_execution(execution_id).await?;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}
