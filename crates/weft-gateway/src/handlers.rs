use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;
use weft_core::WeftError;
use weft_orchestrator::{LockRequest, NewTask, TaskStatus, WorkflowDefinition};

type ApiResult<T> = Result<T, ApiError>;

/// Decode a body ourselves so malformed payloads surface as `kind: "json"`.
fn decode<T: serde::de::DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::Weft(WeftError::Json(e)))
}

fn parse_uuid(raw: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::Weft(WeftError::NotFound(format!("{what} {raw}"))))
}

pub async fn health_handler() -> impl IntoResponse {
    json!({"status": "ok", "service": "weft"}).to_string()
}

// --- workflows ---

#[derive(Deserialize)]
struct SubmitWorkflow {
    #[serde(flatten)]
    definition: WorkflowDefinition,
    #[serde(default)]
    input: Value,
}

pub async fn submit_workflow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let request: SubmitWorkflow = decode(body)?;
    let run_id = state
        .orchestrator
        .submit(request.definition, request.input)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id, "status": "queued" })),
    ))
}

pub async fn list_workflows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.list_runs().await)
}

pub async fn workflow_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run_id = parse_uuid(&id, "run")?;
    Ok(Json(state.orchestrator.status(run_id).await?))
}

pub async fn workflow_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run_id = parse_uuid(&id, "run")?;
    Ok(Json(state.orchestrator.audit_log(run_id).await?))
}

pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run_id = parse_uuid(&id, "run")?;
    let status = state.orchestrator.cancel(run_id).await?;
    Ok(Json(json!({ "run_id": run_id, "status": status })))
}

// --- task board ---

#[derive(Deserialize)]
struct AgentBody {
    agent_id: String,
}

#[derive(Deserialize)]
struct ReviewBody {
    agent_id: String,
    #[serde(default)]
    output: Value,
}

#[derive(Deserialize)]
struct CompleteBody {
    agent_id: String,
    #[serde(default)]
    output: Option<Value>,
}

#[derive(Deserialize)]
struct FailBody {
    agent_id: String,
    error: String,
}

#[derive(Deserialize)]
struct StatusBody {
    status: TaskStatus,
}

#[derive(Deserialize)]
struct ClaimNextBody {
    agent_id: String,
    #[serde(default)]
    capabilities: BTreeSet<String>,
}

/// Push board assignments into the registry so dispatch sees the load.
async fn sync_agent_load(state: &AppState) {
    let assignments = state.board.assignments().await;
    for agent in state.registry.list().await {
        let load = assignments.get(&agent.id).copied().unwrap_or(0);
        state.registry.set_load(&agent.id, load).await;
    }
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let request: NewTask = decode(body)?;
    let task = state.board.create(request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    Ok(Json(state.board.get(task_uuid).await?))
}

pub async fn list_team_tasks(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let team_uuid = parse_uuid(&team, "team")?;
    Ok(Json(state.board.list_team(team_uuid).await))
}

pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    let request: AgentBody = decode(body)?;
    let task = state.board.claim(task_uuid, &request.agent_id).await?;
    sync_agent_load(&state).await;
    Ok(Json(task))
}

/// `POST /teams/{team}/claim`: hand the oldest matching `todo` task to an agent.
pub async fn claim_next_task(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let team_uuid = parse_uuid(&team, "team")?;
    let request: ClaimNextBody = decode(body)?;
    let claimed = state
        .board
        .claim_next(team_uuid, &request.agent_id, &request.capabilities)
        .await?;
    sync_agent_load(&state).await;
    Ok(Json(json!({ "task": claimed })))
}

pub async fn review_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    let request: ReviewBody = decode(body)?;
    Ok(Json(
        state
            .board
            .submit_for_review(task_uuid, &request.agent_id, request.output)
            .await?,
    ))
}

pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    let request: CompleteBody = decode(body)?;
    let task = state
        .board
        .complete(task_uuid, &request.agent_id, request.output)
        .await?;
    sync_agent_load(&state).await;
    Ok(Json(task))
}

pub async fn fail_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    let request: FailBody = decode(body)?;
    let task = state
        .board
        .fail(task_uuid, &request.agent_id, &request.error)
        .await?;
    sync_agent_load(&state).await;
    Ok(Json(task))
}

pub async fn update_task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    let request: StatusBody = decode(body)?;
    let task = state.board.update_status(task_uuid, request.status).await?;
    sync_agent_load(&state).await;
    Ok(Json(task))
}

pub async fn task_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task_uuid = parse_uuid(&id, "task")?;
    Ok(Json(state.board.task_context(task_uuid).await?))
}

// --- locks ---

#[derive(Deserialize)]
struct ReleaseBody {
    owner_agent_id: String,
}

#[derive(Deserialize)]
struct ConflictBody {
    content_hash: String,
}

pub async fn acquire_lock(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let request: LockRequest = decode(body)?;
    let lock = state.locks.acquire(request)?;
    Ok((StatusCode::CREATED, Json(lock)))
}

pub async fn get_lock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let lock_uuid = parse_uuid(&id, "lock")?;
    state
        .locks
        .get(lock_uuid)
        .map(Json)
        .ok_or_else(|| ApiError::Weft(WeftError::NotFound(format!("lock {lock_uuid}"))))
}

pub async fn release_lock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let lock_uuid = parse_uuid(&id, "lock")?;
    let request: ReleaseBody = decode(body)?;
    Ok(Json(state.locks.release(lock_uuid, &request.owner_agent_id)?))
}

pub async fn detect_conflict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let lock_uuid = parse_uuid(&id, "lock")?;
    let request: ConflictBody = decode(body)?;
    let conflict = state
        .locks
        .detect_conflict(lock_uuid, &request.content_hash)?;
    Ok(Json(json!({ "lock_uuid": lock_uuid, "conflict": conflict })))
}

// --- agents ---

pub async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.orchestrator.monitor().snapshot().await;
    let agents: Vec<Value> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|agent| {
            let agent_stats = stats.get(&agent.id).cloned().unwrap_or_default();
            json!({ "agent": agent, "stats": agent_stats })
        })
        .collect();
    Json(agents)
}
