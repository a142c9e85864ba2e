use crate::handlers::{
    acquire_lock, cancel_workflow, claim_next_task, claim_task, complete_task, create_task,
    detect_conflict, fail_task, get_lock, get_task, health_handler, list_agents, list_team_tasks,
    list_workflows, release_lock, review_task, submit_workflow, task_context, update_task_status,
    workflow_audit, workflow_status,
};
use crate::middleware::{auth_middleware, AuthConfig};
use crate::stream::ws_handler;
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use weft_orchestrator::{EventBus, InMemoryRegistry, LockManager, Orchestrator, TaskBoard};

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub board: Arc<TaskBoard>,
    pub locks: Arc<LockManager>,
    pub registry: Arc<InMemoryRegistry>,
    pub events: Arc<EventBus>,
}

/// The HTTP/WebSocket front of the orchestrator.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router. `/health` is always reachable; every other route
    /// sits behind [`auth_middleware`] when `auth` carries keys.
    pub fn build(state: Arc<AppState>, auth: AuthConfig) -> Router {
        let api = Router::new()
            .route("/workflows", post(submit_workflow).get(list_workflows))
            .route("/workflows/{id}", get(workflow_status))
            .route("/workflows/{id}/audit", get(workflow_audit))
            .route("/workflows/{id}/cancel", post(cancel_workflow))
            .route("/tasks", post(create_task))
            .route("/tasks/{id}", get(get_task))
            .route("/tasks/{id}/claim", post(claim_task))
            .route("/tasks/{id}/review", post(review_task))
            .route("/tasks/{id}/complete", post(complete_task))
            .route("/tasks/{id}/fail", post(fail_task))
            .route("/tasks/{id}/status", axum::routing::patch(update_task_status))
            .route("/tasks/{id}/context", get(task_context))
            .route("/teams/{team}/tasks", get(list_team_tasks))
            .route("/teams/{team}/claim", post(claim_next_task))
            .route("/locks", post(acquire_lock))
            .route("/locks/{id}", get(get_lock))
            .route("/locks/{id}/release", post(release_lock))
            .route("/locks/{id}/conflict", post(detect_conflict))
            .route("/agents", get(list_agents))
            .route("/ws/{channel}", get(ws_handler))
            .with_state(state);

        let api = if auth.is_enabled() {
            api.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            api
        };

        Router::new()
            .route("/health", get(health_handler))
            .merge(api)
    }
}
