use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use weft_core::WeftError;
use weft_orchestrator::LockError;

/// Error returned by every API handler.
#[derive(Debug)]
pub enum ApiError {
    Weft(WeftError),
    /// Kept apart so a conflict can report who holds the resource.
    Lock(LockError),
}

impl From<WeftError> for ApiError {
    fn from(err: WeftError) -> Self {
        ApiError::Weft(err)
    }
}

impl From<LockError> for ApiError {
    fn from(err: LockError) -> Self {
        ApiError::Lock(err)
    }
}

/// HTTP status for a [`WeftError`].
pub fn status_for(err: &WeftError) -> StatusCode {
    match err {
        WeftError::Validation(_) | WeftError::Resolution(_) | WeftError::Budget(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        WeftError::Config(_) | WeftError::Json(_) => StatusCode::BAD_REQUEST,
        WeftError::NotFound(_) => StatusCode::NOT_FOUND,
        WeftError::Conflict(_) => StatusCode::CONFLICT,
        WeftError::Forbidden(_) => StatusCode::FORBIDDEN,
        WeftError::Dispatch(_)
        | WeftError::Http(_)
        | WeftError::Orchestrator(_)
        | WeftError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Lock(LockError::Conflict {
                resource_type,
                resource_id,
                holder,
                lock_uuid,
                expires_at,
            }) => {
                let body = serde_json::json!({
                    "error": format!("{resource_type}/{resource_id} is locked by {holder}"),
                    "kind": "conflict",
                    "holder": holder,
                    "lock_uuid": lock_uuid,
                    "expires_at": expires_at,
                });
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
            ApiError::Lock(other) => ApiError::Weft(other.into()).into_response(),
            ApiError::Weft(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "Request failed");
                }
                let body = serde_json::json!({ "error": err.to_string(), "kind": err.kind() });
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&WeftError::Validation("cycle".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&WeftError::NotFound("run".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&WeftError::Conflict("busy".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&WeftError::Forbidden("no".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&WeftError::Config("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&WeftError::Orchestrator("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_lock_conflict_response() {
        let err = ApiError::Lock(LockError::Conflict {
            resource_type: "file".into(),
            resource_id: "src/main.rs".into(),
            holder: "agent-a".into(),
            lock_uuid: uuid::Uuid::nil(),
            expires_at: chrono::Utc::now(),
        });
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
