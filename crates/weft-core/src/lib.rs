//! Core error definitions for the Weft orchestration engine.
//!
//! Every Weft crate reports failures through [`WeftError`], so the gateway and
//! CLI can map them to a single taxonomy.
//!
//! # Main types
//!
//! - [`WeftError`] — Unified error enum for all Weft subsystems.
//! - [`WeftResult`] — Convenience alias for `Result<T, WeftError>`.

/// Top-level error type for the Weft workspace.
///
/// Each variant corresponds to one class of failure in the error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    /// Invalid configuration, e.g. a malformed config file.
    #[error("Config error: {0}")]
    Config(String),

    /// A submitted definition was rejected (cycle, unknown dependency, duplicate id).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A template could not be resolved against the recorded outputs.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// A dispatch to a remote agent failed terminally.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A resource is held by someone else or a state guard rejected an update.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller is not allowed to perform the operation on this record.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A run, task, lock or agent does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The budget collaborator refused the work.
    #[error("Budget error: {0}")]
    Budget(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error from the orchestration engine itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WeftError {
    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            WeftError::Config(_) => "config",
            WeftError::Validation(_) => "validation",
            WeftError::Resolution(_) => "resolution",
            WeftError::Dispatch(_) => "dispatch",
            WeftError::Conflict(_) => "conflict",
            WeftError::Forbidden(_) => "forbidden",
            WeftError::NotFound(_) => "not_found",
            WeftError::Budget(_) => "budget",
            WeftError::Http(_) => "http",
            WeftError::Orchestrator(_) => "orchestrator",
            WeftError::Json(_) => "json",
            WeftError::Io(_) => "io",
        }
    }

    /// Configuration-class errors are rejected synchronously and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WeftError::Config(_) | WeftError::Validation(_) | WeftError::Resolution(_)
        )
    }
}

/// A convenience `Result` alias using [`WeftError`].
pub type WeftResult<T> = Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WeftError::Validation("cycle detected".to_string());
        assert_eq!(err.to_string(), "Validation error: cycle detected");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_configuration_class() {
        assert!(WeftError::Resolution("x".into()).is_configuration());
        assert!(WeftError::Validation("x".into()).is_configuration());
        assert!(!WeftError::Dispatch("x".into()).is_configuration());
        assert!(!WeftError::Conflict("x".into()).is_configuration());
    }

    #[test]
    fn test_json_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: WeftError = parse.unwrap_err().into();
        assert_eq!(err.kind(), "json");
    }
}
