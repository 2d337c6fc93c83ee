//! Typed error hierarchy for the pipeline and integration engine.
//!
//! One enum covers every named error kind; each variant carries the
//! structured context the kind implies instead of a bare string, so callers
//! can match on it.

use thiserror::Error;

/// Errors raised anywhere in the pipeline/integration engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("branch {branch} already has an active pipeline (request {existing_request_id})")]
    Conflict {
        branch: String,
        existing_request_id: String,
    },

    #[error("circuit '{breaker}' is open")]
    CircuitOpen { breaker: &'static str },

    #[error("process '{command}' failed{}", exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    ProcessFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("agent reported failure: {message}")]
    AgentFailure { message: String },

    #[error("agent process exited unexpectedly without a result")]
    AgentCrash,

    #[error("merge conflicts in {files:?} could not be resolved")]
    MergeConflictUnresolved { files: Vec<String> },

    #[error("rebase of {branch} onto {new_base} failed: {reason}")]
    RebaseFailed {
        branch: String,
        new_base: String,
        reason: String,
    },

    #[error("persistence error at {path}: {source}")]
    PersistenceError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transient error: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether a caller should retry this error (DLQ / breaker probe logic).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_) | PipelineError::CircuitOpen { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_is_retryable() {
        let err = PipelineError::CircuitOpen { breaker: "agent" };
        assert!(err.is_retryable());
    }

    #[test]
    fn agent_crash_is_not_retryable() {
        let err = PipelineError::AgentCrash;
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_found_carries_what_and_id() {
        let err = PipelineError::NotFound {
            what: "pending_merge entry",
            id: "feature/login".to_string(),
        };
        match &err {
            PipelineError::NotFound { what, id } => {
                assert_eq!(*what, "pending_merge entry");
                assert_eq!(id, "feature/login");
            }
            _ => panic!("expected NotFound"),
        }
        assert!(err.to_string().contains("feature/login"));
    }

    #[test]
    fn conflict_message_contains_both_ids() {
        let err = PipelineError::Conflict {
            branch: "feature/x".to_string(),
            existing_request_id: "r1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("feature/x"));
        assert!(msg.contains("r1"));
    }

    #[test]
    fn process_failure_formats_exit_code_when_present() {
        let err = PipelineError::ProcessFailure {
            command: "git push".to_string(),
            exit_code: Some(1),
            stderr: "rejected".to_string(),
        };
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn process_failure_omits_exit_code_when_absent() {
        let err = PipelineError::ProcessFailure {
            command: "git push".to_string(),
            exit_code: None,
            stderr: "".to_string(),
        };
        assert!(!err.to_string().contains("exit code"));
    }
}
