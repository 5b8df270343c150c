//! Typed error hierarchy for the job graph orchestrator.
//!
//! Lookups that miss surface as `*NotFound`, lifecycle violations as
//! `InvalidTransition`. A transition that loses a race is not an error at
//! all: it is reported through `TerminalOutcome::AlreadyTerminal` or an
//! empty claim.

use thiserror::Error;

use crate::jobs::JobStatus;

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Stage '{slug}' not found in pipeline")]
    StageNotFound { slug: String },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Session {id} is {status}, cannot submit stage '{stage}'")]
    StageNotSubmittable {
        id: String,
        status: String,
        stage: String,
    },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn job_not_found(id: &str) -> Self {
        Self::JobNotFound { id: id.to_string() }
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::SessionNotFound { id: id.to_string() }
    }

    pub fn stage_not_found(slug: &str) -> Self {
        Self::StageNotFound {
            slug: slug.to_string(),
        }
    }

    /// Whether this is a lookup miss rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound { .. } | Self::SessionNotFound { .. } | Self::StageNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_not_found_carries_id() {
        let err = OrchestratorError::job_not_found("abc");
        match &err {
            OrchestratorError::JobNotFound { id } => assert_eq!(id, "abc"),
            _ => panic!("Expected JobNotFound"),
        }
        assert!(err.to_string().contains("abc"));
        assert!(err.is_not_found());
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = OrchestratorError::InvalidTransition {
            id: "j1".into(),
            from: JobStatus::Pending,
            to: JobStatus::Completed,
        };
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("completed"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn sqlite_errors_convert() {
        let err: OrchestratorError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, OrchestratorError::Database(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::LockPoisoned);
        assert_std_error(&OrchestratorError::stage_not_found("thesis"));
    }
}
