use crate::model::{Pathway, RolloutStage};

/// Failure taxonomy shared by every migration component.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MigrationError {
    /// Malformed input, rejected before any write.
    #[error("invalid {field} `{value}`: {reason}")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("username `{0}` is already taken")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    /// Transient; nothing is assumed persisted.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Rollout command does not apply to the recorded stage. Zero side effects.
    #[error("`{command}` rejected in stage {stage}: {detail}")]
    InvalidTransition {
        stage: RolloutStage,
        command: &'static str,
        detail: String,
    },
    /// No definite answer from the endpoint: it may or may not have acted.
    #[error("{pathway} identity endpoint failed: {message}")]
    Upstream { pathway: Pathway, message: String },
    /// The endpoint answered and did not allocate.
    #[error("{pathway} identity endpoint refused: {message}")]
    Rejected { pathway: Pathway, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MigrationError {
    pub fn invalid_transition(stage: RolloutStage, command: &'static str) -> Self {
        MigrationError::InvalidTransition {
            stage,
            command,
            detail: "command does not apply to this stage".to_string(),
        }
    }

    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MigrationError::StorageUnavailable(_) | MigrationError::Upstream { .. }
        )
    }

    /// Stable machine-readable code for CLI and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::Validation { .. } => "validation",
            MigrationError::Conflict(_) => "conflict",
            MigrationError::NotFound(_) => "not_found",
            MigrationError::StorageUnavailable(_) => "storage_unavailable",
            MigrationError::InvalidTransition { .. } => "invalid_transition",
            MigrationError::Upstream { .. } => "upstream",
            MigrationError::Rejected { .. } => "rejected",
            MigrationError::Config(_) => "config",
        }
    }
}
