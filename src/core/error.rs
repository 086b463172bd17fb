//! Failure classes for a single unit of work.

use std::time::Duration;

use thiserror::Error;

use crate::adapters::CollaboratorError;
use crate::store::StoreError;

/// Why a stage (or plan) attempt on one unit failed.
///
/// Workers never propagate these across units: each one is logged, the
/// claim is released and the run moves on.
#[derive(Debug, Error)]
pub enum StageError {
    /// Generator output had the wrong shape
    #[error("validation failed: {0}")]
    Validation(String),

    /// Service unavailable; retried on a later pass
    #[error("collaborator unavailable: {0}")]
    TransientCollaborator(String),

    /// Collaborator rejected the request outright
    #[error("collaborator rejected request: {0}")]
    PermanentCollaborator(String),

    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),

    /// A required input is missing; needs an operator
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(StoreError),
}

impl StageError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalConfig(msg.into())
    }

    /// Short label for logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "validation",
            StageError::TransientCollaborator(_) => "transient",
            StageError::PermanentCollaborator(_) => "permanent",
            StageError::Timeout(_) => "timeout",
            StageError::FatalConfig(_) => "fatal_config",
            StageError::ConstraintViolation(_) => "constraint",
            StageError::Io(_) => "io",
            StageError::Store(_) => "store",
        }
    }

    /// Whether an operator has to act before the unit can progress
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            StageError::FatalConfig(_) | StageError::ConstraintViolation(_)
        )
    }
}

impl From<CollaboratorError> for StageError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Transient(msg) => StageError::TransientCollaborator(msg),
            CollaboratorError::Permanent(msg) => StageError::PermanentCollaborator(msg),
            CollaboratorError::Validation(msg) => StageError::Validation(msg),
            CollaboratorError::Timeout(after) => StageError::Timeout(after),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation(msg) => StageError::ConstraintViolation(msg),
            other => StageError::Store(other),
        }
    }
}
