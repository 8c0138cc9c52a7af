use convoy::protocol::{ErrorCode, GateDecision, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("rejecting a task requires a non-empty reason")]
    MissingReason,

    #[error("acceptance blocked ({decision}): {message}")]
    FrictionBlocked {
        decision: GateDecision,
        message: String,
    },

    #[error("{0}")]
    DepthExceeded(String),

    #[error("no blocked delegation pending on task {0}")]
    NoPendingDelegation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("circuit open for {0}: too many consecutive rejections")]
    CircuitOpen(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl FleetError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            FleetError::TaskNotFound(_)
            | FleetError::UnknownAccount(_)
            | FleetError::NoPendingDelegation(_) => (ErrorCode::NotFound, self.to_string()),
            FleetError::InvalidTransition { .. } => {
                (ErrorCode::InvalidTransition, self.to_string())
            }
            FleetError::MissingReason => (ErrorCode::MissingReason, self.to_string()),
            FleetError::FrictionBlocked { .. } => (ErrorCode::FrictionBlocked, self.to_string()),
            FleetError::DepthExceeded(_) => (ErrorCode::DepthExceeded, self.to_string()),
            FleetError::Forbidden(_) => (ErrorCode::Forbidden, self.to_string()),
            FleetError::CircuitOpen(_) => (ErrorCode::CircuitOpen, self.to_string()),
            FleetError::Storage(_) => (ErrorCode::InternalError, "internal storage error".to_string()),
        }
    }
}
