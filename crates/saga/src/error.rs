//! Saga error types.

use std::time::Duration;

use common::SagaId;
use saga_log::SagaLogError;
use thiserror::Error;

use crate::state::SagaStatus;

/// A required input field could not be resolved from the saga context.
///
/// The step fails without the remote operation being called.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Context binding failed: field '{field}' requires '{path}', which is not in the saga context")]
pub struct ContextBindingError {
    /// The argument that could not be bound.
    pub field: String,
    /// JSON pointer into the context that resolved to nothing.
    pub path: String,
}

/// Outcome classification for a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection refused, 5xx, 408 or 429. Worth retrying.
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The attempt did not finish within its timeout.
    #[error("Remote call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// 4xx, validation or business rejection. Retrying will not help.
    #[error("Permanent remote error: {0}")]
    Permanent(String),
}

impl RemoteError {
    /// Returns true if another attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout(_))
    }
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered for the requested saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// Saga not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Operator compensation was requested for a saga that cannot be compensated.
    #[error("Saga {saga_id} is not compensable in status {status}")]
    NotCompensable { saga_id: SagaId, status: SagaStatus },

    /// The saga state machine rejected a transition.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A saga definition failed validation at registration.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// Trigger input was rejected before the saga was created.
    #[error("Invalid saga input: {0}")]
    InvalidInput(String),

    /// Action input could not be resolved.
    #[error(transparent)]
    ContextBinding(#[from] ContextBindingError),

    /// A step tried to write a context entry that is already set.
    #[error("Context entry '{0}' is already set")]
    ContextOverwrite(String),

    /// A remote call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A compensating action did not complete.
    #[error("Compensation of step '{step}' failed: {reason}")]
    CompensationFailure { step: String, reason: String },

    /// Saga log error.
    #[error("Saga log error: {0}")]
    Store(#[from] SagaLogError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
