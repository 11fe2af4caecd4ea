//! Remote dispatch: the seam between saga steps and the services they call.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use common::SagaId;
use serde_json::{Map, Value};

use crate::definition::{Operation, ServiceTarget};
use crate::error::RemoteError;
use crate::state::StepDirection;

pub use http::{HttpDispatcher, ServiceEndpoints};
pub use memory::InMemoryServices;

/// One invocation of a remote operation with bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub saga_id: SagaId,
    pub correlation_id: Option<String>,
    pub step_name: String,
    pub direction: StepDirection,
    pub operation: Operation,
    pub arguments: Map<String, Value>,
    /// 1-based attempt number within the step record.
    pub attempt: u32,
}

impl RemoteCall {
    /// Stable across retries and re-dispatch after restart, so the remote
    /// side can deduplicate.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.saga_id, self.step_name, self.direction)
    }

    pub fn target(&self) -> ServiceTarget {
        self.operation.target()
    }
}

/// Health of one remote service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub healthy: bool,
    pub url: Option<String>,
    pub detail: Option<String>,
}

/// Executes remote operations.
///
/// Implementations classify every failure as transient or permanent; the
/// step executor decides what to do with that.
#[async_trait]
pub trait RemoteDispatcher: Send + Sync {
    /// Performs one attempt of a remote call.
    async fn dispatch(&self, call: &RemoteCall) -> Result<Value, RemoteError>;

    /// Probes each remote service.
    async fn check_services(&self) -> Vec<ServiceHealth>;
}

#[async_trait]
impl<T: RemoteDispatcher + ?Sized> RemoteDispatcher for std::sync::Arc<T> {
    async fn dispatch(&self, call: &RemoteCall) -> Result<Value, RemoteError> {
        (**self).dispatch(call).await
    }

    async fn check_services(&self) -> Vec<ServiceHealth> {
        (**self).check_services().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_ignores_attempt() {
        let saga_id = SagaId::new();
        let mut call = RemoteCall {
            saga_id,
            correlation_id: None,
            step_name: "create-content".to_string(),
            direction: StepDirection::Compensate,
            operation: Operation::DeleteContent,
            arguments: Map::new(),
            attempt: 1,
        };
        let first = call.idempotency_key();
        call.attempt = 3;

        assert_eq!(first, call.idempotency_key());
        assert_eq!(first, format!("{saga_id}:create-content:COMPENSATE"));
        assert_eq!(call.target(), ServiceTarget::LoyaltyContent);
    }
}
