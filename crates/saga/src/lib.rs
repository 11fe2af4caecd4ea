//! Saga orchestration across remote services.
//!
//! A saga is an ordered list of steps, each invoking one remote operation
//! with an optional compensating operation. The [`SagaCoordinator`] runs the
//! steps in order, persisting the instance to the saga log after every step.
//! If a step fails, previously completed steps are compensated in reverse
//! order.
//!
//! The complete affiliate registration saga follows these steps:
//! 1. Create content
//! 2. Create affiliate
//! 3. Create collaboration
//! 4. Record metrics

pub mod affiliate_registration;
pub mod binding;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod executor;
pub mod instance;
pub mod messages;
pub mod planner;
pub mod query;
pub mod retry;
pub mod services;
pub mod state;

pub use affiliate_registration::AffiliateRegistrationRequest;
pub use coordinator::SagaCoordinator;
pub use definition::{
    Operation, RemoteAction, SagaDefinition, SagaDefinitionRegistry, ServiceTarget, StepDefinition,
};
pub use error::{ContextBindingError, RemoteError, Result, SagaError};
pub use executor::{StepExecutor, StepOutcome};
pub use instance::{AttemptOutcome, AttemptRecord, SagaInstance, StepRecord};
pub use messages::{Delivery, IdempotentConsumer, IntegrationMessage, MessageHandler, SagaTrigger};
pub use query::{SagaFilter, SagaQueryService, SagaStatistics, SagaSummary};
pub use retry::RetryPolicy;
pub use services::{
    HttpDispatcher, InMemoryServices, RemoteCall, RemoteDispatcher, ServiceEndpoints,
    ServiceHealth,
};
pub use state::{SagaStatus, StepDirection, StepStatus};

/// Returns a registry holding every built-in saga type.
pub fn default_definitions() -> Result<SagaDefinitionRegistry> {
    SagaDefinitionRegistry::new().with(affiliate_registration::definition())
}
