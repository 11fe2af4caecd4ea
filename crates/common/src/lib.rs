//! Shared identifier types for the saga orchestration workspace.

pub mod types;

pub use types::{MessageId, SagaId};
