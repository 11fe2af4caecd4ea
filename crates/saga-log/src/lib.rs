//! Durable log of saga instances.
//!
//! Each saga is stored as one record keyed by its id. A record carries the
//! indexed columns needed for point lookups and filtered range scans
//! (`saga_type`, `status`, `created_at`) plus the full instance document as
//! JSON. Writes replace the whole record under an optimistic version check,
//! so readers never observe a half-applied transition.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::{MessageId, SagaId};
pub use error::{Result, SagaLogError};
pub use memory::InMemorySagaLogStore;
pub use postgres::PostgresSagaLogStore;
pub use query::SagaLogQuery;
pub use record::{SagaRecord, Version};
pub use store::{ProcessedMessageStore, SagaLogStore};
