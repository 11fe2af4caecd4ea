//! Integration messages from other services and at-least-once consumption
//! with consumer-side deduplication.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use saga_log::{ProcessedMessageStore, SagaLogStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::coordinator::SagaCoordinator;
use crate::error::Result;
use crate::services::RemoteDispatcher;

/// A message published by another service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationMessage {
    /// Unique per message; redeliveries carry the same id.
    pub message_id: MessageId,
    pub message_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

/// Handles one integration message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Output: Send;

    async fn handle(&self, message: &IntegrationMessage) -> Result<Self::Output>;
}

/// What happened to a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    /// First delivery; the handler ran.
    Handled(T),
    /// The message id was already processed; the handler did not run.
    Duplicate,
}

/// Wraps a handler so each message id is handled at most once per consumer.
///
/// The id is claimed before the handler runs. If the handler fails the
/// claim is released, so a redelivery can try again.
pub struct IdempotentConsumer<P, H> {
    name: String,
    processed: P,
    handler: H,
}

impl<P, H> IdempotentConsumer<P, H>
where
    P: ProcessedMessageStore,
    H: MessageHandler,
{
    pub fn new(name: impl Into<String>, processed: P, handler: H) -> Self {
        Self {
            name: name.into(),
            processed,
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    #[tracing::instrument(
        skip_all,
        fields(consumer = %self.name, message_id = %message.message_id)
    )]
    pub async fn consume(&self, message: &IntegrationMessage) -> Result<Delivery<H::Output>> {
        if !self.processed.claim(&self.name, &message.message_id).await? {
            info!("duplicate message ignored");
            metrics::counter!("saga_duplicate_messages_total").increment(1);
            return Ok(Delivery::Duplicate);
        }

        match self.handler.handle(message).await {
            Ok(output) => Ok(Delivery::Handled(output)),
            Err(e) => {
                warn!(error = %e, "message handling failed, releasing claim");
                self.processed
                    .release(&self.name, &message.message_id)
                    .await?;
                Err(e)
            }
        }
    }
}

/// Starts a saga for each message whose type is mapped to a saga type.
///
/// The message id becomes the saga's correlation id.
pub struct SagaTrigger<S, D> {
    coordinator: SagaCoordinator<S, D>,
    routes: HashMap<String, String>,
}

impl<S, D> SagaTrigger<S, D> {
    pub fn new(coordinator: SagaCoordinator<S, D>) -> Self {
        Self {
            coordinator,
            routes: HashMap::new(),
        }
    }

    /// Maps a message type to the saga type it starts.
    pub fn route(mut self, message_type: impl Into<String>, saga_type: impl Into<String>) -> Self {
        self.routes.insert(message_type.into(), saga_type.into());
        self
    }

    pub fn saga_type_for(&self, message_type: &str) -> Option<&str> {
        self.routes.get(message_type).map(String::as_str)
    }
}

#[async_trait]
impl<S, D> MessageHandler for SagaTrigger<S, D>
where
    S: SagaLogStore + Clone + 'static,
    D: RemoteDispatcher + 'static,
{
    /// The started saga, or `None` for message types nothing listens to.
    type Output = Option<SagaId>;

    async fn handle(&self, message: &IntegrationMessage) -> Result<Option<SagaId>> {
        let Some(saga_type) = self.saga_type_for(&message.message_type) else {
            info!(message_type = %message.message_type, "no saga for message type");
            return Ok(None);
        };

        let id = self
            .coordinator
            .start_with_correlation(
                saga_type,
                message.payload.clone(),
                Some(message.message_id.to_string()),
            )
            .await?;
        Ok(Some(id))
    }
}
