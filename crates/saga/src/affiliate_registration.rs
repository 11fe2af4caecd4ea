//! Complete affiliate registration saga.
//!
//! 1. Create the affiliate's first content item (compensated by deleting it)
//! 2. Register the affiliate (compensated by deactivating it)
//! 3. Open a collaboration for the affiliate
//! 4. Record the registration with monitoring
//!
//! Steps 3 and 4 have no compensating action.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::{Operation, RemoteAction, SagaDefinition, StepDefinition};
use crate::error::{Result, SagaError};

/// The saga type identifier for affiliate registration.
pub const SAGA_TYPE: &str = "complete-affiliate-registration";

/// Integration message type that triggers this saga.
pub const REQUESTED_MESSAGE_TYPE: &str = "AffiliateRegistrationRequested";

/// Step name: Create content in the loyalty content service.
pub const STEP_CREATE_CONTENT: &str = "create-content";

/// Step name: Register the affiliate.
pub const STEP_CREATE_AFFILIATE: &str = "create-affiliate";

/// Step name: Create the collaboration.
pub const STEP_CREATE_COLLABORATION: &str = "create-collaboration";

/// Step name: Record registration metrics.
pub const STEP_RECORD_METRICS: &str = "record-metrics";

/// Builds the step definitions for this saga type.
pub fn definition() -> SagaDefinition {
    SagaDefinition::new(SAGA_TYPE)
        .step(
            StepDefinition::new(
                STEP_CREATE_CONTENT,
                RemoteAction::new(Operation::CreateContent)
                    .bind("title", "/input/content_title")
                    .bind_optional("description", "/input/content_description")
                    .bind_optional("content_type", "/input/content_type")
                    .bind("author_name", "/input/affiliate_name")
                    .bind("author_email", "/input/affiliate_email"),
            )
            .compensate_with(
                RemoteAction::new(Operation::DeleteContent)
                    .bind("content_id", "/create-content/content_id"),
            ),
        )
        .step(
            StepDefinition::new(
                STEP_CREATE_AFFILIATE,
                RemoteAction::new(Operation::CreateAffiliate)
                    .bind("name", "/input/affiliate_name")
                    .bind("email", "/input/affiliate_email")
                    .bind("commission_rate", "/input/commission_rate")
                    .bind("content_id", "/create-content/content_id"),
            )
            .compensate_with(
                RemoteAction::new(Operation::DeactivateAffiliate)
                    .bind("affiliate_id", "/create-affiliate/affiliate_id")
                    .literal("status", "INACTIVE"),
            ),
        )
        .step(StepDefinition::new(
            STEP_CREATE_COLLABORATION,
            RemoteAction::new(Operation::CreateCollaboration)
                .bind("affiliate_id", "/create-affiliate/affiliate_id")
                .bind_optional("collaboration_type", "/input/collaboration_type")
                .bind("affiliate_name", "/input/affiliate_name")
                .bind("affiliate_email", "/input/affiliate_email"),
        ))
        .step(StepDefinition::new(
            STEP_RECORD_METRICS,
            RemoteAction::new(Operation::RecordMetrics)
                .literal("event_type", "AFFILIATE_REGISTERED")
                .bind("affiliate_id", "/create-affiliate/affiliate_id")
                .bind("content_id", "/create-content/content_id")
                .bind("collaboration_id", "/create-collaboration/collaboration_id")
                .bind("affiliate_name", "/input/affiliate_name")
                .bind_optional("commission_rate", "/input/commission_rate")
                .bind_optional("collaboration_type", "/input/collaboration_type"),
        ))
}

fn default_content_type() -> String {
    "BLOG".to_string()
}

fn default_collaboration_type() -> String {
    "CONTENT_CREATION".to_string()
}

/// Trigger payload for the affiliate registration saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateRegistrationRequest {
    pub affiliate_name: String,
    pub affiliate_email: String,
    /// Fraction between 0 and 1.
    pub commission_rate: f64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub content_title: String,
    pub content_description: String,
    #[serde(default = "default_collaboration_type")]
    pub collaboration_type: String,
}

impl AffiliateRegistrationRequest {
    /// Rejects requests the remote services would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        if self.affiliate_name.trim().is_empty() {
            return Err(SagaError::InvalidInput(
                "affiliate_name must not be empty".to_string(),
            ));
        }
        let valid_email = self
            .affiliate_email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid_email {
            return Err(SagaError::InvalidInput(format!(
                "affiliate_email '{}' is not a valid email address",
                self.affiliate_email
            )));
        }
        if !(0.0..=1.0).contains(&self.commission_rate) {
            return Err(SagaError::InvalidInput(
                "commission_rate must be between 0 and 1".to_string(),
            ));
        }
        if self.content_title.trim().is_empty() {
            return Err(SagaError::InvalidInput(
                "content_title must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates and converts the request into saga input.
    pub fn into_input(self) -> Result<Value> {
        self.validate()?;
        Ok(serde_json::to_value(self)?)
    }
}
