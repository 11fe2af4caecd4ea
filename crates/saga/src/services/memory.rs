//! In-memory stand-ins for the remote services, for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{RemoteCall, RemoteDispatcher, ServiceHealth};
use crate::definition::{Operation, ServiceTarget};
use crate::error::RemoteError;
use crate::state::StepDirection;

/// A call as observed by the in-memory services.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub step_name: String,
    pub direction: StepDirection,
    pub attempt: u32,
    pub idempotency_key: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug)]
struct Affiliate {
    email: String,
    active: bool,
}

#[derive(Debug, Default)]
struct ServicesState {
    contents: HashMap<String, Map<String, Value>>,
    affiliates: HashMap<String, Affiliate>,
    collaborations: HashMap<String, Map<String, Value>>,
    metrics: Vec<Map<String, Value>>,
    next_id: u32,
    calls: Vec<RecordedCall>,
    /// Successful responses by idempotency key.
    responses: HashMap<String, Value>,
    transient_failures: HashMap<Operation, u32>,
    permanent_failures: HashMap<Operation, String>,
    latency: HashMap<Operation, Duration>,
    unhealthy: HashSet<ServiceTarget>,
}

impl ServicesState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// In-memory content, affiliate, collaboration and monitoring services.
///
/// Follows the same business rules the real services enforce (affiliate
/// emails are unique among active affiliates) and answers repeated calls
/// with the same idempotency key with the original response.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServices {
    state: Arc<Mutex<ServicesState>>,
}

impl InMemoryServices {
    /// Creates a new set of in-memory services.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServicesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `times` calls of `operation` fail transiently.
    pub fn fail_transiently(&self, operation: Operation, times: u32) {
        self.lock().transient_failures.insert(operation, times);
    }

    /// Makes every call of `operation` fail permanently with `reason`.
    pub fn fail_permanently(&self, operation: Operation, reason: impl Into<String>) {
        self.lock()
            .permanent_failures
            .insert(operation, reason.into());
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.transient_failures.clear();
        state.permanent_failures.clear();
    }

    /// Delays every call of `operation` by `latency`.
    pub fn set_latency(&self, operation: Operation, latency: Duration) {
        self.lock().latency.insert(operation, latency);
    }

    /// Marks a service as unhealthy for health probes.
    pub fn set_unhealthy(&self, target: ServiceTarget, unhealthy: bool) {
        let mut state = self.lock();
        if unhealthy {
            state.unhealthy.insert(target);
        } else {
            state.unhealthy.remove(&target);
        }
    }

    /// Registers an active affiliate directly, returning its id.
    pub fn seed_affiliate(&self, email: &str) -> String {
        let mut state = self.lock();
        let id = state.next_id("AFF");
        state.affiliates.insert(
            id.clone(),
            Affiliate {
                email: email.to_string(),
                active: true,
            },
        );
        id
    }

    /// Returns every call received, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Returns the operations received, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().calls.iter().map(|c| c.operation).collect()
    }

    /// Returns how many calls of `operation` were received, retries included.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Returns the number of content items that currently exist.
    pub fn content_count(&self) -> usize {
        self.lock().contents.len()
    }

    /// Returns the number of active affiliates.
    pub fn active_affiliate_count(&self) -> usize {
        self.lock().affiliates.values().filter(|a| a.active).count()
    }

    /// Returns the number of collaborations created.
    pub fn collaboration_count(&self) -> usize {
        self.lock().collaborations.len()
    }

    /// Returns the number of metrics entries recorded.
    pub fn metrics_count(&self) -> usize {
        self.lock().metrics.len()
    }

    fn apply(
        state: &mut ServicesState,
        operation: Operation,
        args: &Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        match operation {
            Operation::CreateContent => {
                let title = required_str(args, "title")?;
                let id = state.next_id("CNT");
                state.contents.insert(id.clone(), args.clone());
                Ok(json!({"content_id": id, "title": title, "status": "PUBLISHED"}))
            }
            Operation::DeleteContent => {
                let id = required_str(args, "content_id")?;
                state
                    .contents
                    .remove(&id)
                    .ok_or_else(|| RemoteError::Permanent(format!("content {id} not found")))?;
                Ok(json!({"content_id": id, "deleted": true}))
            }
            Operation::CreateAffiliate => {
                let email = required_str(args, "email")?;
                if state
                    .affiliates
                    .values()
                    .any(|a| a.active && a.email.eq_ignore_ascii_case(&email))
                {
                    return Err(RemoteError::Permanent(format!("duplicate email: {email}")));
                }
                let id = state.next_id("AFF");
                state.affiliates.insert(
                    id.clone(),
                    Affiliate {
                        email: email.clone(),
                        active: true,
                    },
                );
                Ok(json!({"affiliate_id": id, "email": email, "status": "ACTIVE"}))
            }
            Operation::DeactivateAffiliate => {
                let id = required_str(args, "affiliate_id")?;
                let affiliate = state
                    .affiliates
                    .get_mut(&id)
                    .ok_or_else(|| RemoteError::Permanent(format!("affiliate {id} not found")))?;
                affiliate.active = false;
                Ok(json!({"affiliate_id": id, "status": "INACTIVE"}))
            }
            Operation::CreateCollaboration => {
                let affiliate_id = required_str(args, "affiliate_id")?;
                let id = state.next_id("COL");
                state.collaborations.insert(id.clone(), args.clone());
                Ok(json!({"collaboration_id": id, "affiliate_id": affiliate_id, "status": "ACTIVE"}))
            }
            Operation::RecordMetrics => {
                let id = state.next_id("MET");
                state.metrics.push(args.clone());
                Ok(json!({"metrics_id": id, "recorded": true}))
            }
        }
    }
}

fn required_str(args: &Map<String, Value>, field: &str) -> Result<String, RemoteError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Permanent(format!("{field} is required")))
}

#[async_trait]
impl RemoteDispatcher for InMemoryServices {
    async fn dispatch(&self, call: &RemoteCall) -> Result<Value, RemoteError> {
        let key = call.idempotency_key();
        let latency = {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                operation: call.operation,
                step_name: call.step_name.clone(),
                direction: call.direction,
                attempt: call.attempt,
                idempotency_key: key.clone(),
                arguments: call.arguments.clone(),
            });
            state.latency.get(&call.operation).copied()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();

        if let Some(reason) = state.permanent_failures.get(&call.operation) {
            return Err(RemoteError::Permanent(reason.clone()));
        }
        if let Some(remaining) = state.transient_failures.get_mut(&call.operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(RemoteError::Transient(format!(
                "{} unavailable (503)",
                call.target()
            )));
        }
        if let Some(previous) = state.responses.get(&key) {
            return Ok(previous.clone());
        }

        let output = Self::apply(&mut state, call.operation, &call.arguments)?;
        state.responses.insert(key, output.clone());
        Ok(output)
    }

    async fn check_services(&self) -> Vec<ServiceHealth> {
        let state = self.lock();
        ServiceTarget::ALL
            .iter()
            .map(|target| {
                let healthy = !state.unhealthy.contains(target);
                ServiceHealth {
                    service: target.as_str().to_string(),
                    healthy,
                    url: None,
                    detail: (!healthy).then(|| "marked unhealthy".to_string()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;

    fn call(operation: Operation, step: &str, args: Value) -> RemoteCall {
        let arguments = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        RemoteCall {
            saga_id: SagaId::new(),
            correlation_id: None,
            step_name: step.to_string(),
            direction: StepDirection::Forward,
            operation,
            arguments,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_is_permanent() {
        let services = InMemoryServices::new();
        services.seed_affiliate("ana@example.com");

        let result = services
            .dispatch(&call(
                Operation::CreateAffiliate,
                "create-affiliate",
                json!({"email": "ana@example.com"}),
            ))
            .await;

        assert!(matches!(result, Err(RemoteError::Permanent(msg)) if msg.contains("duplicate")));
        assert_eq!(services.active_affiliate_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_count_down() {
        let services = InMemoryServices::new();
        services.fail_transiently(Operation::RecordMetrics, 2);
        let c = call(Operation::RecordMetrics, "record-metrics", json!({}));

        assert!(matches!(
            services.dispatch(&c).await,
            Err(RemoteError::Transient(_))
        ));
        assert!(services.dispatch(&c).await.is_err());
        assert!(services.dispatch(&c).await.is_ok());
        assert_eq!(services.call_count(Operation::RecordMetrics), 3);
        assert_eq!(services.metrics_count(), 1);
    }

    #[tokio::test]
    async fn test_same_idempotency_key_returns_original_response() {
        let services = InMemoryServices::new();
        let c = call(
            Operation::CreateContent,
            "create-content",
            json!({"title": "Guide"}),
        );

        let first = services.dispatch(&c).await.unwrap();
        let second = services.dispatch(&c).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(services.content_count(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_frees_email() {
        let services = InMemoryServices::new();
        let id = services.seed_affiliate("ana@example.com");

        services
            .dispatch(&call(
                Operation::DeactivateAffiliate,
                "create-affiliate",
                json!({"affiliate_id": id}),
            ))
            .await
            .unwrap();

        assert_eq!(services.active_affiliate_count(), 0);
        assert!(
            services
                .dispatch(&call(
                    Operation::CreateAffiliate,
                    "create-affiliate",
                    json!({"email": "ana@example.com"}),
                ))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_health_reflects_unhealthy_flag() {
        let services = InMemoryServices::new();
        services.set_unhealthy(ServiceTarget::Monitoring, true);

        let health = services.check_services().await;

        assert_eq!(health.len(), 4);
        let monitoring = health.iter().find(|h| h.service == "monitoreo").unwrap();
        assert!(!monitoring.healthy);
        assert_eq!(health.iter().filter(|h| h.healthy).count(), 3);
    }
}
