//! Step executor: runs one remote action with per-attempt timeout and
//! retries with backoff.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::instance::{AttemptOutcome, AttemptRecord};
use crate::retry::RetryPolicy;
use crate::services::{RemoteCall, RemoteDispatcher};
use crate::state::StepDirection;

/// Final outcome of a step execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(Value),
    Failed(String),
}

/// Executes remote actions on behalf of the coordinator.
pub struct StepExecutor<D> {
    dispatcher: D,
    forward_policy: RetryPolicy,
    compensation_policy: RetryPolicy,
}

impl<D: RemoteDispatcher> StepExecutor<D> {
    pub fn new(dispatcher: D, forward_policy: RetryPolicy, compensation_policy: RetryPolicy) -> Self {
        Self {
            dispatcher,
            forward_policy,
            compensation_policy,
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn policy(&self, direction: StepDirection) -> &RetryPolicy {
        match direction {
            StepDirection::Forward => &self.forward_policy,
            StepDirection::Compensate => &self.compensation_policy,
        }
    }

    /// Runs `call` until it succeeds, fails permanently, or the retry budget
    /// is spent. Each attempt is appended to `attempts`; numbering continues
    /// from what is already there.
    ///
    /// Transient failures already in the log count against the budget, so a
    /// step re-dispatched after a restart only gets the retries it has left.
    /// A re-dispatch always makes at least one attempt.
    pub async fn execute(&self, mut call: RemoteCall, attempts: &mut Vec<AttemptRecord>) -> StepOutcome {
        let policy = self.policy(call.direction);
        let mut retries = attempts
            .iter()
            .filter(|a| matches!(a.outcome, AttemptOutcome::Failed { retriable: true, .. }))
            .count() as u32;

        loop {
            call.attempt = attempts.len() as u32 + 1;
            let started_at = Utc::now();

            let result = match tokio::time::timeout(
                policy.attempt_timeout,
                self.dispatcher.dispatch(&call),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(policy.attempt_timeout)),
            };

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(e) => AttemptOutcome::Failed {
                    error: e.to_string(),
                    retriable: e.is_retriable(),
                },
            };
            attempts.push(AttemptRecord {
                attempt: call.attempt,
                started_at,
                finished_at: Utc::now(),
                outcome,
            });
            metrics::counter!(
                "saga_step_attempts_total",
                "operation" => call.operation.as_str(),
                "direction" => call.direction.as_str(),
                "result" => if result.is_ok() { "success" } else { "failure" }
            )
            .increment(1);

            match result {
                Ok(output) => {
                    debug!(
                        step = %call.step_name,
                        attempt = call.attempt,
                        "remote call succeeded"
                    );
                    return StepOutcome::Succeeded(output);
                }
                Err(e) if e.is_retriable() && policy.should_retry(retries) => {
                    let delay = policy.delay_for_retry(retries);
                    warn!(
                        step = %call.step_name,
                        attempt = call.attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retriable() => {
                    return StepOutcome::Failed(format!(
                        "retries exhausted after {} attempts: {e}",
                        call.attempt
                    ));
                }
                Err(e) => return StepOutcome::Failed(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::SagaId;
    use serde_json::{Map, json};

    use super::*;
    use crate::definition::Operation;
    use crate::services::InMemoryServices;

    fn executor(services: InMemoryServices, max_retries: u32) -> StepExecutor<InMemoryServices> {
        StepExecutor::new(
            services,
            RetryPolicy::immediate(max_retries).with_attempt_timeout(Duration::from_millis(50)),
            RetryPolicy::immediate(0),
        )
    }

    fn metrics_call(direction: StepDirection) -> RemoteCall {
        RemoteCall {
            saga_id: SagaId::new(),
            correlation_id: None,
            step_name: "record-metrics".to_string(),
            direction,
            operation: Operation::RecordMetrics,
            arguments: Map::new(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = executor(InMemoryServices::new(), 2);
        let mut attempts = Vec::new();

        let outcome = executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Succeeded(v) if v["recorded"] == json!(true)));
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt, 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let services = InMemoryServices::new();
        services.fail_transiently(Operation::RecordMetrics, 2);
        let executor = executor(services.clone(), 2);
        let mut attempts = Vec::new();

        let outcome = executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Succeeded(_)));
        assert_eq!(attempts.len(), 3);
        assert!(matches!(
            attempts[0].outcome,
            AttemptOutcome::Failed { retriable: true, .. }
        ));
        assert_eq!(services.call_count(Operation::RecordMetrics), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_step() {
        let services = InMemoryServices::new();
        services.fail_transiently(Operation::RecordMetrics, 3);
        let executor = executor(services.clone(), 2);
        let mut attempts = Vec::new();

        let outcome = executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("retries exhausted")));
        assert_eq!(attempts.len(), 3);
        assert_eq!(services.metrics_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let services = InMemoryServices::new();
        services.fail_permanently(Operation::RecordMetrics, "rejected");
        let executor = executor(services.clone(), 5);
        let mut attempts = Vec::new();

        let outcome = executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("rejected")));
        assert_eq!(attempts.len(), 1);
        assert!(matches!(
            attempts[0].outcome,
            AttemptOutcome::Failed { retriable: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let services = InMemoryServices::new();
        services.set_latency(Operation::RecordMetrics, Duration::from_millis(500));
        let executor = executor(services.clone(), 1);
        let mut attempts = Vec::new();

        let outcome = executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("timed out")));
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_compensation_uses_its_own_policy() {
        let services = InMemoryServices::new();
        services.fail_transiently(Operation::RecordMetrics, 1);
        let executor = executor(services, 3);
        let mut attempts = Vec::new();

        let outcome = executor
            .execute(metrics_call(StepDirection::Compensate), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_numbers_continue_existing_log() {
        let executor = executor(InMemoryServices::new(), 0);
        let mut attempts = vec![AttemptRecord {
            attempt: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: AttemptOutcome::Failed {
                error: "lost".into(),
                retriable: true,
            },
        }];

        executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_redispatch_only_uses_remaining_budget() {
        let services = InMemoryServices::new();
        services.fail_transiently(Operation::RecordMetrics, 5);
        let executor = executor(services.clone(), 2);
        let mut attempts: Vec<AttemptRecord> = (1..=2)
            .map(|attempt| AttemptRecord {
                attempt,
                started_at: Utc::now(),
                finished_at: Utc::now(),
                outcome: AttemptOutcome::Failed {
                    error: "service unavailable".into(),
                    retriable: true,
                },
            })
            .collect();

        let outcome = executor
            .execute(metrics_call(StepDirection::Forward), &mut attempts)
            .await;

        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("after 3 attempts")));
        assert_eq!(attempts.len(), 3);
        assert_eq!(services.call_count(Operation::RecordMetrics), 1);
    }
}
