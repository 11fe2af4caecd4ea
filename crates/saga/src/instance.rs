//! Saga instance and its step history.

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_log::{SagaRecord, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SagaError};
use crate::state::{SagaStatus, StepDirection, StepStatus};

/// Context key holding the trigger payload.
pub const INPUT_KEY: &str = "input";

/// Result of one remote attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String, retriable: bool },
}

/// One entry of a step's attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number within the step record.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// The execution record of one forward or compensating step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub direction: StepDirection,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Remote output; merged into the saga context on forward success.
    pub output: Option<Value>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl StepRecord {
    fn begin(step_name: impl Into<String>, direction: StepDirection) -> Self {
        Self {
            step_name: step_name.into(),
            direction,
            status: StepStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            output: None,
            attempts: Vec::new(),
        }
    }

    fn is(&self, step_name: &str, direction: StepDirection) -> bool {
        self.step_name == step_name && self.direction == direction
    }
}

/// A running or finished saga.
///
/// The whole instance is persisted as one document after every step. Step
/// records are append-only; a completed step's context entry is never
/// replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    id: SagaId,
    saga_type: String,
    status: SagaStatus,
    correlation_id: Option<String>,
    steps: Vec<StepRecord>,
    context: Map<String, Value>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    version: Version,
}

impl SagaInstance {
    /// Creates a PENDING saga holding `input` under the `input` context key.
    pub fn new(saga_type: impl Into<String>, input: Value, correlation_id: Option<String>) -> Self {
        let now = Utc::now();
        let mut context = Map::new();
        context.insert(INPUT_KEY.to_string(), input);
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            status: SagaStatus::Pending,
            correlation_id,
            steps: Vec::new(),
            context,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// Rebuilds an instance from its saga log record.
    pub fn from_record(record: SagaRecord) -> Result<Self> {
        let mut instance: SagaInstance = serde_json::from_value(record.document)?;
        instance.version = record.version;
        Ok(instance)
    }

    /// Serializes the instance into a saga log record.
    pub fn to_record(&self) -> Result<SagaRecord> {
        Ok(SagaRecord {
            id: self.id,
            saga_type: self.saga_type.clone(),
            status: self.status.as_str().to_string(),
            correlation_id: self.correlation_id.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            document: serde_json::to_value(self)?,
        })
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Returns every step record in execution order.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    /// Returns the trigger payload.
    pub fn input(&self) -> Option<&Value> {
        self.context.get(INPUT_KEY)
    }

    /// Returns the output a completed step merged into the context.
    pub fn output_of(&self, step_name: &str) -> Option<&Value> {
        self.context.get(step_name)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the saga log version of the last persisted write.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the latest forward record for a step.
    pub fn forward_record(&self, step_name: &str) -> Option<&StepRecord> {
        self.steps
            .iter()
            .rev()
            .find(|r| r.is(step_name, StepDirection::Forward))
    }

    /// Returns the latest compensation record for a step.
    pub fn compensation_record(&self, step_name: &str) -> Option<&StepRecord> {
        self.steps
            .iter()
            .rev()
            .find(|r| r.is(step_name, StepDirection::Compensate))
    }

    /// Returns SUCCEEDED forward records in the order they completed.
    pub fn completed_forward_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|r| {
            r.direction == StepDirection::Forward && r.status == StepStatus::Succeeded
        })
    }

    /// Returns true if any compensation ended FAILED.
    pub fn has_failed_compensation(&self) -> bool {
        self.steps.iter().any(|r| {
            r.direction == StepDirection::Compensate && r.status == StepStatus::Failed
        })
    }

    /// Returns the number of forward steps that succeeded.
    pub fn completed_step_count(&self) -> usize {
        self.completed_forward_steps().count()
    }
}

// Mutations, driven by the coordinator
impl SagaInstance {
    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Keeps the first reason; later failures are recorded on their steps.
    pub(crate) fn record_failure(&mut self, reason: impl Into<String>) {
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason.into());
            self.touch();
        }
    }

    /// Appends a PENDING record and returns its index.
    pub(crate) fn begin_step(&mut self, step_name: &str, direction: StepDirection) -> usize {
        self.steps.push(StepRecord::begin(step_name, direction));
        self.touch();
        self.steps.len() - 1
    }

    /// Returns the index of the last record if it is an unfinished record
    /// for this step and direction.
    pub(crate) fn pending_step(&self, step_name: &str, direction: StepDirection) -> Option<usize> {
        let index = self.steps.len().checked_sub(1)?;
        let last = &self.steps[index];
        (last.is(step_name, direction) && last.status == StepStatus::Pending).then_some(index)
    }

    pub(crate) fn attempts_mut(&mut self, index: usize) -> &mut Vec<AttemptRecord> {
        &mut self.steps[index].attempts
    }

    /// Marks a record SUCCEEDED. Forward outputs are merged into the
    /// context under the step name.
    pub(crate) fn succeed_step(&mut self, index: usize, output: Value) -> Result<()> {
        let record = &self.steps[index];
        if record.direction == StepDirection::Forward {
            if self.context.contains_key(&record.step_name) {
                return Err(SagaError::ContextOverwrite(record.step_name.clone()));
            }
            self.context
                .insert(record.step_name.clone(), output.clone());
        }

        let record = &mut self.steps[index];
        record.status = StepStatus::Succeeded;
        record.output = Some(output);
        record.finished_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    pub(crate) fn fail_step(&mut self, index: usize, error: impl Into<String>) {
        let record = &mut self.steps[index];
        record.status = StepStatus::Failed;
        record.error = Some(error.into());
        record.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Records that a step has nothing to undo.
    pub(crate) fn skip_compensation(&mut self, step_name: &str) {
        let mut record = StepRecord::begin(step_name, StepDirection::Compensate);
        record.status = StepStatus::Skipped;
        record.finished_at = Some(record.started_at);
        self.steps.push(record);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_saga() -> SagaInstance {
        SagaInstance::new(
            "complete-affiliate-registration",
            json!({"affiliate_email": "ana@example.com"}),
            Some("corr-1".to_string()),
        )
    }

    #[test]
    fn test_new_saga_is_pending_with_input() {
        let saga = new_saga();
        assert_eq!(saga.status(), SagaStatus::Pending);
        assert!(saga.steps().is_empty());
        assert_eq!(
            saga.input(),
            Some(&json!({"affiliate_email": "ana@example.com"}))
        );
        assert_eq!(saga.version(), Version::initial());
        assert_eq!(saga.correlation_id(), Some("corr-1"));
    }

    #[test]
    fn test_forward_success_merges_output() {
        let mut saga = new_saga();
        saga.transition(SagaStatus::Running).unwrap();

        let index = saga.begin_step("create-content", StepDirection::Forward);
        assert_eq!(
            saga.pending_step("create-content", StepDirection::Forward),
            Some(index)
        );

        saga.succeed_step(index, json!({"content_id": "CNT-1"}))
            .unwrap();

        let record = saga.forward_record("create-content").unwrap();
        assert_eq!(record.status, StepStatus::Succeeded);
        assert!(record.finished_at.is_some());
        assert_eq!(
            saga.output_of("create-content"),
            Some(&json!({"content_id": "CNT-1"}))
        );
        assert!(
            saga.pending_step("create-content", StepDirection::Forward)
                .is_none()
        );
    }

    #[test]
    fn test_context_entries_are_never_replaced() {
        let mut saga = new_saga();
        let first = saga.begin_step("create-content", StepDirection::Forward);
        saga.succeed_step(first, json!({"content_id": "CNT-1"}))
            .unwrap();

        let second = saga.begin_step("create-content", StepDirection::Forward);
        let result = saga.succeed_step(second, json!({"content_id": "CNT-2"}));

        assert!(matches!(result, Err(SagaError::ContextOverwrite(_))));
        assert_eq!(
            saga.output_of("create-content"),
            Some(&json!({"content_id": "CNT-1"}))
        );
    }

    #[test]
    fn test_compensation_output_stays_out_of_context() {
        let mut saga = new_saga();
        let index = saga.begin_step("create-content", StepDirection::Compensate);
        saga.succeed_step(index, json!({"deleted": true})).unwrap();

        assert!(saga.output_of("create-content").is_none());
        assert_eq!(
            saga.compensation_record("create-content").unwrap().status,
            StepStatus::Succeeded
        );
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut saga = new_saga();
        let result = saga.transition(SagaStatus::Completed);
        assert!(matches!(
            result,
            Err(SagaError::InvalidTransition {
                from: SagaStatus::Pending,
                to: SagaStatus::Completed
            })
        ));
        assert_eq!(saga.status(), SagaStatus::Pending);
    }

    #[test]
    fn test_completed_forward_steps_in_execution_order() {
        let mut saga = new_saga();
        for name in ["a", "b", "c"] {
            let index = saga.begin_step(name, StepDirection::Forward);
            if name == "c" {
                saga.fail_step(index, "boom");
            } else {
                saga.succeed_step(index, json!({})).unwrap();
            }
        }

        let names: Vec<_> = saga
            .completed_forward_steps()
            .map(|r| r.step_name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(saga.completed_step_count(), 2);
        assert_eq!(saga.forward_record("c").unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_skip_and_failed_compensation() {
        let mut saga = new_saga();
        saga.skip_compensation("record-metrics");
        assert_eq!(
            saga.compensation_record("record-metrics").unwrap().status,
            StepStatus::Skipped
        );
        assert!(!saga.has_failed_compensation());

        let index = saga.begin_step("create-content", StepDirection::Compensate);
        saga.fail_step(index, "404");
        assert!(saga.has_failed_compensation());
    }

    #[test]
    fn test_failure_reason_keeps_first() {
        let mut saga = new_saga();
        saga.record_failure("duplicate email");
        saga.record_failure("later");
        assert_eq!(saga.failure_reason(), Some("duplicate email"));
    }

    #[test]
    fn test_record_conversion_preserves_instance() {
        let mut saga = new_saga();
        saga.transition(SagaStatus::Running).unwrap();
        let index = saga.begin_step("create-content", StepDirection::Forward);
        saga.attempts_mut(index).push(AttemptRecord {
            attempt: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: AttemptOutcome::Failed {
                error: "503".into(),
                retriable: true,
            },
        });

        let mut record = saga.to_record().unwrap();
        assert_eq!(record.status, "RUNNING");
        assert_eq!(record.saga_type, "complete-affiliate-registration");
        record.version = Version::new(3);

        let restored = SagaInstance::from_record(record).unwrap();
        assert_eq!(restored.id(), saga.id());
        assert_eq!(restored.status(), SagaStatus::Running);
        assert_eq!(restored.steps(), saga.steps());
        assert_eq!(restored.context(), saga.context());
        assert_eq!(restored.version(), Version::new(3));
    }
}
