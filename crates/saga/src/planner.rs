//! Compensation planner.

use crate::definition::{RemoteAction, SagaDefinition};
use crate::instance::SagaInstance;
use crate::state::StepStatus;

/// One entry of a compensation plan.
#[derive(Debug, Clone, PartialEq)]
pub enum CompensationTask {
    /// Run the step's compensating action.
    Compensate { step_name: String, action: RemoteAction },
    /// The step has nothing to undo.
    Skip { step_name: String },
    /// The step completed but is no longer part of the definition.
    Undefined { step_name: String },
}

impl CompensationTask {
    pub fn step_name(&self) -> &str {
        match self {
            CompensationTask::Compensate { step_name, .. }
            | CompensationTask::Skip { step_name }
            | CompensationTask::Undefined { step_name } => step_name,
        }
    }
}

/// Returns the steps to undo, most recently completed first.
///
/// Only SUCCEEDED forward steps are planned. A step whose compensation has
/// already settled (succeeded, skipped or failed) is left out, so planning
/// again after a restart picks up where the previous run stopped.
pub fn plan(definition: &SagaDefinition, saga: &SagaInstance) -> Vec<CompensationTask> {
    let completed: Vec<&str> = saga
        .completed_forward_steps()
        .map(|r| r.step_name.as_str())
        .collect();

    completed
        .into_iter()
        .rev()
        .filter(|name| {
            saga.compensation_record(name)
                .is_none_or(|r| r.status == StepStatus::Pending)
        })
        .map(|name| {
            let step_name = name.to_string();
            match definition.find_step(name) {
                Some(step) => match &step.compensate {
                    Some(action) => CompensationTask::Compensate {
                        step_name,
                        action: action.clone(),
                    },
                    None => CompensationTask::Skip { step_name },
                },
                None => CompensationTask::Undefined { step_name },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::definition::{Operation, StepDefinition};
    use crate::state::StepDirection;

    fn definition() -> SagaDefinition {
        SagaDefinition::new("demo")
            .step(
                StepDefinition::new("a", RemoteAction::new(Operation::CreateContent))
                    .compensate_with(RemoteAction::new(Operation::DeleteContent)),
            )
            .step(StepDefinition::new(
                "b",
                RemoteAction::new(Operation::RecordMetrics),
            ))
            .step(
                StepDefinition::new("c", RemoteAction::new(Operation::CreateAffiliate))
                    .compensate_with(RemoteAction::new(Operation::DeactivateAffiliate)),
            )
            .step(StepDefinition::new(
                "d",
                RemoteAction::new(Operation::CreateCollaboration),
            ))
    }

    fn saga_with(succeeded: &[&str], failed: Option<&str>) -> SagaInstance {
        let mut saga = SagaInstance::new("demo", json!({}), None);
        for name in succeeded {
            let index = saga.begin_step(name, StepDirection::Forward);
            saga.succeed_step(index, json!({})).unwrap();
        }
        if let Some(name) = failed {
            let index = saga.begin_step(name, StepDirection::Forward);
            saga.fail_step(index, "boom");
        }
        saga
    }

    fn names(tasks: &[CompensationTask]) -> Vec<&str> {
        tasks.iter().map(CompensationTask::step_name).collect()
    }

    #[test]
    fn test_plan_reverses_completed_steps() {
        let saga = saga_with(&["a", "b", "c"], Some("d"));
        let tasks = plan(&definition(), &saga);

        assert_eq!(names(&tasks), vec!["c", "b", "a"]);
        assert!(matches!(&tasks[0], CompensationTask::Compensate { action, .. }
            if action.operation() == Operation::DeactivateAffiliate));
        assert!(matches!(&tasks[1], CompensationTask::Skip { .. }));
        assert!(matches!(&tasks[2], CompensationTask::Compensate { action, .. }
            if action.operation() == Operation::DeleteContent));
    }

    #[test]
    fn test_failed_step_is_not_compensated() {
        let saga = saga_with(&["a"], Some("b"));
        let tasks = plan(&definition(), &saga);
        assert_eq!(names(&tasks), vec!["a"]);
    }

    #[test]
    fn test_nothing_to_plan_before_first_success() {
        let saga = saga_with(&[], Some("a"));
        assert!(plan(&definition(), &saga).is_empty());
    }

    #[test]
    fn test_settled_compensations_are_not_planned_again() {
        let mut saga = saga_with(&["a", "b", "c"], Some("d"));
        let index = saga.begin_step("c", StepDirection::Compensate);
        saga.succeed_step(index, json!({})).unwrap();
        saga.skip_compensation("b");

        let tasks = plan(&definition(), &saga);
        assert_eq!(names(&tasks), vec!["a"]);
    }

    #[test]
    fn test_pending_compensation_is_planned_again() {
        let mut saga = saga_with(&["a", "b", "c"], Some("d"));
        saga.begin_step("c", StepDirection::Compensate);

        let tasks = plan(&definition(), &saga);
        assert_eq!(names(&tasks), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_step_missing_from_definition() {
        let saga = saga_with(&["a", "legacy"], None);
        let tasks = plan(&definition(), &saga);
        assert!(matches!(&tasks[0], CompensationTask::Undefined { step_name } if step_name == "legacy"));
    }
}
