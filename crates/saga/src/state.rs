//! Saga and step state machines.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed          (Running ──► Running per step)
///    │                  └──► Compensating ──┬──► Compensated
///    └─────(forced)────────► Compensating   └──► Failed
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga has been accepted but no step has been dispatched.
    #[default]
    Pending,

    /// Forward steps are being executed.
    Running,

    /// Every forward step succeeded (terminal state).
    Completed,

    /// A forward step failed, or an operator forced compensation.
    Compensating,

    /// Every required compensation succeeded (terminal state).
    Compensated,

    /// A compensation could not complete; needs manual remediation (terminal state).
    Failed,
}

impl SagaStatus {
    pub const ALL: [SagaStatus; 6] = [
        SagaStatus::Pending,
        SagaStatus::Running,
        SagaStatus::Completed,
        SagaStatus::Compensating,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if the saga may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Compensating)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Returns true if an operator may force compensation from this status.
    pub fn can_force_compensate(&self) -> bool {
        matches!(
            self,
            SagaStatus::Pending | SagaStatus::Running | SagaStatus::Compensating
        )
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }

    /// Returns the statuses a saga can be resumed from.
    pub fn unfinished() -> [SagaStatus; 3] {
        [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Compensating,
        ]
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown saga status: {s}"))
    }
}

/// Whether a step record runs a forward action or undoes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepDirection {
    Forward,
    Compensate,
}

impl StepDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepDirection::Forward => "FORWARD",
            StepDirection::Compensate => "COMPENSATE",
        }
    }
}

impl std::fmt::Display for StepDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Dispatched, final outcome not yet recorded.
    Pending,
    Succeeded,
    Failed,
    /// Compensation records only: the step has no compensating action.
    Skipped,
}

impl StepStatus {
    /// Returns true once the record's outcome is final.
    pub fn is_settled(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
    }

    #[test]
    fn test_allowed_transitions() {
        use SagaStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Compensating));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Compensating));
        assert!(Compensating.can_transition_to(Compensated));
        assert!(Compensating.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Compensated));
        assert!(!Running.can_transition_to(Failed));
        assert!(!Compensating.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [
            SagaStatus::Completed,
            SagaStatus::Compensated,
            SagaStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_force_compensate());
            for next in SagaStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_can_force_compensate() {
        assert!(SagaStatus::Pending.can_force_compensate());
        assert!(SagaStatus::Running.can_force_compensate());
        assert!(SagaStatus::Compensating.can_force_compensate());
    }

    #[test]
    fn test_display_and_parse() {
        for status in SagaStatus::ALL {
            let parsed: SagaStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(
            "compensated".parse::<SagaStatus>().unwrap(),
            SagaStatus::Compensated
        );
        assert!("DONE".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_serialization_uses_wire_names() {
        let json = serde_json::to_string(&SagaStatus::Compensating).unwrap();
        assert_eq!(json, "\"COMPENSATING\"");
        let json = serde_json::to_string(&StepDirection::Compensate).unwrap();
        assert_eq!(json, "\"COMPENSATE\"");
        let json = serde_json::to_string(&StepStatus::Skipped).unwrap();
        assert_eq!(json, "\"SKIPPED\"");
    }

    #[test]
    fn test_step_status_settled() {
        assert!(!StepStatus::Pending.is_settled());
        assert!(StepStatus::Succeeded.is_settled());
        assert!(StepStatus::Failed.is_settled());
        assert!(StepStatus::Skipped.is_settled());
    }
}
