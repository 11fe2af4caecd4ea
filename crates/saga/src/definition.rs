//! Static saga definitions: which remote operations run, in what order, and
//! how their inputs are drawn from the saga context.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SagaError};
use crate::instance::INPUT_KEY;

/// A remote service the orchestrator talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceTarget {
    /// Loyalty content service (lealtad-contenido).
    LoyaltyContent,
    /// Affiliates and commissions service (afiliados-comisiones).
    AffiliateRegistry,
    /// Collaborations service (colaboraciones).
    Collaborations,
    /// Monitoring service (monitoreo).
    Monitoring,
}

impl ServiceTarget {
    pub const ALL: [ServiceTarget; 4] = [
        ServiceTarget::LoyaltyContent,
        ServiceTarget::AffiliateRegistry,
        ServiceTarget::Collaborations,
        ServiceTarget::Monitoring,
    ];

    /// Returns the service name used in logs and health reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTarget::LoyaltyContent => "lealtad-contenido",
            ServiceTarget::AffiliateRegistry => "afiliados-comisiones",
            ServiceTarget::Collaborations => "colaboraciones",
            ServiceTarget::Monitoring => "monitoreo",
        }
    }
}

impl std::fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP verb of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

/// The closed set of remote operations a saga step can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateContent,
    DeleteContent,
    CreateAffiliate,
    DeactivateAffiliate,
    CreateCollaboration,
    RecordMetrics,
}

impl Operation {
    /// Returns the service that owns this operation.
    pub fn target(&self) -> ServiceTarget {
        match self {
            Operation::CreateContent | Operation::DeleteContent => ServiceTarget::LoyaltyContent,
            Operation::CreateAffiliate | Operation::DeactivateAffiliate => {
                ServiceTarget::AffiliateRegistry
            }
            Operation::CreateCollaboration => ServiceTarget::Collaborations,
            Operation::RecordMetrics => ServiceTarget::Monitoring,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateContent => "create_content",
            Operation::DeleteContent => "delete_content",
            Operation::CreateAffiliate => "create_affiliate",
            Operation::DeactivateAffiliate => "deactivate_affiliate",
            Operation::CreateCollaboration => "create_collaboration",
            Operation::RecordMetrics => "record_metrics",
        }
    }

    pub fn method(&self) -> HttpMethod {
        match self {
            Operation::CreateContent
            | Operation::CreateAffiliate
            | Operation::CreateCollaboration
            | Operation::RecordMetrics => HttpMethod::Post,
            Operation::DeactivateAffiliate => HttpMethod::Put,
            Operation::DeleteContent => HttpMethod::Delete,
        }
    }

    /// Path relative to the service base URL. `{name}` placeholders are
    /// filled from (and consume) the bound arguments.
    pub fn path_template(&self) -> &'static str {
        match self {
            Operation::CreateContent => "/api/contenido",
            Operation::DeleteContent => "/api/contenido/{content_id}",
            Operation::CreateAffiliate => "/api/afiliados",
            Operation::DeactivateAffiliate => "/api/afiliados/{affiliate_id}/deactivate",
            Operation::CreateCollaboration => "/api/colaboraciones",
            Operation::RecordMetrics => "/api/metrics",
        }
    }

    /// Output field that carries the id of the created resource, if any.
    pub fn id_field(&self) -> Option<&'static str> {
        match self {
            Operation::CreateContent => Some("content_id"),
            Operation::CreateAffiliate => Some("affiliate_id"),
            Operation::CreateCollaboration => Some("collaboration_id"),
            Operation::RecordMetrics => Some("metrics_id"),
            Operation::DeleteContent | Operation::DeactivateAffiliate => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a bound argument comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingSource {
    /// JSON pointer into the saga context, e.g. `/create-content/content_id`.
    Context(String),
    /// A constant value.
    Literal(Value),
}

/// Declares one argument of a remote action.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub field: String,
    pub source: BindingSource,
    /// Optional bindings are left out when the context has no value.
    pub required: bool,
}

/// A remote operation plus the bindings that build its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAction {
    operation: Operation,
    bindings: Vec<InputBinding>,
}

impl RemoteAction {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            bindings: Vec::new(),
        }
    }

    /// Binds a required argument to a context path.
    pub fn bind(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.bindings.push(InputBinding {
            field: field.into(),
            source: BindingSource::Context(path.into()),
            required: true,
        });
        self
    }

    /// Binds an argument that is omitted when the path is absent.
    pub fn bind_optional(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.bindings.push(InputBinding {
            field: field.into(),
            source: BindingSource::Context(path.into()),
            required: false,
        });
        self
    }

    /// Sets an argument to a constant.
    pub fn literal(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.push(InputBinding {
            field: field.into(),
            source: BindingSource::Literal(value.into()),
            required: true,
        });
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn target(&self) -> ServiceTarget {
        self.operation.target()
    }

    pub fn bindings(&self) -> &[InputBinding] {
        &self.bindings
    }
}

/// One step of a saga type.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub forward: RemoteAction,
    pub compensate: Option<RemoteAction>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, forward: RemoteAction) -> Self {
        Self {
            name: name.into(),
            forward,
            compensate: None,
        }
    }

    pub fn compensate_with(mut self, action: RemoteAction) -> Self {
        self.compensate = Some(action);
        self
    }
}

/// An ordered list of steps for one saga type.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Steps in forward execution order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn find_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Checks the definition can be driven: at least one step, unique step
    /// names, and no step named like a reserved context key.
    pub fn validate(&self) -> Result<()> {
        if self.saga_type.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "saga type must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga type '{}' has no steps",
                self.saga_type
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name == INPUT_KEY {
                return Err(SagaError::InvalidDefinition(format!(
                    "step name '{INPUT_KEY}' is reserved"
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "duplicate step '{}' in saga type '{}'",
                    step.name, self.saga_type
                )));
            }
        }
        Ok(())
    }
}

/// Saga definitions keyed by saga type.
#[derive(Debug, Clone, Default)]
pub struct SagaDefinitionRegistry {
    definitions: BTreeMap<String, Arc<SagaDefinition>>,
}

impl SagaDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a definition, replacing any previous one for
    /// the same type.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        definition.validate()?;
        self.definitions
            .insert(definition.saga_type.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn with(mut self, definition: SagaDefinition) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn get(&self, saga_type: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.get(saga_type).cloned()
    }

    /// Looks up a definition, failing with `UnknownSagaType`.
    pub fn require(&self, saga_type: &str) -> Result<Arc<SagaDefinition>> {
        self.get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    pub fn saga_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> SagaDefinition {
        SagaDefinition::new("demo")
            .step(
                StepDefinition::new(
                    "create-content",
                    RemoteAction::new(Operation::CreateContent).bind("title", "/input/title"),
                )
                .compensate_with(
                    RemoteAction::new(Operation::DeleteContent)
                        .bind("content_id", "/create-content/content_id"),
                ),
            )
            .step(StepDefinition::new(
                "record-metrics",
                RemoteAction::new(Operation::RecordMetrics).literal("event_type", "DEMO"),
            ))
    }

    #[test]
    fn test_operations_know_their_target() {
        assert_eq!(
            Operation::DeleteContent.target(),
            ServiceTarget::LoyaltyContent
        );
        assert_eq!(
            Operation::DeactivateAffiliate.target(),
            ServiceTarget::AffiliateRegistry
        );
        assert_eq!(Operation::DeactivateAffiliate.method(), HttpMethod::Put);
        assert_eq!(Operation::DeleteContent.method(), HttpMethod::Delete);
        assert_eq!(Operation::CreateAffiliate.id_field(), Some("affiliate_id"));
    }

    #[test]
    fn test_action_builder_collects_bindings() {
        let action = RemoteAction::new(Operation::CreateAffiliate)
            .bind("email", "/input/email")
            .bind_optional("content_id", "/create-content/content_id")
            .literal("status", "ACTIVE");

        assert_eq!(action.bindings().len(), 3);
        assert!(action.bindings()[0].required);
        assert!(!action.bindings()[1].required);
        assert_eq!(
            action.bindings()[2].source,
            BindingSource::Literal(Value::from("ACTIVE"))
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SagaDefinitionRegistry::new().with(two_step()).unwrap();

        let definition = registry.require("demo").unwrap();
        assert_eq!(definition.steps().len(), 2);
        assert!(definition.find_step("record-metrics").unwrap().compensate.is_none());
        assert!(matches!(
            registry.require("nope"),
            Err(SagaError::UnknownSagaType(t)) if t == "nope"
        ));
        assert_eq!(registry.saga_types().collect::<Vec<_>>(), vec!["demo"]);
    }

    #[test]
    fn test_duplicate_step_names_are_rejected() {
        let step = StepDefinition::new("a", RemoteAction::new(Operation::RecordMetrics));
        let definition = SagaDefinition::new("dup").step(step.clone()).step(step);

        assert!(matches!(
            SagaDefinitionRegistry::new().register(definition),
            Err(SagaError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_empty_and_reserved_definitions_are_rejected() {
        assert!(SagaDefinition::new("empty").validate().is_err());

        let reserved = SagaDefinition::new("reserved").step(StepDefinition::new(
            INPUT_KEY,
            RemoteAction::new(Operation::RecordMetrics),
        ));
        assert!(reserved.validate().is_err());
    }
}
