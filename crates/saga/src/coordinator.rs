//! Saga coordinator for orchestrating multi-step sagas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use common::SagaId;
use saga_log::{SagaLogQuery, SagaLogStore, Version};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::binding;
use crate::definition::{RemoteAction, SagaDefinition, SagaDefinitionRegistry};
use crate::error::{Result, SagaError};
use crate::executor::{StepExecutor, StepOutcome};
use crate::instance::SagaInstance;
use crate::planner::{self, CompensationTask};
use crate::services::{RemoteCall, RemoteDispatcher};
use crate::state::{SagaStatus, StepDirection, StepStatus};

const FORCED_REASON: &str = "compensation requested by operator";

type LiveSagas = Arc<Mutex<HashMap<SagaId, Arc<AtomicBool>>>>;

/// Marks a saga as being driven by this process. Dropping it releases the
/// saga.
struct LiveRegistration {
    live: LiveSagas,
    id: SagaId,
    cancel: Arc<AtomicBool>,
}

impl Drop for LiveRegistration {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

enum ForwardOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Drives sagas from trigger to terminal state.
///
/// Every saga runs in its own task. Steps run strictly in definition order;
/// the instance is persisted before a step is dispatched and again once its
/// outcome is known, so a restarted process can pick up at the first step
/// without a settled record. When a forward step fails, the steps that
/// completed are compensated in reverse order.
pub struct SagaCoordinator<S, D> {
    store: S,
    definitions: Arc<SagaDefinitionRegistry>,
    executor: Arc<StepExecutor<D>>,
    live: LiveSagas,
}

impl<S: Clone, D> Clone for SagaCoordinator<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            definitions: Arc::clone(&self.definitions),
            executor: Arc::clone(&self.executor),
            live: Arc::clone(&self.live),
        }
    }
}

impl<S, D> SagaCoordinator<S, D>
where
    S: SagaLogStore + Clone + 'static,
    D: RemoteDispatcher + 'static,
{
    /// Creates a new saga coordinator.
    pub fn new(store: S, definitions: SagaDefinitionRegistry, executor: StepExecutor<D>) -> Self {
        Self {
            store,
            definitions: Arc::new(definitions),
            executor: Arc::new(executor),
            live: Arc::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn definitions(&self) -> &SagaDefinitionRegistry {
        &self.definitions
    }

    pub fn dispatcher(&self) -> &D {
        self.executor.dispatcher()
    }

    /// Returns true while a task of this process is driving the saga.
    pub fn is_live(&self, id: SagaId) -> bool {
        self.live_sagas().contains_key(&id)
    }

    /// Starts a saga and returns its id without waiting for it to run.
    ///
    /// Fails with `UnknownSagaType` before anything is persisted.
    pub async fn start(&self, saga_type: &str, input: Value) -> Result<SagaId> {
        self.start_with_correlation(saga_type, input, None).await
    }

    /// Starts a saga carrying the given correlation id (one is generated if
    /// absent).
    #[tracing::instrument(skip_all, fields(saga_type = %saga_type))]
    pub async fn start_with_correlation(
        &self,
        saga_type: &str,
        input: Value,
        correlation_id: Option<String>,
    ) -> Result<SagaId> {
        let (saga, definition) = self.create(saga_type, input, correlation_id).await?;
        let id = saga.id();

        if let Some(registration) = self.register(id) {
            self.spawn(saga, definition, registration);
        }
        Ok(id)
    }

    /// Starts a saga and drives it to a terminal state before returning.
    #[tracing::instrument(skip_all, fields(saga_type = %saga_type))]
    pub async fn run(&self, saga_type: &str, input: Value) -> Result<SagaInstance> {
        let (saga, definition) = self.create(saga_type, input, None).await?;
        let Some(registration) = self.register(saga.id()) else {
            return Ok(saga);
        };
        self.drive(saga, definition, &registration.cancel).await
    }

    /// Loads the current state of a saga.
    pub async fn get_status(&self, id: SagaId) -> Result<SagaInstance> {
        let record = self.store.get(id).await?.ok_or(SagaError::NotFound(id))?;
        SagaInstance::from_record(record)
    }

    /// Operator override: stop forward progress and compensate.
    ///
    /// A saga being driven by this process is flagged and switches to
    /// compensation at its next step boundary; an in-flight remote call is
    /// never aborted. Any other non-terminal saga is picked up and
    /// compensated in a new task. Terminal sagas are rejected with
    /// `NotCompensable` and left untouched.
    #[tracing::instrument(skip_all, fields(saga_id = %id))]
    pub async fn force_compensate(&self, id: SagaId) -> Result<()> {
        let saga = self.get_status(id).await?;
        if !saga.status().can_force_compensate() {
            return Err(SagaError::NotCompensable {
                saga_id: id,
                status: saga.status(),
            });
        }

        if let Some(cancel) = self.live_sagas().get(&id) {
            cancel.store(true, Ordering::SeqCst);
            info!("compensation requested for running saga");
            return Ok(());
        }

        let definition = self.definitions.require(saga.saga_type())?;
        match self.register(id) {
            Some(registration) => {
                registration.cancel.store(true, Ordering::SeqCst);
                info!(status = %saga.status(), "compensating idle saga");
                self.spawn(saga, definition, registration);
            }
            None => {
                // picked up by another task since the check above
                if let Some(cancel) = self.live_sagas().get(&id) {
                    cancel.store(true, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    /// Drives an existing saga to a terminal state.
    ///
    /// Terminal sagas and sagas already being driven are returned as loaded.
    #[tracing::instrument(skip_all, fields(saga_id = %id))]
    pub async fn resume(&self, id: SagaId) -> Result<SagaInstance> {
        let saga = self.get_status(id).await?;
        if saga.status().is_terminal() {
            return Ok(saga);
        }
        let definition = self.definitions.require(saga.saga_type())?;
        let Some(registration) = self.register(id) else {
            return Ok(saga);
        };
        self.drive(saga, definition, &registration.cancel).await
    }

    /// Resumes every unfinished saga in the log, each in its own task.
    ///
    /// Called at startup. Returns the ids that were picked up.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<SagaId>> {
        let unfinished = SagaStatus::unfinished().map(|s| s.as_str());
        let records = self
            .store
            .query(SagaLogQuery::for_statuses(unfinished))
            .await?;

        let mut resumed = Vec::new();
        for record in records {
            let id = record.id;
            let saga = match SagaInstance::from_record(record) {
                Ok(saga) => saga,
                Err(e) => {
                    error!(saga_id = %id, error = %e, "unreadable saga record, skipping");
                    continue;
                }
            };
            let definition = match self.definitions.require(saga.saga_type()) {
                Ok(definition) => definition,
                Err(e) => {
                    error!(saga_id = %id, error = %e, "cannot resume saga");
                    continue;
                }
            };
            if let Some(registration) = self.register(id) {
                resumed.push(id);
                self.spawn(saga, definition, registration);
            }
        }

        info!(count = resumed.len(), "resumed unfinished sagas");
        Ok(resumed)
    }

    async fn create(
        &self,
        saga_type: &str,
        input: Value,
        correlation_id: Option<String>,
    ) -> Result<(SagaInstance, Arc<SagaDefinition>)> {
        let definition = self.definitions.require(saga_type)?;
        let correlation_id = correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut saga = SagaInstance::new(saga_type, input, Some(correlation_id));
        self.persist(&mut saga).await?;

        metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string()).increment(1);
        info!(saga_id = %saga.id(), "saga created");
        Ok((saga, definition))
    }

    fn spawn(
        &self,
        saga: SagaInstance,
        definition: Arc<SagaDefinition>,
        registration: LiveRegistration,
    ) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let id = saga.id();
            if let Err(e) = coordinator
                .drive(saga, definition, &registration.cancel)
                .await
            {
                error!(saga_id = %id, error = %e, "saga processing aborted, left in last persisted state");
            }
        });
    }

    fn live_sagas(&self) -> MutexGuard<'_, HashMap<SagaId, Arc<AtomicBool>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims a saga for this process; `None` if it is already claimed.
    fn register(&self, id: SagaId) -> Option<LiveRegistration> {
        let mut live = self.live_sagas();
        if live.contains_key(&id) {
            return None;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        live.insert(id, Arc::clone(&cancel));
        Some(LiveRegistration {
            live: Arc::clone(&self.live),
            id,
            cancel,
        })
    }

    /// Writes the whole instance under the optimistic version check.
    async fn persist(&self, saga: &mut SagaInstance) -> Result<()> {
        let record = saga.to_record()?;
        let version = if saga.version() == Version::initial() {
            self.store.insert(record).await?;
            Version::first()
        } else {
            self.store.update(record, saga.version()).await?
        };
        saga.set_version(version);
        Ok(())
    }

    #[tracing::instrument(
        skip_all,
        fields(saga_id = %saga.id(), saga_type = %saga.saga_type())
    )]
    async fn drive(
        &self,
        mut saga: SagaInstance,
        definition: Arc<SagaDefinition>,
        cancel: &AtomicBool,
    ) -> Result<SagaInstance> {
        if saga.status() == SagaStatus::Pending {
            if cancel.load(Ordering::SeqCst) {
                saga.record_failure(FORCED_REASON);
                saga.transition(SagaStatus::Compensating)?;
            } else {
                saga.transition(SagaStatus::Running)?;
            }
            self.persist(&mut saga).await?;
        }

        if saga.status() == SagaStatus::Running {
            let reason = match self.run_forward(&definition, &mut saga, cancel).await? {
                ForwardOutcome::Completed => {
                    saga.transition(SagaStatus::Completed)?;
                    self.persist(&mut saga).await?;
                    self.record_finished(&saga);
                    info!("saga completed");
                    return Ok(saga);
                }
                ForwardOutcome::Failed(reason) => reason,
                ForwardOutcome::Cancelled => FORCED_REASON.to_string(),
            };

            warn!(reason = %reason, "saga compensating");
            saga.record_failure(reason);
            saga.transition(SagaStatus::Compensating)?;
            self.persist(&mut saga).await?;
        }

        if saga.status() == SagaStatus::Compensating {
            self.run_compensation(&definition, &mut saga).await?;
        }

        Ok(saga)
    }

    async fn run_forward(
        &self,
        definition: &SagaDefinition,
        saga: &mut SagaInstance,
        cancel: &AtomicBool,
    ) -> Result<ForwardOutcome> {
        for step in definition.steps() {
            let index = match saga.pending_step(&step.name, StepDirection::Forward) {
                Some(index) => {
                    info!(step = %step.name, "re-dispatching step left in flight");
                    index
                }
                None => {
                    match saga.forward_record(&step.name) {
                        Some(record) if record.status == StepStatus::Succeeded => continue,
                        Some(record) => {
                            let reason = record
                                .error
                                .clone()
                                .unwrap_or_else(|| format!("step '{}' failed", step.name));
                            return Ok(ForwardOutcome::Failed(reason));
                        }
                        None => {}
                    }
                    if cancel.load(Ordering::SeqCst) {
                        info!(step = %step.name, "forward progress stopped by operator");
                        return Ok(ForwardOutcome::Cancelled);
                    }
                    let index = saga.begin_step(&step.name, StepDirection::Forward);
                    self.persist(saga).await?;
                    index
                }
            };

            info!(step = %step.name, "saga step started");
            match self.execute_action(saga, index, &step.forward).await {
                StepOutcome::Succeeded(output) => {
                    if let Err(e) = saga.succeed_step(index, output) {
                        saga.fail_step(index, e.to_string());
                        return Ok(ForwardOutcome::Failed(format!(
                            "step '{}' failed: {e}",
                            step.name
                        )));
                    }
                    self.persist(saga).await?;
                    info!(step = %step.name, "saga step succeeded");
                    // A request that arrived while the step was in flight
                    // still applies, even after the last step.
                    if cancel.load(Ordering::SeqCst) {
                        info!(step = %step.name, "forward progress stopped by operator");
                        return Ok(ForwardOutcome::Cancelled);
                    }
                }
                StepOutcome::Failed(reason) => {
                    warn!(step = %step.name, reason = %reason, "saga step failed");
                    saga.fail_step(index, reason.clone());
                    return Ok(ForwardOutcome::Failed(format!(
                        "step '{}' failed: {reason}",
                        step.name
                    )));
                }
            }
        }
        Ok(ForwardOutcome::Completed)
    }

    async fn run_compensation(
        &self,
        definition: &SagaDefinition,
        saga: &mut SagaInstance,
    ) -> Result<()> {
        for task in planner::plan(definition, saga) {
            match task {
                CompensationTask::Skip { step_name } => {
                    info!(step = %step_name, "no compensation defined, skipped");
                    saga.skip_compensation(&step_name);
                }
                CompensationTask::Undefined { step_name } => {
                    let failure = SagaError::CompensationFailure {
                        step: step_name.clone(),
                        reason: "step is not part of the saga definition".to_string(),
                    };
                    error!(error = %failure, "compensation failed");
                    let index = saga.begin_step(&step_name, StepDirection::Compensate);
                    saga.fail_step(index, failure.to_string());
                }
                CompensationTask::Compensate { step_name, action } => {
                    let index = match saga.pending_step(&step_name, StepDirection::Compensate) {
                        Some(index) => index,
                        None => {
                            let index = saga.begin_step(&step_name, StepDirection::Compensate);
                            self.persist(saga).await?;
                            index
                        }
                    };

                    info!(step = %step_name, "compensation started");
                    match self.execute_action(saga, index, &action).await {
                        StepOutcome::Succeeded(output) => {
                            saga.succeed_step(index, output)?;
                            info!(step = %step_name, "compensation succeeded");
                        }
                        // Compensation failures don't stop the chain
                        StepOutcome::Failed(reason) => {
                            let failure = SagaError::CompensationFailure {
                                step: step_name.clone(),
                                reason: reason.clone(),
                            };
                            error!(error = %failure, "compensation failed");
                            saga.fail_step(index, reason);
                        }
                    }
                }
            }
            self.persist(saga).await?;
        }

        if saga.has_failed_compensation() {
            saga.transition(SagaStatus::Failed)?;
            error!("saga failed, manual intervention required");
        } else {
            saga.transition(SagaStatus::Compensated)?;
            info!("saga compensated");
        }
        self.persist(saga).await?;
        self.record_finished(saga);
        Ok(())
    }

    async fn execute_action(
        &self,
        saga: &mut SagaInstance,
        index: usize,
        action: &RemoteAction,
    ) -> StepOutcome {
        let arguments = match binding::resolve(action.bindings(), saga.context()) {
            Ok(arguments) => arguments,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };

        let record = &saga.steps()[index];
        let call = RemoteCall {
            saga_id: saga.id(),
            correlation_id: saga.correlation_id().map(str::to_string),
            step_name: record.step_name.clone(),
            direction: record.direction,
            operation: action.operation(),
            arguments,
            attempt: 0,
        };
        self.executor.execute(call, saga.attempts_mut(index)).await
    }

    fn record_finished(&self, saga: &SagaInstance) {
        let name = match saga.status() {
            SagaStatus::Completed => "saga_completed_total",
            SagaStatus::Compensated => "saga_compensated_total",
            SagaStatus::Failed => "saga_failed_total",
            _ => return,
        };
        let saga_type = saga.saga_type().to_string();
        metrics::counter!(name, "saga_type" => saga_type.clone()).increment(1);

        let elapsed = (Utc::now() - saga.created_at()).num_milliseconds().max(0) as f64 / 1000.0;
        metrics::histogram!(
            "saga_duration_seconds",
            "saga_type" => saga_type,
            "status" => saga.status().as_str()
        )
        .record(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use saga_log::InMemorySagaLogStore;
    use serde_json::json;

    use super::*;
    use crate::definition::{Operation, StepDefinition};
    use crate::retry::RetryPolicy;
    use crate::services::InMemoryServices;

    type TestCoordinator = SagaCoordinator<InMemorySagaLogStore, InMemoryServices>;

    fn setup() -> (TestCoordinator, InMemorySagaLogStore, InMemoryServices) {
        let store = InMemorySagaLogStore::new();
        let services = InMemoryServices::new();
        let definitions = SagaDefinitionRegistry::new()
            .with(
                SagaDefinition::new("content-only")
                    .step(
                        StepDefinition::new(
                            "create-content",
                            RemoteAction::new(Operation::CreateContent)
                                .bind("title", "/input/title"),
                        )
                        .compensate_with(
                            RemoteAction::new(Operation::DeleteContent)
                                .bind("content_id", "/create-content/content_id"),
                        ),
                    )
                    .step(StepDefinition::new(
                        "record-metrics",
                        RemoteAction::new(Operation::RecordMetrics)
                            .bind("content_id", "/create-content/content_id"),
                    )),
            )
            .unwrap();
        let executor = StepExecutor::new(
            services.clone(),
            RetryPolicy::immediate(1),
            RetryPolicy::immediate(1),
        );
        (
            SagaCoordinator::new(store.clone(), definitions, executor),
            store,
            services,
        )
    }

    #[tokio::test]
    async fn test_run_completes_and_persists() {
        let (coordinator, store, services) = setup();

        let saga = coordinator
            .run("content-only", json!({"title": "Guide"}))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.steps().len(), 2);
        assert_eq!(services.metrics_count(), 1);
        assert!(!coordinator.is_live(saga.id()));

        let stored = coordinator.get_status(saga.id()).await.unwrap();
        assert_eq!(stored.status(), SagaStatus::Completed);
        assert_eq!(stored.version(), saga.version());
        assert_eq!(store.saga_count().await, 1);
    }

    #[tokio::test]
    async fn test_binding_error_fails_without_remote_call() {
        let (coordinator, _, services) = setup();

        let saga = coordinator
            .run("content-only", json!({"no_title": true}))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        let record = saga.forward_record("create-content").unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert!(record.attempts.is_empty());
        assert!(services.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_persists_nothing() {
        let (coordinator, store, _) = setup();

        let result = coordinator.start("nope", json!({})).await;

        assert!(matches!(result, Err(SagaError::UnknownSagaType(_))));
        assert_eq!(store.saga_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let (coordinator, _, _) = setup();
        let result = coordinator.get_status(SagaId::new()).await;
        assert!(matches!(result, Err(SagaError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_compensation_ends_failed() {
        let (coordinator, _, services) = setup();
        services.fail_permanently(Operation::RecordMetrics, "monitoring rejected");
        services.fail_permanently(Operation::DeleteContent, "content locked");

        let saga = coordinator
            .run("content-only", json!({"title": "Guide"}))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(saga.has_failed_compensation());
        assert!(saga.failure_reason().unwrap().contains("monitoring rejected"));
        assert_eq!(services.content_count(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_aborts_and_resume_finishes() {
        let (coordinator, store, services) = setup();
        store.set_fail_on_update(true);

        let result = coordinator
            .run("content-only", json!({"title": "Guide"}))
            .await;
        assert!(matches!(result, Err(SagaError::Store(_))));
        assert!(services.calls().is_empty());

        let records = store.query(SagaLogQuery::new()).await.unwrap();
        let id = records[0].id;
        assert_eq!(records[0].status, "PENDING");

        store.set_fail_on_update(false);
        let saga = coordinator.resume(id).await.unwrap();
        assert_eq!(saga.status(), SagaStatus::Completed);
    }
}
