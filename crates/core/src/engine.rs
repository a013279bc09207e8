//! The Engine: lifecycle operations (execute/cancel/pause/resume/history),
//! admission control, and the per-execution scheduling loop that drives a
//! `WorkflowExecution` from its entry steps to a terminal status.

use crate::events::{TimelineEvent, TimelineEventType};
use crate::monitor::Monitor;
use crate::notifier::{NotificationPayload, Notifier};
use crate::registry::ProcessorRegistry;
use crate::storage::WorkflowRepository;
use crate::types::{
    ErrorKind, ExecutionError, ExecutionId, ExecutionStatus, StepExecution, StepId, StepStatus,
    TriggerType, WorkflowDefaultAction, WorkflowDefinition, WorkflowExecution, WorkflowId,
};
use crate::workflow::dag::WorkflowDag;
use crate::workflow::scheduler::{Scheduler, SchedulerDecision};
use crate::workflow::step_runner::StepRunner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;

/// A typed error raised by the engine's public lifecycle operations. Matches
/// spec.md §7's propagation policy: only `NotFound`, `ConfigurationError`
/// and `ResourceExhausted` are ever surfaced to `execute_workflow`'s caller;
/// everything else is absorbed into execution/step state.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorKind::PersistenceError, err.to_string())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_executions: usize,
    pub default_workflow_timeout_secs: u64,
    pub max_retry_backoff_secs: u64,
    /// spec.md §9 open question #1: when `true`, a condition expression the
    /// evaluator can't parse is a `ConfigurationError` instead of the
    /// permissive legacy default of "gate open, log a warning".
    pub strict_expressions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            default_workflow_timeout_secs: 3600,
            max_retry_backoff_secs: 300,
            strict_expressions: false,
        }
    }
}

/// Either an existing workflow to look up, or an ad hoc definition submitted
/// alongside the execution request (saved as a new version before running).
pub enum WorkflowRef {
    Latest(WorkflowId),
    Versioned(WorkflowId, u32),
    Definition(WorkflowDefinition),
}

struct ExecutionControl {
    cancel_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    // Tracks whether a Paused status has actually been persisted, so
    // concurrent/duplicate pause or resume calls are idempotent rather than
    // double-emitting timeline events or re-bumping the revision.
    paused: std::sync::atomic::AtomicBool,
    // Held for the execution's lifetime; dropping it returns the admission
    // permit to the semaphore.
    _permit: OwnedSemaphorePermit,
}

pub struct Engine {
    config: EngineConfig,
    repository: Arc<dyn WorkflowRepository>,
    monitor: Arc<dyn Monitor>,
    step_runner: Arc<StepRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    admission: Arc<Semaphore>,
    active: RwLock<HashMap<ExecutionId, ExecutionControl>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn WorkflowRepository>,
        monitor: Arc<dyn Monitor>,
        registry: ProcessorRegistry,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_executions));
        let step_runner = Arc::new(
            StepRunner::new(
                Arc::new(MonitorEventLog(monitor.clone())),
                Arc::new(registry),
                config.max_retry_backoff_secs,
            )
            .with_strict_expressions(config.strict_expressions),
        );

        Self {
            config,
            repository,
            monitor,
            step_runner,
            notifier,
            admission,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a minimal sample workflow if the repository is empty.
    /// Best-effort: a seeding failure is logged and never fails construction
    /// (spec.md §5 "Startup").
    pub async fn ensure_seed_workflow(&self) {
        match self.repository.list_workflows(0, 1).await {
            Ok(workflows) if workflows.is_empty() => {
                let definition = sample_workflow();
                if let Err(err) = self.repository.save_workflow(definition).await {
                    tracing::warn!("failed to seed sample workflow: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("failed to check for existing workflows while seeding: {}", err),
        }
    }

    pub async fn execute_workflow(
        self: &Arc<Self>,
        workflow_ref: WorkflowRef,
        params: serde_json::Value,
        trigger_type: TriggerType,
    ) -> Result<WorkflowExecution, EngineError> {
        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::new(ErrorKind::ResourceExhausted, "no admission permit available"))?;

        let definition = self.resolve_definition(workflow_ref).await?;

        let dag = WorkflowDag::from_definition(&definition)
            .map_err(|err| EngineError::new(ErrorKind::ConfigurationError, err.to_string()))?;

        let mut execution = WorkflowExecution::new(
            definition.id.clone(),
            definition.version,
            trigger_type,
            params,
        );
        if let Some(seed) = &definition.variables {
            execution.variables = seed.clone();
        }
        execution.status = ExecutionStatus::Running;
        for step in &definition.steps {
            execution
                .step_executions
                .insert(step.id.0.clone(), StepExecution::new(step.id.clone()));
        }

        self.repository.save_execution(execution.clone()).await?;
        self.monitor
            .record_timeline_event(TimelineEvent::new(
                execution.id,
                TimelineEventType::WorkflowStarted {
                    workflow_id: definition.id.clone(),
                    workflow_version: definition.version,
                },
            ))
            .await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        self.active.write().await.insert(
            execution.id,
            ExecutionControl {
                cancel_tx,
                pause_tx,
                paused: std::sync::atomic::AtomicBool::new(false),
                _permit: permit,
            },
        );

        let engine = self.clone();
        let snapshot = execution.clone();
        tokio::spawn(async move {
            engine.run_scheduling_loop(execution, definition, dag, cancel_rx, pause_rx).await;
        });

        Ok(snapshot)
    }

    async fn resolve_definition(&self, workflow_ref: WorkflowRef) -> Result<WorkflowDefinition, EngineError> {
        match workflow_ref {
            WorkflowRef::Latest(id) => self
                .repository
                .get_workflow(&id, None)
                .await?
                .ok_or_else(|| EngineError::new(ErrorKind::NotFound, format!("workflow {} not found", id))),
            WorkflowRef::Versioned(id, version) => self
                .repository
                .get_workflow(&id, Some(version))
                .await?
                .ok_or_else(|| {
                    EngineError::new(ErrorKind::NotFound, format!("workflow {}@{} not found", id, version))
                }),
            WorkflowRef::Definition(definition) => {
                self.repository.save_workflow(definition.clone()).await?;
                Ok(definition)
            }
        }
    }

    pub async fn get_execution_status(&self, id: ExecutionId) -> Result<WorkflowExecution, EngineError> {
        self.repository
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, format!("execution {} not found", id)))
    }

    /// Returns `false` (rather than an error) for an unknown or already
    /// terminal execution, per spec.md §8's idempotence properties.
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<bool, EngineError> {
        let active = self.active.read().await;
        let Some(control) = active.get(&id) else {
            return Ok(false);
        };
        control.cancel_tx.send(true).ok();
        Ok(true)
    }

    pub async fn pause_execution(&self, id: ExecutionId) -> Result<bool, EngineError> {
        let active = self.active.read().await;
        let Some(control) = active.get(&id) else {
            return Ok(false);
        };
        if control
            .paused
            .compare_exchange(false, true, std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst)
            .is_err()
        {
            // Already paused: idempotent no-op.
            return Ok(true);
        }

        let Some(mut execution) = self.repository.get_execution(id).await? else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Running {
            control.paused.store(false, std::sync::atomic::Ordering::SeqCst);
            return Ok(false);
        }

        execution.status = ExecutionStatus::Paused;
        execution.revision += 1;
        self.repository.save_execution(execution).await?;
        self.monitor
            .record_timeline_event(TimelineEvent::new(id, TimelineEventType::WorkflowPaused))
            .await?;

        control.pause_tx.send(true).ok();
        Ok(true)
    }

    pub async fn resume_execution(&self, id: ExecutionId) -> Result<bool, EngineError> {
        let active = self.active.read().await;
        let Some(control) = active.get(&id) else {
            return Ok(false);
        };
        if control
            .paused
            .compare_exchange(true, false, std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst)
            .is_err()
        {
            // Not currently paused: idempotent no-op.
            return Ok(false);
        }

        let Some(mut execution) = self.repository.get_execution(id).await? else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Paused {
            control.paused.store(true, std::sync::atomic::Ordering::SeqCst);
            return Ok(false);
        }

        execution.status = ExecutionStatus::Running;
        execution.revision += 1;
        self.repository.save_execution(execution).await?;
        self.monitor
            .record_timeline_event(TimelineEvent::new(id, TimelineEventType::WorkflowResumed))
            .await?;

        control.pause_tx.send(false).ok();
        Ok(true)
    }

    pub async fn get_execution_history(
        &self,
        workflow_id: &WorkflowId,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self
            .repository
            .get_recent_executions(Some(workflow_id.clone()), limit)
            .await?)
    }

    async fn run_scheduling_loop(
        self: Arc<Self>,
        mut execution: WorkflowExecution,
        definition: WorkflowDefinition,
        dag: WorkflowDag,
        mut cancel_rx: watch::Receiver<bool>,
        mut pause_rx: watch::Receiver<bool>,
    ) {
        let budget = Duration::from_secs(self.config.default_workflow_timeout_secs);
        let timed_out = tokio::time::timeout(
            budget,
            self.drive_execution(
                &mut execution,
                &dag,
                definition.error_handling.max_errors,
                &mut cancel_rx,
                &mut pause_rx,
            ),
        )
        .await
        .is_err();

        if timed_out {
            execution
                .errors
                .push(ExecutionError::new(ErrorKind::Timeout, "execution exceeded its timeout budget"));
        }

        self.finalize(execution, &definition, timed_out, *cancel_rx.borrow()).await;
    }

    async fn drive_execution(
        &self,
        execution: &mut WorkflowExecution,
        dag: &WorkflowDag,
        max_errors: u32,
        cancel_rx: &mut watch::Receiver<bool>,
        pause_rx: &mut watch::Receiver<bool>,
    ) {
        let mut running: JoinSet<(StepId, anyhow::Result<crate::workflow::step_runner::StepRunOutcome>)> =
            JoinSet::new();

        loop {
            if *cancel_rx.borrow() {
                break;
            }

            let paused = *pause_rx.borrow();
            if !paused {
                match Scheduler::next_batch(dag, execution) {
                    SchedulerDecision::Ready(ready_ids) => {
                        for step_id in ready_ids {
                            let Some(step) = dag.step(&step_id).cloned() else { continue };
                            if let Some(se) = execution.step_executions.get_mut(&step_id.0) {
                                se.status = StepStatus::Running;
                            }

                            let runner = self.step_runner.clone();
                            let execution_snapshot = execution.clone();
                            let dag_for_task = dag_clone_for_task(dag);
                            let step_cancel_rx = cancel_rx.clone();
                            running.spawn(async move {
                                let outcome = runner
                                    .run_step(&execution_snapshot, &dag_for_task, &step, step_cancel_rx)
                                    .await;
                                (step_id, outcome)
                            });
                        }
                    }
                    SchedulerDecision::Wait => {}
                    SchedulerDecision::Done => {
                        if running.is_empty() {
                            break;
                        }
                    }
                }
            }

            if running.is_empty() {
                if paused {
                    // Nothing in flight while paused: just wait for resume
                    // or cancellation rather than busy-looping.
                    tokio::select! {
                        _ = cancel_rx.changed() => continue,
                        _ = pause_rx.changed() => continue,
                    }
                }
                if matches!(Scheduler::next_batch(dag, execution), SchedulerDecision::Done) {
                    break;
                }
            }

            tokio::select! {
                joined = running.join_next(), if !running.is_empty() => {
                    if let Some(Ok((step_id, outcome))) = joined {
                        self.apply_step_outcome(execution, &step_id, outcome).await;
                    }
                }
                _ = cancel_rx.changed() => {}
                _ = pause_rx.changed() => {}
            }

            if execution.errors.len() as u32 >= max_errors {
                execution.status = ExecutionStatus::Failed;
                break;
            }
        }

        // Cancellation observed: let in-flight steps finish rather than
        // abandoning them, per spec.md §5.
        while let Some(Ok((step_id, outcome))) = running.join_next().await {
            self.apply_step_outcome(execution, &step_id, outcome).await;
        }
    }

    async fn apply_step_outcome(
        &self,
        execution: &mut WorkflowExecution,
        step_id: &StepId,
        outcome: anyhow::Result<crate::workflow::step_runner::StepRunOutcome>,
    ) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!("step runner task for {} panicked or errored: {}", step_id, err);
                let mut step_execution = StepExecution::new(step_id.clone());
                step_execution.status = StepStatus::Failed;
                let error = ExecutionError::new(ErrorKind::ProcessorError, err.to_string()).with_step(step_id.clone());
                execution.errors.push(error.clone());
                step_execution.error = Some(error);
                execution.step_executions.insert(step_id.0.clone(), step_execution);
                return;
            }
        };

        if let Some(error) = &outcome.step_execution.error {
            execution.errors.push(error.clone());
        }
        if let Some(value) = outcome.effective_output {
            execution.step_outputs.insert(step_id.0.clone(), value);
        }
        execution
            .step_executions
            .insert(step_id.0.clone(), outcome.step_execution);

        self.repository
            .update_step_execution(
                execution.id,
                execution.step_executions.get(&step_id.0).cloned().unwrap(),
            )
            .await
            .ok();

        if let Some(reset_id) = outcome.reset_step_id {
            let fresh = StepExecution::new(reset_id.clone());
            execution.step_executions.insert(reset_id.0.clone(), fresh.clone());
            self.repository.update_step_execution(execution.id, fresh).await.ok();
        }

        if outcome.stop_workflow {
            execution.status = ExecutionStatus::Failed;
        }
    }

    async fn finalize(
        &self,
        mut execution: WorkflowExecution,
        definition: &WorkflowDefinition,
        timed_out: bool,
        cancelled: bool,
    ) {
        // A step left Failed by a masking ExecuteFallback or a non-stopping
        // ContinueWorkflow policy doesn't by itself fail the run — only an
        // unresolved step (one the scheduler could never reach) does, and
        // only `apply_step_outcome` setting `Failed` via a `StopWorkflow`
        // policy is a hard stop.
        let any_unresolved = execution
            .step_executions
            .values()
            .any(|se| matches!(se.status, StepStatus::NotStarted | StepStatus::Waiting | StepStatus::Running));

        execution.status = if timed_out {
            ExecutionStatus::Failed
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else if execution.status == ExecutionStatus::Failed {
            ExecutionStatus::Failed
        } else if any_unresolved {
            if definition.error_handling.default_action == WorkflowDefaultAction::ContinueOnError {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            }
        } else {
            ExecutionStatus::Completed
        };

        execution.completed_at = Some(chrono::Utc::now());

        // The in-memory `execution` we've been threading through the
        // scheduling loop doesn't see the revision bumps `update_step_execution`
        // and pause/resume have been applying directly on disk. Refetch and
        // take the higher revision so this terminal write isn't silently
        // dropped by `save_execution`'s optimistic-concurrency check.
        if let Ok(Some(stored)) = self.repository.get_execution(execution.id).await {
            execution.revision = execution.revision.max(stored.revision);
        }
        execution.revision += 1;

        let duration_ms = (execution.completed_at.unwrap() - execution.started_at)
            .num_milliseconds()
            .max(0) as u64;

        let event_type = match execution.status {
            ExecutionStatus::Completed => TimelineEventType::WorkflowCompleted { duration_ms },
            ExecutionStatus::Cancelled => TimelineEventType::WorkflowCancelled {
                reason: "cancellation requested".to_string(),
            },
            _ => TimelineEventType::WorkflowFailed {
                error: execution
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| ExecutionError::new(ErrorKind::ProcessorError, "execution failed")),
                duration_ms,
            },
        };

        if self.monitor.record_timeline_event(TimelineEvent::new(execution.id, event_type)).await.is_err() {
            tracing::warn!("failed to record terminal timeline event for execution {}", execution.id);
        }

        if let Err(err) = self.repository.save_execution(execution.clone()).await {
            tracing::error!("failed to persist terminal execution {}: {}", execution.id, err);
        }

        if self.monitor.update_workflow_metrics(&execution).await.is_err() {
            tracing::warn!("failed to update metrics for workflow {}", execution.workflow_id);
        }

        self.active.write().await.remove(&execution.id);

        if definition.error_handling.notify_on_error || execution.status == ExecutionStatus::Completed {
            if let Some(notifier) = &self.notifier {
                let subject = format!("workflow {} {:?}", execution.workflow_id, execution.status);
                let message = match execution.errors.last() {
                    Some(err) => err.message.clone(),
                    None => "completed successfully".to_string(),
                };
                notifier
                    .notify(NotificationPayload::new(
                        execution.id,
                        execution.workflow_id.clone(),
                        subject,
                        message,
                        execution.status,
                    ))
                    .await;
            }
        }

        tracing::info!("execution {} terminated with status {:?}", execution.id, execution.status);
    }
}

/// Rebuilding the DAG per spawned step task avoids sharing `&WorkflowDag`
/// across task boundaries (it isn't `'static`); the DAG is pure data derived
/// from the definition, so cloning is cheap relative to a step's own work.
fn dag_clone_for_task(dag: &WorkflowDag) -> WorkflowDag {
    dag.clone()
}

/// Adapts a `Monitor` to the `EventLog` trait the `StepRunner` expects,
/// so every timeline event emitted mid-step also flows through metrics
/// aggregation instead of needing two handles threaded through the runner.
struct MonitorEventLog(Arc<dyn Monitor>);

#[async_trait::async_trait]
impl crate::events::EventLog for MonitorEventLog {
    async fn append(&self, event: TimelineEvent) -> anyhow::Result<()> {
        self.0.record_timeline_event(event).await
    }

    async fn get_execution_events(&self, execution_id: ExecutionId) -> anyhow::Result<Vec<TimelineEvent>> {
        self.0.get_timeline_events(execution_id, usize::MAX).await
    }

    async fn get_execution_events_range(
        &self,
        execution_id: ExecutionId,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<TimelineEvent>> {
        let events = self.0.get_timeline_events(execution_id, usize::MAX).await?;
        Ok(events.into_iter().filter(|e| e.timestamp >= start && e.timestamp <= end).collect())
    }
}

fn sample_workflow() -> WorkflowDefinition {
    use crate::types::{Step, StepErrorHandling, StepType};

    let extract = Step {
        id: StepId::new("extract"),
        name: "Extract sample data".to_string(),
        step_type: StepType::Extract,
        depends_on: vec![],
        condition: None,
        error_handling: StepErrorHandling::default(),
        configuration: serde_json::json!({}),
    };
    let transform = Step {
        id: StepId::new("transform"),
        name: "Transform sample data".to_string(),
        step_type: StepType::Transform,
        depends_on: vec![StepId::new("extract")],
        condition: None,
        error_handling: StepErrorHandling::default(),
        configuration: serde_json::json!({}),
    };
    let load = Step {
        id: StepId::new("load"),
        name: "Load sample data".to_string(),
        step_type: StepType::Load,
        depends_on: vec![StepId::new("transform")],
        condition: None,
        error_handling: StepErrorHandling::default(),
        configuration: serde_json::json!({}),
    };

    WorkflowDefinition {
        id: WorkflowId::new("sample-etl-pipeline"),
        version: 1,
        name: "Sample ETL Pipeline".to_string(),
        description: Some("Extract, transform, then load a small sample dataset.".to_string()),
        steps: vec![extract, transform, load],
        error_handling: crate::types::WorkflowErrorHandling::stop_on_first_error(),
        variables: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}
