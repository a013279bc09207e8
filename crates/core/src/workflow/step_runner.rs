use crate::events::{EventLog, TimelineEvent, TimelineEventType};
use crate::registry::{ProcessorRegistry, StepContext};
use crate::types::{
    ErrorAction, ErrorKind, ExecutionError, Step, StepExecution, StepId, StepOutput, StepStatus, WorkflowExecution,
};
use crate::workflow::condition::{ConditionEvaluator, EvalContext, EvalOutcome};
use crate::workflow::dag::WorkflowDag;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// A step's audit record plus the value its dependents should see. `skipped`
/// and `continued` steps carry `Null`/`None` in `effective_output` rather
/// than a real value.
pub struct StepRunOutcome {
    pub step_execution: StepExecution,
    pub effective_output: Option<Value>,
    /// Set when this step's exhausted error policy is `StopWorkflow` (or
    /// `RetryStep` with no retries left): the engine should halt scheduling
    /// and fail the run.
    pub stop_workflow: bool,
    /// Set by `ExecuteFallback`: the id of the fallback step the engine
    /// should reset to `NotStarted` so the scheduler picks it up as an
    /// ordinary DAG node, rather than this step running it directly.
    pub reset_step_id: Option<StepId>,
}

/// Runs a single step to completion: condition gate, input gathering,
/// processor dispatch, timeout, retry/backoff, and the five error policies.
pub struct StepRunner {
    event_log: Arc<dyn EventLog>,
    registry: Arc<ProcessorRegistry>,
    max_retry_backoff_secs: u64,
    /// When set, a condition expression the evaluator can't parse fails the
    /// step with a `ConfigurationError` instead of the legacy default of
    /// gating open with a warning.
    strict_expressions: bool,
}

impl StepRunner {
    pub fn new(event_log: Arc<dyn EventLog>, registry: Arc<ProcessorRegistry>, max_retry_backoff_secs: u64) -> Self {
        Self {
            event_log,
            registry,
            max_retry_backoff_secs,
            strict_expressions: false,
        }
    }

    pub fn with_strict_expressions(mut self, strict: bool) -> Self {
        self.strict_expressions = strict;
        self
    }

    pub async fn run_step(
        &self,
        execution: &WorkflowExecution,
        dag: &WorkflowDag,
        step: &Step,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<StepRunOutcome> {
        if let Some(condition) = &step.condition {
            let ctx = EvalContext {
                params: &execution.params,
                variables: &execution.variables,
                step_outputs: &execution.step_outputs,
            };
            let gate_open = match ConditionEvaluator::evaluate(condition, &ctx) {
                EvalOutcome::Resolved(value) => value,
                EvalOutcome::UnknownDefaultedTrue if self.strict_expressions => {
                    let error = ExecutionError::new(
                        ErrorKind::ConfigurationError,
                        format!("condition on step {} could not be evaluated", step.id),
                    )
                    .with_step(step.id.clone());
                    self.event_log
                        .append(
                            TimelineEvent::new(execution.id, TimelineEventType::ErrorOccurred { error: error.clone() })
                                .for_step(step.id.clone()),
                        )
                        .await?;

                    let mut step_execution = StepExecution::new(step.id.clone());
                    step_execution.status = StepStatus::Failed;
                    step_execution.error = Some(error);
                    return Ok(StepRunOutcome {
                        step_execution,
                        effective_output: None,
                        stop_workflow: true,
                        reset_step_id: None,
                    });
                }
                EvalOutcome::UnknownDefaultedTrue => {
                    self.event_log
                        .append(TimelineEvent::new(
                            execution.id,
                            TimelineEventType::WarningOccurred {
                                message: format!(
                                    "condition on step {} could not be evaluated; proceeding",
                                    step.id
                                ),
                            },
                        ))
                        .await?;
                    true
                }
            };

            if !gate_open {
                self.event_log
                    .append(
                        TimelineEvent::new(
                            execution.id,
                            TimelineEventType::StepSkipped {
                                step_id: step.id.clone(),
                                reason: "condition evaluated to false".to_string(),
                            },
                        )
                        .for_step(step.id.clone()),
                    )
                    .await?;

                let now = chrono::Utc::now();
                let mut step_execution = StepExecution::new(step.id.clone());
                step_execution.status = StepStatus::Skipped;
                step_execution.started_at = Some(now);
                step_execution.completed_at = Some(now);
                return Ok(StepRunOutcome {
                    step_execution,
                    effective_output: Some(Value::Null),
                    stop_workflow: false,
                    reset_step_id: None,
                });
            }
        }

        self.attempt_with_retries(execution, dag, step, 1, cancel_rx).await
    }

    fn attempt_with_retries<'a>(
        &'a self,
        execution: &'a WorkflowExecution,
        dag: &'a WorkflowDag,
        step: &'a Step,
        attempt: u32,
        cancel_rx: watch::Receiver<bool>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<StepRunOutcome>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!("executing step {} (attempt {}) for execution {}", step.id, attempt, execution.id);

            self.event_log
                .append(
                    TimelineEvent::new(
                        execution.id,
                        TimelineEventType::StepStarted {
                            step_id: step.id.clone(),
                            attempt,
                        },
                    )
                    .for_step(step.id.clone()),
                )
                .await?;

            let inputs = self.gather_inputs(execution, step);
            let timeout_secs = step
                .configuration
                .get("timeout_seconds")
                .and_then(Value::as_u64);

            let started_at = chrono::Utc::now();
            let start = std::time::Instant::now();
            let dispatch_fut = self.dispatch(execution, step, inputs.clone(), cancel_rx.clone());
            let result = match timeout_secs {
                Some(secs) => match timeout(Duration::from_secs(secs), dispatch_fut).await {
                    Ok(inner) => inner,
                    Err(_) => Err(ExecutionError::new(
                        ErrorKind::Timeout,
                        format!("step timed out after {} seconds", secs),
                    )
                    .with_step(step.id.clone())),
                },
                None => dispatch_fut.await,
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    self.event_log
                        .append(
                            TimelineEvent::new(
                                execution.id,
                                TimelineEventType::StepCompleted {
                                    step_id: step.id.clone(),
                                    duration_ms,
                                },
                            )
                            .for_step(step.id.clone()),
                        )
                        .await?;

                    let mut step_execution = StepExecution::new(step.id.clone());
                    step_execution.status = StepStatus::Completed;
                    step_execution.attempt = attempt;
                    step_execution.started_at = Some(started_at);
                    step_execution.completed_at = Some(chrono::Utc::now());
                    step_execution.input = inputs;
                    step_execution.output = Some(output.clone());

                    Ok(StepRunOutcome {
                        step_execution,
                        effective_output: Some(output.result),
                        stop_workflow: false,
                        reset_step_id: None,
                    })
                }
                Err(error) => {
                    self.handle_failure(execution, dag, step, attempt, started_at, inputs, error, cancel_rx)
                        .await
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        execution: &WorkflowExecution,
        dag: &WorkflowDag,
        step: &Step,
        attempt: u32,
        started_at: chrono::DateTime<chrono::Utc>,
        inputs: HashMap<String, Value>,
        error: ExecutionError,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<StepRunOutcome> {
        let policy = &step.error_handling;
        let can_retry = matches!(policy.on_error, ErrorAction::RetryStep) && attempt <= policy.max_retries;

        self.event_log
            .append(
                TimelineEvent::new(
                    execution.id,
                    TimelineEventType::StepFailed {
                        step_id: step.id.clone(),
                        error: error.clone(),
                        attempt,
                        will_retry: can_retry,
                    },
                )
                .for_step(step.id.clone()),
            )
            .await?;

        self.event_log
            .append(
                TimelineEvent::new(execution.id, TimelineEventType::ErrorOccurred { error: error.clone() })
                    .for_step(step.id.clone()),
            )
            .await?;

        if can_retry {
            let backoff_secs = (policy.retry_backoff_secs * 2_u64.pow(attempt - 1)).min(self.max_retry_backoff_secs);
            self.event_log
                .append(
                    TimelineEvent::new(
                        execution.id,
                        TimelineEventType::StepRetrying {
                            step_id: step.id.clone(),
                            attempt: attempt + 1,
                            backoff_secs,
                        },
                    )
                    .for_step(step.id.clone()),
                )
                .await?;

            // A cancellation observed during the backoff sleep ends the step
            // here rather than starting another attempt (spec.md §8:
            // "Cancellation during retryInterval sleep ⇒ execution
            // terminates Cancelled before next attempt").
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                _ = cancel_rx.changed() => {
                    let mut step_execution = StepExecution::new(step.id.clone());
                    step_execution.attempt = attempt;
                    step_execution.started_at = Some(started_at);
                    step_execution.completed_at = Some(chrono::Utc::now());
                    step_execution.input = inputs;
                    step_execution.status = StepStatus::Cancelled;
                    step_execution.error = Some(error);
                    return Ok(StepRunOutcome {
                        step_execution,
                        effective_output: None,
                        stop_workflow: false,
                        reset_step_id: None,
                    });
                }
            }
            return self
                .attempt_with_retries(execution, dag, step, attempt + 1, cancel_rx)
                .await;
        }

        let mut step_execution = StepExecution::new(step.id.clone());
        step_execution.attempt = attempt;
        step_execution.started_at = Some(started_at);
        step_execution.completed_at = Some(chrono::Utc::now());
        step_execution.input = inputs;
        step_execution.error = Some(error.clone());

        match policy.on_error {
            ErrorAction::StopWorkflow => {
                step_execution.status = StepStatus::Failed;
                Ok(StepRunOutcome {
                    step_execution,
                    effective_output: None,
                    stop_workflow: true,
                    reset_step_id: None,
                })
            }
            ErrorAction::ContinueWorkflow => {
                step_execution.status = StepStatus::Failed;
                Ok(StepRunOutcome {
                    step_execution,
                    effective_output: None,
                    stop_workflow: false,
                    reset_step_id: None,
                })
            }
            ErrorAction::SkipStep => {
                step_execution.status = StepStatus::Skipped;
                self.event_log
                    .append(
                        TimelineEvent::new(
                            execution.id,
                            TimelineEventType::StepSkipped {
                                step_id: step.id.clone(),
                                reason: format!("step failed and onError is SkipStep: {}", error.message),
                            },
                        )
                        .for_step(step.id.clone()),
                    )
                    .await?;
                Ok(StepRunOutcome {
                    step_execution,
                    effective_output: Some(Value::Null),
                    stop_workflow: false,
                    reset_step_id: None,
                })
            }
            ErrorAction::RetryStep => {
                // Retries exhausted under a retry policy with nothing else
                // specified: treat like StopWorkflow rather than silently
                // letting a broken step's dependents hang forever.
                step_execution.status = StepStatus::Failed;
                Ok(StepRunOutcome {
                    step_execution,
                    effective_output: None,
                    stop_workflow: true,
                    reset_step_id: None,
                })
            }
            ErrorAction::ExecuteFallback => {
                step_execution.status = StepStatus::Failed;
                let fallback_id = policy.fallback_step_id.clone();
                match fallback_id.and_then(|id| dag.step(&id).cloned()) {
                    Some(fallback_step) => {
                        // The fallback is an ordinary DAG node; resetting it
                        // to NotStarted here and letting the scheduler pick
                        // it up (rather than running it inline) keeps it
                        // from being invoked twice when it's also reachable
                        // as a normal step, and keeps dependency waiting
                        // intact when it isn't an entry step.
                        Ok(StepRunOutcome {
                            step_execution,
                            effective_output: None,
                            stop_workflow: false,
                            reset_step_id: Some(fallback_step.id.clone()),
                        })
                    }
                    None => {
                        self.event_log
                            .append(TimelineEvent::new(
                                execution.id,
                                TimelineEventType::WarningOccurred {
                                    message: format!(
                                        "step {} specifies ExecuteFallback but no valid fallback_step_id was found",
                                        step.id
                                    ),
                                },
                            ))
                            .await?;
                        Ok(StepRunOutcome {
                            step_execution,
                            effective_output: None,
                            stop_workflow: true,
                            reset_step_id: None,
                        })
                    }
                }
            }
        }
    }

    fn gather_inputs(&self, execution: &WorkflowExecution, step: &Step) -> HashMap<String, Value> {
        step.depends_on
            .iter()
            .filter_map(|dep| {
                execution
                    .step_outputs
                    .get(&dep.0)
                    .map(|value| (dep.0.clone(), value.clone()))
            })
            .collect()
    }

    async fn dispatch(
        &self,
        execution: &WorkflowExecution,
        step: &Step,
        inputs: HashMap<String, Value>,
        cancellation: watch::Receiver<bool>,
    ) -> std::result::Result<StepOutput, ExecutionError> {
        let processor = self.registry.get(step.step_type.as_str()).ok_or_else(|| {
            ExecutionError::new(
                ErrorKind::ConfigurationError,
                format!("no processor registered for step type '{}'", step.step_type.as_str()),
            )
            .with_step(step.id.clone())
        })?;

        let ctx = StepContext {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            params: execution.params.clone(),
            variables: execution.variables.clone(),
            inputs,
            step_outputs: execution.step_outputs.clone(),
            cancellation,
        };

        processor.execute(step, &ctx).await.map_err(|e| {
            ExecutionError::new(ErrorKind::ProcessorError, e.to_string()).with_step(step.id.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::registry::Processor;
    use crate::types::{StepErrorHandling, StepType, TriggerType, WorkflowDefinition, WorkflowErrorHandling, WorkflowId};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct InMemoryEventLog(tokio::sync::Mutex<Vec<TimelineEvent>>);

    impl InMemoryEventLog {
        fn new() -> Self {
            Self(tokio::sync::Mutex::new(Vec::new()))
        }
    }

    #[async_trait]
    impl EventLog for InMemoryEventLog {
        async fn append(&self, event: TimelineEvent) -> Result<()> {
            self.0.lock().await.push(event);
            Ok(())
        }
        async fn get_execution_events(&self, _execution_id: ExecutionId) -> Result<Vec<TimelineEvent>> {
            Ok(self.0.lock().await.clone())
        }
        async fn get_execution_events_range(
            &self,
            _execution_id: ExecutionId,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
        ) -> Result<Vec<TimelineEvent>> {
            Ok(self.0.lock().await.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Processor for AlwaysFails {
        async fn execute(&self, _step: &Step, _ctx: &StepContext) -> Result<StepOutput> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct SucceedsAfterNAttempts {
        attempts_before_success: u32,
        seen: AtomicU32,
    }

    #[async_trait]
    impl Processor for SucceedsAfterNAttempts {
        async fn execute(&self, _step: &Step, _ctx: &StepContext) -> Result<StepOutput> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.attempts_before_success {
                Err(anyhow::anyhow!("not yet"))
            } else {
                Ok(StepOutput {
                    result: serde_json::json!({ "ok": true }),
                })
            }
        }
    }

    fn step(id: &str, step_type: StepType, error_handling: StepErrorHandling) -> Step {
        Step {
            id: sid(id),
            name: id.to_string(),
            step_type,
            depends_on: vec![],
            condition: None,
            error_handling,
            configuration: serde_json::json!({}),
        }
    }

    fn sid(id: &str) -> crate::types::StepId {
        crate::types::StepId::new(id)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn definition(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::new("wf"),
            version: 1,
            name: "wf".into(),
            description: None,
            steps,
            error_handling: WorkflowErrorHandling::stop_on_first_error(),
            variables: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn retries_until_success_then_reports_completed() {
        let s = step(
            "a",
            StepType::Transform,
            StepErrorHandling {
                on_error: ErrorAction::RetryStep,
                fallback_step_id: None,
                max_retries: 3,
                retry_backoff_secs: 0,
            },
        );
        let def = definition(vec![s.clone()]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let execution = WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let registry = ProcessorRegistry::builder()
            .register(
                "transform",
                Arc::new(SucceedsAfterNAttempts {
                    attempts_before_success: 2,
                    seen: AtomicU32::new(0),
                }),
            )
            .build();
        let runner = StepRunner::new(Arc::new(InMemoryEventLog::new()), Arc::new(registry), 60);

        let outcome = runner.run_step(&execution, &dag, &s, no_cancel()).await.unwrap();
        assert_eq!(outcome.step_execution.status, StepStatus::Completed);
        assert!(!outcome.stop_workflow);
    }

    #[tokio::test]
    async fn stop_workflow_policy_propagates() {
        let s = step(
            "a",
            StepType::Transform,
            StepErrorHandling {
                on_error: ErrorAction::StopWorkflow,
                fallback_step_id: None,
                max_retries: 0,
                retry_backoff_secs: 0,
            },
        );
        let def = definition(vec![s.clone()]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let execution = WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let registry = ProcessorRegistry::builder()
            .register("transform", Arc::new(AlwaysFails))
            .build();
        let runner = StepRunner::new(Arc::new(InMemoryEventLog::new()), Arc::new(registry), 60);

        let outcome = runner.run_step(&execution, &dag, &s, no_cancel()).await.unwrap();
        assert_eq!(outcome.step_execution.status, StepStatus::Failed);
        assert!(outcome.stop_workflow);
    }

    #[tokio::test]
    async fn skip_step_policy_yields_skipped_with_null_output() {
        let s = step(
            "a",
            StepType::Transform,
            StepErrorHandling {
                on_error: ErrorAction::SkipStep,
                fallback_step_id: None,
                max_retries: 0,
                retry_backoff_secs: 0,
            },
        );
        let def = definition(vec![s.clone()]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let execution = WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let registry = ProcessorRegistry::builder()
            .register("transform", Arc::new(AlwaysFails))
            .build();
        let runner = StepRunner::new(Arc::new(InMemoryEventLog::new()), Arc::new(registry), 60);

        let outcome = runner.run_step(&execution, &dag, &s, no_cancel()).await.unwrap();
        assert_eq!(outcome.step_execution.status, StepStatus::Skipped);
        assert_eq!(outcome.effective_output, Some(Value::Null));
    }

    #[tokio::test]
    async fn execute_fallback_runs_the_fallback_step_and_carries_its_output() {
        let failing = step(
            "a",
            StepType::Transform,
            StepErrorHandling {
                on_error: ErrorAction::ExecuteFallback,
                fallback_step_id: Some(sid("a-fallback")),
                max_retries: 0,
                retry_backoff_secs: 0,
            },
        );
        let fallback = step("a-fallback", StepType::Transform, StepErrorHandling::default());
        let def = definition(vec![failing.clone(), fallback]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let execution = WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        // Both steps dispatch through the same "transform" processor; it
        // fails once (for the primary step) then succeeds (for the fallback).
        let registry = ProcessorRegistry::builder()
            .register(
                "transform",
                Arc::new(SucceedsAfterNAttempts {
                    attempts_before_success: 1,
                    seen: AtomicU32::new(0),
                }),
            )
            .build();
        let runner = StepRunner::new(Arc::new(InMemoryEventLog::new()), Arc::new(registry), 60);

        let outcome = runner.run_step(&execution, &dag, &failing, no_cancel()).await.unwrap();
        assert_eq!(outcome.step_execution.status, StepStatus::Failed);
        assert_eq!(outcome.effective_output, Some(serde_json::json!({ "ok": true })));
        assert!(!outcome.stop_workflow);
    }
}
