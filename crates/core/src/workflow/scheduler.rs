use crate::types::{StepId, StepStatus, WorkflowExecution};
use crate::workflow::dag::WorkflowDag;
use std::collections::HashSet;

/// Result of asking the scheduler what to do next for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerDecision {
    /// These steps have every dependency satisfied and are not yet started;
    /// the engine should run them now (respecting admission limits).
    Ready(Vec<StepId>),
    /// Nothing is runnable right now, but the execution isn't finished —
    /// some step is still in flight or waiting on a retry backoff.
    Wait,
    /// No step can ever become runnable again: every step has reached a
    /// terminal status, or remaining steps are unreachable because a
    /// dependency failed without a fallback.
    Done,
}

/// Computes what should run next for an execution, given its DAG and
/// current per-step statuses. Holds no state of its own — the engine owns
/// mutation and just calls this after any state change.
pub struct Scheduler;

impl Scheduler {
    pub fn next_batch(dag: &WorkflowDag, execution: &WorkflowExecution) -> SchedulerDecision {
        let completed: HashSet<StepId> = execution
            .step_executions
            .values()
            .filter(|se| matches!(se.status, StepStatus::Completed | StepStatus::Skipped))
            .map(|se| se.step_id.clone())
            .collect();

        let all_ids = dag.all_step_ids();
        let mut ready = Vec::new();
        let mut any_in_flight = false;
        let mut any_unstarted = false;

        for step_id in &all_ids {
            let status = execution
                .step_executions
                .get(&step_id.0)
                .map(|se| se.status)
                .unwrap_or(StepStatus::NotStarted);

            match status {
                StepStatus::Running | StepStatus::Waiting => any_in_flight = true,
                StepStatus::NotStarted => {
                    any_unstarted = true;
                    if dag.can_execute(step_id, &completed).unwrap_or(false) {
                        ready.push(step_id.clone());
                    }
                }
                StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed | StepStatus::Cancelled => {}
            }
        }

        if !ready.is_empty() {
            return SchedulerDecision::Ready(ready);
        }
        if any_in_flight {
            return SchedulerDecision::Wait;
        }
        if any_unstarted {
            // Unstarted steps remain, but none are runnable: their
            // dependencies will never complete (an upstream step failed or
            // was cancelled without a fallback reviving it).
            return SchedulerDecision::Done;
        }
        SchedulerDecision::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Step, StepErrorHandling, StepExecution, StepType, TriggerType, WorkflowDefinition,
        WorkflowErrorHandling, WorkflowId,
    };
    use chrono::Utc;

    fn step(id: &str, depends_on: &[&str]) -> Step {
        Step {
            id: StepId::new(id),
            name: id.to_string(),
            step_type: StepType::Transform,
            depends_on: depends_on.iter().map(|d| StepId::new(*d)).collect(),
            condition: None,
            error_handling: StepErrorHandling::default(),
            configuration: serde_json::json!({}),
        }
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

    #[test]
    fn entry_steps_are_ready_on_a_fresh_execution() {
        let def = definition(vec![step("a", &[]), step("b", &["a"])]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let execution = WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        match Scheduler::next_batch(&dag, &execution) {
            SchedulerDecision::Ready(ids) => assert_eq!(ids, vec![StepId::new("a")]),
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn completing_a_step_unblocks_its_dependent() {
        let def = definition(vec![step("a", &[]), step("b", &["a"])]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let mut execution =
            WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let mut se = StepExecution::new(StepId::new("a"));
        se.status = StepStatus::Completed;
        execution.step_executions.insert("a".to_string(), se);

        match Scheduler::next_batch(&dag, &execution) {
            SchedulerDecision::Ready(ids) => assert_eq!(ids, vec![StepId::new("b")]),
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn in_flight_step_yields_wait() {
        let def = definition(vec![step("a", &[])]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let mut execution =
            WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let mut se = StepExecution::new(StepId::new("a"));
        se.status = StepStatus::Running;
        execution.step_executions.insert("a".to_string(), se);

        assert_eq!(Scheduler::next_batch(&dag, &execution), SchedulerDecision::Wait);
    }

    #[test]
    fn failed_step_without_fallback_leaves_dependent_unreachable() {
        let def = definition(vec![step("a", &[]), step("b", &["a"])]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let mut execution =
            WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let mut se = StepExecution::new(StepId::new("a"));
        se.status = StepStatus::Failed;
        execution.step_executions.insert("a".to_string(), se);

        assert_eq!(Scheduler::next_batch(&dag, &execution), SchedulerDecision::Done);
    }

    #[test]
    fn all_completed_yields_done() {
        let def = definition(vec![step("a", &[])]);
        let dag = WorkflowDag::from_definition(&def).unwrap();
        let mut execution =
            WorkflowExecution::new(def.id.clone(), 1, TriggerType::Manual, serde_json::json!({}));

        let mut se = StepExecution::new(StepId::new("a"));
        se.status = StepStatus::Completed;
        execution.step_executions.insert("a".to_string(), se);

        assert_eq!(Scheduler::next_batch(&dag, &execution), SchedulerDecision::Done);
    }
}
