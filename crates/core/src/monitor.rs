//! Timeline recording plus incremental per-workflow/per-step metrics
//! aggregation, kept separate from the `Repository` so a host can swap in a
//! dedicated time-series backend without touching workflow/execution
//! storage.

use crate::events::{EventLog, TimelineEvent};
use crate::types::{ExecutionStatus, StepStatus, WorkflowExecution, WorkflowId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const WORKFLOW_METRICS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_metrics");

/// Running aggregate for one workflow across all its executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub last_execution_at: Option<chrono::DateTime<chrono::Utc>>,
    pub step_metrics: HashMap<String, StepMetrics>,
}

/// Running aggregate for one step, scoped to a single workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_id: String,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub retry_count: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_duration_ms: f64,
    /// Keyed by `"{error_kind}:{message_prefix}"`.
    pub common_errors: HashMap<String, CommonError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonError {
    pub error_type: String,
    pub message: String,
    pub count: u64,
}

const ERROR_MESSAGE_PREFIX_LEN: usize = 120;

fn record_duration(count_before: u64, avg_before: f64, min_before: u64, max_before: u64, sample_ms: u64) -> (f64, u64, u64) {
    let n = count_before + 1;
    let avg = avg_before + (sample_ms as f64 - avg_before) / n as f64;
    let min = if count_before == 0 { sample_ms } else { min_before.min(sample_ms) };
    let max = if count_before == 0 { sample_ms } else { max_before.max(sample_ms) };
    (avg, min, max)
}

impl WorkflowMetrics {
    fn new(workflow_id: &WorkflowId) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            ..Default::default()
        }
    }

    /// Folds one terminal execution into the running aggregates.
    fn record(&mut self, execution: &WorkflowExecution) {
        let duration_ms = execution
            .completed_at
            .map(|end| (end - execution.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let (avg, min, max) = record_duration(
            self.total_executions,
            self.avg_duration_ms,
            self.min_duration_ms,
            self.max_duration_ms,
            duration_ms,
        );
        self.avg_duration_ms = avg;
        self.min_duration_ms = min;
        self.max_duration_ms = max;
        self.total_executions += 1;
        self.last_execution_at = execution.completed_at.or(Some(execution.started_at));

        match execution.status {
            ExecutionStatus::Completed => self.successful_executions += 1,
            ExecutionStatus::Failed => self.failed_executions += 1,
            ExecutionStatus::Cancelled => self.cancelled_executions += 1,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused => {}
        }

        for step_execution in execution.step_executions.values() {
            let step_metrics = self
                .step_metrics
                .entry(step_execution.step_id.0.clone())
                .or_insert_with(|| StepMetrics {
                    step_id: step_execution.step_id.0.clone(),
                    ..Default::default()
                });

            let step_duration_ms = match (step_execution.started_at, step_execution.completed_at) {
                (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
                _ => 0,
            };

            let (avg, min, max) = record_duration(
                step_metrics.total_runs,
                step_metrics.avg_duration_ms,
                step_metrics.min_duration_ms,
                step_metrics.max_duration_ms,
                step_duration_ms,
            );
            step_metrics.avg_duration_ms = avg;
            step_metrics.min_duration_ms = min;
            step_metrics.max_duration_ms = max;
            step_metrics.total_runs += 1;
            step_metrics.retry_count += step_execution.attempt.saturating_sub(1) as u64;

            match step_execution.status {
                StepStatus::Completed => step_metrics.successful_runs += 1,
                StepStatus::Failed => step_metrics.failed_runs += 1,
                _ => {}
            }

            if let Some(error) = &step_execution.error {
                let prefix: String = error.message.chars().take(ERROR_MESSAGE_PREFIX_LEN).collect();
                let key = format!("{:?}:{}", error.kind, prefix);
                let entry = step_metrics.common_errors.entry(key).or_insert_with(|| CommonError {
                    error_type: format!("{:?}", error.kind),
                    message: prefix,
                    count: 0,
                });
                entry.count += 1;
            }
        }
    }
}

/// Records timeline events and aggregates metrics off terminal executions.
#[async_trait::async_trait]
pub trait Monitor: Send + Sync {
    async fn record_timeline_event(&self, event: TimelineEvent) -> Result<()>;
    async fn get_timeline_events(&self, execution_id: crate::types::ExecutionId, limit: usize)
        -> Result<Vec<TimelineEvent>>;
    async fn update_workflow_metrics(&self, execution: &WorkflowExecution) -> Result<()>;
    async fn get_workflow_metrics(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowMetrics>>;
}

/// Default `Monitor`: delegates timeline storage to an `EventLog` and keeps
/// metrics in a dedicated redb table so aggregates survive a restart.
pub struct RedbMonitor {
    event_log: Arc<dyn EventLog>,
    db: Arc<Database>,
}

impl RedbMonitor {
    pub fn new(event_log: Arc<dyn EventLog>, metrics_db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = metrics_db_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create metrics directory")?;
        }
        let db = Database::create(&metrics_db_path).context("failed to create metrics database")?;
        let write_txn = db.begin_write().context("failed to begin write transaction")?;
        {
            write_txn
                .open_table(WORKFLOW_METRICS_TABLE)
                .context("failed to open workflow metrics table")?;
        }
        write_txn.commit().context("failed to commit")?;

        Ok(Self {
            event_log,
            db: Arc::new(db),
        })
    }
}

#[async_trait::async_trait]
impl Monitor for RedbMonitor {
    async fn record_timeline_event(&self, event: TimelineEvent) -> Result<()> {
        self.event_log.append(event).await
    }

    async fn get_timeline_events(
        &self,
        execution_id: crate::types::ExecutionId,
        limit: usize,
    ) -> Result<Vec<TimelineEvent>> {
        let mut events = self.event_log.get_execution_events(execution_id).await?;
        if events.len() > limit {
            events = events.split_off(events.len() - limit);
        }
        Ok(events)
    }

    async fn update_workflow_metrics(&self, execution: &WorkflowExecution) -> Result<()> {
        let workflow_id = execution.workflow_id.clone();
        let db = self.db.clone();
        let execution = execution.clone();

        tokio::task::spawn_blocking(move || {
            let mut metrics = load_metrics(&db, &workflow_id)?;
            metrics.record(&execution);
            store_metrics(&db, &workflow_id, &metrics)
        })
        .await?
    }

    async fn get_workflow_metrics(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowMetrics>> {
        let db = self.db.clone();
        let workflow_id = workflow_id.clone();
        let metrics = tokio::task::spawn_blocking(move || load_metrics(&db, &workflow_id)).await??;
        if metrics.total_executions == 0 {
            Ok(None)
        } else {
            Ok(Some(metrics))
        }
    }
}

fn load_metrics(db: &Database, workflow_id: &WorkflowId) -> Result<WorkflowMetrics> {
    let read_txn = db.begin_read().context("failed to begin read")?;
    let table = read_txn
        .open_table(WORKFLOW_METRICS_TABLE)
        .context("failed to open workflow metrics table")?;

    match table.get(workflow_id.to_string().as_str())? {
        Some(guard) => serde_json::from_slice(guard.value()).context("failed to deserialize metrics"),
        None => Ok(WorkflowMetrics::new(workflow_id)),
    }
}

fn store_metrics(db: &Database, workflow_id: &WorkflowId, metrics: &WorkflowMetrics) -> Result<()> {
    let write_txn = db.begin_write().context("failed to begin write")?;
    {
        let mut table = write_txn
            .open_table(WORKFLOW_METRICS_TABLE)
            .context("failed to open workflow metrics table")?;
        let value = serde_json::to_vec(metrics).context("failed to serialize metrics")?;
        table
            .insert(workflow_id.to_string().as_str(), value.as_slice())
            .context("failed to insert metrics")?;
    }
    write_txn.commit().context("failed to commit")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonlEventLog;
    use crate::types::{ErrorKind, ExecutionError, StepExecution, StepId, StepStatus, TriggerType};
    use tempfile::TempDir;

    fn monitor() -> (TempDir, RedbMonitor) {
        let dir = TempDir::new().unwrap();
        let event_log = Arc::new(JsonlEventLog::new(dir.path().join("events")).unwrap());
        let monitor = RedbMonitor::new(event_log, dir.path().join("metrics.redb")).unwrap();
        (dir, monitor)
    }

    fn sample_execution(status: ExecutionStatus) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(
            WorkflowId::new("pipeline"),
            1,
            TriggerType::Manual,
            serde_json::json!({}),
        );
        execution.status = status;
        execution.completed_at = Some(execution.started_at + chrono::Duration::milliseconds(500));

        let mut se = StepExecution::new(StepId::new("extract"));
        se.status = StepStatus::Completed;
        se.started_at = Some(execution.started_at);
        se.completed_at = Some(execution.started_at + chrono::Duration::milliseconds(200));
        execution.step_executions.insert("extract".to_string(), se);

        execution
    }

    #[tokio::test]
    async fn aggregates_incrementally_across_executions() {
        let (_dir, monitor) = monitor();

        monitor
            .update_workflow_metrics(&sample_execution(ExecutionStatus::Completed))
            .await
            .unwrap();
        monitor
            .update_workflow_metrics(&sample_execution(ExecutionStatus::Failed))
            .await
            .unwrap();

        let metrics = monitor
            .get_workflow_metrics(&WorkflowId::new("pipeline"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(metrics.total_executions, 2);
        assert_eq!(metrics.successful_executions, 1);
        assert_eq!(metrics.failed_executions, 1);
        assert_eq!(metrics.avg_duration_ms, 500.0);

        let step_metrics = metrics.step_metrics.get("extract").unwrap();
        assert_eq!(step_metrics.total_runs, 2);
        assert_eq!(step_metrics.successful_runs, 2);
    }

    #[tokio::test]
    async fn common_errors_are_grouped_by_kind_and_message() {
        let (_dir, monitor) = monitor();
        let mut execution = sample_execution(ExecutionStatus::Failed);
        let mut se = StepExecution::new(StepId::new("load"));
        se.status = StepStatus::Failed;
        se.error = Some(ExecutionError::new(ErrorKind::ProcessorError, "connection refused"));
        execution.step_executions.insert("load".to_string(), se);

        monitor.update_workflow_metrics(&execution).await.unwrap();
        monitor.update_workflow_metrics(&execution).await.unwrap();

        let metrics = monitor
            .get_workflow_metrics(&WorkflowId::new("pipeline"))
            .await
            .unwrap()
            .unwrap();
        let step_metrics = metrics.step_metrics.get("load").unwrap();
        assert_eq!(step_metrics.common_errors.len(), 1);
        assert_eq!(step_metrics.common_errors.values().next().unwrap().count, 2);
    }

    #[tokio::test]
    async fn unknown_workflow_has_no_metrics() {
        let (_dir, monitor) = monitor();
        assert!(monitor
            .get_workflow_metrics(&WorkflowId::new("nope"))
            .await
            .unwrap()
            .is_none());
    }
}
