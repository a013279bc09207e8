use crate::types::{
    ExecutionId, ExecutionSummary, StepExecution, WorkflowDefinition, WorkflowExecution, WorkflowId,
};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const DEFINITIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_definitions");
const LATEST_POINTERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("workflow_latest");
const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_executions");

fn definition_key(id: &WorkflowId, version: u32) -> String {
    format!("{}@{}", id, version)
}

/// redb-backed store for workflow definitions and their executions.
///
/// Definitions are versioned: each `saveWorkflow` call writes a new
/// `"{id}@{version}"` entry and repoints a `"{id}"` -> latest-version pointer,
/// so `getWorkflow(id)` with no version resolves to the newest one while
/// older versions stay addressable for executions already running against
/// them.
#[derive(Clone)]
pub struct RedbWorkflowRepository {
    db: Arc<Database>,
}

impl RedbWorkflowRepository {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create repository directory")?;
        }

        let db = Database::create(&path).context("failed to create redb database")?;

        let write_txn = db.begin_write().context("failed to begin write transaction")?;
        {
            write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("failed to open definitions table")?;
            write_txn
                .open_table(LATEST_POINTERS_TABLE)
                .context("failed to open latest-pointers table")?;
            write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("failed to open executions table")?;
        }
        write_txn.commit().context("failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut definitions = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("failed to open definitions table")?;
            let key = definition_key(&definition.id, definition.version);
            let value = serde_json::to_vec(definition).context("failed to serialize workflow")?;
            definitions
                .insert(key.as_str(), value.as_slice())
                .context("failed to insert workflow definition")?;

            let mut pointers = write_txn
                .open_table(LATEST_POINTERS_TABLE)
                .context("failed to open pointers table")?;
            let id_key = definition.id.to_string();
            let should_repoint = match pointers.get(id_key.as_str())? {
                Some(existing) => {
                    let existing_version: u32 = existing
                        .value()
                        .rsplit('@')
                        .next()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    definition.version >= existing_version
                }
                None => true,
            };
            if should_repoint {
                pointers
                    .insert(id_key.as_str(), key.as_str())
                    .context("failed to update latest pointer")?;
            }
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    /// `version = None` resolves to the latest saved version.
    pub fn get_workflow(
        &self,
        id: &WorkflowId,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let definitions = read_txn
            .open_table(DEFINITIONS_TABLE)
            .context("failed to open definitions table")?;

        let key = match version {
            Some(v) => definition_key(id, v),
            None => {
                let pointers = read_txn
                    .open_table(LATEST_POINTERS_TABLE)
                    .context("failed to open pointers table")?;
                match pointers.get(id.to_string().as_str())? {
                    Some(k) => k.value().to_string(),
                    None => return Ok(None),
                }
            }
        };

        match definitions.get(key.as_str()).context("failed to get workflow")? {
            Some(guard) => {
                let def: WorkflowDefinition =
                    serde_json::from_slice(guard.value()).context("failed to deserialize workflow")?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    /// Lists the latest version of every workflow, sorted by id, with
    /// `skip`/`take` pagination (spec.md §4.6 "listWorkflows(skip, take)").
    pub fn list_workflows(&self, skip: usize, take: usize) -> Result<Vec<WorkflowDefinition>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let pointers = read_txn
            .open_table(LATEST_POINTERS_TABLE)
            .context("failed to open pointers table")?;
        let definitions = read_txn
            .open_table(DEFINITIONS_TABLE)
            .context("failed to open definitions table")?;

        let mut workflows = Vec::new();
        for item in pointers.iter().context("failed to iterate pointers")? {
            let (_id, latest_key) = item.context("failed to read pointer entry")?;
            if let Some(guard) = definitions.get(latest_key.value())? {
                let def: WorkflowDefinition = serde_json::from_slice(guard.value())
                    .context("failed to deserialize workflow")?;
                workflows.push(def);
            }
        }

        workflows.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(workflows.into_iter().skip(skip).take(take).collect())
    }

    pub fn get_workflow_versions(&self, id: &WorkflowId) -> Result<Vec<WorkflowDefinition>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let definitions = read_txn
            .open_table(DEFINITIONS_TABLE)
            .context("failed to open definitions table")?;

        let prefix = format!("{}@", id);
        let mut versions = Vec::new();
        for item in definitions.iter().context("failed to iterate definitions")? {
            let (key, value) = item.context("failed to read definition entry")?;
            if key.value().starts_with(&prefix) {
                let def: WorkflowDefinition =
                    serde_json::from_slice(value.value()).context("failed to deserialize workflow")?;
                versions.push(def);
            }
        }

        versions.sort_by_key(|d| d.version);
        Ok(versions)
    }

    pub fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("failed to open executions table")?;

            let key = execution.id.to_string();

            // Optimistic concurrency: if a newer revision is already on disk,
            // keep it rather than clobbering it with a stale write. The
            // single-writer transaction makes this check-then-write atomic.
            if let Some(guard) = table.get(key.as_str())? {
                let existing: WorkflowExecution = serde_json::from_slice(guard.value())
                    .context("failed to deserialize existing execution")?;
                if existing.revision > execution.revision {
                    return Ok(());
                }
            }

            let value = serde_json::to_vec(execution).context("failed to serialize execution")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("failed to insert execution")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    pub fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("failed to open executions table")?;

        let key = id.to_string();
        match table.get(key.as_str()).context("failed to get execution")? {
            Some(guard) => {
                let execution: WorkflowExecution = serde_json::from_slice(guard.value())
                    .context("failed to deserialize execution")?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    /// Updates a single step's attempt record on an execution already on
    /// disk, bumping both the step's and the execution's revision.
    pub fn update_step_execution(
        &self,
        execution_id: ExecutionId,
        step_execution: StepExecution,
    ) -> Result<()> {
        let mut execution = self
            .get_execution(execution_id)?
            .context("execution not found")?;

        let mut step_execution = step_execution;
        step_execution.revision += 1;
        execution
            .step_executions
            .insert(step_execution.step_id.to_string(), step_execution);
        execution.revision += 1;

        self.save_execution(&execution)
    }

    /// Removes the latest-version pointer for a workflow. Historical
    /// `"{id}@{version}"` entries are left in place so executions already
    /// running against an older version can still resolve it.
    pub fn delete_workflow(&self, id: &WorkflowId) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut pointers = write_txn
                .open_table(LATEST_POINTERS_TABLE)
                .context("failed to open pointers table")?;
            pointers
                .remove(id.to_string().as_str())
                .context("failed to remove latest pointer")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    pub fn get_recent_executions(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("failed to open executions table")?;

        let mut executions = Vec::new();
        for item in table.iter().context("failed to iterate executions")? {
            let (_key, value) = item.context("failed to read execution entry")?;
            let execution: WorkflowExecution =
                serde_json::from_slice(value.value()).context("failed to deserialize execution")?;
            let matches = match workflow_id {
                Some(id) => &execution.workflow_id == id,
                None => true,
            };
            if matches {
                executions.push(execution);
            }
        }

        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit);
        Ok(executions)
    }

    /// Most-recent-first projection of a workflow's executions (spec.md
    /// §4.6 "getExecutionSummaries").
    pub fn get_execution_summaries(&self, workflow_id: &WorkflowId, limit: usize) -> Result<Vec<ExecutionSummary>> {
        Ok(self
            .get_recent_executions(Some(workflow_id), limit)?
            .iter()
            .map(ExecutionSummary::from)
            .collect())
    }
}

/// Trait seam so the engine doesn't depend directly on redb, mirroring the
/// rest of this crate's pluggable-backend traits.
#[async_trait::async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save_workflow(&self, definition: WorkflowDefinition) -> anyhow::Result<()>;
    async fn get_workflow(
        &self,
        id: &WorkflowId,
        version: Option<u32>,
    ) -> anyhow::Result<Option<WorkflowDefinition>>;
    async fn list_workflows(&self, skip: usize, take: usize) -> anyhow::Result<Vec<WorkflowDefinition>>;
    async fn get_workflow_versions(&self, id: &WorkflowId) -> anyhow::Result<Vec<WorkflowDefinition>>;
    async fn delete_workflow(&self, id: &WorkflowId) -> anyhow::Result<()>;
    async fn save_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()>;
    async fn get_execution(&self, id: ExecutionId) -> anyhow::Result<Option<WorkflowExecution>>;
    async fn update_step_execution(
        &self,
        execution_id: ExecutionId,
        step_execution: StepExecution,
    ) -> anyhow::Result<()>;
    async fn get_recent_executions(
        &self,
        workflow_id: Option<WorkflowId>,
        limit: usize,
    ) -> anyhow::Result<Vec<WorkflowExecution>>;
    async fn get_execution_summaries(
        &self,
        workflow_id: &WorkflowId,
        limit: usize,
    ) -> anyhow::Result<Vec<ExecutionSummary>>;
}

#[async_trait::async_trait]
impl WorkflowRepository for RedbWorkflowRepository {
    async fn save_workflow(&self, definition: WorkflowDefinition) -> anyhow::Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.save_workflow(&definition)).await?
    }

    async fn get_workflow(
        &self,
        id: &WorkflowId,
        version: Option<u32>,
    ) -> anyhow::Result<Option<WorkflowDefinition>> {
        let this = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || this.get_workflow(&id, version)).await?
    }

    async fn list_workflows(&self, skip: usize, take: usize) -> anyhow::Result<Vec<WorkflowDefinition>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.list_workflows(skip, take)).await?
    }

    async fn get_workflow_versions(&self, id: &WorkflowId) -> anyhow::Result<Vec<WorkflowDefinition>> {
        let this = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || this.get_workflow_versions(&id)).await?
    }

    async fn delete_workflow(&self, id: &WorkflowId) -> anyhow::Result<()> {
        let this = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || this.delete_workflow(&id)).await?
    }

    async fn save_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.save_execution(&execution)).await?
    }

    async fn get_execution(&self, id: ExecutionId) -> anyhow::Result<Option<WorkflowExecution>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.get_execution(id)).await?
    }

    async fn update_step_execution(
        &self,
        execution_id: ExecutionId,
        step_execution: StepExecution,
    ) -> anyhow::Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.update_step_execution(execution_id, step_execution))
            .await?
    }

    async fn get_recent_executions(
        &self,
        workflow_id: Option<WorkflowId>,
        limit: usize,
    ) -> anyhow::Result<Vec<WorkflowExecution>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.get_recent_executions(workflow_id.as_ref(), limit))
            .await?
    }

    async fn get_execution_summaries(
        &self,
        workflow_id: &WorkflowId,
        limit: usize,
    ) -> anyhow::Result<Vec<ExecutionSummary>> {
        let this = self.clone();
        let workflow_id = workflow_id.clone();
        tokio::task::spawn_blocking(move || this.get_execution_summaries(&workflow_id, limit)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TriggerType, WorkflowErrorHandling};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_workflow(id: &str, version: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::new(id),
            version,
            name: "sample".into(),
            description: None,
            steps: vec![],
            error_handling: WorkflowErrorHandling::stop_on_first_error(),
            variables: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn get_workflow_resolves_latest_version_when_unspecified() {
        let dir = TempDir::new().unwrap();
        let repo = RedbWorkflowRepository::new(dir.path().join("db.redb")).unwrap();

        repo.save_workflow(&sample_workflow("pipeline", 1)).unwrap();
        repo.save_workflow(&sample_workflow("pipeline", 2)).unwrap();

        let latest = repo.get_workflow(&WorkflowId::new("pipeline"), None).unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let v1 = repo
            .get_workflow(&WorkflowId::new("pipeline"), Some(1))
            .unwrap()
            .unwrap();
        assert_eq!(v1.version, 1);
    }

    #[test]
    fn get_workflow_versions_returns_all_versions_sorted() {
        let dir = TempDir::new().unwrap();
        let repo = RedbWorkflowRepository::new(dir.path().join("db.redb")).unwrap();

        repo.save_workflow(&sample_workflow("pipeline", 2)).unwrap();
        repo.save_workflow(&sample_workflow("pipeline", 1)).unwrap();

        let versions = repo.get_workflow_versions(&WorkflowId::new("pipeline")).unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn save_execution_rejects_stale_revisions() {
        let dir = TempDir::new().unwrap();
        let repo = RedbWorkflowRepository::new(dir.path().join("db.redb")).unwrap();

        let mut execution = WorkflowExecution::new(
            WorkflowId::new("pipeline"),
            1,
            TriggerType::Manual,
            serde_json::json!({}),
        );
        execution.revision = 5;
        repo.save_execution(&execution).unwrap();

        let mut stale = execution.clone();
        stale.revision = 1;
        stale.status = crate::types::ExecutionStatus::Cancelled;
        repo.save_execution(&stale).unwrap();

        let stored = repo.get_execution(execution.id).unwrap().unwrap();
        assert_eq!(stored.revision, 5);
        assert_eq!(stored.status, crate::types::ExecutionStatus::Pending);
    }
}
