use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in an execution's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: TimelineEventId,
    pub execution_id: ExecutionId,
    pub step_id: Option<StepId>,
    pub timestamp: DateTime<Utc>,
    pub event_type: TimelineEventType,
}

impl TimelineEvent {
    pub fn new(execution_id: ExecutionId, event_type: TimelineEventType) -> Self {
        Self {
            id: TimelineEventId::new(),
            execution_id,
            step_id: None,
            timestamp: Utc::now(),
            event_type,
        }
    }

    pub fn for_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }
}

/// The closed set of things that can happen over the lifetime of an
/// execution. `Custom` exists for a processor to record domain-specific
/// milestones without the engine having to know about them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEventType {
    WorkflowStarted {
        workflow_id: WorkflowId,
        workflow_version: u32,
    },
    WorkflowCompleted {
        duration_ms: u64,
    },
    WorkflowFailed {
        error: ExecutionError,
        duration_ms: u64,
    },
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled {
        reason: String,
    },

    StepStarted {
        step_id: StepId,
        attempt: u32,
    },
    StepCompleted {
        step_id: StepId,
        duration_ms: u64,
    },
    StepFailed {
        step_id: StepId,
        error: ExecutionError,
        attempt: u32,
        will_retry: bool,
    },
    StepRetrying {
        step_id: StepId,
        attempt: u32,
        backoff_secs: u64,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },

    ErrorOccurred {
        error: ExecutionError,
    },
    WarningOccurred {
        message: String,
    },
    Information {
        message: String,
    },
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

/// Append-only timeline store, keyed by execution.
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: TimelineEvent) -> anyhow::Result<()>;

    async fn get_execution_events(
        &self,
        execution_id: ExecutionId,
    ) -> anyhow::Result<Vec<TimelineEvent>>;

    async fn get_execution_events_range(
        &self,
        execution_id: ExecutionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TimelineEvent>>;
}
