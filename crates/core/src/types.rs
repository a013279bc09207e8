use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a step within a workflow definition. Unique only within
/// the scope of its own workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a single run of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a single attempt record of a step within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepExecutionId(pub Uuid);

impl StepExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a timeline event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineEventId(pub Uuid);

impl TimelineEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimelineEventId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a workflow execution was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Event,
    Api,
}

/// The kind of operation a step performs. `Custom` covers anything a
/// registered processor wants to name that doesn't fit the built-in kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Extract,
    Transform,
    Load,
    Validate,
    Enrich,
    Branch,
    Join,
    Custom(String),
}

impl StepType {
    /// The string a `ProcessorRegistry` dispatches on.
    pub fn as_str(&self) -> &str {
        match self {
            StepType::Extract => "extract",
            StepType::Transform => "transform",
            StepType::Load => "load",
            StepType::Validate => "validate",
            StepType::Enrich => "enrich",
            StepType::Branch => "branch",
            StepType::Join => "join",
            StepType::Custom(s) => s.as_str(),
        }
    }
}

/// What should happen to the whole execution when a step's error policy
/// doesn't specify otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowDefaultAction {
    /// Stop scheduling new steps as soon as one fails.
    StopOnFirstError,
    /// Keep running every step whose dependencies are still satisfiable.
    ContinueOnError,
}

/// A workflow's execution-wide error policy (spec.md §3
/// `WorkflowErrorHandling`). `default_action` governs steps with no
/// dependents left to satisfy; `max_errors` is a hard ceiling on the total
/// number of errors (across every step and retry) an execution may
/// accumulate before the engine force-fails it, regardless of individual
/// step policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowErrorHandling {
    pub default_action: WorkflowDefaultAction,
    pub max_errors: u32,
    pub detailed_logging: bool,
    pub notify_on_error: bool,
}

impl WorkflowErrorHandling {
    pub const fn stop_on_first_error() -> Self {
        Self {
            default_action: WorkflowDefaultAction::StopOnFirstError,
            max_errors: 1,
            detailed_logging: false,
            notify_on_error: true,
        }
    }

    pub const fn continue_on_error() -> Self {
        Self {
            default_action: WorkflowDefaultAction::ContinueOnError,
            max_errors: u32::MAX,
            detailed_logging: false,
            notify_on_error: true,
        }
    }
}

impl Default for WorkflowErrorHandling {
    fn default() -> Self {
        Self::stop_on_first_error()
    }
}

/// Per-step action to take when the step's processor returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Fail the whole execution immediately.
    StopWorkflow,
    /// Mark this step failed but keep scheduling independent steps.
    ContinueWorkflow,
    /// Retry the step according to its retry policy.
    RetryStep,
    /// Mark this step skipped and let its dependents treat it as satisfied.
    SkipStep,
    /// Run `fallback_step_id` in this step's place.
    ExecuteFallback,
}

/// A step's error-handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepErrorHandling {
    pub on_error: ErrorAction,
    /// Required when `on_error` is `ExecuteFallback`.
    pub fallback_step_id: Option<StepId>,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
}

impl Default for StepErrorHandling {
    fn default() -> Self {
        Self {
            on_error: ErrorAction::StopWorkflow,
            fallback_step_id: None,
            max_retries: 0,
            retry_backoff_secs: 1,
        }
    }
}

/// The kind of condition expression gating a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// `$params.env == "prod"`-style comparison expression.
    Expression { expr: String },
    /// Reserved for a future scripting backend; currently evaluates to true.
    Script { source: String },
    /// Reserved for a future data-driven predicate; currently evaluates to true.
    DataBased { query: String },
    /// Reserved for a future external decision service; currently evaluates to true.
    External { endpoint: String },
}

/// A single node in a workflow's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub step_type: StepType,
    pub depends_on: Vec<StepId>,
    pub condition: Option<Condition>,
    pub error_handling: StepErrorHandling,
    /// Free-form parameters handed to the processor. `timeout_seconds`, if
    /// present as a number, bounds this step's execution.
    pub configuration: serde_json::Value,
}

/// A versioned workflow definition: the DAG template an execution runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub version: u32,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub error_handling: WorkflowErrorHandling,
    /// Seed values for the execution's mutable `variables` map. Absent means
    /// every execution of this definition starts with an empty object.
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a whole workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Category of an execution error, used for both API responses and metrics
/// bucketing of common errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ConfigurationError,
    ResourceExhausted,
    Timeout,
    Cancelled,
    ProcessorError,
    PersistenceError,
}

/// A structured error raised during execution, either by the engine itself
/// or surfaced from a processor's failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub step_id: Option<StepId>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }
}

/// The value a processor hands back on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub result: serde_json::Value,
}

/// A single attempt record for a step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub step_id: StepId,
    pub status: StepStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Snapshot of `stepOutputs[dep]` for every id in `dependsOn`, taken when
    /// this attempt started.
    pub input: HashMap<String, serde_json::Value>,
    pub output: Option<StepOutput>,
    pub error: Option<ExecutionError>,
    /// Incremented on every persisted write; see the repository's optimistic
    /// write strategy.
    pub revision: u64,
}

impl StepExecution {
    pub fn new(step_id: StepId) -> Self {
        Self {
            id: StepExecutionId::new(),
            step_id,
            status: StepStatus::NotStarted,
            attempt: 0,
            started_at: None,
            completed_at: None,
            input: HashMap::new(),
            output: None,
            error: None,
            revision: 0,
        }
    }
}

/// A single run of a `WorkflowDefinition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub params: serde_json::Value,
    /// Mutable map visible to processors and the condition evaluator (`$name`
    /// in an expression resolves here); unlike `params` it can change over
    /// the life of the execution.
    pub variables: serde_json::Value,
    /// Keyed by `StepId`; holds the latest attempt record for each step.
    pub step_executions: HashMap<String, StepExecution>,
    /// Keyed by `StepId`; the `result` value of each completed step, used as
    /// input for its dependents and for condition evaluation.
    pub step_outputs: HashMap<String, serde_json::Value>,
    /// Every error raised over the life of the execution, across every step
    /// and every retry attempt, oldest first. Drives `WorkflowErrorHandling`'s
    /// `max_errors` budget and Monitor's common-error aggregation.
    pub errors: Vec<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub revision: u64,
}

/// Lightweight projection of an execution for history/summary listings
/// (spec.md §4.6 "getExecutionSummaries ... projection (counts per status,
/// durations)") — avoids shipping every step's full attempt history to a
/// caller that only wants to list recent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub step_count: usize,
    pub completed_step_count: usize,
    pub failed_step_count: usize,
    pub error_count: usize,
}

impl From<&WorkflowExecution> for ExecutionSummary {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            workflow_version: execution.workflow_version,
            status: execution.status,
            trigger_type: execution.trigger_type,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms: execution
                .completed_at
                .map(|end| (end - execution.started_at).num_milliseconds().max(0) as u64),
            step_count: execution.step_executions.len(),
            completed_step_count: execution
                .step_executions
                .values()
                .filter(|se| se.status == StepStatus::Completed)
                .count(),
            failed_step_count: execution
                .step_executions
                .values()
                .filter(|se| se.status == StepStatus::Failed)
                .count(),
            error_count: execution.errors.len(),
        }
    }
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: WorkflowId,
        workflow_version: u32,
        trigger_type: TriggerType,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            workflow_version,
            status: ExecutionStatus::Pending,
            trigger_type,
            params,
            variables: serde_json::json!({}),
            step_executions: HashMap::new(),
            step_outputs: HashMap::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            revision: 0,
        }
    }
}
