use crate::types::{ExecutionId, Step, StepOutput, WorkflowId};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// The per-execution context a `Processor` sees while running one step.
/// Mirrors spec.md §6's processor contract: identity, the caller's read-only
/// `params`, the execution's mutable `variables`, every step's output so
/// far, and a cancellation signal the processor is expected to honor.
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub params: serde_json::Value,
    pub variables: serde_json::Value,
    /// `step_outputs` of every step this one depends on, keyed by step id.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Every step output produced so far in the execution, keyed by step id.
    pub step_outputs: HashMap<String, serde_json::Value>,
    pub cancellation: watch::Receiver<bool>,
}

impl StepContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }
}

/// Executes a single step's unit of work. Implementations live outside this
/// crate (an extract processor talking to a database, a transform processor
/// running a user script, and so on); the engine only ever knows this trait.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutput>;
}

/// Dispatch table from a step's type name (`StepType::as_str()`) to the
/// `Processor` that handles it.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(step_type).cloned()
    }
}

#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistryBuilder {
    pub fn register(mut self, step_type: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(step_type.into(), processor);
        self
    }

    pub fn build(self) -> ProcessorRegistry {
        ProcessorRegistry {
            processors: self.processors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepType;

    struct EchoProcessor;

    #[async_trait::async_trait]
    impl Processor for EchoProcessor {
        async fn execute(&self, step: &Step, _ctx: &StepContext) -> Result<StepOutput> {
            Ok(StepOutput {
                result: serde_json::json!({ "step": step.id.0 }),
            })
        }
    }

    #[test]
    fn registry_dispatches_by_step_type_name() {
        let registry = ProcessorRegistry::builder()
            .register(StepType::Transform.as_str(), Arc::new(EchoProcessor))
            .build();

        assert!(registry.get("transform").is_some());
        assert!(registry.get("extract").is_none());
    }
}
