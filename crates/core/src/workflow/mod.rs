pub mod condition;
pub mod dag;
pub mod scheduler;
pub mod step_runner;

pub use condition::{ConditionEvaluator, EvalContext, EvalOutcome};
pub use dag::WorkflowDag;
pub use scheduler::{Scheduler, SchedulerDecision};
pub use step_runner::{StepRunOutcome, StepRunner};
