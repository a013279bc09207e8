pub mod event_log;
pub mod repository;

pub use event_log::JsonlEventLog;
pub use repository::{RedbWorkflowRepository, WorkflowRepository};
