//! Core types and engine for the ETL Workflow Engine.

pub mod engine;
pub mod events;
pub mod monitor;
pub mod notifier;
pub mod registry;
pub mod storage;
pub mod types;
pub mod workflow;

pub use types::*;
