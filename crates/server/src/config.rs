use anyhow::{Context, Result};
use etl_workflow_core::engine::{Engine, EngineConfig};
use etl_workflow_core::monitor::{Monitor, RedbMonitor};
use etl_workflow_core::notifier::{HttpNotifier, Notifier};
use etl_workflow_core::registry::ProcessorRegistry;
use etl_workflow_core::storage::{JsonlEventLog, RedbWorkflowRepository, WorkflowRepository};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::middleware::auth::{AllowAllAuthChecker, AuthChecker};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Webhook URL the `Notifier` POSTs lifecycle notifications to. Absent
    /// means notifications are disabled.
    #[serde(default)]
    pub notifier_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_metrics_file")]
    pub metrics_file: String,
}

fn default_index_file() -> String {
    "workflows.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_metrics_file() -> String {
    "metrics.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            event_log_dir: default_event_log_dir(),
            metrics_file: default_metrics_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("failed to read configuration file")?;
            toml::from_str(&content).context("failed to parse configuration file")?
        } else {
            tracing::info!("configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
                notifier_url: None,
            }
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.metrics_file)
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub repository: Arc<dyn WorkflowRepository>,
    pub monitor: Arc<dyn Monitor>,
    pub auth_checker: Arc<dyn AuthChecker>,
}

impl AppState {
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("failed to create event log")?,
        );
        let monitor: Arc<dyn Monitor> = Arc::new(
            RedbMonitor::new(event_log, config.metrics_path()).context("failed to create monitor")?,
        );
        let repository: Arc<dyn WorkflowRepository> = Arc::new(
            RedbWorkflowRepository::new(config.index_path()).context("failed to create repository")?,
        );

        let notifier: Option<Arc<dyn Notifier>> = config
            .notifier_url
            .as_ref()
            .map(|url| Arc::new(HttpNotifier::new(url.clone())) as Arc<dyn Notifier>);

        // No processors are registered by default: extract/transform/load
        // implementations are external collaborators supplied by whoever
        // embeds this engine.
        let registry = ProcessorRegistry::builder().build();

        let engine = Arc::new(Engine::new(
            config.engine.clone(),
            repository.clone(),
            monitor.clone(),
            registry,
            notifier,
        ));
        engine.ensure_seed_workflow().await;

        Ok(Self {
            engine,
            repository,
            monitor,
            auth_checker: Arc::new(AllowAllAuthChecker),
        })
    }
}
