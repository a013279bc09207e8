//! Fire-and-forget lifecycle notifications to an external endpoint. Failures
//! are logged, never surfaced to the engine — per spec.md §6 "Notifier
//! contract", a notification delivery problem must not affect a workflow's
//! outcome.

use crate::types::{ExecutionId, ExecutionStatus, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub subject: String,
    pub message: String,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        subject: impl Into<String>,
        message: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            subject: subject.into(),
            message: message.into(),
            status,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: NotificationPayload);
}

/// POSTs the payload as JSON to a fixed webhook URL. Errors of every kind —
/// connection refused, non-2xx response, timeout — are logged at `warn` and
/// swallowed.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, payload: NotificationPayload) {
        let result = self.client.post(&self.url).json(&payload).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    "notifier endpoint {} returned {} for execution {}",
                    self.url,
                    response.status(),
                    payload.execution_id
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    "notifier endpoint {} unreachable for execution {}: {}",
                    self.url,
                    payload.execution_id,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_json_payload_to_configured_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/workflow"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(format!("{}/hooks/workflow", server.uri()));
        notifier
            .notify(NotificationPayload::new(
                ExecutionId::new(),
                WorkflowId::new("pipeline"),
                "workflow completed",
                "all steps finished",
                ExecutionStatus::Completed,
            ))
            .await;
    }

    #[tokio::test]
    async fn swallows_failures_from_an_unreachable_endpoint() {
        let notifier = HttpNotifier::new("http://127.0.0.1:1/unreachable");
        notifier
            .notify(NotificationPayload::new(
                ExecutionId::new(),
                WorkflowId::new("pipeline"),
                "workflow failed",
                "step `load` failed",
                ExecutionStatus::Failed,
            ))
            .await;
    }
}
