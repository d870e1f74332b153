//! Registry sync: mirrors task-type registration and completion events to an
//! external task registry over HTTP.
//!
//! The local queue store is the authority on task state. Everything here is
//! best-effort bookkeeping, and callers treat every error as non-fatal.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::TaskId;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RegistrySyncError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Announces that this worker can run a task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTypeRegistration {
    pub name: String,
    pub version: String,
    /// JSON Schema of the parameters.
    pub schema: serde_json::Value,
}

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub worker_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait RegistrySync: Send + Sync {
    async fn register_task_type(
        &self,
        registration: &TaskTypeRegistration,
    ) -> Result<(), RegistrySyncError>;

    async fn report_completion(&self, report: &CompletionReport) -> Result<(), RegistrySyncError>;
}

/// JSON-over-HTTP registry client.
///
/// * `POST {base}/task-types` with a [`TaskTypeRegistration`]
/// * `POST {base}/tasks/{task_id}/complete` with a [`CompletionReport`]
///
/// Any 2xx response is success.
pub struct HttpRegistryClient {
    base_url: String,
    token: Option<SecretString>,
    http_client: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        timeout: Option<Duration>,
    ) -> Result<Self, RegistrySyncError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), RegistrySyncError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http_client.post(&url).json(body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(%url, status = status.as_u16(), "registry call ok");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%url, status = status.as_u16(), %body, "registry call rejected");
        Err(RegistrySyncError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RegistrySync for HttpRegistryClient {
    async fn register_task_type(
        &self,
        registration: &TaskTypeRegistration,
    ) -> Result<(), RegistrySyncError> {
        self.post("/task-types", registration).await
    }

    async fn report_completion(&self, report: &CompletionReport) -> Result<(), RegistrySyncError> {
        self.post(&format!("/tasks/{}/complete", report.task_id), report)
            .await
    }
}
