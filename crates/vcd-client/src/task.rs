//! vCD task tracking.

use std::time::Instant;

use api_types::Task;
use api_types::TaskStatus;
use error_stack::Report;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::client::VcdClient;
use crate::error::VcdError;
use crate::error::VcdResult;

/// Fields of a task created or updated by CSE itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub operation: String,
    pub operation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<api_types::Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<api_types::TaskError>,
}

impl TaskUpdate {
    pub fn new(status: TaskStatus, operation_name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            status,
            operation: operation.into(),
            operation_name: operation_name.into(),
            details: None,
            progress: None,
            owner: None,
            error: None,
        }
    }

    pub fn with_owner(mut self, owner: api_types::Reference) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    /// Mark the update as failed with the given message.
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = TaskStatus::Error;
        self.error = Some(api_types::TaskError {
            message: message.into(),
            major_error_code: Some(500),
        });
        self
    }
}

impl VcdClient {
    /// create a CSE-owned task
    pub async fn create_task(&self, update: &TaskUpdate) -> VcdResult<Task> {
        let url = self.api_url("tasks");
        self.post_json(&url, update).await
    }

    /// update a CSE-owned task in place
    pub async fn update_task(&self, href: &str, update: &TaskUpdate) -> VcdResult<Task> {
        self.put_json(href, update).await
    }

    pub async fn get_task(&self, href: &str) -> VcdResult<Task> {
        self.get_json(href).await
    }

    /// Polls a task until it reaches a terminal status or one of
    /// `statuses`, whichever comes first. Fails with
    /// [`VcdError::Timeout`] once the configured task timeout elapses.
    pub async fn wait_for_status(&self, href: &str, statuses: &[TaskStatus]) -> VcdResult<Task> {
        let config = self.config();
        let interval = config.task_poll_interval;
        let timeout = config.task_timeout;
        let start = Instant::now();

        loop {
            let task = self.get_task(href).await?;
            debug!(href, status = %task.status, progress = ?task.progress, "Polled task");
            if task.status.is_terminal() || statuses.contains(&task.status) {
                return Ok(task);
            }
            if start.elapsed() >= timeout {
                warn!(href, seconds = timeout.as_secs(), "Task wait timed out");
                return Err(Report::new(VcdError::Timeout {
                    href: href.to_string(),
                    seconds: timeout.as_secs(),
                }));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Waits for a task and fails unless it finished with `success`.
    pub async fn wait_for_success(&self, href: &str) -> VcdResult<Task> {
        let task = self.wait_for_status(href, &[TaskStatus::Success]).await?;
        if task.status == TaskStatus::Success {
            return Ok(task);
        }
        let message = task
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("task finished with status {}", task.status));
        Err(Report::new(VcdError::TaskFailed {
            href: href.to_string(),
            message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn failed_update_carries_error() {
        let update = TaskUpdate::new(TaskStatus::Running, "Creating cluster", "create")
            .with_progress(150)
            .failed("boom");
        assert_eq!(update.status, TaskStatus::Error);
        assert_eq!(update.progress, Some(100));
        let json = serde_json::to_value(&update).expect("serializable");
        assert_eq!(json["error"]["message"], "boom");
        assert_eq!(json["operationName"], "Creating cluster");
        assert!(json.get("owner").is_none());
    }
}
