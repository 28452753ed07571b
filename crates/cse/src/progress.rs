//! vCD tasks used as progress handles for CSE background work.

use api_types::Reference;
use api_types::TaskStatus;
use tracing::warn;
use vcd_client::TaskUpdate;
use vcd_client::VcdClient;
use vcd_client::VcdResult;

/// A CSE-owned vCD task.
///
/// Progress updates are best effort: a failed update is logged and never
/// fails the operation being reported on.
#[derive(Debug, Clone)]
pub struct ProgressTask {
    client: VcdClient,
    href: String,
    operation_name: String,
    operation: String,
    owner: Option<Reference>,
}

impl ProgressTask {
    /// Create the task in `running` state.
    pub async fn start(
        client: VcdClient,
        operation_name: &str,
        operation: &str,
        owner: Option<Reference>,
    ) -> VcdResult<Self> {
        let mut update = TaskUpdate::new(TaskStatus::Running, operation_name, operation);
        if let Some(owner) = owner.clone() {
            update = update.with_owner(owner);
        }
        let task = client.create_task(&update).await?;
        Ok(Self {
            client,
            href: task.href,
            operation_name: operation_name.to_string(),
            operation: operation.to_string(),
            owner,
        })
    }

    pub fn href(&self) -> &str {
        &self.href
    }

    fn update(&self, status: TaskStatus, message: &str) -> TaskUpdate {
        let mut update = TaskUpdate::new(status, &self.operation_name, message);
        if let Some(owner) = self.owner.clone() {
            update = update.with_owner(owner);
        }
        update
    }

    async fn send(&self, update: TaskUpdate) {
        if let Err(e) = self.client.update_task(&self.href, &update).await {
            warn!(href = %self.href, "Failed to update task: {e:?}");
        }
    }

    /// Still running, with a new progress message.
    pub async fn running(&self, message: &str) {
        self.send(self.update(TaskStatus::Running, message)).await;
    }

    pub async fn success(&self, message: &str) {
        self.send(self.update(TaskStatus::Success, message)).await;
    }

    pub async fn error(&self, message: &str) {
        self.send(self.update(TaskStatus::Running, &self.operation).failed(message))
            .await;
    }
}
