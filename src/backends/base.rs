//! Backend interfaces the master uses for persistence and discovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::command::SlotPredicate;
use crate::models::{Command, Host, TaskInstance, WorkflowDag, WorkflowInstance};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Clone, Debug)]
/// Command that could not be turned into a workflow instance.
pub struct ErrorCommand {
    pub command: Command,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Workflow and task instance rows.
#[async_trait]
pub trait WorkflowInstanceBackend: Send + Sync {
    async fn get_workflow_instance(&self, id: i64) -> BackendResult<Option<WorkflowInstance>>;

    /// Returns `false` when no row was updated.
    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> BackendResult<bool>;

    /// Insert `task` and return its assigned id.
    async fn create_task_instance(&self, task: &TaskInstance) -> BackendResult<i64>;

    async fn update_task_instance(&self, task: &TaskInstance) -> BackendResult<bool>;

    async fn list_task_instances(&self, workflow_instance_id: i64)
    -> BackendResult<Vec<TaskInstance>>;
}

/// Pending command queue.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Pending commands owned by `slot`, ascending by id, at most `limit`.
    async fn list_pending_commands(
        &self,
        slot: SlotPredicate,
        limit: usize,
    ) -> BackendResult<Vec<Command>>;

    /// Turn `command` into a workflow instance owned by `host`, consuming the
    /// command. Recover and rerun commands only take over an instance that is
    /// terminal or whose owning master is no longer live; otherwise nothing
    /// changes and an error is returned.
    async fn create_workflow_instance(
        &self,
        command: &Command,
        host: &str,
    ) -> BackendResult<WorkflowInstance>;

    async fn move_to_error_command(&self, command: &Command, message: &str) -> BackendResult<()>;

    /// Close `workflow_instance_id`, already created from `command`, as
    /// failed and record the command in the error store.
    async fn fail_workflow_instance(
        &self,
        command: &Command,
        workflow_instance_id: i64,
        message: &str,
    ) -> BackendResult<()>;
}

#[async_trait]
pub trait WorkflowDefinitionBackend: Send + Sync {
    async fn load_dag(&self, code: i64, version: i32) -> BackendResult<WorkflowDag>;
}

/// Live masters and workers. Empty lists mean nothing is eligible.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn list_worker_groups(&self) -> BackendResult<Vec<String>>;

    async fn list_hosts(&self, worker_group: &str) -> BackendResult<Vec<Host>>;

    async fn list_masters(&self) -> BackendResult<Vec<String>>;

    /// Record a heartbeat for the master at `address`.
    async fn register_master(&self, address: &str) -> BackendResult<()>;
}

/// Everything a master process needs from its backend.
pub trait MasterBackend:
    WorkflowInstanceBackend + CommandBackend + WorkflowDefinitionBackend + RegistryBackend
{
}

impl<T> MasterBackend for T where
    T: WorkflowInstanceBackend + CommandBackend + WorkflowDefinitionBackend + RegistryBackend
{
}
