//! Workflow engine: owns the live runnables of this master and drives
//! trigger, pause, resume and stop requests against them.

use async_trait::async_trait;
use thiserror::Error;

use crate::backends::BackendError;
use crate::dispatch::DispatchError;
use crate::events::StateEvent;
use crate::models::WorkflowExecutionStatus;

mod factory;
mod repository;
mod runnable;
#[cfg(test)]
pub(crate) mod testing;
mod workflow_engine;

pub use factory::{DefaultWorkflowRunnableFactory, WorkflowRunnableFactory};
pub use repository::WorkflowRunnableRepository;
pub use runnable::{RunnableContext, WorkflowExecuteRunnable};
pub use workflow_engine::WorkflowEngine;

#[derive(Debug, Error)]
pub enum RunnableError {
    #[error("workflow instance {id} cannot {operation} in status {status}")]
    IllegalState {
        id: i64,
        operation: &'static str,
        status: WorkflowExecutionStatus,
    },
    #[error("failed to persist {entity} {id} as {status}")]
    PersistFailed {
        entity: &'static str,
        id: i64,
        status: String,
    },
    #[error("workflow instance {0} no longer accepts events")]
    MailboxClosed(i64),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("WorkflowExecuteRunnable not found: [id={0}]")]
    NotFound(i64),
    #[error("WorkflowExecuteRunnable already exists: [id={0}]")]
    AlreadyExists(i64),
    #[error("workflow instance {id} cannot {operation} in status {status}")]
    IllegalState {
        id: i64,
        operation: &'static str,
        status: WorkflowExecutionStatus,
    },
    #[error(transparent)]
    Runnable(#[from] RunnableError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// In-memory aggregate owning one workflow instance and its task graph.
#[async_trait]
pub trait WorkflowExecutionRunnable: Send + Sync {
    fn workflow_instance_id(&self) -> i64;

    fn status(&self) -> WorkflowExecutionStatus;

    async fn start(&self) -> Result<(), RunnableError>;

    async fn pause(&self) -> Result<(), RunnableError>;

    async fn resume(&self) -> Result<(), RunnableError>;

    async fn kill(&self) -> Result<(), RunnableError>;

    /// Enqueue `event` on the runnable's mailbox without waiting for it to be
    /// handled.
    fn submit_event(&self, event: StateEvent) -> Result<(), RunnableError>;
}
