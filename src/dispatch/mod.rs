//! Task dispatch: pick a host, then hand the request to an executor manager.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::proto::TaskDispatchRequest;
use crate::models::Host;
use crate::rpc::RpcError;

mod dispatcher;
mod executor;
mod host_manager;
mod host_selector;

pub use dispatcher::ExecuteDispatcher;
pub use executor::RpcExecutorManager;
pub use host_manager::{HostManager, spawn_host_refresher};
pub use host_selector::{
    HostSelector, HostSelectorKind, LowerWeightSelector, RandomSelector, RoundRobinSelector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorType {
    /// Task runs on a worker from the task's worker group.
    Worker,
    /// Request is forwarded to another master.
    PeerMaster,
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorType::Worker => f.write_str("WORKER"),
            ExecutorType::PeerMaster => f.write_str("PEER_MASTER"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no executor manager registered for {0}")]
    NoExecutorManager(ExecutorType),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Message(String),
}

/// Everything needed to dispatch one task instance. `host` is filled in by
/// the dispatcher once a host has been selected.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub executor_type: ExecutorType,
    pub worker_group: String,
    pub workflow_instance_id: i64,
    pub task_instance_id: i64,
    pub request: TaskDispatchRequest,
    pub host: Option<Host>,
}

impl ExecutionContext {
    pub fn for_worker(request: TaskDispatchRequest) -> Self {
        Self {
            executor_type: ExecutorType::Worker,
            worker_group: request.worker_group.clone(),
            workflow_instance_id: request.workflow_instance_id,
            task_instance_id: request.task_instance_id,
            request,
            host: None,
        }
    }
}

#[async_trait]
pub trait ExecutorManager: Send + Sync {
    async fn before_execute(&self, _ctx: &ExecutionContext) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Returns whether the remote side accepted the task.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool, DispatchError>;

    /// Runs after every `execute`, whatever its outcome.
    async fn after_execute(&self, _ctx: &ExecutionContext) {}
}
