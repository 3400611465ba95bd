use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{DispatchError, ExecutionContext, ExecutorManager};
use crate::messages::proto::{MessageKind, TaskDispatchRequest, TaskDispatchResponse};
use crate::rpc::RpcClient;

/// Sends the dispatch request to the selected host and reports whether the
/// worker accepted it.
pub struct RpcExecutorManager {
    client: Arc<RpcClient>,
    timeout: Duration,
}

impl RpcExecutorManager {
    pub fn new(client: Arc<RpcClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ExecutorManager for RpcExecutorManager {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool, DispatchError> {
        let host = ctx
            .host
            .as_ref()
            .ok_or_else(|| DispatchError::Message("execute called without a host".to_string()))?;
        let response: TaskDispatchResponse = self
            .client
            .call::<TaskDispatchRequest, _>(
                &host.address,
                MessageKind::TaskDispatchRequest,
                &ctx.request,
                MessageKind::TaskDispatchResponse,
                self.timeout,
            )
            .await?;
        if !response.accepted {
            debug!(
                task_instance_id = ctx.task_instance_id,
                host = %host.address,
                message = %response.message,
                "worker rejected task"
            );
        }
        Ok(response.accepted)
    }
}
