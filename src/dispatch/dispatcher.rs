use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{DispatchError, ExecutionContext, ExecutorManager, ExecutorType, HostManager};
use crate::observability::obs;

/// Routes each dispatch to the executor manager registered for its type.
pub struct ExecuteDispatcher {
    managers: HashMap<ExecutorType, Arc<dyn ExecutorManager>>,
    host_manager: Arc<HostManager>,
    permits: Arc<Semaphore>,
}

impl ExecuteDispatcher {
    /// At most `task_number` dispatches are in flight at once.
    pub fn new(host_manager: Arc<HostManager>, task_number: usize) -> Self {
        Self {
            managers: HashMap::new(),
            host_manager,
            permits: Arc::new(Semaphore::new(task_number.max(1))),
        }
    }

    pub fn register(
        &mut self,
        executor_type: ExecutorType,
        manager: Arc<dyn ExecutorManager>,
    ) -> &mut Self {
        self.managers.insert(executor_type, manager);
        self
    }

    pub fn host_manager(&self) -> &Arc<HostManager> {
        &self.host_manager
    }

    /// `Ok(false)` with `ctx.host` unset when no host is eligible.
    #[obs]
    pub async fn dispatch(&self, ctx: &mut ExecutionContext) -> Result<bool, DispatchError> {
        let manager = self
            .managers
            .get(&ctx.executor_type)
            .cloned()
            .ok_or(DispatchError::NoExecutorManager(ctx.executor_type))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::Message("dispatcher closed".to_string()))?;

        let Some(host) = self.host_manager.select(ctx) else {
            ctx.host = None;
            metrics::counter!("flowmaster_dispatch_no_host_total").increment(1);
            warn!(
                task_instance_id = ctx.task_instance_id,
                worker_group = %ctx.worker_group,
                executor_type = %ctx.executor_type,
                "no eligible host for task"
            );
            return Ok(false);
        };
        debug!(
            task_instance_id = ctx.task_instance_id,
            host = %host.address,
            "dispatching task"
        );
        ctx.host = Some(host);

        let result = match manager.before_execute(ctx).await {
            Ok(()) => manager.execute(ctx).await,
            Err(err) => Err(err),
        };
        manager.after_execute(ctx).await;

        match &result {
            Ok(true) => metrics::counter!("flowmaster_dispatch_accepted_total").increment(1),
            Ok(false) => metrics::counter!("flowmaster_dispatch_rejected_total").increment(1),
            Err(_) => metrics::counter!("flowmaster_dispatch_errors_total").increment(1),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::dispatch::RoundRobinSelector;
    use crate::messages::proto::TaskDispatchRequest;
    use crate::models::Host;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingManager {
        calls: Mutex<Vec<&'static str>>,
        fail_execute: bool,
    }

    #[async_trait]
    impl ExecutorManager for RecordingManager {
        async fn before_execute(&self, _ctx: &ExecutionContext) -> Result<(), DispatchError> {
            self.calls.lock().expect("calls").push("before");
            Ok(())
        }

        async fn execute(&self, ctx: &ExecutionContext) -> Result<bool, DispatchError> {
            self.calls.lock().expect("calls").push("execute");
            assert!(ctx.host.is_some(), "host stamped before execute");
            if self.fail_execute {
                return Err(DispatchError::Message("worker unreachable".to_string()));
            }
            Ok(true)
        }

        async fn after_execute(&self, _ctx: &ExecutionContext) {
            self.calls.lock().expect("calls").push("after");
        }
    }

    async fn host_manager(hosts: &[&str]) -> Arc<HostManager> {
        let backend = Arc::new(MemoryBackend::new());
        for address in hosts {
            backend.add_host(Host::new(*address, 100, "default"));
        }
        let manager = HostManager::new(backend, Arc::new(RoundRobinSelector::new()));
        manager.refresh().await.expect("refresh");
        Arc::new(manager)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::for_worker(TaskDispatchRequest {
            task_instance_id: 7,
            workflow_instance_id: 1,
            worker_group: "default".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn runs_hooks_in_order() {
        let mut dispatcher = ExecuteDispatcher::new(host_manager(&["10.0.0.1:1234"]).await, 4);
        let manager = Arc::new(RecordingManager::default());
        dispatcher.register(ExecutorType::Worker, manager.clone());

        let mut ctx = ctx();
        assert!(dispatcher.dispatch(&mut ctx).await.expect("dispatch"));
        assert_eq!(
            ctx.host.map(|host| host.address),
            Some("10.0.0.1:1234".to_string())
        );
        assert_eq!(
            *manager.calls.lock().expect("calls"),
            vec!["before", "execute", "after"]
        );
    }

    #[tokio::test]
    async fn after_execute_runs_when_execute_fails() {
        let mut dispatcher = ExecuteDispatcher::new(host_manager(&["10.0.0.1:1234"]).await, 4);
        let manager = Arc::new(RecordingManager {
            fail_execute: true,
            ..Default::default()
        });
        dispatcher.register(ExecutorType::Worker, manager.clone());

        let mut ctx = ctx();
        assert!(dispatcher.dispatch(&mut ctx).await.is_err());
        assert_eq!(
            *manager.calls.lock().expect("calls"),
            vec!["before", "execute", "after"]
        );
    }

    #[tokio::test]
    async fn no_host_returns_false_without_calling_manager() {
        let mut dispatcher = ExecuteDispatcher::new(host_manager(&[]).await, 4);
        let manager = Arc::new(RecordingManager::default());
        dispatcher.register(ExecutorType::Worker, manager.clone());

        let mut ctx = ctx();
        assert!(!dispatcher.dispatch(&mut ctx).await.expect("dispatch"));
        assert!(ctx.host.is_none());
        assert!(manager.calls.lock().expect("calls").is_empty());
    }

    #[tokio::test]
    async fn unknown_executor_type_is_an_error() {
        let dispatcher = ExecuteDispatcher::new(host_manager(&["10.0.0.1:1234"]).await, 4);
        let mut ctx = ctx();
        ctx.executor_type = ExecutorType::PeerMaster;
        assert!(matches!(
            dispatcher.dispatch(&mut ctx).await,
            Err(DispatchError::NoExecutorManager(ExecutorType::PeerMaster))
        ));
    }
}
