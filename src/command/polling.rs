use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, error, info, warn};

use super::{CommandFetcher, LoadProtection, SystemMetricsCollector};
use crate::backends::CommandBackend;
use crate::engine::{EngineError, WorkflowEngine, WorkflowRunnableFactory};
use crate::models::Command;
use crate::observability::obs;

#[derive(Clone, Debug)]
pub struct CommandFetchConfig {
    pub poll_interval: Duration,
}

impl Default for CommandFetchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Periodically claims this master's pending commands and triggers a
/// workflow for each, unless the host is overloaded.
pub struct CommandFetchCoordinator {
    fetcher: Arc<dyn CommandFetcher>,
    backend: Arc<dyn CommandBackend>,
    factory: Arc<dyn WorkflowRunnableFactory>,
    engine: WorkflowEngine,
    load_protection: LoadProtection,
    collector: Arc<dyn SystemMetricsCollector>,
    config: CommandFetchConfig,
}

impl CommandFetchCoordinator {
    pub fn new(
        fetcher: Arc<dyn CommandFetcher>,
        backend: Arc<dyn CommandBackend>,
        factory: Arc<dyn WorkflowRunnableFactory>,
        engine: WorkflowEngine,
        load_protection: LoadProtection,
        collector: Arc<dyn SystemMetricsCollector>,
        config: CommandFetchConfig,
    ) -> Self {
        Self {
            fetcher,
            backend,
            factory,
            engine,
            load_protection,
            collector,
            config,
        }
    }

    pub async fn run(self, shutdown: WaitForCancellationFutureOwned) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "starting command fetch coordinator"
        );
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("command fetch coordinator shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One fetch cycle. Returns how many workflows were triggered.
    #[obs]
    pub async fn poll_once(&self) -> usize {
        let metrics = self.collector.collect();
        if self.load_protection.is_overload(&metrics) {
            metrics::counter!("flowmaster_command_overload_skips_total").increment(1);
            debug!(?metrics, "host overloaded, skipping command fetch");
            return 0;
        }

        let commands = match self.fetcher.fetch_commands().await {
            Ok(commands) => commands,
            Err(err) => {
                metrics::counter!("flowmaster_command_fetch_errors_total").increment(1);
                error!(?err, "command fetch failed");
                return 0;
            }
        };

        let mut triggered = 0;
        for command in commands {
            if let Some(workflow_instance_id) = self.handle_command(&command).await {
                triggered += 1;
                metrics::counter!("flowmaster_command_triggered_total").increment(1);
                debug!(command_id = command.id, workflow_instance_id, "command triggered");
            }
        }
        triggered
    }

    async fn handle_command(&self, command: &Command) -> Option<i64> {
        let runnable = match self.factory.create(command).await {
            Ok(runnable) => runnable,
            Err(err) => {
                self.reject(command, &err.to_string()).await;
                return None;
            }
        };
        let workflow_instance_id = runnable.workflow_instance_id();
        match self.engine.trigger_workflow(runnable).await {
            Ok(()) => Some(workflow_instance_id),
            // The live runnable still owns the instance row.
            Err(err @ EngineError::AlreadyExists(_)) => {
                self.reject(command, &err.to_string()).await;
                None
            }
            Err(err) => {
                self.abandon(command, workflow_instance_id, &err.to_string()).await;
                None
            }
        }
    }

    /// The command already produced an instance that nothing will run.
    async fn abandon(&self, command: &Command, workflow_instance_id: i64, message: &str) {
        metrics::counter!("flowmaster_command_failed_total").increment(1);
        warn!(
            command_id = command.id,
            workflow_instance_id,
            error = %message,
            "workflow failed to start, closing instance"
        );
        if let Err(err) = self
            .backend
            .fail_workflow_instance(command, workflow_instance_id, message)
            .await
        {
            error!(command_id = command.id, workflow_instance_id, ?err, "failed to close instance");
        }
    }

    async fn reject(&self, command: &Command, message: &str) {
        metrics::counter!("flowmaster_command_failed_total").increment(1);
        warn!(command_id = command.id, error = %message, "command failed, moving to error store");
        if let Err(err) = self.backend.move_to_error_command(command, message).await {
            error!(command_id = command.id, ?err, "failed to move command to error store");
        }
    }
}
