//! Master coordinator: wires every component of one master process.
//!
//! A MasterCoordinator:
//! - Registers the master and keeps its heartbeat and command slot current
//! - Keeps the worker/master host pool refreshed from the registry
//! - Serves inbound RPC (state changes, control requests)
//! - Polls its command slot and triggers workflow runnables
//!
//! Several coordinators can share one backend; slot partitioning keeps each
//! command on exactly one of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{info, warn};

use crate::backends::{CommandBackend, MasterBackend, RegistryBackend};
use crate::command::{
    CommandFetchConfig, CommandFetchCoordinator, IdSlotBasedCommandFetcher, LoadProtection,
    MasterSlotManager, SlotSource, SystemMetricsCollector,
};
use crate::config::{Config, EVENT_SHARD_CAPACITY};
use crate::dispatch::{
    ExecuteDispatcher, ExecutorType, HostManager, RpcExecutorManager, spawn_host_refresher,
};
use crate::engine::{
    DefaultWorkflowRunnableFactory, RunnableContext, WorkflowEngine, WorkflowRunnableRepository,
};
use crate::events::{MasterRpcHandler, StateEventPipeline};
use crate::rpc::{RpcClient, RpcServer, Transport, spawn_sweeper};

pub struct MasterCoordinator {
    advertise_addr: String,
    engine: WorkflowEngine,
    handler: Arc<MasterRpcHandler>,
    pipeline: Arc<StateEventPipeline>,
    rpc_client: Arc<RpcClient>,
    host_manager: Arc<HostManager>,
    slot_manager: Option<Arc<MasterSlotManager>>,
    server: Option<RpcServer>,
    shutdown: CancellationToken,
    /// Parent of every runnable's driver token; cancelled after the event
    /// pipeline has drained.
    runnables: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl MasterCoordinator {
    pub async fn start<B>(
        config: Config,
        backend: Arc<B>,
        transport: Arc<dyn Transport>,
        collector: Arc<dyn SystemMetricsCollector>,
    ) -> Result<Self>
    where
        B: MasterBackend + 'static,
    {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let runnables = CancellationToken::new();
        let mut handles = Vec::new();
        let advertise_addr = config.advertise_addr.clone();
        let registry: Arc<dyn RegistryBackend> = backend.clone();
        let commands: Arc<dyn CommandBackend> = backend.clone();

        registry
            .register_master(&advertise_addr)
            .await
            .context("failed to register master")?;

        let repository = Arc::new(WorkflowRunnableRepository::new());
        let engine = WorkflowEngine::new(Arc::clone(&repository));

        let rpc_client = Arc::new(RpcClient::new(transport, config.rpc_timeout));
        handles.push(spawn_sweeper(
            rpc_client.pending().clone(),
            config.rpc_sweep_interval,
            config.rpc_sweep_interval,
            shutdown.clone().cancelled_owned(),
        ));

        let host_manager = Arc::new(HostManager::new(
            Arc::clone(&registry),
            config.host_selector.build(),
        ));
        if let Err(err) = host_manager.refresh().await {
            warn!(?err, "initial host pool refresh failed");
        }
        handles.push(spawn_host_refresher(
            Arc::clone(&host_manager),
            config.host_refresh_interval,
            shutdown.clone().cancelled_owned(),
        ));

        let executor = Arc::new(RpcExecutorManager::new(
            Arc::clone(&rpc_client),
            config.rpc_timeout,
        ));
        let mut dispatcher =
            ExecuteDispatcher::new(Arc::clone(&host_manager), config.dispatch_task_number);
        dispatcher
            .register(ExecutorType::Worker, executor.clone())
            .register(ExecutorType::PeerMaster, executor);

        let (slot, slot_manager) = match config.command.static_slot()? {
            Some(slot) => {
                info!(%slot, "using static command slot");
                (SlotSource::Static(slot), None)
            }
            None => {
                let manager = Arc::new(MasterSlotManager::new(advertise_addr.clone()));
                if let Err(err) = manager.refresh(registry.as_ref()).await {
                    warn!(?err, "initial master slot refresh failed");
                }
                (SlotSource::Dynamic(Arc::clone(&manager)), Some(manager))
            }
        };
        handles.push(spawn_master_heartbeat(
            Arc::clone(&registry),
            advertise_addr.clone(),
            slot_manager.clone(),
            config.host_refresh_interval,
            shutdown.clone().cancelled_owned(),
        ));

        let pipeline = Arc::new(StateEventPipeline::start(
            Arc::clone(&repository),
            config.event_shards,
            EVENT_SHARD_CAPACITY,
        ));
        let handler = Arc::new(MasterRpcHandler::new(Arc::clone(&pipeline), engine.clone()));
        let server = if config.rpc_server_enabled {
            Some(RpcServer::start(config.listen_addr, handler.clone()).await?)
        } else {
            None
        };

        let context = RunnableContext {
            backend: backend.clone(),
            dispatcher: Arc::new(dispatcher),
            rpc_client: Arc::clone(&rpc_client),
            engine: engine.clone(),
            master_address: advertise_addr.clone(),
            dispatch_retry_interval: config.dispatch_retry_interval,
            kill_timeout: config.rpc_timeout,
            shutdown: runnables.clone(),
        };
        let fetcher = Arc::new(IdSlotBasedCommandFetcher::new(
            Arc::clone(&commands),
            slot,
            config.command.fetch_size,
        ));
        let command_coordinator = CommandFetchCoordinator::new(
            fetcher,
            commands,
            Arc::new(DefaultWorkflowRunnableFactory::new(context)),
            engine.clone(),
            LoadProtection::new(config.load_protection),
            collector,
            CommandFetchConfig {
                poll_interval: config.command.poll_interval,
            },
        );
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            command_coordinator.run(token.cancelled_owned()).await;
        }));

        info!(address = %advertise_addr, "master started");
        Ok(Self {
            advertise_addr,
            engine,
            handler,
            pipeline,
            rpc_client,
            host_manager,
            slot_manager,
            server,
            shutdown,
            runnables,
            handles,
        })
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Handler for inbound envelopes; register it with an in-process
    /// transport when the TCP server is disabled.
    pub fn rpc_handler(&self) -> Arc<MasterRpcHandler> {
        Arc::clone(&self.handler)
    }

    pub fn rpc_client(&self) -> &Arc<RpcClient> {
        &self.rpc_client
    }

    pub fn host_manager(&self) -> &Arc<HostManager> {
        &self.host_manager
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(RpcServer::addr)
    }

    pub fn slot_manager(&self) -> Option<&Arc<MasterSlotManager>> {
        self.slot_manager.as_ref()
    }

    pub async fn shutdown(self) {
        info!(address = %self.advertise_addr, "master shutting down");
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        self.pipeline.shutdown().await;
        self.runnables.cancel();
        if let Some(server) = self.server {
            server.shutdown().await;
        }
    }
}

/// Re-register the master and recompute its slot every `heartbeat_interval`.
fn spawn_master_heartbeat(
    registry: Arc<dyn RegistryBackend>,
    address: String,
    slot_manager: Option<Arc<MasterSlotManager>>,
    heartbeat_interval: Duration,
    shutdown: WaitForCancellationFutureOwned,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(err) = registry.register_master(&address).await {
                        warn!(?err, "master heartbeat failed");
                        continue;
                    }
                    if let Some(manager) = &slot_manager
                        && let Err(err) = manager.refresh(registry.as_ref()).await
                    {
                        warn!(?err, "master slot refresh failed");
                    }
                }
            }
        }
    })
}
