use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, info, warn};

use super::{ExecutionContext, ExecutorType, HostSelector};
use crate::backends::{BackendResult, RegistryBackend};
use crate::models::Host;

/// Weight given to peer masters; the registry does not report one.
const MASTER_WEIGHT: u32 = 100;

/// Cached view of the registry plus the configured selection strategy.
pub struct HostManager {
    registry: Arc<dyn RegistryBackend>,
    selector: Arc<dyn HostSelector>,
    workers: RwLock<HashMap<String, Vec<Host>>>,
    masters: RwLock<Vec<Host>>,
}

impl HostManager {
    pub fn new(registry: Arc<dyn RegistryBackend>, selector: Arc<dyn HostSelector>) -> Self {
        Self {
            registry,
            selector,
            workers: RwLock::new(HashMap::new()),
            masters: RwLock::new(Vec::new()),
        }
    }

    pub fn select(&self, ctx: &ExecutionContext) -> Option<Host> {
        let pool = match ctx.executor_type {
            ExecutorType::Worker => self.hosts(&ctx.worker_group),
            ExecutorType::PeerMaster => self.masters.read().expect("masters poisoned").clone(),
        };
        if pool.is_empty() {
            return None;
        }
        self.selector.select(&pool)
    }

    pub fn hosts(&self, worker_group: &str) -> Vec<Host> {
        self.workers
            .read()
            .expect("workers poisoned")
            .get(worker_group)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn refresh(&self) -> BackendResult<()> {
        let groups = self.registry.list_worker_groups().await?;
        let mut workers = HashMap::with_capacity(groups.len());
        for group in groups {
            let hosts = self.registry.list_hosts(&group).await?;
            workers.insert(group, hosts);
        }
        let masters: Vec<Host> = self
            .registry
            .list_masters()
            .await?
            .into_iter()
            .map(|address| Host::new(address, MASTER_WEIGHT, ""))
            .collect();

        debug!(
            groups = workers.len(),
            masters = masters.len(),
            "refreshed host pool"
        );
        *self.workers.write().expect("workers poisoned") = workers;
        *self.masters.write().expect("masters poisoned") = masters;
        Ok(())
    }
}

/// Refresh `manager` from the registry every `refresh_interval`.
pub fn spawn_host_refresher(
    manager: Arc<HostManager>,
    refresh_interval: Duration,
    shutdown: WaitForCancellationFutureOwned,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            refresh_interval_ms = refresh_interval.as_millis(),
            "host refresher started"
        );
        let mut ticker = interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("host refresher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = manager.refresh().await {
                        warn!(?err, "failed to refresh host pool");
                    }
                }
            }
        }
    })
}
