//! Command intake: which commands this master owns, when it is allowed to take
//! more, and the loop that turns them into running workflows.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backends::{BackendResult, CommandBackend};

mod load;
mod polling;
mod slot;

pub use load::{
    FixedMetricsCollector, LoadProtection, LoadProtectionConfig, SysinfoMetricsCollector,
    SystemMetrics, SystemMetricsCollector,
};
pub use polling::{CommandFetchConfig, CommandFetchCoordinator};
pub use slot::{MasterSlotManager, SlotError, SlotPredicate};

#[async_trait]
pub trait CommandFetcher: Send + Sync {
    async fn fetch_commands(&self) -> BackendResult<Vec<crate::models::Command>>;
}

/// Where the fetcher takes its slot from.
#[derive(Clone)]
pub enum SlotSource {
    Static(SlotPredicate),
    /// Follows the live master list; unknown until this master is registered.
    Dynamic(Arc<MasterSlotManager>),
}

impl SlotSource {
    pub fn current(&self) -> Option<SlotPredicate> {
        match self {
            SlotSource::Static(slot) => Some(*slot),
            SlotSource::Dynamic(manager) => manager.current(),
        }
    }
}

/// Fetches the oldest pending commands whose id falls in this master's slot.
pub struct IdSlotBasedCommandFetcher {
    backend: Arc<dyn CommandBackend>,
    slot: SlotSource,
    fetch_size: usize,
}

impl IdSlotBasedCommandFetcher {
    pub fn new(backend: Arc<dyn CommandBackend>, slot: SlotSource, fetch_size: usize) -> Self {
        Self {
            backend,
            slot,
            fetch_size: fetch_size.max(1),
        }
    }
}

#[async_trait]
impl CommandFetcher for IdSlotBasedCommandFetcher {
    async fn fetch_commands(&self) -> BackendResult<Vec<crate::models::Command>> {
        let Some(slot) = self.slot.current() else {
            debug!("master slot unknown, skipping command fetch");
            return Ok(Vec::new());
        };
        let commands = self
            .backend
            .list_pending_commands(slot, self.fetch_size)
            .await?;
        if !commands.is_empty() {
            metrics::counter!("flowmaster_command_fetched_total").increment(commands.len() as u64);
            debug!(%slot, count = commands.len(), "fetched commands");
        }
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::models::{Command, CommandType};
    use chrono::Utc;
    use serde_json::Value;

    fn seeded(count: i64) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for id in 1..=count {
            backend.insert_command(Command {
                id,
                command_type: CommandType::Start,
                workflow_definition_code: 1,
                workflow_definition_version: 1,
                workflow_instance_id: None,
                worker_group: "default".to_string(),
                params: Value::Null,
                created_at: Utc::now(),
            });
        }
        backend
    }

    async fn ids(fetcher: &IdSlotBasedCommandFetcher) -> Vec<i64> {
        fetcher
            .fetch_commands()
            .await
            .expect("fetch")
            .into_iter()
            .map(|command| command.id)
            .collect()
    }

    #[tokio::test]
    async fn slots_partition_the_command_table() {
        let backend = Arc::new(seeded(12));
        let mut seen = Vec::new();
        for slot_index in 0..3 {
            let fetcher = IdSlotBasedCommandFetcher::new(
                backend.clone(),
                SlotSource::Static(SlotPredicate::new(3, slot_index).expect("slot")),
                100,
            );
            let owned = ids(&fetcher).await;
            assert!(owned.iter().all(|id| id % 3 == slot_index));
            seen.extend(owned);
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn fetch_size_bounds_batch() {
        let backend = Arc::new(seeded(10));
        let fetcher =
            IdSlotBasedCommandFetcher::new(backend, SlotSource::Static(SlotPredicate::all()), 4);
        assert_eq!(ids(&fetcher).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unknown_dynamic_slot_fetches_nothing() {
        let backend = Arc::new(seeded(3));
        let manager = Arc::new(MasterSlotManager::new("10.0.0.9:5678"));
        let fetcher =
            IdSlotBasedCommandFetcher::new(backend, SlotSource::Dynamic(manager.clone()), 10);
        assert!(ids(&fetcher).await.is_empty());

        manager.update(&["10.0.0.9:5678".to_string()]);
        assert_eq!(ids(&fetcher).await, vec![1, 2, 3]);
    }
}
