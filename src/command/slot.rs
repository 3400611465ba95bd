//! Id-slot partitioning of the command table across masters.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::backends::{BackendResult, RegistryBackend};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("id_step must be at least 1, got {0}")]
    InvalidStep(i64),
    #[error("slot_index {slot_index} must be in [0, {id_step})")]
    InvalidIndex { slot_index: i64, id_step: i64 },
}

/// A command belongs to this slot iff `id mod id_step == slot_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPredicate {
    id_step: i64,
    slot_index: i64,
}

impl SlotPredicate {
    pub fn new(id_step: i64, slot_index: i64) -> Result<Self, SlotError> {
        if id_step < 1 {
            return Err(SlotError::InvalidStep(id_step));
        }
        if !(0..id_step).contains(&slot_index) {
            return Err(SlotError::InvalidIndex {
                slot_index,
                id_step,
            });
        }
        Ok(Self {
            id_step,
            slot_index,
        })
    }

    /// A single master owns every command.
    pub fn all() -> Self {
        Self {
            id_step: 1,
            slot_index: 0,
        }
    }

    pub fn id_step(&self) -> i64 {
        self.id_step
    }

    pub fn slot_index(&self) -> i64 {
        self.slot_index
    }

    pub fn matches(&self, id: i64) -> bool {
        id.rem_euclid(self.id_step) == self.slot_index
    }
}

impl fmt::Display for SlotPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.slot_index, self.id_step)
    }
}

/// Derives this master's slot from the sorted list of live masters.
pub struct MasterSlotManager {
    local_address: String,
    current: std::sync::RwLock<Option<SlotPredicate>>,
}

impl MasterSlotManager {
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            current: std::sync::RwLock::new(None),
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// `None` until the local master shows up in the registry.
    pub fn current(&self) -> Option<SlotPredicate> {
        *self.current.read().expect("slot lock poisoned")
    }

    pub fn update(&self, masters: &[String]) -> Option<SlotPredicate> {
        let mut sorted: Vec<&String> = masters.iter().collect();
        sorted.sort();
        sorted.dedup();
        let slot = sorted
            .iter()
            .position(|address| *address == &self.local_address)
            .and_then(|index| SlotPredicate::new(sorted.len() as i64, index as i64).ok());

        let mut current = self.current.write().expect("slot lock poisoned");
        if *current != slot {
            match slot {
                Some(slot) => info!(%slot, masters = sorted.len(), "master slot changed"),
                None => info!(
                    address = %self.local_address,
                    "local master missing from registry, slot unknown"
                ),
            }
        }
        *current = slot;
        slot
    }

    pub async fn refresh(&self, registry: &dyn RegistryBackend) -> BackendResult<Option<SlotPredicate>> {
        let masters = registry.list_masters().await?;
        debug!(count = masters.len(), "refreshed master list");
        Ok(self.update(&masters))
    }
}
