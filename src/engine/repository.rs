use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::WorkflowExecutionRunnable;

/// Live runnables of this master keyed by workflow instance id. At most one
/// runnable exists per id.
#[derive(Default)]
pub struct WorkflowRunnableRepository {
    runnables: Mutex<HashMap<i64, Arc<dyn WorkflowExecutionRunnable>>>,
}

impl WorkflowRunnableRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false`, leaving the existing entry in place, when the id is
    /// already present.
    pub fn insert(&self, runnable: Arc<dyn WorkflowExecutionRunnable>) -> bool {
        let mut guard = self.runnables.lock().expect("runnable repository poisoned");
        match guard.entry(runnable.workflow_instance_id()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(runnable);
                true
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<dyn WorkflowExecutionRunnable>> {
        self.runnables
            .lock()
            .expect("runnable repository poisoned")
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: i64) -> Option<Arc<dyn WorkflowExecutionRunnable>> {
        self.runnables
            .lock()
            .expect("runnable repository poisoned")
            .remove(&id)
    }

    /// Remove the entry for `id` only if it is `runnable` itself.
    pub fn remove_if_same(&self, id: i64, runnable: &Arc<dyn WorkflowExecutionRunnable>) -> bool {
        let mut guard = self.runnables.lock().expect("runnable repository poisoned");
        let same = guard.get(&id).is_some_and(|current| {
            std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(runnable))
        });
        if same {
            guard.remove(&id);
        }
        same
    }

    pub fn contains(&self, id: i64) -> bool {
        self.runnables
            .lock()
            .expect("runnable repository poisoned")
            .contains_key(&id)
    }

    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .runnables
            .lock()
            .expect("runnable repository poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.runnables
            .lock()
            .expect("runnable repository poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
