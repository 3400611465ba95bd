use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventError, StateEvent};
use crate::engine::WorkflowRunnableRepository;

/// Fixed pool of ordered queues. Events for one workflow instance always land
/// on the same shard, so they reach its runnable in arrival order.
pub struct StateEventPipeline {
    shards: Vec<mpsc::Sender<StateEvent>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StateEventPipeline {
    pub fn start(
        repository: Arc<WorkflowRunnableRepository>,
        shard_count: usize,
        shard_capacity: usize,
    ) -> Self {
        let shard_count = shard_count.max(1);
        let shutdown = CancellationToken::new();
        let mut shards = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (sender, receiver) = mpsc::channel(shard_capacity.max(1));
            shards.push(sender);
            handles.push(tokio::spawn(Self::drain(
                shard,
                receiver,
                Arc::clone(&repository),
                shutdown.clone(),
            )));
        }
        info!(shards = shard_count, "state event pipeline started");
        Self {
            shards,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, workflow_instance_id: i64) -> usize {
        workflow_instance_id.rem_euclid(self.shards.len() as i64) as usize
    }

    /// Queue `event` on its instance's shard, waiting while that shard is full.
    pub async fn submit(&self, event: StateEvent) -> Result<(), EventError> {
        if self.shutdown.is_cancelled() {
            return Err(EventError::PipelineClosed);
        }
        let shard = self.shard_for(event.workflow_instance_id());
        self.shards[shard]
            .send(event)
            .await
            .map_err(|_| EventError::PipelineClosed)?;
        metrics::counter!("flowmaster_events_received_total").increment(1);
        Ok(())
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn shutdown(&self) {
        self.trigger_shutdown();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("pipeline handles poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
        info!("state event pipeline stopped");
    }

    async fn drain(
        shard: usize,
        mut receiver: mpsc::Receiver<StateEvent>,
        repository: Arc<WorkflowRunnableRepository>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Deliver what was accepted before shutdown.
                    receiver.close();
                    while let Ok(event) = receiver.try_recv() {
                        Self::route(&repository, event);
                    }
                    break;
                }
                next = receiver.recv() => {
                    let Some(event) = next else { break };
                    Self::route(&repository, event);
                }
            }
        }
        debug!(shard, "state event shard stopped");
    }

    fn route(repository: &WorkflowRunnableRepository, event: StateEvent) {
        let workflow_instance_id = event.workflow_instance_id();
        let Some(runnable) = repository.get(workflow_instance_id) else {
            metrics::counter!("flowmaster_events_dropped_total").increment(1);
            warn!(
                workflow_instance_id,
                task_instance_id = ?event.task_instance_id(),
                event_type = ?event.event_type(),
                "dropping state event for unknown workflow instance"
            );
            return;
        };
        if let Err(err) = runnable.submit_event(event) {
            metrics::counter!("flowmaster_events_dropped_total").increment(1);
            warn!(workflow_instance_id, ?err, "runnable refused state event");
        }
    }
}
