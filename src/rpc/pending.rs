use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, info, warn};

use super::RpcError;
use crate::messages::proto::Envelope;

struct PendingEntry {
    deadline: Instant,
    sender: oneshot::Sender<Envelope>,
}

/// Correlation map from request id to the waiter of that request.
///
/// Each entry is removed exactly once: by [`PendingRequests::resolve`], by the
/// waiter giving up, or by [`PendingRequests::sweep_expired`]. Whoever removes
/// it owns the single wake-up.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: u64, timeout: Duration) -> PendingHandle {
        let (sender, receiver) = oneshot::channel();
        let entry = PendingEntry {
            deadline: Instant::now() + timeout,
            sender,
        };
        let previous = self
            .inner
            .lock()
            .expect("pending requests poisoned")
            .insert(request_id, entry);
        if previous.is_some() {
            warn!(request_id, "replaced pending request with duplicate id");
        }
        PendingHandle {
            request_id,
            receiver,
            requests: self.clone(),
        }
    }

    /// Hand `envelope` to the waiter registered under its request id.
    ///
    /// Returns `false` when nothing is waiting for that id any more.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let entry = self
            .inner
            .lock()
            .expect("pending requests poisoned")
            .remove(&envelope.request_id);
        match entry {
            Some(entry) => entry.sender.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, request_id: u64) -> bool {
        self.inner
            .lock()
            .expect("pending requests poisoned")
            .remove(&request_id)
            .is_some()
    }

    /// Drop every entry whose deadline plus `grace` is at or before `now`.
    /// Dropping the sender releases the waiter with a timeout.
    pub fn sweep_expired(&self, now: Instant, grace: Duration) -> Vec<u64> {
        let mut guard = self.inner.lock().expect("pending requests poisoned");
        let expired: Vec<u64> = guard
            .iter()
            .filter(|(_, entry)| entry.deadline + grace <= now)
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in &expired {
            guard.remove(request_id);
            warn!(request_id, "swept expired rpc request");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending requests poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waiter side of one registered request.
pub struct PendingHandle {
    request_id: u64,
    receiver: oneshot::Receiver<Envelope>,
    requests: PendingRequests,
}

impl PendingHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub async fn wait(self, timeout: Duration) -> Result<Envelope, RpcError> {
        let PendingHandle {
            request_id,
            receiver,
            requests,
        } = self;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(envelope)) => Ok(envelope),
            // Sender dropped: the sweeper already removed the entry.
            Ok(Err(_)) => {
                metrics::counter!("flowmaster_rpc_timeouts_total").increment(1);
                Err(RpcError::Timeout {
                    request_id,
                    timeout,
                })
            }
            Err(_) => {
                requests.cancel(request_id);
                metrics::counter!("flowmaster_rpc_timeouts_total").increment(1);
                debug!(request_id, ?timeout, "rpc wait timed out");
                Err(RpcError::Timeout {
                    request_id,
                    timeout,
                })
            }
        }
    }
}

/// Periodically reap requests nobody will ever answer.
pub fn spawn_sweeper(
    requests: PendingRequests,
    sweep_interval: Duration,
    grace: Duration,
    shutdown: WaitForCancellationFutureOwned,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            sweep_interval_ms = sweep_interval.as_millis(),
            "rpc sweeper started"
        );
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("rpc sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let swept = requests.sweep_expired(Instant::now(), grace);
                    if !swept.is_empty() {
                        metrics::counter!("flowmaster_rpc_swept_total")
                            .increment(swept.len() as u64);
                    }
                }
            }
        }
    })
}
