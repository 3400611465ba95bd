use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{PendingHandle, PendingRequests, RpcError, Transport};
use crate::messages::{
    self,
    proto::{Envelope, ErrorResponse, MessageKind},
};

/// Connection to one host. Its lock is held while connecting, so only
/// callers of that host wait on a slow connect.
type ConnectionSlot = Arc<tokio::sync::Mutex<Option<mpsc::Sender<Envelope>>>>;

/// Outbound RPC client with one lazily opened connection per host.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
    connections: Mutex<HashMap<String, ConnectionSlot>>,
    next_request_id: AtomicU64,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            pending: PendingRequests::new(),
            connections: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Write a request to `host` and return the handle to await its response.
    pub async fn send<M: Message>(
        &self,
        host: &str,
        kind: MessageKind,
        payload: &M,
    ) -> Result<PendingHandle, RpcError> {
        self.send_with_timeout(host, kind, payload, self.default_timeout)
            .await
    }

    /// Send a request and decode the typed response. An `Error` envelope from
    /// the remote side surfaces as [`RpcError::Remote`].
    pub async fn call<Req, Resp>(
        &self,
        host: &str,
        kind: MessageKind,
        request: &Req,
        response_kind: MessageKind,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let handle = self.send_with_timeout(host, kind, request, timeout).await?;
        let envelope = handle.wait(timeout).await?;
        if envelope.kind == MessageKind::Error as i32 {
            let error: ErrorResponse = messages::decode_message(&envelope.payload)?;
            return Err(RpcError::Remote(error.message));
        }
        Ok(messages::decode_payload(&envelope, response_kind)?)
    }

    async fn send_with_timeout<M: Message>(
        &self,
        host: &str,
        kind: MessageKind,
        payload: &M,
        timeout: Duration,
    ) -> Result<PendingHandle, RpcError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let handle = self.pending.register(request_id, timeout);
        let envelope = messages::envelope(request_id, kind, payload);

        let slot = self.slot(host);
        let sender = match self.connection(host, &slot).await {
            Ok(sender) => sender,
            Err(err) => {
                self.pending.cancel(request_id);
                return Err(err);
            }
        };
        if sender.send(envelope).await.is_err() {
            self.pending.cancel(request_id);
            clear_slot(&slot, &sender).await;
            return Err(RpcError::ChannelClosed {
                host: host.to_string(),
            });
        }
        metrics::counter!("flowmaster_rpc_requests_total").increment(1);
        Ok(handle)
    }

    fn slot(&self, host: &str) -> ConnectionSlot {
        let mut guard = self.connections.lock().expect("rpc connections poisoned");
        Arc::clone(guard.entry(host.to_string()).or_default())
    }

    async fn connection(
        &self,
        host: &str,
        slot: &ConnectionSlot,
    ) -> Result<mpsc::Sender<Envelope>, RpcError> {
        let mut current = slot.lock().await;
        if let Some(sender) = current.as_ref()
            && !sender.is_closed()
        {
            return Ok(sender.clone());
        }

        let connection = self.transport.connect(host).await?;
        let sender = connection.to_remote;
        *current = Some(sender.clone());
        debug!(host, "opened rpc connection");

        tokio::spawn(Self::reader_loop(
            host.to_string(),
            connection.from_remote,
            self.pending.clone(),
            Arc::clone(slot),
            sender.clone(),
        ));
        Ok(sender)
    }

    async fn reader_loop(
        host: String,
        mut from_remote: mpsc::Receiver<Envelope>,
        pending: PendingRequests,
        slot: ConnectionSlot,
        sender: mpsc::Sender<Envelope>,
    ) {
        while let Some(envelope) = from_remote.recv().await {
            let request_id = envelope.request_id;
            if !pending.resolve(envelope) {
                metrics::counter!("flowmaster_rpc_orphan_responses_total").increment(1);
                warn!(host = %host, request_id, "orphan response");
            }
        }

        clear_slot(&slot, &sender).await;
        debug!(host = %host, "rpc connection closed");
    }
}

/// Forget `sender` unless the slot already moved on to a newer connection.
async fn clear_slot(slot: &ConnectionSlot, sender: &mpsc::Sender<Envelope>) {
    let mut current = slot.lock().await;
    if current
        .as_ref()
        .is_some_and(|existing| existing.same_channel(sender))
    {
        *current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::proto::{TaskKillRequest, TaskKillResponse};
    use crate::rpc::{InMemoryTransport, RpcHandler};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct KillHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for KillHandler {
        async fn handle(&self, envelope: Envelope) -> Option<Envelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let request: TaskKillRequest =
                messages::decode_payload(&envelope, MessageKind::TaskKillRequest).ok()?;
            if request.task_instance_id < 0 {
                return Some(messages::error_envelope(envelope.request_id, "bad task id"));
            }
            Some(messages::envelope(
                envelope.request_id,
                MessageKind::TaskKillResponse,
                &TaskKillResponse {
                    task_instance_id: request.task_instance_id,
                    success: true,
                    message: String::new(),
                },
            ))
        }
    }

    struct SilentHandler;

    #[async_trait]
    impl RpcHandler for SilentHandler {
        async fn handle(&self, _envelope: Envelope) -> Option<Envelope> {
            None
        }
    }

    fn client(transport: &InMemoryTransport) -> RpcClient {
        RpcClient::new(Arc::new(transport.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn call_round_trips_and_reuses_connection() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(KillHandler {
            calls: AtomicUsize::new(0),
        });
        transport.register("worker-1:1234", handler.clone());
        let client = client(&transport);

        for task_instance_id in [1, 2] {
            let response: TaskKillResponse = client
                .call(
                    "worker-1:1234",
                    MessageKind::TaskKillRequest,
                    &TaskKillRequest {
                        task_instance_id,
                        workflow_instance_id: 10,
                    },
                    MessageKind::TaskKillResponse,
                    Duration::from_secs(1),
                )
                .await
                .expect("kill response");
            assert_eq!(response.task_instance_id, task_instance_id);
            assert!(response.success);
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.connections.lock().expect("connections").len(), 1);
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn error_envelope_surfaces_as_remote_error() {
        let transport = InMemoryTransport::new();
        transport.register(
            "worker-1:1234",
            Arc::new(KillHandler {
                calls: AtomicUsize::new(0),
            }),
        );
        let client = client(&transport);

        let err = client
            .call::<_, TaskKillResponse>(
                "worker-1:1234",
                MessageKind::TaskKillRequest,
                &TaskKillRequest {
                    task_instance_id: -1,
                    workflow_instance_id: 10,
                },
                MessageKind::TaskKillResponse,
                Duration::from_secs(1),
            )
            .await
            .expect_err("remote rejects");
        assert!(matches!(err, RpcError::Remote(message) if message == "bad task id"));
    }

    #[tokio::test]
    async fn unknown_host_fails_to_connect() {
        let client = client(&InMemoryTransport::new());
        let err = client
            .send("nowhere:1", MessageKind::Heartbeat, &ErrorResponse::default())
            .await
            .err()
            .expect("connect fails");
        assert!(matches!(err, RpcError::Connect { .. }));
        assert!(client.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let transport = InMemoryTransport::new();
        transport.register("worker-1:1234", Arc::new(SilentHandler));
        let client = client(&transport);

        let handle = client
            .send(
                "worker-1:1234",
                MessageKind::TaskKillRequest,
                &TaskKillRequest::default(),
            )
            .await
            .expect("send");
        let request_id = handle.request_id();
        let err = handle
            .wait(Duration::from_millis(200))
            .await
            .expect_err("never answered");
        assert!(matches!(err, RpcError::Timeout { request_id: id, .. } if id == request_id));
        assert!(client.pending().is_empty());
    }

    /// Transport whose connects to `slow:1` hang for two seconds.
    struct SlowTransport {
        inner: InMemoryTransport,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn connect(&self, host: &str) -> Result<crate::rpc::Connection, RpcError> {
            if host == "slow:1" {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            self.inner.connect(host).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_does_not_block_other_hosts() {
        let inner = InMemoryTransport::new();
        for host in ["slow:1", "fast:1"] {
            inner.register(
                host,
                Arc::new(KillHandler {
                    calls: AtomicUsize::new(0),
                }),
            );
        }
        let client = Arc::new(RpcClient::new(
            Arc::new(SlowTransport { inner }),
            Duration::from_secs(5),
        ));
        let kill = |task_instance_id| TaskKillRequest {
            task_instance_id,
            workflow_instance_id: 10,
        };

        let slow_client = Arc::clone(&client);
        let slow = tokio::spawn(async move {
            slow_client
                .call::<_, TaskKillResponse>(
                    "slow:1",
                    MessageKind::TaskKillRequest,
                    &kill(1),
                    MessageKind::TaskKillResponse,
                    Duration::from_secs(5),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        let fast: TaskKillResponse = client
            .call(
                "fast:1",
                MessageKind::TaskKillRequest,
                &kill(2),
                MessageKind::TaskKillResponse,
                Duration::from_secs(5),
            )
            .await
            .expect("fast host answers");
        assert_eq!(fast.task_instance_id, 2);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "waited {:?} behind the slow connect",
            started.elapsed()
        );

        let slow = slow.await.expect("join").expect("slow host answers");
        assert_eq!(slow.task_instance_id, 1);
    }
}
