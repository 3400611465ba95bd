//! Duplex envelope channels to remote hosts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::RpcError;
use crate::messages::{self, proto::Envelope};

const CHANNEL_CAPACITY: usize = 256;

/// One open channel to a remote host.
pub struct Connection {
    pub to_remote: mpsc::Sender<Envelope>,
    pub from_remote: mpsc::Receiver<Envelope>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Connection, RpcError>;
}

/// Serves inbound envelopes. A returned envelope is written back on the same
/// connection and must echo the request id.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Option<Envelope>;
}

#[derive(Clone, Debug)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str) -> Result<Connection, RpcError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| RpcError::Connect {
                host: host.to_string(),
                message: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|err| RpcError::Connect {
                host: host.to_string(),
                message: err.to_string(),
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(host, ?err, "failed to set TCP_NODELAY");
        }
        Ok(spawn_framed(stream, host.to_string()))
    }
}

/// Split a TCP stream into length-delimited prost envelope channels.
pub(crate) fn spawn_framed(stream: TcpStream, peer: String) -> Connection {
    let (mut sink, mut frames) =
        Framed::new(stream, LengthDelimitedCodec::new()).split::<Bytes>();
    let (to_remote, mut outbound) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
    let (inbound, from_remote) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let frame = Bytes::from(messages::encode_message(&envelope));
            if let Err(err) = sink.send(frame).await {
                warn!(peer = %writer_peer, ?err, "failed to write envelope");
                break;
            }
        }
        debug!(peer = %writer_peer, "writer closed");
    });

    tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(peer = %peer, ?err, "failed to read frame");
                    break;
                }
            };
            match messages::decode_message::<Envelope>(&frame) {
                Ok(envelope) => {
                    if inbound.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(peer = %peer, ?err, "dropping undecodable frame"),
            }
        }
        debug!(peer = %peer, "reader closed");
    });

    Connection {
        to_remote,
        from_remote,
    }
}

/// Routes envelopes to handlers registered in this process, keyed by host
/// address.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn RpcHandler>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.handlers
            .write()
            .expect("transport handlers poisoned")
            .insert(host.into(), handler);
    }

    pub fn unregister(&self, host: &str) -> bool {
        self.handlers
            .write()
            .expect("transport handlers poisoned")
            .remove(host)
            .is_some()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, host: &str) -> Result<Connection, RpcError> {
        let handler = self
            .handlers
            .read()
            .expect("transport handlers poisoned")
            .get(host)
            .cloned()
            .ok_or_else(|| RpcError::Connect {
                host: host.to_string(),
                message: "no handler registered".to_string(),
            })?;

        let (to_remote, mut outbound) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
        let (inbound, from_remote) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let handler = Arc::clone(&handler);
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Some(response) = handler.handle(envelope).await {
                        let _ = inbound.send(response).await;
                    }
                });
            }
        });
        Ok(Connection {
            to_remote,
            from_remote,
        })
    }
}
