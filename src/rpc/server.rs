use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RpcHandler;
use super::transport::spawn_framed;

/// TCP listener that feeds every inbound envelope to an [`RpcHandler`].
pub struct RpcServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RpcServer {
    pub async fn start(bind_addr: SocketAddr, handler: Arc<dyn RpcHandler>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind rpc server on {bind_addr}"))?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            Self::accept_loop(listener, handler, token).await;
        });
        info!(%addr, "rpc server listening");
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
        info!(addr = %self.addr, "rpc server stopped");
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn RpcHandler>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted rpc connection");
                        tokio::spawn(Self::serve_connection(
                            stream,
                            peer,
                            Arc::clone(&handler),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => warn!(?err, "rpc accept failed"),
                },
            }
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn RpcHandler>,
        shutdown: CancellationToken,
    ) {
        let mut connection = spawn_framed(stream, peer.to_string());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                inbound = connection.from_remote.recv() => {
                    let Some(envelope) = inbound else { break };
                    let handler = Arc::clone(&handler);
                    let responder = connection.to_remote.clone();
                    tokio::spawn(async move {
                        if let Some(response) = handler.handle(envelope).await {
                            let _ = responder.send(response).await;
                        }
                    });
                }
            }
        }
        debug!(%peer, "rpc connection finished");
    }
}
