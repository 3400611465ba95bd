//! Request/response correlation over a duplex envelope channel.
//!
//! Every outbound request is stamped with a fresh id and parked in
//! [`PendingRequests`] until the matching response arrives, the caller's
//! timeout fires, or the background sweeper reaps it.

use std::time::Duration;

use thiserror::Error;

use crate::messages::MessageError;

pub mod client;
pub mod pending;
pub mod server;
pub mod transport;

pub use client::RpcClient;
pub use pending::{PendingHandle, PendingRequests, spawn_sweeper};
pub use server::RpcServer;
pub use transport::{Connection, InMemoryTransport, RpcHandler, TcpTransport, Transport};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: u64, timeout: Duration },
    #[error("connection to {host} closed")]
    ChannelClosed { host: String },
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Message(#[from] MessageError),
}

pub type RpcResult<T> = Result<T, RpcError>;
