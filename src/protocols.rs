//! Trait seams between the DHT engine and its collaborators.
//!
//! | Seam | Trait | Implemented by |
//! |------|-------|----------------|
//! | Outbound RPC | [`DhtRpc`] | `network::Network` |
//! | Stream opening | [`Dialer`] | `transport::TcpTransport`, `transport::MemoryTransport` |
//! | Protocol registration | [`Registrar`] | same as `Dialer` |
//! | Inbound streams | [`StreamHandler`] | `rpc::RpcHandler` |
//! | Closest-peer lookup | [`ClosestPeersLookup`] | `query::QueryEngine` |
//! | Content announcement | [`ContentProvider`] | `query::QueryEngine` |
//!
//! Maintenance loops depend only on the last two traits so they can be
//! driven by a mock in tests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::DhtError;
use crate::identity::PeerInfo;
use crate::messages::{Message, MessageType};

/// A negotiated, bidirectional byte stream speaking one protocol.
pub trait DhtIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DhtIo for T {}

pub type DhtStream = Box<dyn DhtIo>;

/// Outbound DHT RPCs.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Send a request and wait for exactly one reply.
    async fn send_request(&self, to: &PeerInfo, request: Message) -> Result<Message>;

    /// Send a message that expects no reply (ADD_PROVIDER).
    async fn send_message(&self, to: &PeerInfo, message: Message) -> Result<()>;

    /// Liveness probe.
    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        let reply = self
            .send_request(to, Message::request(MessageType::Ping, Vec::new()))
            .await?;
        match reply.kind() {
            Ok(MessageType::Ping) => Ok(()),
            _ => anyhow::bail!("unexpected reply to PING"),
        }
    }
}

#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn open_stream(&self, peer: &PeerInfo, protocol: &str) -> Result<DhtStream>;
}

#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Serve one inbound stream until the remote closes it.
    async fn handle_stream(&self, remote: PeerInfo, stream: DhtStream) -> Result<()>;
}

#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    async fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<()>;

    async fn unhandle(&self, protocol: &str);
}

#[async_trait]
pub trait ClosestPeersLookup: Send + Sync + 'static {
    /// Run a closest-peers lookup for `key` and return the final closest set.
    async fn lookup_closest(&self, key: &[u8], cancel: CancellationToken) -> Result<Vec<PeerInfo>, DhtError>;
}

#[async_trait]
pub trait ContentProvider: Send + Sync + 'static {
    /// Announce the local node as provider of `cid`. Returns the number of
    /// peers the announcement was sent to.
    async fn announce(&self, cid: &Cid, cancel: CancellationToken) -> Result<usize, DhtError>;
}
