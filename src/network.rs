//! Outbound RPC client.
//!
//! Opens one stream per exchange through the [`Dialer`], writes the request
//! frame and reads at most one reply frame. Peers handed to us without
//! addresses are resolved through the peer store first.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::identity::PeerInfo;
use crate::messages::{read_message, write_message, Message};
use crate::peerstore::PeerStore;
use crate::protocols::{DhtRpc, Dialer};

pub struct Network {
    dialer: Arc<dyn Dialer>,
    peerstore: Arc<dyn PeerStore>,
    protocol: String,
    timeout: Duration,
}

impl Network {
    pub fn new(dialer: Arc<dyn Dialer>, peerstore: Arc<dyn PeerStore>, protocol: String, timeout: Duration) -> Self {
        Self {
            dialer,
            peerstore,
            protocol,
            timeout,
        }
    }

    async fn resolve(&self, peer: &PeerInfo) -> PeerInfo {
        if !peer.addrs.is_empty() {
            return peer.clone();
        }
        PeerInfo::new(peer.id.clone(), self.peerstore.addresses(&peer.id).await)
    }
}

#[async_trait]
impl DhtRpc for Network {
    async fn send_request(&self, to: &PeerInfo, request: Message) -> Result<Message> {
        let target = self.resolve(to).await;
        let kind = request.kind().map(|k| k.as_str()).unwrap_or("UNKNOWN");
        trace!(peer = %to.id.short(), kind, "sending request");

        let reply = tokio::time::timeout(self.timeout, async {
            let mut stream = self
                .dialer
                .open_stream(&target, &self.protocol)
                .await
                .context("failed to open stream")?;
            write_message(&mut stream, &request).await?;
            let reply = read_message(&mut stream)
                .await?
                .ok_or_else(|| anyhow::anyhow!("stream closed before reply"))?;
            let _ = stream.shutdown().await;
            Ok::<_, anyhow::Error>(reply)
        })
        .await
        .context("RPC timed out")??;

        if !reply.error.is_empty() {
            anyhow::bail!("remote error: {}", reply.error);
        }
        Ok(reply)
    }

    async fn send_message(&self, to: &PeerInfo, message: Message) -> Result<()> {
        let target = self.resolve(to).await;
        tokio::time::timeout(self.timeout, async {
            let mut stream = self
                .dialer
                .open_stream(&target, &self.protocol)
                .await
                .context("failed to open stream")?;
            write_message(&mut stream, &message).await?;
            stream.shutdown().await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("RPC timed out")?
    }
}
