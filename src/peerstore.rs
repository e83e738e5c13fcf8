//! Peer metadata store.
//!
//! The DHT never owns peer metadata; it reads known addresses and writes
//! addresses and tags through [`PeerStore`]. Connection management (outside
//! this crate) reads the tags to decide which connections to keep.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use multiaddr::Multiaddr;
use tokio::sync::RwLock;

use crate::identity::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag {
    pub value: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerRecord {
    pub addrs: Vec<Multiaddr>,
    pub tags: BTreeMap<String, Tag>,
}

/// A partial update. Addresses are unioned with the known set; a tag mapped
/// to `None` is removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub multiaddrs: Vec<Multiaddr>,
    pub tags: BTreeMap<String, Option<Tag>>,
}

#[async_trait]
pub trait PeerStore: Send + Sync + 'static {
    async fn get(&self, peer: &PeerId) -> Option<PeerRecord>;

    async fn merge(&self, peer: &PeerId, update: PeerUpdate) -> anyhow::Result<()>;

    async fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.get(peer).await.map(|r| r.addrs).unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MemoryPeerStore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(peer).cloned()
    }

    async fn merge(&self, peer: &PeerId, update: PeerUpdate) -> anyhow::Result<()> {
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer.clone()).or_default();
        for addr in update.multiaddrs {
            if !record.addrs.contains(&addr) {
                record.addrs.push(addr);
            }
        }
        for (name, tag) in update.tags {
            match tag {
                Some(tag) => {
                    record.tags.insert(name, tag);
                }
                None => {
                    record.tags.remove(&name);
                }
            }
        }
        Ok(())
    }
}
