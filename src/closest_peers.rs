//! # Closest-Peers Maintenance
//!
//! Tracks the peers closest to the local node and tags them in the peer
//! store so connection management keeps them connected preferentially.
//!
//! - Every `PeerPinged` routing event feeds a [`PeerDistanceList`] centred on
//!   the local `KadId`.
//! - On each tick the list is diffed against the previously tagged set:
//!   newcomers get the close tag and the keep-alive tag, peers that fell out
//!   get both tags removed.
//!
//! `start`/`stop` are idempotent. Stopping drops the routing subscription
//! and the timer.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{DhtConfig, KEEP_ALIVE_TAG_NAME};
use crate::distance::PeerDistanceList;
use crate::identity::{PeerId, PeerInfo};
use crate::peerstore::{PeerStore, PeerUpdate, Tag};
use crate::routing::{RoutingEvent, RoutingTable};

struct Inner {
    routing: RoutingTable,
    peerstore: Arc<dyn PeerStore>,
    update_interval: Duration,
    close_tag_name: String,
    close_tag_value: u32,
    keep_alive_tag_value: u32,
    observed: Mutex<PeerDistanceList>,
    tagged: Mutex<HashSet<PeerId>>,
}

pub struct ClosestPeers {
    inner: Arc<Inner>,
    task: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ClosestPeers {
    pub fn new(routing: RoutingTable, peerstore: Arc<dyn PeerStore>, config: &DhtConfig) -> Self {
        let observed = PeerDistanceList::new(*routing.local_kad_id(), config.closest_peers_set_size);
        Self {
            inner: Arc::new(Inner {
                routing,
                peerstore,
                update_interval: config.closest_peers_update_interval,
                close_tag_name: config.close_tag_name.clone(),
                close_tag_value: config.close_tag_value,
                keep_alive_tag_value: config.keep_alive_tag_value,
                observed: Mutex::new(observed),
                tagged: Mutex::new(HashSet::new()),
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    pub fn start(&self) {
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let mut events = self.inner.routing.subscribe();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.update_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(RoutingEvent::PeerPinged(peer)) => inner.observe(peer).await,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "closest-peers tracker lagged behind routing events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = interval.tick() => inner.update_peer_tags().await,
                }
            }
            trace!("closest-peers maintenance stopped");
        });
        *slot = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let running = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Feed one observed-alive peer into the candidate set.
    pub async fn on_peer_ping(&self, peer: PeerId) {
        self.inner.observe(peer).await;
    }

    /// Diff the candidate set against the tagged set and update tags.
    pub async fn update_peer_tags(&self) {
        self.inner.update_peer_tags().await;
    }

    pub async fn tagged_peers(&self) -> HashSet<PeerId> {
        self.inner.tagged.lock().await.clone()
    }
}

impl Inner {
    async fn observe(&self, peer: PeerId) {
        self.observed.lock().await.add(PeerInfo::without_addrs(peer));
    }

    async fn update_peer_tags(&self) {
        let current: HashSet<PeerId> = self.observed.lock().await.peer_ids().into_iter().collect();
        let mut tagged = self.tagged.lock().await;

        let removed: Vec<PeerId> = tagged.difference(&current).cloned().collect();
        let added: Vec<PeerId> = current.difference(&tagged).cloned().collect();
        if removed.is_empty() && added.is_empty() {
            return;
        }

        for peer in &removed {
            let update = self.tag_update(None, None);
            if let Err(e) = self.peerstore.merge(peer, update).await {
                warn!(peer = %peer.short(), error = %e, "failed to untag peer");
            }
        }
        for peer in &added {
            let update = self.tag_update(
                Some(Tag { value: self.close_tag_value }),
                Some(Tag { value: self.keep_alive_tag_value }),
            );
            if let Err(e) = self.peerstore.merge(peer, update).await {
                warn!(peer = %peer.short(), error = %e, "failed to tag peer");
            }
        }

        debug!(added = added.len(), removed = removed.len(), "updated closest-peer tags");
        *tagged = current;
    }

    fn tag_update(&self, close: Option<Tag>, keep_alive: Option<Tag>) -> PeerUpdate {
        let mut tags = BTreeMap::new();
        tags.insert(self.close_tag_name.clone(), close);
        tags.insert(KEEP_ALIVE_TAG_NAME.to_string(), keep_alive);
        PeerUpdate {
            multiaddrs: Vec::new(),
            tags,
        }
    }
}
