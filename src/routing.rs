//! # Routing Table
//!
//! 256 k-buckets indexed by the length of the common prefix between the
//! local [`KadId`] and a peer's `KadId`. Bucket 0 holds the farthest half of
//! the key space, bucket 255 the closest peers.
//!
//! ## Eviction
//!
//! Entries are kept least-recently-contacted first. When a bucket is full the
//! oldest entry is pinged; only if the ping fails is it replaced by the
//! newcomer. At most one probe per bucket is in flight; newcomers arriving
//! while a probe runs are dropped.
//!
//! ## Actor Architecture
//!
//! - [`RoutingTable`]: cloneable handle used by queries and maintenance loops
//! - `RoutingActor`: owns the buckets, applies every mutation in order
//! - Change notifications go out on a `broadcast` channel
//!
//! | Event | Emitted when |
//! |-------|--------------|
//! | `PeerAdded` | a peer enters a bucket |
//! | `PeerRemoved` | a peer leaves (explicit removal or failed probe) |
//! | `PeerPinged` | a peer is observed alive (contact, refresh, successful probe) |

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{Distance, KadId, PeerId, PeerInfo};
use crate::protocols::DhtRpc;

/// Number of buckets, one per bit of the key space.
pub const NUM_BUCKETS: usize = 256;

/// Capacity of the change-notification channel. Slow subscribers observe
/// `RecvError::Lagged` rather than blocking the table.
const EVENT_CHANNEL_SIZE: usize = 256;

const COMMAND_CHANNEL_SIZE: usize = 256;

/// Upper bound on a liveness probe of a bucket's oldest entry.
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deepest bucket for which a random refresh key is generated. Finding a key
/// for bucket `i` takes about `2^(i+1)` hash attempts.
pub const MAX_REFRESH_BUCKET: usize = 15;

const MAX_RANDOM_KEY_ATTEMPTS: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
    PeerPinged(PeerId),
}

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub id: PeerId,
    pub kad_id: KadId,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Refreshed,
    /// Bucket full; the oldest entry is being probed.
    Pending,
    /// Local peer, or bucket full with a probe already running.
    Ignored,
}

// ============================================================================
// Buckets
// ============================================================================

#[derive(Debug)]
struct KBucket {
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum TouchOutcome {
    Inserted,
    Refreshed,
    Full { oldest: PeerId },
}

#[derive(Debug, Clone)]
struct PendingEviction {
    bucket: usize,
    oldest: PeerId,
    candidate: PeerId,
}

impl KBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() >= threshold
    }

    fn touch(&mut self, id: PeerId, kad_id: KadId, k: usize) -> TouchOutcome {
        if self.refresh(&id) {
            return TouchOutcome::Refreshed;
        }
        if self.entries.len() < k {
            self.entries.push(RoutingEntry {
                id,
                kad_id,
                last_seen: Instant::now(),
            });
            self.mark_refreshed();
            return TouchOutcome::Inserted;
        }
        match self.entries.first() {
            Some(oldest) => TouchOutcome::Full {
                oldest: oldest.id.clone(),
            },
            // k == 0
            None => TouchOutcome::Refreshed,
        }
    }

    /// Move an existing entry to the most-recent end.
    fn refresh(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            let mut entry = self.entries.remove(pos);
            entry.last_seen = Instant::now();
            self.entries.push(entry);
            self.mark_refreshed();
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

pub(crate) fn bucket_index(local: &KadId, other: &KadId) -> usize {
    (local.distance(other).leading_zeros() as usize).min(NUM_BUCKETS - 1)
}

/// A random key whose `KadId` falls into `bucket` relative to `local`.
/// `None` for buckets deeper than [`MAX_REFRESH_BUCKET`].
pub fn random_key_for_bucket(local: &KadId, bucket: usize) -> Option<Vec<u8>> {
    if bucket > MAX_REFRESH_BUCKET {
        return None;
    }
    let mut rng = rand::thread_rng();
    let mut key = vec![0u8; 32];
    for _ in 0..MAX_RANDOM_KEY_ATTEMPTS {
        rng.fill_bytes(&mut key);
        if bucket_index(local, &KadId::from_key(&key)) == bucket {
            return Some(key);
        }
    }
    None
}

pub(crate) struct KBucketTable {
    local: KadId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl KBucketTable {
    pub(crate) fn new(local: KadId, k: usize) -> Self {
        Self {
            local,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| KBucket::new()).collect(),
        }
    }

    fn touch(&mut self, id: PeerId) -> Option<(TouchOutcome, usize)> {
        let kad_id = id.kad_id();
        if kad_id == self.local {
            return None;
        }
        let idx = bucket_index(&self.local, &kad_id);
        Some((self.buckets[idx].touch(id, kad_id, self.k), idx))
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        let idx = bucket_index(&self.local, &id.kad_id());
        self.buckets[idx].remove(id)
    }

    fn find(&self, id: &PeerId) -> Option<RoutingEntry> {
        let idx = bucket_index(&self.local, &id.kad_id());
        self.buckets[idx].entries.iter().find(|e| &e.id == id).cloned()
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.id.clone()))
            .collect()
    }

    /// The `n` known peers closest to `target`, ascending by distance.
    fn closest(&self, target: &KadId, n: usize) -> Vec<PeerId> {
        if n == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<(Distance, PeerId)> = BinaryHeap::with_capacity(n + 1);
        for entry in self.buckets.iter().flat_map(|b| b.entries.iter()) {
            let dist = entry.kad_id.distance(target);
            if heap.len() < n {
                heap.push((dist, entry.id.clone()));
            } else if let Some((farthest, _)) = heap.peek()
                && dist < *farthest
            {
                heap.push((dist, entry.id.clone()));
                heap.pop();
            }
        }
        heap.into_sorted_vec().into_iter().map(|(_, id)| id).collect()
    }

    /// Returns the peer that left and the peer that entered the bucket.
    fn apply_ping_result(&mut self, pending: PendingEviction, oldest_alive: bool) -> (Option<PeerId>, Option<PeerId>) {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket];
        if oldest_alive {
            bucket.refresh(&pending.oldest);
            return (None, None);
        }

        let removed = bucket.remove(&pending.oldest).then_some(pending.oldest);
        let already_present = bucket.entries.iter().any(|e| e.id == pending.candidate);
        if already_present || bucket.entries.len() >= k {
            return (removed, None);
        }
        let kad_id = pending.candidate.kad_id();
        bucket.entries.push(RoutingEntry {
            id: pending.candidate.clone(),
            kad_id,
            last_seen: Instant::now(),
        });
        bucket.mark_refreshed();
        (removed, Some(pending.candidate))
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.mark_refreshed();
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Add(PeerId, oneshot::Sender<AddOutcome>),
    Remove(PeerId, oneshot::Sender<bool>),
    Closest(KadId, usize, oneshot::Sender<Vec<PeerId>>),
    Find(PeerId, oneshot::Sender<Option<RoutingEntry>>),
    Size(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<PeerId>>),
    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingEviction, bool),
    Quit,
}

#[derive(Clone)]
pub struct RoutingTable {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<RoutingEvent>,
    local: KadId,
    k: usize,
}

struct RoutingActor {
    table: KBucketTable,
    rpc: Arc<dyn DhtRpc>,
    events: broadcast::Sender<RoutingEvent>,
    probing: HashSet<usize>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
}

impl RoutingTable {
    /// Spawns the owning actor. `rpc` is used only for liveness probes.
    pub fn new(local: &PeerId, k: usize, rpc: Arc<dyn DhtRpc>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let local = local.kad_id();

        let actor = RoutingActor {
            table: KBucketTable::new(local, k),
            rpc,
            events: events.clone(),
            probing: HashSet::new(),
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            events,
            local,
            k,
        }
    }

    pub fn local_kad_id(&self) -> &KadId {
        &self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.events.subscribe()
    }

    /// Record a directly observed peer.
    pub async fn add(&self, peer: PeerId) -> AddOutcome {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Add(peer, tx)).await.is_err() {
            return AddOutcome::Ignored;
        }
        rx.await.unwrap_or(AddOutcome::Ignored)
    }

    pub async fn remove(&self, peer: &PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Remove(peer.clone(), tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Known peers only; never touches the network.
    pub async fn closest(&self, target: &KadId, n: usize) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Closest(*target, n, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn find(&self, peer: &PeerId) -> Option<RoutingEntry> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Find(peer.clone(), tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Size(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Peers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Non-empty buckets with no activity within `threshold`.
    pub async fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StaleBuckets(threshold, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn mark_bucket_refreshed(&self, bucket: usize) {
        let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl RoutingActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Add(peer, reply) => {
                    let outcome = self.handle_add(peer);
                    let _ = reply.send(outcome);
                }
                Command::Remove(peer, reply) => {
                    let removed = self.table.remove(&peer);
                    if removed {
                        debug!(peer = %peer.short(), "peer removed from routing table");
                        self.emit(RoutingEvent::PeerRemoved(peer));
                    }
                    let _ = reply.send(removed);
                }
                Command::Closest(target, n, reply) => {
                    let _ = reply.send(self.table.closest(&target, n));
                }
                Command::Find(peer, reply) => {
                    let _ = reply.send(self.table.find(&peer));
                }
                Command::Size(reply) => {
                    let _ = reply.send(self.table.len());
                }
                Command::Peers(reply) => {
                    let _ = reply.send(self.table.peers());
                }
                Command::StaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.table.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.table.mark_bucket_refreshed(idx);
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.handle_ping_result(pending, alive);
                }
                Command::Quit => break,
            }
        }
        trace!("routing table actor stopped");
    }

    fn emit(&self, event: RoutingEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn handle_add(&mut self, peer: PeerId) -> AddOutcome {
        let Some((outcome, bucket)) = self.table.touch(peer.clone()) else {
            return AddOutcome::Ignored;
        };
        match outcome {
            TouchOutcome::Inserted => {
                debug!(peer = %peer.short(), bucket, "peer added to routing table");
                self.emit(RoutingEvent::PeerAdded(peer.clone()));
                self.emit(RoutingEvent::PeerPinged(peer));
                AddOutcome::Added
            }
            TouchOutcome::Refreshed => {
                self.emit(RoutingEvent::PeerPinged(peer));
                AddOutcome::Refreshed
            }
            TouchOutcome::Full { oldest } => {
                if !self.probing.insert(bucket) {
                    trace!(peer = %peer.short(), bucket, "bucket full, probe already running");
                    return AddOutcome::Ignored;
                }
                self.spawn_liveness_probe(PendingEviction {
                    bucket,
                    oldest,
                    candidate: peer,
                });
                AddOutcome::Pending
            }
        }
    }

    fn spawn_liveness_probe(&self, pending: PendingEviction) {
        let rpc = self.rpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let target = PeerInfo::without_addrs(pending.oldest.clone());
            let alive = matches!(
                tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, rpc.ping(&target)).await,
                Ok(Ok(()))
            );
            trace!(peer = %pending.oldest.short(), alive, "liveness probe finished");
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(Command::ApplyPingResult(pending, alive)).await;
            }
        });
    }

    fn handle_ping_result(&mut self, pending: PendingEviction, alive: bool) {
        self.probing.remove(&pending.bucket);
        let oldest = pending.oldest.clone();
        let (removed, added) = self.table.apply_ping_result(pending, alive);
        if alive {
            self.emit(RoutingEvent::PeerPinged(oldest));
            return;
        }
        if let Some(removed) = removed {
            debug!(peer = %removed.short(), "evicted unresponsive peer");
            self.emit(RoutingEvent::PeerRemoved(removed));
        }
        if let Some(added) = added {
            self.emit(RoutingEvent::PeerAdded(added.clone()));
            self.emit(RoutingEvent::PeerPinged(added));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::messages::Message;

    struct ProbeRpc {
        alive: AtomicBool,
        pings: AtomicUsize,
    }

    impl ProbeRpc {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                pings: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DhtRpc for ProbeRpc {
        async fn send_request(&self, _to: &PeerInfo, _request: Message) -> anyhow::Result<Message> {
            anyhow::bail!("not used")
        }

        async fn send_message(&self, _to: &PeerInfo, _message: Message) -> anyhow::Result<()> {
            Ok(())
        }

        async fn ping(&self, _to: &PeerInfo) -> anyhow::Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                anyhow::bail!("injected ping failure")
            }
        }
    }

    /// Random peers that land in bucket 0 (farthest half) of `local`.
    fn peers_in_bucket_zero(local: &KadId, count: usize) -> Vec<PeerId> {
        let mut out = Vec::new();
        while out.len() < count {
            let peer = PeerId::random();
            if bucket_index(local, &peer.kad_id()) == 0 {
                out.push(peer);
            }
        }
        out
    }

    async fn next_event(rx: &mut broadcast::Receiver<RoutingEvent>) -> RoutingEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event arrives")
            .expect("channel open")
    }

    #[test]
    fn bucket_index_uses_common_prefix_length() {
        let local = KadId::from_raw([0u8; 32]);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        let mut near = [0u8; 32];
        near[31] = 0x01;
        assert_eq!(bucket_index(&local, &KadId::from_raw(far)), 0);
        assert_eq!(bucket_index(&local, &KadId::from_raw(near)), 255);
    }

    #[test]
    fn closest_returns_ascending_distance() {
        let local = PeerId::random();
        let mut table = KBucketTable::new(local.kad_id(), 20);
        let peers: Vec<PeerId> = (0..50).map(|_| PeerId::random()).collect();
        for p in &peers {
            table.touch(p.clone());
        }
        let target = KadId::from_key(b"target");
        let closest = table.closest(&target, 10);
        assert_eq!(closest.len(), 10);

        let dists: Vec<_> = closest.iter().map(|p| p.kad_id().distance(&target)).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));

        let mut all: Vec<_> = table.peers();
        all.sort_by_key(|p| p.kad_id().distance(&target));
        assert_eq!(closest, all[..10].to_vec());
        assert!(table.closest(&target, 0).is_empty());
    }

    #[test]
    fn touch_never_duplicates_and_ignores_self() {
        let local = PeerId::random();
        let mut table = KBucketTable::new(local.kad_id(), 20);
        let peer = PeerId::random();
        table.touch(peer.clone());
        table.touch(peer.clone());
        assert_eq!(table.len(), 1);
        assert!(table.touch(local).is_none());
        assert!(table.find(&peer).is_some());
    }

    #[tokio::test]
    async fn add_emits_added_and_pinged() {
        let local = PeerId::random();
        let table = RoutingTable::new(&local, 20, ProbeRpc::new(true));
        let mut rx = table.subscribe();
        let peer = PeerId::random();

        assert_eq!(table.add(peer.clone()).await, AddOutcome::Added);
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerAdded(peer.clone()));
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerPinged(peer.clone()));

        assert_eq!(table.add(peer.clone()).await, AddOutcome::Refreshed);
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerPinged(peer.clone()));
        assert_eq!(table.size().await, 1);

        assert!(table.remove(&peer).await);
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerRemoved(peer.clone()));
        assert!(!table.remove(&peer).await);
        assert_eq!(table.size().await, 0);
    }

    #[tokio::test]
    async fn full_bucket_keeps_responsive_incumbent() {
        let local = PeerId::random();
        let rpc = ProbeRpc::new(true);
        let table = RoutingTable::new(&local, 2, rpc.clone());
        let peers = peers_in_bucket_zero(&local.kad_id(), 3);
        table.add(peers[0].clone()).await;
        table.add(peers[1].clone()).await;

        let mut rx = table.subscribe();
        assert_eq!(table.add(peers[2].clone()).await, AddOutcome::Pending);
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerPinged(peers[0].clone()));

        assert_eq!(rpc.pings.load(Ordering::SeqCst), 1);
        assert!(table.find(&peers[2]).await.is_none());
        assert_eq!(table.size().await, 2);
    }

    #[tokio::test]
    async fn full_bucket_evicts_dead_incumbent() {
        let local = PeerId::random();
        let rpc = ProbeRpc::new(false);
        let table = RoutingTable::new(&local, 2, rpc.clone());
        let peers = peers_in_bucket_zero(&local.kad_id(), 3);
        table.add(peers[0].clone()).await;
        table.add(peers[1].clone()).await;

        let mut rx = table.subscribe();
        assert_eq!(table.add(peers[2].clone()).await, AddOutcome::Pending);
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerRemoved(peers[0].clone()));
        assert_eq!(next_event(&mut rx).await, RoutingEvent::PeerAdded(peers[2].clone()));

        assert!(table.find(&peers[0]).await.is_none());
        assert!(table.find(&peers[2]).await.is_some());
        assert_eq!(table.size().await, 2);
    }

    #[tokio::test]
    async fn stale_buckets_and_refresh_marking() {
        let local = PeerId::random();
        let table = RoutingTable::new(&local, 20, ProbeRpc::new(true));
        let peer = peers_in_bucket_zero(&local.kad_id(), 1).remove(0);
        table.add(peer).await;

        assert_eq!(table.stale_buckets(Duration::ZERO).await, vec![0]);
        assert!(table.stale_buckets(Duration::from_secs(60)).await.is_empty());
        table.mark_bucket_refreshed(0).await;
        assert!(table.stale_buckets(Duration::from_secs(60)).await.is_empty());
    }

    #[test]
    fn random_key_lands_in_requested_bucket() {
        let local = KadId::from_key(b"local");
        for bucket in [0, 3, 8] {
            let key = random_key_for_bucket(&local, bucket).expect("key found");
            assert_eq!(bucket_index(&local, &KadId::from_key(&key)), bucket);
        }
        assert!(random_key_for_bucket(&local, MAX_REFRESH_BUCKET + 1).is_none());
    }
}
