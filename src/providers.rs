//! # Provider Store
//!
//! Maps content to the peers that advertise providing it.
//!
//! ## Keying
//!
//! Records are keyed by the CID's multihash, not by the CID itself, so CIDs
//! that differ only in version or codec share one provider set. Each
//! `(digest, peer)` pair is one datastore entry:
//!
//! ```text
//! /dht/provider/<hex multihash>/<hex peer id>  ->  bincode(ProviderEntry)
//! ```
//!
//! Adding an existing pair refreshes its timestamp in place; it never
//! creates a second record.
//!
//! ## Expiry
//!
//! Records older than the validity window are filtered out on every read and
//! deleted by a periodic sweep. An LRU cache of recently read provider sets
//! sits in front of the datastore.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cid::Cid;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::datastore::Datastore;
use crate::error::DhtError;
use crate::identity::{now_ms, PeerId};

const PROVIDER_PREFIX: &str = "/dht/provider/";

const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ProviderEntry {
    added_at_ms: u64,
}

/// Multihash bytes of the content; the dedup key across CID versions.
pub fn content_digest(cid: &Cid) -> Vec<u8> {
    cid.hash().to_bytes()
}

fn digest_prefix(digest: &[u8]) -> String {
    format!("{PROVIDER_PREFIX}{}/", hex::encode(digest))
}

fn entry_key(digest: &[u8], peer: &PeerId) -> String {
    format!("{}{}", digest_prefix(digest), peer.to_hex())
}

/// `/dht/provider/<digest>/<peer>` -> (digest, peer).
fn parse_entry_key(key: &str) -> Option<(Vec<u8>, PeerId)> {
    let rest = key.strip_prefix(PROVIDER_PREFIX)?;
    let (digest, peer) = rest.split_once('/')?;
    let digest = hex::decode(digest).ok()?;
    let peer = peer.parse().ok()?;
    Some((digest, peer))
}

enum Command {
    Add(Vec<u8>, PeerId, oneshot::Sender<Result<(), DhtError>>),
    Get(Vec<u8>, oneshot::Sender<Result<Vec<PeerId>, DhtError>>),
    Remove(Vec<u8>, PeerId, oneshot::Sender<Result<(), DhtError>>),
    Cleanup(oneshot::Sender<Result<usize, DhtError>>),
    LocalProvides(Duration, oneshot::Sender<Result<Vec<Vec<u8>>, DhtError>>),
    Count(oneshot::Sender<Result<usize, DhtError>>),
}

#[derive(Clone)]
pub struct ProviderStore {
    cmd_tx: mpsc::Sender<Command>,
    cleanup_interval: Duration,
    cleanup_task: Arc<StdMutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

struct ProviderStoreActor {
    datastore: Arc<dyn Datastore>,
    local: PeerId,
    validity_ms: u64,
    cache: LruCache<Vec<u8>, HashMap<PeerId, u64>>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl ProviderStore {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        local: PeerId,
        validity: Duration,
        cleanup_interval: Duration,
        cache_size: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        let actor = ProviderStoreActor {
            datastore,
            local,
            validity_ms: validity.as_millis() as u64,
            cache: LruCache::new(cache_size),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self {
            cmd_tx,
            cleanup_interval,
            cleanup_task: Arc::new(StdMutex::new(None)),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, DhtError>>) -> Command,
    ) -> Result<T, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| DhtError::Shutdown)?;
        rx.await.map_err(|_| DhtError::Shutdown)?
    }

    /// Record `provider` for the content behind `cid`.
    ///
    /// Idempotent on the provider set: one record per `(digest, peer)` and a
    /// repeated add never errors or duplicates. A repeated add does renew the
    /// record's timestamp, which is what keeps a republished record (local
    /// reprovide or a remote ADD_PROVIDER) alive past the validity window.
    pub async fn add_provider(&self, cid: &Cid, provider: &PeerId) -> Result<(), DhtError> {
        let digest = content_digest(cid);
        let provider = provider.clone();
        self.request(|tx| Command::Add(digest, provider, tx)).await
    }

    /// Distinct, unexpired providers of the content behind `cid`.
    pub async fn get_providers(&self, cid: &Cid) -> Result<Vec<PeerId>, DhtError> {
        let digest = content_digest(cid);
        self.request(|tx| Command::Get(digest, tx)).await
    }

    /// Removing a record that does not exist succeeds.
    pub async fn remove_provider(&self, cid: &Cid, provider: &PeerId) -> Result<(), DhtError> {
        let digest = content_digest(cid);
        let provider = provider.clone();
        self.request(|tx| Command::Remove(digest, provider, tx)).await
    }

    /// Delete every expired record. Returns the number deleted.
    pub async fn cleanup(&self) -> Result<usize, DhtError> {
        self.request(Command::Cleanup).await
    }

    /// Digests the local node provides whose record is older than `older_than`.
    pub async fn local_provides(&self, older_than: Duration) -> Result<Vec<Vec<u8>>, DhtError> {
        self.request(|tx| Command::LocalProvides(older_than, tx)).await
    }

    /// Number of stored records, expired or not.
    pub async fn count(&self) -> Result<usize, DhtError> {
        self.request(Command::Count).await
    }

    /// Start the periodic expiry sweep. Idempotent.
    pub fn start(&self) {
        let Ok(mut slot) = self.cleanup_task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match store.cleanup().await {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "expired provider records removed"),
                            Err(DhtError::Shutdown) => break,
                            Err(e) => warn!(error = %e, "provider cleanup failed"),
                        }
                    }
                }
            }
        });
        *slot = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let running = self.cleanup_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }
    }
}

impl ProviderStoreActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Add(digest, peer, reply) => {
                    let _ = reply.send(self.handle_add(digest, peer).await);
                }
                Command::Get(digest, reply) => {
                    let _ = reply.send(self.handle_get(digest).await);
                }
                Command::Remove(digest, peer, reply) => {
                    let _ = reply.send(self.handle_remove(digest, peer).await);
                }
                Command::Cleanup(reply) => {
                    let _ = reply.send(self.handle_cleanup().await);
                }
                Command::LocalProvides(older_than, reply) => {
                    let _ = reply.send(self.handle_local_provides(older_than).await);
                }
                Command::Count(reply) => {
                    let result = self
                        .datastore
                        .query_prefix(PROVIDER_PREFIX)
                        .await
                        .map(|entries| entries.len())
                        .map_err(DhtError::datastore);
                    let _ = reply.send(result);
                }
            }
        }
        trace!("provider store actor stopped");
    }

    fn is_expired(&self, added_at_ms: u64, now: u64) -> bool {
        now.saturating_sub(added_at_ms) > self.validity_ms
    }

    async fn load(&self, digest: &[u8]) -> Result<HashMap<PeerId, u64>, DhtError> {
        let entries = self
            .datastore
            .query_prefix(&digest_prefix(digest))
            .await
            .map_err(DhtError::datastore)?;
        let mut providers = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            let Some((_, peer)) = parse_entry_key(&key) else {
                warn!(key = %key, "skipping malformed provider key");
                continue;
            };
            match bincode::deserialize::<ProviderEntry>(&value) {
                Ok(entry) => {
                    providers.insert(peer, entry.added_at_ms);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable provider record"),
            }
        }
        Ok(providers)
    }

    async fn handle_add(&mut self, digest: Vec<u8>, peer: PeerId) -> Result<(), DhtError> {
        let added_at_ms = now_ms();
        let value = bincode::serialize(&ProviderEntry { added_at_ms }).map_err(DhtError::datastore)?;
        self.datastore
            .put(&entry_key(&digest, &peer), value)
            .await
            .map_err(DhtError::datastore)?;
        trace!(digest = %hex::encode(&digest[..digest.len().min(8)]), provider = %peer.short(), "provider record stored");
        if let Some(cached) = self.cache.get_mut(&digest) {
            cached.insert(peer, added_at_ms);
        }
        Ok(())
    }

    async fn handle_get(&mut self, digest: Vec<u8>) -> Result<Vec<PeerId>, DhtError> {
        let providers = match self.cache.get(&digest) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = self.load(&digest).await?;
                self.cache.put(digest, loaded.clone());
                loaded
            }
        };
        let now = now_ms();
        let mut live: Vec<(PeerId, u64)> = providers
            .into_iter()
            .filter(|(_, added_at)| !self.is_expired(*added_at, now))
            .collect();
        live.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(live.into_iter().map(|(peer, _)| peer).collect())
    }

    async fn handle_remove(&mut self, digest: Vec<u8>, peer: PeerId) -> Result<(), DhtError> {
        self.datastore
            .delete(&entry_key(&digest, &peer))
            .await
            .map_err(DhtError::datastore)?;
        if let Some(cached) = self.cache.get_mut(&digest) {
            cached.remove(&peer);
        }
        Ok(())
    }

    async fn handle_cleanup(&mut self) -> Result<usize, DhtError> {
        let entries = self
            .datastore
            .query_prefix(PROVIDER_PREFIX)
            .await
            .map_err(DhtError::datastore)?;
        let now = now_ms();
        let mut removed = 0;
        for (key, value) in entries {
            let expired = match bincode::deserialize::<ProviderEntry>(&value) {
                Ok(entry) => self.is_expired(entry.added_at_ms, now),
                Err(_) => true,
            };
            if expired {
                self.datastore.delete(&key).await.map_err(DhtError::datastore)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.cache.clear();
        }
        Ok(removed)
    }

    async fn handle_local_provides(&self, older_than: Duration) -> Result<Vec<Vec<u8>>, DhtError> {
        let entries = self
            .datastore
            .query_prefix(PROVIDER_PREFIX)
            .await
            .map_err(DhtError::datastore)?;
        let now = now_ms();
        let threshold = older_than.as_millis() as u64;
        let mut digests = Vec::new();
        for (key, value) in entries {
            let Some((digest, peer)) = parse_entry_key(&key) else {
                continue;
            };
            if peer != self.local {
                continue;
            }
            let Ok(entry) = bincode::deserialize::<ProviderEntry>(&value) else {
                continue;
            };
            if now.saturating_sub(entry.added_at_ms) >= threshold && !self.is_expired(entry.added_at_ms, now) {
                digests.push(digest);
            }
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use cid::multihash::Multihash;
    use sha2::{Digest, Sha256};

    use crate::datastore::MemoryDatastore;

    const RAW: u64 = 0x55;
    const DAG_PB: u64 = 0x70;

    fn sha256_mh(data: &[u8]) -> Multihash<64> {
        Multihash::<64>::wrap(0x12, &Sha256::digest(data)).expect("digest fits")
    }

    fn store_with(local: PeerId, validity: Duration) -> ProviderStore {
        ProviderStore::new(
            Arc::new(MemoryDatastore::new()),
            local,
            validity,
            Duration::from_secs(3600),
            16,
        )
    }

    #[tokio::test]
    async fn repeated_adds_yield_distinct_providers() {
        let store = store_with(PeerId::random(), Duration::from_secs(3600));
        let cid = Cid::new_v1(RAW, sha256_mh(b"content"));
        let a = PeerId::random();
        let b = PeerId::random();

        store.add_provider(&cid, &a).await.expect("add");
        store.add_provider(&cid, &a).await.expect("add");
        for _ in 0..3 {
            store.add_provider(&cid, &b).await.expect("add");
        }

        let providers: HashSet<_> = store.get_providers(&cid).await.expect("get").into_iter().collect();
        assert_eq!(providers, HashSet::from([a, b]));
        assert_eq!(store.count().await, Ok(2));
    }

    #[tokio::test]
    async fn re_adding_renews_expiry() {
        let store = store_with(PeerId::random(), Duration::from_millis(300));
        let cid = Cid::new_v1(RAW, sha256_mh(b"republished"));
        let peer = PeerId::random();

        store.add_provider(&cid, &peer).await.expect("add");
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.add_provider(&cid, &peer).await.expect("re-add");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.get_providers(&cid).await.expect("get"), vec![peer]);
        assert_eq!(store.count().await, Ok(1));
    }

    #[tokio::test]
    async fn cid_versions_share_provider_set() {
        let store = store_with(PeerId::random(), Duration::from_secs(3600));
        let mh = sha256_mh(b"shared digest");
        let cid = Cid::new_v0(mh).expect("v0 cid");
        let cid_a = Cid::new_v1(RAW, mh);
        let cid_b = Cid::new_v1(DAG_PB, mh);
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();

        store.add_provider(&cid, &peers[0]).await.expect("add");
        store.add_provider(&cid_a, &peers[1]).await.expect("add");
        store.add_provider(&cid_b, &peers[2]).await.expect("add");

        let expected: HashSet<_> = peers.iter().cloned().collect();
        for query in [&cid, &cid_a, &cid_b] {
            let found: HashSet<_> = store.get_providers(query).await.expect("get").into_iter().collect();
            assert_eq!(found, expected);
        }
    }

    #[tokio::test]
    async fn removing_absent_provider_succeeds() {
        let store = store_with(PeerId::random(), Duration::from_secs(3600));
        let cid = Cid::new_v1(RAW, sha256_mh(b"nobody"));
        assert_eq!(store.remove_provider(&cid, &PeerId::random()).await, Ok(()));

        let peer = PeerId::random();
        store.add_provider(&cid, &peer).await.expect("add");
        store.get_providers(&cid).await.expect("warm cache");
        store.remove_provider(&cid, &peer).await.expect("remove");
        assert!(store.get_providers(&cid).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn expired_records_are_excluded_and_swept() {
        let store = store_with(PeerId::random(), Duration::from_millis(50));
        let cid = Cid::new_v1(RAW, sha256_mh(b"short lived"));
        store.add_provider(&cid, &PeerId::random()).await.expect("add");
        assert_eq!(store.get_providers(&cid).await.expect("get").len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get_providers(&cid).await.expect("get").is_empty());
        assert_eq!(store.cleanup().await, Ok(1));
        assert_eq!(store.count().await, Ok(0));
    }

    #[tokio::test]
    async fn local_provides_selects_own_old_records() {
        let local = PeerId::random();
        let store = store_with(local.clone(), Duration::from_secs(3600));
        let mine = Cid::new_v1(RAW, sha256_mh(b"mine"));
        let theirs = Cid::new_v1(RAW, sha256_mh(b"theirs"));
        store.add_provider(&mine, &local).await.expect("add");
        store.add_provider(&theirs, &PeerId::random()).await.expect("add");

        assert!(store.local_provides(Duration::from_secs(60)).await.expect("scan").is_empty());
        let due = store.local_provides(Duration::ZERO).await.expect("scan");
        assert_eq!(due, vec![content_digest(&mine)]);
    }

    #[tokio::test]
    async fn start_stop_cleanup_loop() {
        let store = store_with(PeerId::random(), Duration::from_secs(3600));
        store.start();
        store.start();
        store.stop().await;
        store.stop().await;
    }
}
