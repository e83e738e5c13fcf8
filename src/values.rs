//! # Value Store
//!
//! Local storage of value records, persisted through the [`Datastore`] under
//! `/dht/record/<hex key>` as protobuf-encoded [`Record`]s.
//!
//! All writes go through a single actor, so concurrent `put`s for the same
//! key are applied one after another. A write never silently regresses a
//! key: when a record already exists the namespace selector chooses between
//! the stored and the incoming value, and a tie keeps the stored one.
//!
//! Records older than the configured maximum age are deleted when read and
//! reported as absent.

use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::datastore::Datastore;
use crate::error::DhtError;
use crate::messages::Record;
use crate::validation::{best_record, verify_record, Selectors, Validators};

const RECORD_PREFIX: &str = "/dht/record/";

const COMMAND_CHANNEL_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The selector preferred the record already stored.
    Kept,
}

fn datastore_key(key: &[u8]) -> String {
    format!("{RECORD_PREFIX}{}", hex::encode(key))
}

enum Command {
    Put(Record, oneshot::Sender<Result<PutOutcome, DhtError>>),
    Get(Vec<u8>, oneshot::Sender<Result<Option<Record>, DhtError>>),
    Remove(Vec<u8>, oneshot::Sender<Result<(), DhtError>>),
    Len(oneshot::Sender<Result<usize, DhtError>>),
}

#[derive(Clone)]
pub struct ValueStore {
    cmd_tx: mpsc::Sender<Command>,
    validators: Arc<Validators>,
    selectors: Arc<Selectors>,
}

struct ValueStoreActor {
    datastore: Arc<dyn Datastore>,
    validators: Arc<Validators>,
    selectors: Arc<Selectors>,
    max_record_age: Duration,
    cmd_rx: mpsc::Receiver<Command>,
}

impl ValueStore {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        validators: Validators,
        selectors: Selectors,
        max_record_age: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let validators = Arc::new(validators);
        let selectors = Arc::new(selectors);
        let actor = ValueStoreActor {
            datastore,
            validators: validators.clone(),
            selectors: selectors.clone(),
            max_record_age,
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self {
            cmd_tx,
            validators,
            selectors,
        }
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    pub fn selectors(&self) -> &Selectors {
        &self.selectors
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, DhtError>>) -> Command,
    ) -> Result<T, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| DhtError::Shutdown)?;
        rx.await.map_err(|_| DhtError::Shutdown)?
    }

    /// Validate and store. Fails with `InvalidParameters` when the record has
    /// no matching validator or fails it.
    pub async fn put(&self, record: Record) -> Result<PutOutcome, DhtError> {
        self.request(|tx| Command::Put(record, tx)).await
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Record>, DhtError> {
        let key = key.to_vec();
        self.request(|tx| Command::Get(key, tx)).await
    }

    /// Removing an absent key succeeds.
    pub async fn remove(&self, key: &[u8]) -> Result<(), DhtError> {
        let key = key.to_vec();
        self.request(|tx| Command::Remove(key, tx)).await
    }

    pub async fn len(&self) -> Result<usize, DhtError> {
        self.request(Command::Len).await
    }
}

impl ValueStoreActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Put(record, reply) => {
                    let _ = reply.send(self.handle_put(record).await);
                }
                Command::Get(key, reply) => {
                    let _ = reply.send(self.handle_get(&key).await);
                }
                Command::Remove(key, reply) => {
                    let result = self
                        .datastore
                        .delete(&datastore_key(&key))
                        .await
                        .map_err(DhtError::datastore);
                    let _ = reply.send(result);
                }
                Command::Len(reply) => {
                    let result = self
                        .datastore
                        .query_prefix(RECORD_PREFIX)
                        .await
                        .map(|entries| entries.len())
                        .map_err(DhtError::datastore);
                    let _ = reply.send(result);
                }
            }
        }
        trace!("value store actor stopped");
    }

    async fn load(&self, key: &[u8]) -> Result<Option<Record>, DhtError> {
        let Some(bytes) = self
            .datastore
            .get(&datastore_key(key))
            .await
            .map_err(DhtError::datastore)?
        else {
            return Ok(None);
        };
        Record::decode(bytes.as_slice())
            .map(Some)
            .map_err(DhtError::datastore)
    }

    fn is_expired(&self, record: &Record) -> bool {
        let Some(received) = record.received_at() else {
            return true;
        };
        let age = chrono::Utc::now().signed_duration_since(received);
        age.to_std().map(|age| age > self.max_record_age).unwrap_or(false)
    }

    async fn handle_get(&self, key: &[u8]) -> Result<Option<Record>, DhtError> {
        let Some(record) = self.load(key).await? else {
            return Ok(None);
        };
        if self.is_expired(&record) {
            debug!(key = %hex::encode(&key[..key.len().min(8)]), "deleting expired record");
            self.datastore
                .delete(&datastore_key(key))
                .await
                .map_err(DhtError::datastore)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn handle_put(&self, mut record: Record) -> Result<PutOutcome, DhtError> {
        verify_record(&self.validators, &record)?;

        if let Some(existing) = self.handle_get(&record.key).await? {
            let candidates = vec![existing.value, record.value.clone()];
            let best = best_record(&self.selectors, &record.key, &candidates)?;
            if best != 1 {
                trace!(key = %hex::encode(&record.key[..record.key.len().min(8)]), "keeping stored record");
                return Ok(PutOutcome::Kept);
            }
        }

        record.stamp_received();
        self.datastore
            .put(&datastore_key(&record.key), record.encode_to_vec())
            .await
            .map_err(DhtError::datastore)?;
        Ok(PutOutcome::Stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::datastore::MemoryDatastore;
    use crate::identity::Keypair;
    use crate::validation::{default_selectors, default_validators, public_key_record_key};

    /// Namespace `v` accepts anything; the selector prefers the longest value.
    fn versioned_store(max_age: Duration) -> (ValueStore, Arc<MemoryDatastore>) {
        let datastore = Arc::new(MemoryDatastore::new());
        let mut validators = Validators::empty();
        validators.insert("v", Arc::new(|_: &[u8], _: &[u8]| Ok::<(), DhtError>(())));
        let mut selectors = Selectors::empty();
        selectors.insert(
            "v",
            Arc::new(|_: &[u8], records: &[Vec<u8>]| {
                let mut best = 0;
                for (i, r) in records.iter().enumerate() {
                    if r.len() > records[best].len() {
                        best = i;
                    }
                }
                best
            }),
        );
        let store = ValueStore::new(datastore.clone(), validators, selectors, max_age);
        (store, datastore)
    }

    #[tokio::test]
    async fn put_rejects_unvalidated_namespace() {
        let store = ValueStore::new(
            Arc::new(MemoryDatastore::new()),
            default_validators(),
            default_selectors(),
            Duration::from_secs(60),
        );
        let err = store.put(Record::new(b"/nope/k".to_vec(), b"v".to_vec())).await;
        assert!(matches!(err, Err(DhtError::InvalidParameters(_))));
        assert_eq!(store.len().await, Ok(0));
    }

    #[tokio::test]
    async fn put_then_get_public_key_record() {
        let store = ValueStore::new(
            Arc::new(MemoryDatastore::new()),
            default_validators(),
            default_selectors(),
            Duration::from_secs(60),
        );
        let keypair = Keypair::generate();
        let key = public_key_record_key(keypair.peer_id().as_bytes());
        let record = Record::new(key.clone(), keypair.public().encode());

        assert_eq!(store.put(record.clone()).await, Ok(PutOutcome::Stored));
        assert_eq!(store.put(record.clone()).await, Ok(PutOutcome::Kept));
        let stored = store.get(&key).await.expect("get").expect("present");
        assert_eq!(stored.value, record.value);
        assert_eq!(store.len().await, Ok(1));
    }

    #[tokio::test]
    async fn selector_decides_between_stored_and_incoming() {
        let (store, _) = versioned_store(Duration::from_secs(60));
        let key = b"/v/key".to_vec();

        store.put(Record::new(key.clone(), b"bb".to_vec())).await.expect("put");
        assert_eq!(
            store.put(Record::new(key.clone(), b"a".to_vec())).await,
            Ok(PutOutcome::Kept)
        );
        assert_eq!(
            store.put(Record::new(key.clone(), b"xx".to_vec())).await,
            Ok(PutOutcome::Kept)
        );
        assert_eq!(
            store.put(Record::new(key.clone(), b"ccc".to_vec())).await,
            Ok(PutOutcome::Stored)
        );
        let stored = store.get(&key).await.expect("get").expect("present");
        assert_eq!(stored.value, b"ccc".to_vec());
    }

    #[tokio::test]
    async fn concurrent_puts_are_linearized() {
        let (store, _) = versioned_store(Duration::from_secs(60));
        let key = b"/v/race".to_vec();
        let mut handles = Vec::new();
        for len in 1..=16usize {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.put(Record::new(key, vec![b'x'; len])).await
            }));
        }
        for h in handles {
            h.await.expect("join").expect("put");
        }
        let stored = store.get(&key).await.expect("get").expect("present");
        assert_eq!(stored.value.len(), 16);
    }

    #[tokio::test]
    async fn expired_record_is_deleted_on_read() {
        let (store, datastore) = versioned_store(Duration::from_secs(60));
        let key = b"/v/old".to_vec();
        let mut record = Record::new(key.clone(), b"value".to_vec());
        record.time_received = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        datastore
            .put(&datastore_key(&key), record.encode_to_vec())
            .await
            .expect("seed");

        assert_eq!(store.get(&key).await, Ok(None));
        assert!(datastore.get(&datastore_key(&key)).await.expect("get").is_none());
        assert_eq!(store.remove(&key).await, Ok(()));
    }
}
