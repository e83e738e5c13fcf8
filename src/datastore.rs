//! Byte-oriented persistent key/value datastore.
//!
//! Provider and value records are persisted through [`Datastore`]; the
//! stores that sit on top of it are its only writers. Keys are
//! slash-separated paths such as `/dht/provider/<digest>/<peer>`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn query_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
}

#[derive(Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn query_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
