//! # Routing Table Refresh
//!
//! Buckets that have seen no activity within the stale threshold are
//! refreshed by looking up a random key that falls into them. Only the
//! shallow buckets (up to [`MAX_REFRESH_BUCKET`]) are refreshed; deeper ones
//! are kept fresh by the self-query.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocols::ClosestPeersLookup;
use crate::routing::{random_key_for_bucket, RoutingTable, MAX_REFRESH_BUCKET};

struct Inner {
    routing: RoutingTable,
    lookup: Arc<dyn ClosestPeersLookup>,
    interval: Duration,
    stale_threshold: Duration,
}

pub struct RoutingRefresh {
    inner: Arc<Inner>,
    task: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RoutingRefresh {
    pub fn new(
        routing: RoutingTable,
        lookup: Arc<dyn ClosestPeersLookup>,
        interval: Duration,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                routing,
                lookup,
                interval,
                stale_threshold,
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn start(&self) {
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        inner.refresh(&token).await;
                    }
                }
            }
            trace!("routing refresh loop stopped");
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

    /// Refresh every stale bucket once. Returns how many were refreshed.
    pub async fn refresh(&self) -> usize {
        self.inner.refresh(&CancellationToken::new()).await
    }
}

impl Inner {
    async fn refresh(&self, cancel: &CancellationToken) -> usize {
        let stale: Vec<usize> = self
            .routing
            .stale_buckets(self.stale_threshold)
            .await
            .into_iter()
            .filter(|b| *b <= MAX_REFRESH_BUCKET)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        debug!(count = stale.len(), "refreshing stale routing buckets");

        let local = *self.routing.local_kad_id();
        let mut refreshed = 0;
        for bucket in stale {
            if cancel.is_cancelled() {
                break;
            }
            let Some(key) = random_key_for_bucket(&local, bucket) else {
                continue;
            };
            if let Err(e) = self.lookup.lookup_closest(&key, cancel.child_token()).await {
                debug!(bucket, error = %e, "bucket refresh lookup failed");
            }
            self.routing.mark_bucket_refreshed(bucket).await;
            refreshed += 1;
        }
        refreshed
    }
}
