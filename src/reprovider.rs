//! # Reprovider
//!
//! Provider records expire on remote peers, so content this node provides is
//! periodically re-announced. Each interval, local provider records older
//! than the reprovide threshold are announced again through the
//! [`ContentProvider`], which also refreshes their local timestamp.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cid::multihash::Multihash;
use cid::Cid;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::DhtError;
use crate::protocols::ContentProvider;
use crate::providers::ProviderStore;

/// Multicodec `raw`. Provider records are keyed by multihash, so the codec
/// of the rebuilt CID does not affect which records it matches.
const RAW_CODEC: u64 = 0x55;

struct Inner {
    providers: ProviderStore,
    announcer: Arc<dyn ContentProvider>,
    interval: Duration,
    threshold: Duration,
}

pub struct Reprovider {
    inner: Arc<Inner>,
    task: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Reprovider {
    pub fn new(
        providers: ProviderStore,
        announcer: Arc<dyn ContentProvider>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                providers,
                announcer,
                interval,
                threshold,
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
                    _ = interval.tick() => match inner.reprovide(&token).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "reprovided content"),
                        Err(DhtError::Shutdown) => break,
                        Err(e) => warn!(error = %e, "reprovide failed"),
                    },
                }
            }
            trace!("reprovider stopped");
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

    /// Re-announce every due record once. Returns how many were announced.
    pub async fn reprovide(&self) -> Result<usize, DhtError> {
        self.inner.reprovide(&CancellationToken::new()).await
    }
}

impl Inner {
    async fn reprovide(&self, cancel: &CancellationToken) -> Result<usize, DhtError> {
        let due = self.providers.local_provides(self.threshold).await?;
        let mut announced = 0;
        for digest in due {
            if cancel.is_cancelled() {
                break;
            }
            let cid = match Multihash::<64>::from_bytes(&digest) {
                Ok(hash) => Cid::new_v1(RAW_CODEC, hash),
                Err(e) => {
                    debug!(error = %e, "skipping provider record with malformed digest");
                    continue;
                }
            };
            match self.announcer.announce(&cid, cancel.child_token()).await {
                Ok(peers) => {
                    trace!(%cid, peers, "reprovided");
                    announced += 1;
                }
                Err(DhtError::Cancelled) => break,
                Err(e) => debug!(%cid, error = %e, "reprovide announce failed"),
            }
        }
        Ok(announced)
    }
}
