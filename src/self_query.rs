//! # Self Query
//!
//! Periodically looks up the local node's own id. This keeps the nearest
//! buckets populated and announces the node to its neighbourhood.
//!
//! - At most one self-query runs at a time; concurrent callers share it
//! - With an empty routing table the query waits until a peer is added
//! - Each run is bounded by the self-query timeout
//! - A watch signal flips to `true` once the first run has finished

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::DhtError;
use crate::identity::PeerId;
use crate::protocols::ClosestPeersLookup;
use crate::routing::{RoutingEvent, RoutingTable};

type InFlight = Shared<BoxFuture<'static, Result<usize, DhtError>>>;

struct Inner {
    local: PeerId,
    routing: RoutingTable,
    lookup: Arc<dyn ClosestPeersLookup>,
    interval: Duration,
    initial_delay: Duration,
    timeout: Duration,
    in_flight: StdMutex<Option<InFlight>>,
    has_run: watch::Sender<bool>,
}

pub struct QuerySelf {
    inner: Arc<Inner>,
    task: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl QuerySelf {
    pub fn new(
        local: PeerId,
        routing: RoutingTable,
        lookup: Arc<dyn ClosestPeersLookup>,
        interval: Duration,
        initial_delay: Duration,
        timeout: Duration,
    ) -> Self {
        let (has_run, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                local,
                routing,
                lookup,
                interval,
                initial_delay,
                timeout,
                in_flight: StdMutex::new(None),
                has_run,
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
        let token = cancel.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(inner.initial_delay) => {}
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = Inner::query_self(&inner) => match result {
                        Ok(found) => debug!(found, "self-query finished"),
                        Err(e) => debug!(error = %e, "self-query failed"),
                    },
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(inner.interval) => {}
                }
            }
            trace!("self-query loop stopped");
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

    /// Run a self-query now, or join the one already in flight. Returns the
    /// number of closest peers found.
    pub async fn query_self(&self) -> Result<usize, DhtError> {
        Inner::query_self(&self.inner).await
    }

    /// Flips to `true` once the first self-query has finished.
    pub fn initial_query_self_has_run(&self) -> watch::Receiver<bool> {
        self.inner.has_run.subscribe()
    }
}

impl Inner {
    async fn query_self(this: &Arc<Self>) -> Result<usize, DhtError> {
        let fut = {
            let mut slot = this.in_flight.lock().map_err(|_| DhtError::Shutdown)?;
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let inner = this.clone();
                    let fut = async move {
                        let result = inner.run_once().await;
                        if let Ok(mut slot) = inner.in_flight.lock() {
                            *slot = None;
                        }
                        inner.has_run.send_replace(true);
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    async fn wait_for_peer(&self) {
        let mut events = self.routing.subscribe();
        if self.routing.size().await > 0 {
            return;
        }
        debug!("routing table empty, self-query waiting for a peer");
        loop {
            match events.recv().await {
                Ok(RoutingEvent::PeerAdded(_)) | Err(RecvError::Lagged(_)) => {
                    if self.routing.size().await > 0 {
                        return;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn run_once(&self) -> Result<usize, DhtError> {
        self.wait_for_peer().await;

        let cancel = CancellationToken::new();
        let lookup = self.lookup.lookup_closest(self.local.as_bytes(), cancel.clone());
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(peers)) => {
                info!(peers = peers.len(), "self-query found closest peers");
                Ok(peers.len())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                cancel.cancel();
                Err(DhtError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::identity::PeerInfo;
    use crate::messages::Message;
    use crate::protocols::DhtRpc;

    struct NoopRpc;

    #[async_trait]
    impl DhtRpc for NoopRpc {
        async fn send_request(&self, _to: &PeerInfo, _request: Message) -> anyhow::Result<Message> {
            anyhow::bail!("offline")
        }

        async fn send_message(&self, _to: &PeerInfo, _message: Message) -> anyhow::Result<()> {
            anyhow::bail!("offline")
        }
    }

    /// Counts lookups; each one takes `delay` and returns `found` peers.
    struct CountingLookup {
        calls: AtomicUsize,
        delay: Duration,
        found: usize,
    }

    #[async_trait]
    impl ClosestPeersLookup for CountingLookup {
        async fn lookup_closest(&self, _key: &[u8], _cancel: CancellationToken) -> Result<Vec<PeerInfo>, DhtError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok((0..self.found).map(|_| PeerInfo::without_addrs(PeerId::random())).collect())
        }
    }

    fn setup(delay: Duration, timeout: Duration) -> (QuerySelf, Arc<CountingLookup>, RoutingTable) {
        let local = PeerId::random();
        let routing = RoutingTable::new(&local, 20, Arc::new(NoopRpc));
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            delay,
            found: 3,
        });
        let query = QuerySelf::new(
            local,
            routing.clone(),
            lookup.clone(),
            Duration::from_secs(300),
            Duration::from_millis(10),
            timeout,
        );
        (query, lookup, routing)
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_lookup() {
        let (query, lookup, routing) = setup(Duration::from_millis(100), Duration::from_secs(5));
        routing.add(PeerId::random()).await;

        let (a, b) = tokio::join!(query.query_self(), query.query_self());
        assert_eq!(a, Ok(3));
        assert_eq!(b, Ok(3));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        assert_eq!(query.query_self().await, Ok(3));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_table_waits_for_first_peer() {
        let (query, lookup, routing) = setup(Duration::ZERO, Duration::from_secs(5));
        let query = Arc::new(query);
        let waiting = tokio::spawn({
            let query = query.clone();
            async move { query.query_self().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);

        routing.add(PeerId::random()).await;
        assert_eq!(waiting.await.expect("join"), Ok(3));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_calls_on_empty_table_share_one_lookup() {
        let (query, lookup, routing) = setup(Duration::ZERO, Duration::from_secs(5));
        let query = Arc::new(query);
        let first = tokio::spawn({
            let query = query.clone();
            async move { query.query_self().await }
        });
        let second = tokio::spawn({
            let query = query.clone();
            async move { query.query_self().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        routing.add(PeerId::random()).await;

        assert_eq!(first.await.expect("join"), Ok(3));
        assert_eq!(second.await.expect("join"), Ok(3));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_lookup_times_out() {
        let (query, _, routing) = setup(Duration::from_secs(10), Duration::from_millis(50));
        routing.add(PeerId::random()).await;
        assert_eq!(query.query_self().await, Err(DhtError::Timeout));
    }

    #[tokio::test]
    async fn initial_run_signal_flips_after_first_run() {
        let (query, _, routing) = setup(Duration::ZERO, Duration::from_secs(5));
        routing.add(PeerId::random()).await;
        let mut has_run = query.initial_query_self_has_run();
        assert!(!*has_run.borrow());

        query.start();
        query.start();
        tokio::time::timeout(Duration::from_secs(5), has_run.wait_for(|ran| *ran))
            .await
            .expect("initial run within deadline")
            .expect("signal open");

        query.stop().await;
        query.stop().await;
        assert!(!query.is_running());
    }
}
