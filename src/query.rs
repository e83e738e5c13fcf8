//! # Query Engine
//!
//! Iterative Kademlia lookups and the public operations built on them.
//!
//! ## Lookup
//!
//! 1. Seed candidates from the routing table (`k` closest to the target)
//! 2. Partition the seeds round-robin over `disjoint_paths` paths; a peer is
//!    contacted by at most one path
//! 3. Each round contacts up to `alpha` unqueried candidates concurrently,
//!    each RPC bounded by the per-RPC timeout
//! 4. Responders enter the routing table; closer peers they return become
//!    candidates and their addresses are merged into the peer store
//! 5. A path ends when a round yields no peer closer than the best already
//!    known, when it runs out of candidates, or when the operation stops it
//!
//! Every operation returns a [`QueryStream`] of [`QueryEvent`]s. Dropping the
//! stream or calling [`QueryStream::cancel`] stops the query; events already
//! delivered stay with the consumer. The whole query is bounded by the
//! configured query timeout.
//!
//! | Operation | RPC | Terminal events |
//! |-----------|-----|-----------------|
//! | `get_closest_peers` | FIND_NODE | `FinalPeer` per closest responder |
//! | `find_peer_events` | FIND_NODE | `FinalPeer` for the target |
//! | `find_providers` | GET_PROVIDERS | `Provider` |
//! | `get` | GET_VALUE | `Value` |
//! | `put` | FIND_NODE, then PUT_VALUE | `PeerResponse` per replica |
//! | `provide` | FIND_NODE, then ADD_PROVIDER | `PeerResponse` per announce |

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use cid::Cid;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::distance::PeerDistanceList;
use crate::error::DhtError;
use crate::identity::{Distance, KadId, PeerId, PeerInfo, PeerInfoMapper};
use crate::messages::{ConnectionType, Message, MessageType, Peer, Record};
use crate::peerstore::{PeerStore, PeerUpdate};
use crate::protocols::{ClosestPeersLookup, ContentProvider, DhtRpc};
use crate::providers::{content_digest, ProviderStore};
use crate::routing::{AddOutcome, RoutingTable};
use crate::validation::{best_record, verify_record};
use crate::values::ValueStore;

/// Buffered events per query before the producer waits for the consumer.
const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// About to send `kind` to `to`.
    SendQuery { to: PeerId, kind: MessageType },
    DialPeer { peer: PeerId },
    PeerResponse {
        from: PeerId,
        kind: MessageType,
        closer: Vec<PeerInfo>,
        providers: Vec<PeerInfo>,
        record: Option<Record>,
    },
    FinalPeer { from: PeerId, peer: PeerInfo },
    /// A single peer failed; the query continues.
    QueryError { from: PeerId, error: String },
    Provider { from: PeerId, providers: Vec<PeerInfo> },
    Value { from: PeerId, record: Record },
    /// A responder entered the routing table.
    AddPeer { peer: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Running,
    Completed,
    Cancelled,
    TimedOut,
}

/// Event stream of one running query.
pub struct QueryStream {
    rx: mpsc::Receiver<QueryEvent>,
    cancel: CancellationToken,
    outcome: watch::Receiver<QueryOutcome>,
    _guard: DropGuard,
}

impl QueryStream {
    fn new(rx: mpsc::Receiver<QueryEvent>, cancel: CancellationToken, outcome: watch::Receiver<QueryOutcome>) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            rx,
            cancel,
            outcome,
            _guard: guard,
        }
    }

    /// Stop the query. Already-buffered events can still be read.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Running` until the query task has finished.
    pub fn outcome(&self) -> QueryOutcome {
        *self.outcome.borrow()
    }
}

impl Stream for QueryStream {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Clone)]
struct QueryContext {
    events: mpsc::Sender<QueryEvent>,
    cancel: CancellationToken,
}

impl QueryContext {
    /// Returns false once the query is cancelled or the consumer is gone.
    async fn emit(&self, event: QueryEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => {
                if sent.is_err() {
                    self.cancel.cancel();
                }
                sent.is_ok()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupControl {
    Continue,
    Stop,
}

struct Reaction {
    events: Vec<QueryEvent>,
    control: LookupControl,
}

impl Reaction {
    fn proceed() -> Self {
        Self {
            events: Vec::new(),
            control: LookupControl::Continue,
        }
    }
}

/// Inspects each successful reply of a lookup.
type ResponseHandler = Arc<dyn Fn(&PeerInfo, &Message) -> Reaction + Send + Sync>;

fn continue_always() -> ResponseHandler {
    Arc::new(|_, _| Reaction::proceed())
}

#[derive(Debug, Clone)]
struct LookupParams {
    k: usize,
    alpha: usize,
    disjoint_paths: usize,
    rpc_timeout: Duration,
    query_timeout: Option<Duration>,
    max_providers_per_find: usize,
}

struct EngineInner {
    local: PeerInfo,
    routing: RoutingTable,
    rpc: Arc<dyn DhtRpc>,
    peerstore: Arc<dyn PeerStore>,
    providers: ProviderStore,
    values: ValueStore,
    params: LookupParams,
    mapper: PeerInfoMapper,
    /// Parent of every running query's token; replaced by `cancel_all`.
    queries: StdMutex<CancellationToken>,
}

#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

/// Dependencies of a [`QueryEngine`].
pub struct EngineParts {
    pub local: PeerInfo,
    pub routing: RoutingTable,
    pub rpc: Arc<dyn DhtRpc>,
    pub peerstore: Arc<dyn PeerStore>,
    pub providers: ProviderStore,
    pub values: ValueStore,
    pub mapper: PeerInfoMapper,
}

impl QueryEngine {
    pub fn new(parts: EngineParts, config: &DhtConfig) -> Self {
        let params = LookupParams {
            k: config.k.max(1),
            alpha: config.alpha.max(1),
            disjoint_paths: config.disjoint_paths.max(1),
            rpc_timeout: config.rpc_timeout,
            query_timeout: config.query_timeout,
            max_providers_per_find: config.max_providers_per_find.max(1),
        };
        Self {
            inner: Arc::new(EngineInner {
                local: parts.local,
                routing: parts.routing,
                rpc: parts.rpc,
                peerstore: parts.peerstore,
                providers: parts.providers,
                values: parts.values,
                params,
                mapper: parts.mapper,
                queries: StdMutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.inner.local
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn providers(&self) -> &ProviderStore {
        &self.inner.providers
    }

    pub fn values(&self) -> &ValueStore {
        &self.inner.values
    }

    pub fn map_peer(&self, info: PeerInfo) -> PeerInfo {
        (self.inner.mapper)(info)
    }

    /// Cancel every running query. Queries started afterwards are unaffected.
    pub fn cancel_all(&self) {
        if let Ok(mut parent) = self.inner.queries.lock() {
            parent.cancel();
            *parent = CancellationToken::new();
        }
    }

    fn spawn_query<F, Fut>(&self, op: F) -> QueryStream
    where
        F: FnOnce(Arc<EngineInner>, QueryContext) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (outcome_tx, outcome_rx) = watch::channel(QueryOutcome::Running);
        let cancel = self
            .inner
            .queries
            .lock()
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let ctx = QueryContext {
            events: tx.clone(),
            cancel: cancel.clone(),
        };
        let timeout = self.inner.params.query_timeout;
        let fut = op(self.inner.clone(), ctx);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let finished = match timeout {
                Some(limit) => tokio::time::timeout(limit, fut).await.is_ok(),
                None => {
                    fut.await;
                    true
                }
            };
            let outcome = if !finished {
                QueryOutcome::TimedOut
            } else if task_cancel.is_cancelled() {
                QueryOutcome::Cancelled
            } else {
                QueryOutcome::Completed
            };
            trace!(?outcome, "query finished");
            let _ = outcome_tx.send(outcome);
            // The stream ends only after the outcome is visible.
            drop(tx);
        });

        QueryStream::new(rx, cancel, outcome_rx)
    }

    /// Converge on the `k` peers closest to `key`.
    pub fn get_closest_peers(&self, key: &[u8]) -> QueryStream {
        let key = key.to_vec();
        self.spawn_query(move |inner, ctx| async move {
            let target = KadId::from_key(&key);
            let request = Message::request(MessageType::FindNode, key);
            let closest = inner.lookup(target, request, continue_always(), &ctx).await;
            for peer in closest {
                let event = QueryEvent::FinalPeer {
                    from: peer.id.clone(),
                    peer,
                };
                if !ctx.emit(event).await {
                    return;
                }
            }
        })
    }

    /// Look for `target`, emitting a `FinalPeer` once it is located.
    pub fn find_peer_events(&self, target: &PeerId) -> QueryStream {
        let target = target.clone();
        self.spawn_query(move |inner, ctx| async move {
            if target == inner.local.id {
                let _ = ctx
                    .emit(QueryEvent::FinalPeer {
                        from: inner.local.id.clone(),
                        peer: inner.local.clone(),
                    })
                    .await;
                return;
            }

            if inner.routing.find(&target).await.is_some() {
                let addrs = inner.peerstore.addresses(&target).await;
                if !addrs.is_empty() {
                    let _ = ctx
                        .emit(QueryEvent::FinalPeer {
                            from: inner.local.id.clone(),
                            peer: PeerInfo::new(target, addrs),
                        })
                        .await;
                    return;
                }
            }

            let wanted = target.clone();
            let handler: ResponseHandler = Arc::new(move |from, reply| {
                let found = if from.id == wanted && !from.addrs.is_empty() {
                    Some(from.clone())
                } else {
                    reply
                        .closer_peer_infos()
                        .into_iter()
                        .find(|p| p.id == wanted && !p.addrs.is_empty())
                };
                match found {
                    Some(peer) => Reaction {
                        events: vec![QueryEvent::FinalPeer {
                            from: from.id.clone(),
                            peer,
                        }],
                        control: LookupControl::Stop,
                    },
                    None => Reaction::proceed(),
                }
            });
            let request = Message::request(MessageType::FindNode, target.to_bytes());
            inner.lookup(target.kad_id(), request, handler, &ctx).await;
        })
    }

    /// Locate `target` and return its addresses, or `None` when the lookup
    /// converged without finding it.
    pub async fn find_peer(&self, target: &PeerId, cancel: CancellationToken) -> Result<Option<PeerInfo>, DhtError> {
        let mut stream = self.find_peer_events(target);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.cancel();
                    return Err(DhtError::Cancelled);
                }
                event = stream.next() => match event {
                    Some(QueryEvent::FinalPeer { peer, .. }) if &peer.id == target => {
                        stream.cancel();
                        return Ok(Some(peer));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        match stream.outcome() {
            QueryOutcome::Cancelled => Err(DhtError::Cancelled),
            QueryOutcome::TimedOut => Err(DhtError::Timeout),
            _ => Ok(None),
        }
    }

    /// Local providers first, then the network, up to the configured maximum.
    pub fn find_providers(&self, cid: &Cid) -> QueryStream {
        let cid = *cid;
        self.spawn_query(move |inner, ctx| async move {
            let max = inner.params.max_providers_per_find;
            let seen: Arc<StdMutex<HashSet<PeerId>>> = Arc::new(StdMutex::new(HashSet::new()));

            let local = match inner.providers.get_providers(&cid).await {
                Ok(local) => local,
                Err(e) => {
                    debug!(error = %e, "local provider lookup failed");
                    Vec::new()
                }
            };
            let mut local_infos = Vec::new();
            for peer in local.into_iter().take(max) {
                let addrs = if peer == inner.local.id {
                    inner.local.addrs.clone()
                } else {
                    inner.peerstore.addresses(&peer).await
                };
                if let Ok(mut seen) = seen.lock() {
                    seen.insert(peer.clone());
                }
                local_infos.push(PeerInfo::new(peer, addrs));
            }
            let found_locally = local_infos.len();
            if !local_infos.is_empty() {
                let event = QueryEvent::Provider {
                    from: inner.local.id.clone(),
                    providers: local_infos,
                };
                if !ctx.emit(event).await {
                    return;
                }
            }
            if found_locally >= max {
                return;
            }

            let digest = content_digest(&cid);
            let handler_seen = seen.clone();
            let handler: ResponseHandler = Arc::new(move |from, reply| {
                let Ok(mut seen) = handler_seen.lock() else {
                    return Reaction::proceed();
                };
                let fresh: Vec<PeerInfo> = reply
                    .provider_peer_infos()
                    .into_iter()
                    .filter(|p| seen.len() < max && seen.insert(p.id.clone()))
                    .collect();
                let control = if seen.len() >= max {
                    LookupControl::Stop
                } else {
                    LookupControl::Continue
                };
                let events = if fresh.is_empty() {
                    Vec::new()
                } else {
                    vec![QueryEvent::Provider {
                        from: from.id.clone(),
                        providers: fresh,
                    }]
                };
                Reaction { events, control }
            });
            let request = Message::request(MessageType::GetProviders, cid.to_bytes());
            inner.lookup(KadId::from_key(&digest), request, handler, &ctx).await;
        })
    }

    /// Collect valid records for `key` from the local store and the network.
    /// Peers that returned an outdated record are sent the best one.
    pub fn get(&self, key: &[u8]) -> QueryStream {
        let key = key.to_vec();
        self.spawn_query(move |inner, ctx| async move {
            match inner.values.get(&key).await {
                Ok(Some(record)) => {
                    let event = QueryEvent::Value {
                        from: inner.local.id.clone(),
                        record,
                    };
                    if !ctx.emit(event).await {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "local record lookup failed"),
            }

            let found: Arc<StdMutex<Vec<(PeerInfo, Record)>>> = Arc::new(StdMutex::new(Vec::new()));
            let handler_found = found.clone();
            let validators = inner.values.validators().clone();
            let handler: ResponseHandler = Arc::new(move |from, reply| {
                let Some(record) = reply.record.clone() else {
                    return Reaction::proceed();
                };
                let event = match verify_record(&validators, &record) {
                    Ok(()) => {
                        if let Ok(mut found) = handler_found.lock() {
                            found.push((from.clone(), record.clone()));
                        }
                        QueryEvent::Value {
                            from: from.id.clone(),
                            record,
                        }
                    }
                    Err(e) => QueryEvent::QueryError {
                        from: from.id.clone(),
                        error: e.to_string(),
                    },
                };
                Reaction {
                    events: vec![event],
                    control: LookupControl::Continue,
                }
            });
            let request = Message::request(MessageType::GetValue, key.clone());
            inner.lookup(KadId::from_key(&key), request, handler, &ctx).await;

            let found = found.lock().map(|f| f.clone()).unwrap_or_default();
            inner.send_corrections(&key, found, &ctx).await;
        })
    }

    /// The best record for `key` across the local store and the network.
    pub async fn get_value(&self, key: &[u8], cancel: CancellationToken) -> Result<Record, DhtError> {
        let mut stream = self.get(key);
        let mut records = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.cancel();
                    return Err(DhtError::Cancelled);
                }
                event = stream.next() => match event {
                    Some(QueryEvent::Value { record, .. }) => records.push(record),
                    Some(_) => {}
                    None => break,
                }
            }
        }
        match stream.outcome() {
            QueryOutcome::Cancelled => return Err(DhtError::Cancelled),
            QueryOutcome::TimedOut if records.is_empty() => return Err(DhtError::Timeout),
            _ => {}
        }
        if records.is_empty() {
            return Err(DhtError::NotFound(hex::encode(key)));
        }
        let values: Vec<Vec<u8>> = records.iter().map(|r| r.value.clone()).collect();
        let best = best_record(self.inner.values.selectors(), key, &values)?;
        Ok(records.swap_remove(best))
    }

    /// Validate and store locally, then replicate to the closest peers.
    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<QueryStream, DhtError> {
        let record = Record::new(key, value);
        verify_record(self.inner.values.validators(), &record)?;
        self.inner.values.put(record.clone()).await?;

        Ok(self.spawn_query(move |inner, ctx| async move {
            let target = KadId::from_key(&record.key);
            let request = Message::request(MessageType::FindNode, record.key.clone());
            let closest = inner.lookup(target, request, continue_always(), &ctx).await;

            let mut message = Message::request(MessageType::PutValue, record.key.clone());
            message.record = Some(record);
            inner.fan_out(closest, message, true, &ctx).await;
        }))
    }

    /// Record the local node as a provider of `cid`, then announce it to the
    /// closest peers.
    pub async fn provide(&self, cid: &Cid) -> Result<QueryStream, DhtError> {
        let cid = *cid;
        self.inner.providers.add_provider(&cid, &self.inner.local.id).await?;

        Ok(self.spawn_query(move |inner, ctx| async move {
            let digest = content_digest(&cid);
            let request = Message::request(MessageType::FindNode, digest.clone());
            let closest = inner.lookup(KadId::from_key(&digest), request, continue_always(), &ctx).await;

            let mut message = Message::request(MessageType::AddProvider, cid.to_bytes());
            message.provider_peers = vec![Peer::from_info(&inner.local, ConnectionType::Connected)];
            inner.fan_out(closest, message, false, &ctx).await;
        }))
    }

    /// Closest known peers to `key` that have addresses, excluding
    /// `requester` and the local node. Mapped for sending to remote peers.
    pub async fn closer_peers_offline(&self, key: &[u8], requester: &PeerId) -> Vec<PeerInfo> {
        let target = KadId::from_key(key);
        let ids = self.inner.routing.closest(&target, self.inner.params.k).await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if &id == requester || id == self.inner.local.id {
                continue;
            }
            let info = self.map_peer(PeerInfo::new(id.clone(), self.inner.peerstore.addresses(&id).await));
            if !info.addrs.is_empty() {
                out.push(info);
            }
        }
        out
    }
}

impl EngineInner {
    async fn seed(&self, target: &KadId) -> Vec<PeerInfo> {
        let ids = self.routing.closest(target, self.params.k).await;
        let mut seeds = Vec::with_capacity(ids.len());
        for id in ids {
            let addrs = self.peerstore.addresses(&id).await;
            seeds.push(PeerInfo::new(id, addrs));
        }
        seeds
    }

    /// Run a lookup over all paths and return the closest responders.
    async fn lookup(
        self: &Arc<Self>,
        target: KadId,
        request: Message,
        handler: ResponseHandler,
        ctx: &QueryContext,
    ) -> Vec<PeerInfo> {
        let seeds = self.seed(&target).await;
        if seeds.is_empty() {
            debug!(kind = request_kind(&request), "lookup has no seed peers");
            return Vec::new();
        }

        let paths = self.params.disjoint_paths.min(seeds.len());
        let mut partitions: Vec<Vec<PeerInfo>> = vec![Vec::new(); paths];
        for (i, seed) in seeds.into_iter().enumerate() {
            partitions[i % paths].push(seed);
        }

        let claimed = Arc::new(StdMutex::new(HashSet::from([self.local.id.clone()])));
        let stop = ctx.cancel.child_token();
        let runs = partitions.into_iter().map(|seeds| {
            self.run_path(target, &request, seeds, claimed.clone(), handler.clone(), ctx, &stop)
        });
        let results = join_all(runs).await;

        let mut closest = PeerDistanceList::new(target, self.params.k);
        for peer in results.into_iter().flatten() {
            closest.add(peer);
        }
        closest.peers()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_path(
        self: &Arc<Self>,
        target: KadId,
        request: &Message,
        seeds: Vec<PeerInfo>,
        claimed: Arc<StdMutex<HashSet<PeerId>>>,
        handler: ResponseHandler,
        ctx: &QueryContext,
        stop: &CancellationToken,
    ) -> Vec<PeerInfo> {
        let kind = request.kind().unwrap_or(MessageType::FindNode);
        let mut candidates = PeerDistanceList::new(target, self.params.k);
        for seed in seeds {
            candidates.add(seed);
        }
        let mut responded = PeerDistanceList::new(target, self.params.k);
        let mut best: Distance = candidates.iter().next().map(|(_, d)| *d).unwrap_or(Distance::MAX);

        'rounds: loop {
            if stop.is_cancelled() {
                break;
            }

            let batch: Vec<PeerInfo> = {
                let Ok(mut claimed) = claimed.lock() else {
                    break;
                };
                candidates
                    .iter()
                    .filter(|(p, _)| claimed.insert(p.id.clone()))
                    .take(self.params.alpha)
                    .map(|(p, _)| p.clone())
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            for peer in &batch {
                if !ctx.emit(QueryEvent::DialPeer { peer: peer.id.clone() }).await
                    || !ctx.emit(QueryEvent::SendQuery { to: peer.id.clone(), kind }).await
                {
                    break 'rounds;
                }
            }

            let mut join_set = JoinSet::new();
            for peer in batch {
                let rpc = self.rpc.clone();
                let message = request.clone();
                let limit = self.params.rpc_timeout;
                join_set.spawn(async move {
                    let result = match tokio::time::timeout(limit, rpc.send_request(&peer, message)).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (peer, result)
                });
            }

            let mut any_closer = false;
            loop {
                let joined = tokio::select! {
                    _ = stop.cancelled() => {
                        join_set.abort_all();
                        break 'rounds;
                    }
                    joined = join_set.join_next() => joined,
                };
                let Some(joined) = joined else {
                    break;
                };
                let Ok((peer, result)) = joined else {
                    continue;
                };

                let reply = match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        trace!(peer = %peer.id.short(), error = %e, "lookup rpc failed");
                        let event = QueryEvent::QueryError {
                            from: peer.id.clone(),
                            error: e.to_string(),
                        };
                        if !ctx.emit(event).await {
                            break 'rounds;
                        }
                        continue;
                    }
                };

                if self.routing.add(peer.id.clone()).await == AddOutcome::Added
                    && !ctx.emit(QueryEvent::AddPeer { peer: peer.id.clone() }).await
                {
                    break 'rounds;
                }

                let closer: Vec<PeerInfo> = reply
                    .closer_peer_infos()
                    .into_iter()
                    .filter(|p| p.id != self.local.id)
                    .collect();
                for info in &closer {
                    if info.addrs.is_empty() {
                        continue;
                    }
                    let update = PeerUpdate {
                        multiaddrs: info.addrs.clone(),
                        ..Default::default()
                    };
                    if let Err(e) = self.peerstore.merge(&info.id, update).await {
                        debug!(peer = %info.id.short(), error = %e, "failed to record peer addresses");
                    }
                }

                let response = QueryEvent::PeerResponse {
                    from: peer.id.clone(),
                    kind,
                    closer: closer.clone(),
                    providers: reply.provider_peer_infos(),
                    record: reply.record.clone(),
                };
                if !ctx.emit(response).await {
                    break 'rounds;
                }

                let reaction = handler(&peer, &reply);
                for event in reaction.events {
                    if !ctx.emit(event).await {
                        break 'rounds;
                    }
                }
                if reaction.control == LookupControl::Stop {
                    stop.cancel();
                }

                responded.add(peer);
                for info in closer {
                    let d = target.distance(&info.id.kad_id());
                    if d < best {
                        best = d;
                        any_closer = true;
                    }
                    candidates.add(info);
                }
            }

            if !any_closer {
                break;
            }
        }

        responded.peers()
    }

    /// Send `message` to each peer concurrently. With `expect_reply` the
    /// reply is awaited, otherwise the message is fire-and-forget.
    async fn fan_out(&self, peers: Vec<PeerInfo>, message: Message, expect_reply: bool, ctx: &QueryContext) {
        let kind = message.kind().unwrap_or(MessageType::PutValue);
        for peer in &peers {
            if !ctx.emit(QueryEvent::SendQuery { to: peer.id.clone(), kind }).await {
                return;
            }
        }

        let mut join_set = JoinSet::new();
        for peer in peers {
            let rpc = self.rpc.clone();
            let message = message.clone();
            let limit = self.params.rpc_timeout;
            join_set.spawn(async move {
                let sent = async {
                    if expect_reply {
                        rpc.send_request(&peer, message).await.map(|_| ())
                    } else {
                        rpc.send_message(&peer, message).await
                    }
                };
                let result = match tokio::time::timeout(limit, sent).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("query timeout")),
                };
                (peer, result)
            });
        }

        loop {
            let joined = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    join_set.abort_all();
                    return;
                }
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                return;
            };
            let Ok((peer, result)) = joined else {
                continue;
            };
            let event = match result {
                Ok(()) => QueryEvent::PeerResponse {
                    from: peer.id,
                    kind,
                    closer: Vec::new(),
                    providers: Vec::new(),
                    record: None,
                },
                Err(e) => QueryEvent::QueryError {
                    from: peer.id,
                    error: e.to_string(),
                },
            };
            if !ctx.emit(event).await {
                return;
            }
        }
    }

    async fn send_corrections(&self, key: &[u8], found: Vec<(PeerInfo, Record)>, ctx: &QueryContext) {
        if found.len() < 2 || ctx.cancel.is_cancelled() {
            return;
        }
        let values: Vec<Vec<u8>> = found.iter().map(|(_, r)| r.value.clone()).collect();
        let best = match best_record(self.values.selectors(), key, &values) {
            Ok(best) => found[best].1.clone(),
            Err(e) => {
                debug!(error = %e, "could not select best record");
                return;
            }
        };

        let mut join_set = JoinSet::new();
        for (peer, record) in found {
            if record.value == best.value {
                continue;
            }
            let rpc = self.rpc.clone();
            let mut message = Message::request(MessageType::PutValue, key.to_vec());
            message.record = Some(Record::new(best.key.clone(), best.value.clone()));
            let limit = self.params.rpc_timeout;
            join_set.spawn(async move {
                let outcome = tokio::time::timeout(limit, rpc.send_request(&peer, message)).await;
                if !matches!(outcome, Ok(Ok(_))) {
                    debug!(peer = %peer.id.short(), "failed to correct outdated record");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }
}

fn request_kind(request: &Message) -> &'static str {
    request.kind().map(|k| k.as_str()).unwrap_or("UNKNOWN")
}

#[async_trait]
impl ClosestPeersLookup for QueryEngine {
    async fn lookup_closest(&self, key: &[u8], cancel: CancellationToken) -> Result<Vec<PeerInfo>, DhtError> {
        let mut stream = self.get_closest_peers(key);
        let mut peers = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.cancel();
                    return Err(DhtError::Cancelled);
                }
                event = stream.next() => match event {
                    Some(QueryEvent::FinalPeer { peer, .. }) => peers.push(peer),
                    Some(_) => {}
                    None => break,
                }
            }
        }
        match stream.outcome() {
            QueryOutcome::Cancelled => Err(DhtError::Cancelled),
            QueryOutcome::TimedOut if peers.is_empty() => Err(DhtError::Timeout),
            _ => Ok(peers),
        }
    }
}

#[async_trait]
impl ContentProvider for QueryEngine {
    async fn announce(&self, cid: &Cid, cancel: CancellationToken) -> Result<usize, DhtError> {
        let mut stream = self.provide(cid).await?;
        let mut announced = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.cancel();
                    return Err(DhtError::Cancelled);
                }
                event = stream.next() => match event {
                    Some(QueryEvent::PeerResponse { kind: MessageType::AddProvider, .. }) => announced += 1,
                    Some(_) => {}
                    None => break,
                }
            }
        }
        if stream.outcome() == QueryOutcome::Cancelled {
            return Err(DhtError::Cancelled);
        }
        Ok(announced)
    }
}
