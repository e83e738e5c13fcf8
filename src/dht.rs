//! # Kademlia DHT
//!
//! [`KadDht`] wires the routing table, stores, query engine, inbound
//! handler and maintenance loops into one node.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `find_peer(id)` | Locate a peer's addresses |
//! | `get_closest_peers(key)` | The `k` peers closest to a key |
//! | `find_providers(cid)` | Peers that provide some content |
//! | `provide(cid)` | Announce the local node as a provider |
//! | `put(key, value)` / `get(key)` | Store and retrieve validated records |
//! | `bootstrap(peers)` | Join the network via known peers |
//!
//! ## Lifecycle
//!
//! Construction spawns the store and routing actors. `start` registers the
//! protocol handler (unless in client mode) and starts the maintenance
//! loops; `stop` reverses both and cancels running queries. Both are
//! idempotent.
//!
//! Connection events from the host feed the routing table through
//! `on_peer_connected` / `on_peer_disconnected`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cid::Cid;
use multiaddr::Multiaddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::closest_peers::ClosestPeers;
use crate::config::DhtConfig;
use crate::datastore::Datastore;
use crate::error::DhtError;
use crate::identity::{passthrough_mapper, Keypair, PeerId, PeerInfo, PeerInfoMapper};
use crate::messages::Record;
use crate::network::Network;
use crate::peerstore::{PeerStore, PeerUpdate};
use crate::protocols::{ClosestPeersLookup, ContentProvider, DhtRpc, Dialer, Registrar, StreamHandler};
use crate::providers::ProviderStore;
use crate::query::{EngineParts, QueryEngine, QueryStream};
use crate::refresh::RoutingRefresh;
use crate::reprovider::Reprovider;
use crate::routing::RoutingTable;
use crate::rpc::RpcHandler;
use crate::self_query::QuerySelf;
use crate::validation::{default_selectors, default_validators, Selectors, Validators};
use crate::values::ValueStore;

/// Collaborators supplied by the host.
pub struct DhtComponents {
    pub keypair: Keypair,
    pub listen_addrs: Vec<Multiaddr>,
    pub dialer: Arc<dyn Dialer>,
    pub registrar: Arc<dyn Registrar>,
    pub peerstore: Arc<dyn PeerStore>,
    pub datastore: Arc<dyn Datastore>,
}

/// Record validation and address rewriting hooks.
pub struct DhtOptions {
    pub validators: Validators,
    pub selectors: Selectors,
    pub mapper: PeerInfoMapper,
}

impl Default for DhtOptions {
    fn default() -> Self {
        Self {
            validators: default_validators(),
            selectors: default_selectors(),
            mapper: passthrough_mapper(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub routing_table_size: usize,
    pub provider_records: usize,
    pub value_records: usize,
}

pub struct KadDht {
    config: DhtConfig,
    local: PeerInfo,
    registrar: Arc<dyn Registrar>,
    peerstore: Arc<dyn PeerStore>,
    routing: RoutingTable,
    engine: QueryEngine,
    handler: Arc<RpcHandler>,
    closest_peers: ClosestPeers,
    self_query: QuerySelf,
    refresh: RoutingRefresh,
    reprovider: Reprovider,
    started: AtomicBool,
}

impl KadDht {
    pub fn new(config: DhtConfig, components: DhtComponents) -> Self {
        Self::with_options(config, components, DhtOptions::default())
    }

    pub fn with_options(config: DhtConfig, components: DhtComponents, options: DhtOptions) -> Self {
        let config = config.normalized();
        let local_id = components.keypair.peer_id();
        let local = PeerInfo::new(local_id.clone(), components.listen_addrs);

        let rpc: Arc<dyn DhtRpc> = Arc::new(Network::new(
            components.dialer,
            components.peerstore.clone(),
            config.protocol.clone(),
            config.rpc_timeout,
        ));
        let routing = RoutingTable::new(&local_id, config.k, rpc.clone());
        let providers = ProviderStore::new(
            components.datastore.clone(),
            local_id.clone(),
            config.provider_validity,
            config.provider_cleanup_interval,
            config.provider_cache_size,
        );
        let values = ValueStore::new(
            components.datastore,
            options.validators,
            options.selectors,
            config.max_record_age,
        );

        let engine = QueryEngine::new(
            EngineParts {
                local: local.clone(),
                routing: routing.clone(),
                rpc,
                peerstore: components.peerstore.clone(),
                providers: providers.clone(),
                values,
                mapper: options.mapper,
            },
            &config,
        );
        let handler = Arc::new(RpcHandler::new(
            engine.clone(),
            components.peerstore.clone(),
            components.keypair.public(),
        ));

        let lookup: Arc<dyn ClosestPeersLookup> = Arc::new(engine.clone());
        let announcer: Arc<dyn ContentProvider> = Arc::new(engine.clone());
        let closest_peers = ClosestPeers::new(routing.clone(), components.peerstore.clone(), &config);
        let self_query = QuerySelf::new(
            local_id,
            routing.clone(),
            lookup.clone(),
            config.self_query_interval,
            config.self_query_initial_delay,
            config.self_query_timeout,
        );
        let refresh = RoutingRefresh::new(
            routing.clone(),
            lookup,
            config.bucket_refresh_interval,
            config.bucket_stale_threshold,
        );
        let reprovider = Reprovider::new(
            providers,
            announcer,
            config.reprovide_interval,
            config.reprovide_threshold,
        );

        Self {
            config,
            local,
            registrar: components.registrar,
            peerstore: components.peerstore,
            routing,
            engine,
            handler,
            closest_peers,
            self_query,
            refresh,
            reprovider,
            started: AtomicBool::new(false),
        }
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn self_query(&self) -> &QuerySelf {
        &self.self_query
    }

    pub fn closest_peers(&self) -> &ClosestPeers {
        &self.closest_peers
    }

    pub async fn start(&self) -> Result<(), DhtError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.client_mode {
            info!(peer = %self.local.id.short(), "starting DHT in client mode");
        } else {
            let handler: Arc<dyn StreamHandler> = self.handler.clone();
            if let Err(e) = self.registrar.handle(&self.config.protocol, handler).await {
                self.started.store(false, Ordering::SeqCst);
                return Err(DhtError::network(e));
            }
            info!(peer = %self.local.id.short(), protocol = %self.config.protocol, "DHT started");
        }

        self.engine.providers().start();
        self.closest_peers.start();
        self.self_query.start();
        self.refresh.start();
        self.reprovider.start();
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if !self.config.client_mode {
            self.registrar.unhandle(&self.config.protocol).await;
        }
        self.engine.cancel_all();
        self.reprovider.stop().await;
        self.refresh.stop().await;
        self.self_query.stop().await;
        self.closest_peers.stop().await;
        self.engine.providers().stop().await;
        info!(peer = %self.local.id.short(), "DHT stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// A connection to `peer` was established by the host.
    pub async fn on_peer_connected(&self, peer: &PeerInfo) {
        if peer.id == self.local.id {
            return;
        }
        if !peer.addrs.is_empty() {
            let update = PeerUpdate {
                multiaddrs: peer.addrs.clone(),
                ..Default::default()
            };
            if let Err(e) = self.peerstore.merge(&peer.id, update).await {
                warn!(peer = %peer.id.short(), error = %e, "failed to record peer addresses");
            }
        }
        let outcome = self.routing.add(peer.id.clone()).await;
        debug!(peer = %peer.id.short(), ?outcome, "peer connected");
    }

    pub async fn on_peer_disconnected(&self, peer: &PeerId) {
        if self.routing.remove(peer).await {
            debug!(peer = %peer.short(), "peer disconnected, removed from routing table");
        }
    }

    /// Add `peers` to the routing table and run a self-query through them.
    pub async fn bootstrap(&self, peers: &[PeerInfo]) -> Result<usize, DhtError> {
        for peer in peers {
            self.on_peer_connected(peer).await;
        }
        self.self_query.query_self().await
    }

    pub async fn find_peer(&self, peer: &PeerId, cancel: CancellationToken) -> Result<Option<PeerInfo>, DhtError> {
        self.engine.find_peer(peer, cancel).await
    }

    pub fn find_peer_events(&self, peer: &PeerId) -> QueryStream {
        self.engine.find_peer_events(peer)
    }

    pub fn get_closest_peers(&self, key: &[u8]) -> QueryStream {
        self.engine.get_closest_peers(key)
    }

    pub fn find_providers(&self, cid: &Cid) -> QueryStream {
        self.engine.find_providers(cid)
    }

    pub async fn provide(&self, cid: &Cid) -> Result<QueryStream, DhtError> {
        self.engine.provide(cid).await
    }

    pub fn get(&self, key: &[u8]) -> QueryStream {
        self.engine.get(key)
    }

    pub async fn get_value(&self, key: &[u8], cancel: CancellationToken) -> Result<Record, DhtError> {
        self.engine.get_value(key, cancel).await
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<QueryStream, DhtError> {
        self.engine.put(key, value).await
    }

    pub async fn telemetry(&self) -> Result<TelemetrySnapshot, DhtError> {
        Ok(TelemetrySnapshot {
            routing_table_size: self.routing.size().await,
            provider_records: self.engine.providers().count().await?,
            value_records: self.engine.values().len().await?,
        })
    }
}
