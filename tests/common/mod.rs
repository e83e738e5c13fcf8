//! In-process swarm over the memory transport.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kadroute::{
    DhtComponents, DhtConfig, KadDht, Keypair, MemoryDatastore, MemoryNetwork, MemoryPeerStore, Multiaddr,
    PeerInfo,
};

/// Upper bound on any single test step.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestNode {
    pub keypair: Keypair,
    pub dht: KadDht,
}

impl TestNode {
    pub fn info(&self) -> &PeerInfo {
        self.dht.local_peer()
    }
}

/// Background loops are pushed out so tests control every query.
pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_secs(2),
        query_timeout: Some(Duration::from_secs(5)),
        self_query_initial_delay: Duration::from_secs(600),
        ..DhtConfig::default()
    }
}

fn addr_for(index: usize) -> Multiaddr {
    format!("/ip4/10.0.{}.{}/tcp/4001", index / 250, index % 250 + 1)
        .parse()
        .expect("valid multiaddr")
}

pub async fn spawn_node(network: &Arc<MemoryNetwork>, index: usize, config: DhtConfig) -> TestNode {
    let keypair = Keypair::generate();
    let addr = addr_for(index);
    let transport = network
        .transport(PeerInfo::new(keypair.peer_id(), vec![addr.clone()]))
        .await;
    let dht = KadDht::new(
        config,
        DhtComponents {
            keypair: keypair.clone(),
            listen_addrs: vec![addr],
            dialer: transport.clone(),
            registrar: transport,
            peerstore: Arc::new(MemoryPeerStore::new()),
            datastore: Arc::new(MemoryDatastore::new()),
        },
    );
    dht.start().await.expect("start");
    TestNode { keypair, dht }
}

pub struct Swarm {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<TestNode>,
}

impl Swarm {
    /// `size` started nodes, each connected to node 0 in both directions.
    pub async fn star(size: usize) -> Self {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(size);
        for index in 0..size {
            nodes.push(spawn_node(&network, index, test_config()).await);
        }
        for node in nodes.iter().skip(1) {
            node.dht.on_peer_connected(nodes[0].info()).await;
            nodes[0].dht.on_peer_connected(node.info()).await;
        }
        Self { network, nodes }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.dht.stop().await;
        }
    }
}

/// Poll `check` until it returns `Some` or the test timeout elapses.
pub async fn eventually<T, F, Fut>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}
