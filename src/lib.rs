//! # kadroute - Kademlia DHT Engine
//!
//! A Kademlia distributed hash table for content and peer routing:
//!
//! - **Routing**: 256 k-buckets over the XOR metric with liveness-probed eviction
//! - **Queries**: iterative, alpha-parallel lookups with optional disjoint paths,
//!   streamed as events and cancellable at any point
//! - **Content routing**: provider records keyed by multihash, with expiry and
//!   periodic re-announcement
//! - **Records**: namespaced values checked by validators, ranked by selectors
//! - **Maintenance**: self-query, bucket refresh and closest-peer tagging loops
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - A cheap-to-clone handle sends commands over an async channel
//! - A private actor owns the state and processes commands in order
//!
//! Transport, peer metadata and persistence are collaborators behind traits
//! ([`Dialer`], [`Registrar`], [`PeerStore`], [`Datastore`]), so the engine
//! runs unchanged over TCP, over in-process pipes, or inside a host node.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `dht` | [`KadDht`] facade combining all components |
//! | `identity` | Keypairs, peer ids, key-space ids and distances |
//! | `distance` | Bounded distance-ordered peer lists |
//! | `routing` | k-bucket routing table with change notifications |
//! | `closest_peers` | Tags the closest peers in the peer store |
//! | `query` | Query engine and event streams |
//! | `rpc` | Inbound protocol handler |
//! | `network` | Outbound RPC client |
//! | `transport` | TCP and in-memory stream transports |
//! | `messages` | Wire messages and framing |
//! | `providers` | Provider record store |
//! | `values` | Value record store |
//! | `validation` | Record validators and selectors |
//! | `self_query` | Periodic lookup of the local id |
//! | `refresh` | Stale bucket refresh |
//! | `reprovider` | Re-announcement of provided content |
//! | `peerstore` / `datastore` | Collaborator traits with in-memory implementations |
//! | `protocols` | Trait seams between components |
//! | `config` / `error` | Configuration and error taxonomy |

mod closest_peers;
mod config;
mod datastore;
mod dht;
mod distance;
mod error;
mod identity;
mod messages;
mod network;
mod peerstore;
mod protocols;
mod providers;
mod query;
mod refresh;
mod reprovider;
mod routing;
mod rpc;
mod self_query;
mod transport;
mod validation;
mod values;

pub use cid::Cid;
pub use multiaddr::Multiaddr;

pub use closest_peers::ClosestPeers;
pub use config::*;
pub use datastore::{Datastore, MemoryDatastore};
pub use dht::{DhtComponents, DhtOptions, KadDht, TelemetrySnapshot};
pub use distance::PeerDistanceList;
pub use error::{DhtError, DhtResult};
pub use identity::{
    is_private_addr, multiaddr_to_socket_addr, passthrough_mapper, remove_private_addresses,
    remove_public_addresses, sha256_multihash, socket_addr_to_multiaddr, Distance, KadId, KeyError, Keypair,
    PeerId, PeerInfo, PeerInfoMapper, PublicKey,
};
pub use messages::{
    read_message, write_message, ConnectionType, Message, MessageType, Peer, Record, MAX_MESSAGE_SIZE,
};
pub use network::Network;
pub use peerstore::{MemoryPeerStore, PeerRecord, PeerStore, PeerUpdate, Tag};
pub use protocols::{ClosestPeersLookup, ContentProvider, DhtIo, DhtRpc, DhtStream, Dialer, Registrar, StreamHandler};
pub use providers::{content_digest, ProviderStore};
pub use query::{EngineParts, QueryEngine, QueryEvent, QueryOutcome, QueryStream};
pub use refresh::RoutingRefresh;
pub use reprovider::Reprovider;
pub use routing::{random_key_for_bucket, AddOutcome, RoutingEntry, RoutingEvent, RoutingTable, NUM_BUCKETS};
pub use rpc::RpcHandler;
pub use self_query::QuerySelf;
pub use transport::{MemoryNetwork, MemoryTransport, StreamHeader, TcpTransport};
pub use validation::{
    best_record, default_selectors, default_validators, public_key_record_key, select_first,
    validate_public_key_record, verify_record, SelectorFn, Selectors, ValidatorFn, Validators,
    PUBLIC_KEY_NAMESPACE, PUBLIC_KEY_PREFIX,
};
pub use values::{PutOutcome, ValueStore};
