//! # Inbound RPC Handler
//!
//! Serves the DHT protocol on inbound streams. A stream carries any number
//! of request frames; each request is answered with one reply frame, except
//! ADD_PROVIDER which has no reply.
//!
//! | Request | Reply |
//! |---------|-------|
//! | PING | echo |
//! | FIND_NODE | closer peers, or the local node when it is the target |
//! | GET_VALUE | stored record (if any) plus closer peers |
//! | PUT_VALUE | echo of the stored record |
//! | GET_PROVIDERS | known providers plus closer peers |
//! | ADD_PROVIDER | none |
//!
//! The remote peer of every stream enters the routing table and its
//! addresses are recorded in the peer store. A request that cannot be
//! served is answered with an error reply; the stream stays open.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::identity::{PeerInfo, PublicKey};
use crate::messages::{read_message, write_message, ConnectionType, Message, MessageType, Peer, Record};
use crate::peerstore::{PeerStore, PeerUpdate};
use crate::protocols::{DhtStream, StreamHandler};
use crate::providers::content_digest;
use crate::query::QueryEngine;
use crate::validation::public_key_record_key;

/// Upper bound on serving a single request.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RpcHandler {
    engine: QueryEngine,
    peerstore: Arc<dyn PeerStore>,
    public_key: PublicKey,
}

impl RpcHandler {
    pub fn new(engine: QueryEngine, peerstore: Arc<dyn PeerStore>, public_key: PublicKey) -> Self {
        Self {
            engine,
            peerstore,
            public_key,
        }
    }

    async fn observe_remote(&self, remote: &PeerInfo) {
        if remote.id == self.engine.local_peer().id {
            return;
        }
        if !remote.addrs.is_empty() {
            let update = PeerUpdate {
                multiaddrs: remote.addrs.clone(),
                ..Default::default()
            };
            if let Err(e) = self.peerstore.merge(&remote.id, update).await {
                debug!(peer = %remote.id.short(), error = %e, "failed to record remote addresses");
            }
        }
        self.engine.routing().add(remote.id.clone()).await;
    }

    /// `Ok(None)` means the request gets no reply.
    pub async fn handle_message(&self, remote: &PeerInfo, request: &Message) -> Result<Option<Message>, DhtError> {
        let kind = request.kind()?;
        trace!(peer = %remote.id.short(), kind = kind.as_str(), "handling request");
        match kind {
            MessageType::Ping => Ok(Some(Message::reply_to(request))),
            MessageType::FindNode => self.handle_find_node(remote, request).await.map(Some),
            MessageType::GetValue => self.handle_get_value(remote, request).await.map(Some),
            MessageType::PutValue => self.handle_put_value(request).await.map(Some),
            MessageType::GetProviders => self.handle_get_providers(remote, request).await.map(Some),
            MessageType::AddProvider => {
                self.handle_add_provider(remote, request).await?;
                Ok(None)
            }
        }
    }

    fn encode_peers(&self, peers: &[PeerInfo]) -> Vec<Peer> {
        peers
            .iter()
            .map(|p| Peer::from_info(p, ConnectionType::NotConnected))
            .collect()
    }

    async fn handle_find_node(&self, remote: &PeerInfo, request: &Message) -> Result<Message, DhtError> {
        let local = self.engine.local_peer();
        let closer = if request.key == local.id.as_bytes() {
            vec![self.engine.map_peer(local.clone())]
        } else {
            self.engine.closer_peers_offline(&request.key, &remote.id).await
        };
        debug!(peer = %remote.id.short(), returned = closer.len(), "FIND_NODE response");

        let mut reply = Message::reply_to(request);
        reply.closer_peers = self.encode_peers(&closer);
        Ok(reply)
    }

    async fn handle_get_value(&self, remote: &PeerInfo, request: &Message) -> Result<Message, DhtError> {
        if request.key.is_empty() {
            return Err(DhtError::invalid_message("empty key"));
        }

        let own_key = public_key_record_key(self.engine.local_peer().id.as_bytes());
        let record = if request.key == own_key {
            Some(Record::new(own_key, self.public_key.encode()))
        } else {
            self.engine.values().get(&request.key).await?
        };
        let closer = self.engine.closer_peers_offline(&request.key, &remote.id).await;
        debug!(
            peer = %remote.id.short(),
            found = record.is_some(),
            closer = closer.len(),
            "GET_VALUE response"
        );

        let mut reply = Message::reply_to(request);
        reply.record = record;
        reply.closer_peers = self.encode_peers(&closer);
        Ok(reply)
    }

    async fn handle_put_value(&self, request: &Message) -> Result<Message, DhtError> {
        let record = request
            .record
            .clone()
            .ok_or_else(|| DhtError::invalid_message("PUT_VALUE without record"))?;
        if record.key != request.key {
            return Err(DhtError::invalid_message("record key does not match message key"));
        }
        self.engine.values().put(record.clone()).await?;

        let mut reply = Message::reply_to(request);
        reply.record = Some(record);
        Ok(reply)
    }

    async fn handle_get_providers(&self, remote: &PeerInfo, request: &Message) -> Result<Message, DhtError> {
        let cid = Cid::try_from(request.key.as_slice()).map_err(|_| DhtError::invalid_message("Invalid CID"))?;
        let digest = content_digest(&cid);

        let (providers, closer) = tokio::join!(
            self.engine.providers().get_providers(&cid),
            self.engine.closer_peers_offline(&digest, &remote.id),
        );

        let local = self.engine.local_peer();
        let mut provider_infos = Vec::new();
        for id in providers? {
            let addrs = if id == local.id {
                local.addrs.clone()
            } else {
                self.peerstore.addresses(&id).await
            };
            let info = self.engine.map_peer(PeerInfo::new(id, addrs));
            if !info.addrs.is_empty() {
                provider_infos.push(info);
            }
        }
        debug!(
            peer = %remote.id.short(),
            providers = provider_infos.len(),
            closer = closer.len(),
            "GET_PROVIDERS response"
        );

        let mut reply = Message::reply_to(request);
        reply.provider_peers = self.encode_peers(&provider_infos);
        reply.closer_peers = self.encode_peers(&closer);
        Ok(reply)
    }

    async fn handle_add_provider(&self, remote: &PeerInfo, request: &Message) -> Result<(), DhtError> {
        let cid = Cid::try_from(request.key.as_slice()).map_err(|_| DhtError::invalid_message("Invalid CID"))?;
        let providers = request.provider_peer_infos();
        if providers.is_empty() {
            warn!(peer = %remote.id.short(), "ADD_PROVIDER without providers");
        }

        for provider in providers {
            // Peers may only announce themselves.
            if provider.id != remote.id {
                debug!(
                    peer = %remote.id.short(),
                    claimed = %provider.id.short(),
                    "ignoring provider record for another peer"
                );
                continue;
            }
            if !provider.addrs.is_empty() {
                let update = PeerUpdate {
                    multiaddrs: provider.addrs.clone(),
                    ..Default::default()
                };
                if let Err(e) = self.peerstore.merge(&provider.id, update).await {
                    debug!(peer = %provider.id.short(), error = %e, "failed to record provider addresses");
                }
            }
            self.engine.providers().add_provider(&cid, &provider.id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamHandler for RpcHandler {
    async fn handle_stream(&self, remote: PeerInfo, mut stream: DhtStream) -> Result<()> {
        self.observe_remote(&remote).await;

        while let Some(request) = read_message(&mut stream).await? {
            let reply = match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, self.handle_message(&remote, &request)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    debug!(peer = %remote.id.short(), error = %e, "request failed");
                    Some(Message::error_reply(&request, &e))
                }
                Err(_) => {
                    warn!(peer = %remote.id.short(), "request processing timed out");
                    Some(Message::error_reply(&request, &DhtError::Timeout))
                }
            };
            if let Some(reply) = reply {
                write_message(&mut stream, &reply).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cid::multihash::Multihash;
    use multiaddr::Multiaddr;
    use sha2::{Digest, Sha256};

    use crate::config::DhtConfig;
    use crate::datastore::MemoryDatastore;
    use crate::identity::{passthrough_mapper, Keypair, PeerId};
    use crate::peerstore::MemoryPeerStore;
    use crate::protocols::DhtRpc;
    use crate::providers::ProviderStore;
    use crate::query::EngineParts;
    use crate::routing::RoutingTable;
    use crate::validation::{default_selectors, default_validators};
    use crate::values::ValueStore;

    struct OfflineRpc;

    #[async_trait]
    impl DhtRpc for OfflineRpc {
        async fn send_request(&self, _to: &PeerInfo, _request: Message) -> Result<Message> {
            anyhow::bail!("offline")
        }

        async fn send_message(&self, _to: &PeerInfo, _message: Message) -> Result<()> {
            anyhow::bail!("offline")
        }
    }

    struct Fixture {
        handler: Arc<RpcHandler>,
        keypair: Keypair,
        peerstore: Arc<MemoryPeerStore>,
        engine: QueryEngine,
    }

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/10.1.0.1/tcp/{port}").parse().expect("addr")
    }

    fn fixture() -> Fixture {
        let keypair = Keypair::generate();
        let local = keypair.peer_id();
        let config = DhtConfig::default();
        let datastore = Arc::new(MemoryDatastore::new());
        let peerstore = Arc::new(MemoryPeerStore::new());
        let rpc: Arc<dyn DhtRpc> = Arc::new(OfflineRpc);
        let engine = QueryEngine::new(
            EngineParts {
                local: PeerInfo::new(local.clone(), vec![addr(1)]),
                routing: RoutingTable::new(&local, config.k, rpc.clone()),
                rpc,
                peerstore: peerstore.clone(),
                providers: ProviderStore::new(
                    datastore.clone(),
                    local,
                    config.provider_validity,
                    config.provider_cleanup_interval,
                    config.provider_cache_size,
                ),
                values: ValueStore::new(datastore, default_validators(), default_selectors(), config.max_record_age),
                mapper: passthrough_mapper(),
            },
            &config,
        );
        let handler = Arc::new(RpcHandler::new(engine.clone(), peerstore.clone(), keypair.public()));
        Fixture {
            handler,
            keypair,
            peerstore,
            engine,
        }
    }

    fn cid_for(data: &[u8]) -> Cid {
        Cid::new_v1(0x55, Multihash::<64>::wrap(0x12, &Sha256::digest(data)).expect("digest fits"))
    }

    /// Send `requests` over a duplex stream and collect the replies.
    async fn exchange(handler: Arc<RpcHandler>, remote: PeerInfo, requests: Vec<Message>) -> Vec<Message> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let serve = tokio::spawn(async move { handler.handle_stream(remote, Box::new(server)).await });
        let mut replies = Vec::new();
        for request in &requests {
            write_message(&mut client, request).await.expect("write");
            if request.kind() == Ok(MessageType::AddProvider) {
                continue;
            }
            replies.push(read_message(&mut client).await.expect("read").expect("reply"));
        }
        drop(client);
        serve.await.expect("join").expect("serve");
        replies
    }

    #[tokio::test]
    async fn ping_echoes_and_records_remote() {
        let f = fixture();
        let remote = PeerInfo::new(PeerId::random(), vec![addr(2)]);
        let replies = exchange(f.handler.clone(), remote.clone(), vec![Message::request(MessageType::Ping, Vec::new())]).await;
        assert_eq!(replies[0].kind(), Ok(MessageType::Ping));
        assert!(replies[0].error.is_empty());
        assert!(f.engine.routing().find(&remote.id).await.is_some());
        assert_eq!(f.peerstore.addresses(&remote.id).await, remote.addrs);
    }

    #[tokio::test]
    async fn find_node_for_local_id_returns_self() {
        let f = fixture();
        let remote = PeerInfo::new(PeerId::random(), vec![addr(3)]);
        let request = Message::request(MessageType::FindNode, f.keypair.peer_id().to_bytes());
        let replies = exchange(f.handler.clone(), remote, vec![request]).await;
        let closer = replies[0].closer_peer_infos();
        assert_eq!(closer.len(), 1);
        assert_eq!(closer[0].id, f.keypair.peer_id());
    }

    #[tokio::test]
    async fn find_node_excludes_requester_and_addressless_peers() {
        let f = fixture();
        let known = PeerInfo::new(PeerId::random(), vec![addr(4)]);
        let addressless = PeerId::random();
        f.peerstore
            .merge(&known.id, PeerUpdate { multiaddrs: known.addrs.clone(), ..Default::default() })
            .await
            .expect("merge");
        f.engine.routing().add(known.id.clone()).await;
        f.engine.routing().add(addressless).await;

        let remote = PeerInfo::new(PeerId::random(), vec![addr(5)]);
        let request = Message::request(MessageType::FindNode, b"some key".to_vec());
        let replies = exchange(f.handler.clone(), remote.clone(), vec![request]).await;
        let ids: Vec<PeerId> = replies[0].closer_peer_infos().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![known.id]);
    }

    #[tokio::test]
    async fn get_value_serves_own_public_key() {
        let f = fixture();
        let key = public_key_record_key(f.keypair.peer_id().as_bytes());
        let request = Message::request(MessageType::GetValue, key.clone());
        let replies = exchange(f.handler.clone(), PeerInfo::new(PeerId::random(), vec![addr(6)]), vec![request]).await;
        let record = replies[0].record.clone().expect("record");
        assert_eq!(record.key, key);
        assert_eq!(record.value, f.keypair.public().encode());
    }

    #[tokio::test]
    async fn put_value_requires_record_and_matching_key() {
        let f = fixture();
        let other = Keypair::generate();
        let key = public_key_record_key(other.peer_id().as_bytes());

        let missing = Message::request(MessageType::PutValue, key.clone());
        let mut mismatched = Message::request(MessageType::PutValue, b"/pk/elsewhere".to_vec());
        mismatched.record = Some(Record::new(key.clone(), other.public().encode()));
        let mut valid = Message::request(MessageType::PutValue, key.clone());
        valid.record = Some(Record::new(key.clone(), other.public().encode()));

        let replies = exchange(
            f.handler.clone(),
            PeerInfo::new(PeerId::random(), vec![addr(7)]),
            vec![missing, mismatched, valid],
        )
        .await;
        assert!(!replies[0].error.is_empty());
        assert!(!replies[1].error.is_empty());
        assert!(replies[2].error.is_empty());
        let stored = f.engine.values().get(&key).await.expect("get").expect("stored");
        assert_eq!(stored.value, other.public().encode());
    }

    #[tokio::test]
    async fn get_providers_rejects_invalid_cid() {
        let f = fixture();
        let request = Message::request(MessageType::GetProviders, b"not a cid".to_vec());
        let replies = exchange(f.handler.clone(), PeerInfo::new(PeerId::random(), vec![addr(8)]), vec![request]).await;
        assert!(replies[0].error.contains("Invalid CID"));
    }

    #[tokio::test]
    async fn add_provider_only_accepts_the_sender() {
        let f = fixture();
        let cid = cid_for(b"content");
        let remote = PeerInfo::new(PeerId::random(), vec![addr(9)]);
        let impostor = PeerInfo::new(PeerId::random(), vec![addr(10)]);

        let mut announce = Message::request(MessageType::AddProvider, cid.to_bytes());
        announce.provider_peers = vec![
            Peer::from_info(&remote, ConnectionType::Connected),
            Peer::from_info(&impostor, ConnectionType::Connected),
        ];
        let query = Message::request(MessageType::GetProviders, cid.to_bytes());
        let replies = exchange(f.handler.clone(), remote.clone(), vec![announce, query]).await;

        assert_eq!(replies.len(), 1);
        let providers: Vec<PeerId> = replies[0].provider_peer_infos().into_iter().map(|p| p.id).collect();
        assert_eq!(providers, vec![remote.id]);
    }

    #[tokio::test]
    async fn unknown_message_type_gets_error_reply() {
        let f = fixture();
        let mut request = Message::request(MessageType::Ping, Vec::new());
        request.message_type = 42;
        let replies = exchange(f.handler.clone(), PeerInfo::new(PeerId::random(), vec![addr(11)]), vec![request]).await;
        assert!(!replies[0].error.is_empty());
    }
}
