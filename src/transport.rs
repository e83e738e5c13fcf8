//! # Stream Transports
//!
//! Two implementations of [`Dialer`] + [`Registrar`]:
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`TcpTransport`] | Real nodes (the `kadroute` binary). One TCP connection per stream. |
//! | [`MemoryTransport`] | In-process swarms for tests. Streams are `tokio::io::duplex` pipes. |
//!
//! ## TCP Stream Header
//!
//! Every TCP stream starts with one framed [`StreamHeader`] naming the
//! protocol, the dialer's peer id and the address it listens on. The
//! listener dispatches the remainder of the stream to the handler registered
//! for that protocol. The header is not authenticated; connection security
//! belongs to the layer below this crate.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use multiaddr::Multiaddr;
use prost::Message as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::{multiaddr_to_socket_addr, socket_addr_to_multiaddr, PeerId, PeerInfo};
use crate::messages::{read_frame, write_frame};
use crate::protocols::{DhtStream, Dialer, Registrar, StreamHandler};

/// Buffer size of each in-memory duplex pipe.
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// Time allowed for a dialer to send its stream header.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Destinations used to learn which local interface routes outward.
/// Connecting a UDP socket sends no packets.
const ROUTE_PROBE_TARGETS_V4: [&str; 3] = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];
const ROUTE_PROBE_TARGETS_V6: [&str; 2] = ["[2001:4860:4860::8888]:53", "[2606:4700:4700::1111]:53"];

type HandlerMap = RwLock<HashMap<String, Arc<dyn StreamHandler>>>;

async fn lookup_handler(handlers: &HandlerMap, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
    handlers.read().await.get(protocol).cloned()
}

// ============================================================================
// TCP
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamHeader {
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(bytes = "vec", tag = "2")]
    pub peer_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub listen_addr: Vec<u8>,
}

pub struct TcpTransport {
    local_peer: PeerId,
    local_addr: SocketAddr,
    advertised: Vec<SocketAddr>,
    handlers: Arc<HandlerMap>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Bind the listener and start accepting streams.
    pub async fn bind(addr: SocketAddr, local_peer: PeerId) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let advertised = routable_addresses(local_addr);
        let transport = Arc::new(Self {
            local_peer,
            local_addr,
            advertised,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        });

        let handlers = transport.handlers.clone();
        let shutdown = transport.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (socket, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::serve_inbound(handlers, socket, remote).await {
                        debug!(remote = %remote, error = ?e, "inbound stream error");
                    }
                });
            }
            debug!("tcp listener stopped");
        });

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Preferred address other peers should dial. Never unspecified.
    pub fn listen_multiaddr(&self) -> Multiaddr {
        self.advertised
            .first()
            .copied()
            .map(socket_addr_to_multiaddr)
            .unwrap_or_else(|| socket_addr_to_multiaddr(self.local_addr))
    }

    /// All addresses this listener is reachable on.
    pub fn listen_multiaddrs(&self) -> Vec<Multiaddr> {
        self.advertised.iter().copied().map(socket_addr_to_multiaddr).collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn serve_inbound(handlers: Arc<HandlerMap>, mut socket: TcpStream, remote: SocketAddr) -> Result<()> {
        let header = tokio::time::timeout(HEADER_READ_TIMEOUT, read_frame(&mut socket))
            .await
            .map_err(|_| anyhow::anyhow!("stream header read timed out"))??
            .ok_or_else(|| anyhow::anyhow!("stream closed before header"))?;
        let header = StreamHeader::decode(header.as_slice()).context("malformed stream header")?;
        let peer = PeerId::from_bytes(&header.peer_id).context("malformed peer id in header")?;

        let addrs = vec![observed_listen_addr(&header.listen_addr, remote)];

        let Some(handler) = lookup_handler(&handlers, &header.protocol).await else {
            trace!(remote = %remote, protocol = %header.protocol, "no handler for protocol");
            return Ok(());
        };
        handler
            .handle_stream(PeerInfo::new(peer, addrs), Box::new(socket))
            .await
    }
}

#[async_trait]
impl Dialer for TcpTransport {
    async fn open_stream(&self, peer: &PeerInfo, protocol: &str) -> Result<DhtStream> {
        let addr = peer
            .addrs
            .iter()
            .find_map(multiaddr_to_socket_addr)
            .ok_or_else(|| anyhow::anyhow!("no dialable address for peer {}", peer.id.short()))?;
        let mut socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        socket.set_nodelay(true)?;

        let header = StreamHeader {
            protocol: protocol.to_string(),
            peer_id: self.local_peer.to_bytes(),
            listen_addr: self.listen_multiaddr().to_vec(),
        };
        write_frame(&mut socket, &header.encode_to_vec()).await?;
        Ok(Box::new(socket))
    }
}

#[async_trait]
impl Registrar for TcpTransport {
    async fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<()> {
        self.handlers.write().await.insert(protocol.to_string(), handler);
        Ok(())
    }

    async fn unhandle(&self, protocol: &str) {
        self.handlers.write().await.remove(protocol);
    }
}

/// Addresses worth advertising for a listener bound to `local`.
///
/// A wildcard bind is expanded to the interfaces that route outward, with
/// loopback last so a single host still works offline.
fn routable_addresses(local: SocketAddr) -> Vec<SocketAddr> {
    let ip = local.ip();
    if !ip.is_unspecified() {
        return vec![local];
    }

    let (bind, targets, loopback): (&str, &[&str], IpAddr) = if ip.is_ipv4() {
        ("0.0.0.0:0", &ROUTE_PROBE_TARGETS_V4, IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        ("[::]:0", &ROUTE_PROBE_TARGETS_V6, IpAddr::V6(Ipv6Addr::LOCALHOST))
    };

    let mut addrs = Vec::new();
    for target in targets {
        if let Ok(socket) = UdpSocket::bind(bind)
            && socket.connect(target).is_ok()
            && let Ok(probe) = socket.local_addr()
        {
            let found = SocketAddr::new(probe.ip(), local.port());
            if !found.ip().is_loopback() && !found.ip().is_unspecified() && !addrs.contains(&found) {
                addrs.push(found);
            }
        }
    }
    addrs.push(SocketAddr::new(loopback, local.port()));
    addrs
}

/// The dialable address of an inbound peer.
///
/// The header's listen address is trusted for its port; an unspecified or
/// unparsable IP is replaced by the one the connection came from.
fn observed_listen_addr(header_addr: &[u8], remote: SocketAddr) -> Multiaddr {
    let announced = Multiaddr::try_from(header_addr.to_vec())
        .ok()
        .and_then(|addr| multiaddr_to_socket_addr(&addr));
    match announced {
        Some(addr) if !addr.ip().is_unspecified() => socket_addr_to_multiaddr(addr),
        Some(addr) => socket_addr_to_multiaddr(SocketAddr::new(remote.ip(), addr.port())),
        None => socket_addr_to_multiaddr(remote),
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Shared registry of in-process peers with failure and latency injection.
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<PeerId, Arc<HandlerMap>>>,
    unreachable: RwLock<HashSet<PeerId>>,
    latencies: RwLock<HashMap<PeerId, Duration>>,
    dials: AtomicUsize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create the transport endpoint of one peer.
    pub async fn transport(self: &Arc<Self>, local: PeerInfo) -> Arc<MemoryTransport> {
        let handlers = Arc::new(RwLock::new(HashMap::new()));
        self.handlers.write().await.insert(local.id.clone(), handlers.clone());
        Arc::new(MemoryTransport {
            local,
            network: self.clone(),
            handlers,
        })
    }

    pub async fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(peer.clone());
        } else {
            set.remove(peer);
        }
    }

    pub async fn set_latency(&self, peer: &PeerId, latency: Duration) {
        self.latencies.write().await.insert(peer.clone(), latency);
    }

    /// Total number of streams opened through this network.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }
}

pub struct MemoryTransport {
    local: PeerInfo,
    network: Arc<MemoryNetwork>,
    handlers: Arc<HandlerMap>,
}

impl MemoryTransport {
    pub fn local(&self) -> &PeerInfo {
        &self.local
    }
}

#[async_trait]
impl Dialer for MemoryTransport {
    async fn open_stream(&self, peer: &PeerInfo, protocol: &str) -> Result<DhtStream> {
        self.network.dials.fetch_add(1, Ordering::Relaxed);
        if self.network.unreachable.read().await.contains(&peer.id) {
            anyhow::bail!("peer {} unreachable", peer.id.short());
        }
        let latency = self.network.latencies.read().await.get(&peer.id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let remote_handlers = self
            .network
            .handlers
            .read()
            .await
            .get(&peer.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("peer {} not found", peer.id.short()))?;
        let handler = lookup_handler(&remote_handlers, protocol)
            .await
            .ok_or_else(|| anyhow::anyhow!("protocol {protocol} not supported by {}", peer.id.short()))?;

        let (client, server) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        let local = self.local.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle_stream(local, Box::new(server)).await {
                trace!(error = ?e, "memory stream handler error");
            }
        });
        Ok(Box::new(client))
    }
}

#[async_trait]
impl Registrar for MemoryTransport {
    async fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<()> {
        self.handlers.write().await.insert(protocol.to_string(), handler);
        Ok(())
    }

    async fn unhandle(&self, protocol: &str) {
        self.handlers.write().await.remove(protocol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{read_message, write_message, Message, MessageType};

    struct Echo;

    #[async_trait]
    impl StreamHandler for Echo {
        async fn handle_stream(&self, _remote: PeerInfo, mut stream: DhtStream) -> Result<()> {
            while let Some(message) = read_message(&mut stream).await? {
                write_message(&mut stream, &message).await?;
            }
            Ok(())
        }
    }

    fn local_info() -> PeerInfo {
        PeerInfo::new(PeerId::random(), vec!["/ip4/127.0.0.1/tcp/1".parse().expect("addr")])
    }

    #[tokio::test]
    async fn memory_transport_routes_by_protocol() {
        let network = MemoryNetwork::new();
        let a = network.transport(local_info()).await;
        let b = network.transport(local_info()).await;
        b.handle("/echo", Arc::new(Echo)).await.expect("register");

        let mut stream = a.open_stream(b.local(), "/echo").await.expect("open");
        let ping = Message::request(MessageType::Ping, Vec::new());
        write_message(&mut stream, &ping).await.expect("write");
        let reply = read_message(&mut stream).await.expect("read").expect("reply");
        assert_eq!(reply, ping);

        assert!(a.open_stream(b.local(), "/other").await.is_err());
        b.unhandle("/echo").await;
        assert!(a.open_stream(b.local(), "/echo").await.is_err());
        assert_eq!(network.dial_count(), 3);
    }

    #[tokio::test]
    async fn unreachable_peer_fails_to_dial() {
        let network = MemoryNetwork::new();
        let a = network.transport(local_info()).await;
        let b = network.transport(local_info()).await;
        b.handle("/echo", Arc::new(Echo)).await.expect("register");

        network.set_unreachable(&b.local().id, true).await;
        assert!(a.open_stream(b.local(), "/echo").await.is_err());
        network.set_unreachable(&b.local().id, false).await;
        assert!(a.open_stream(b.local(), "/echo").await.is_ok());
    }

    #[tokio::test]
    async fn tcp_transport_carries_header_and_payload() {
        let a = TcpTransport::bind("127.0.0.1:0".parse().expect("addr"), PeerId::random())
            .await
            .expect("bind");
        let b_id = PeerId::random();
        let b = TcpTransport::bind("127.0.0.1:0".parse().expect("addr"), b_id.clone())
            .await
            .expect("bind");
        b.handle("/echo", Arc::new(Echo)).await.expect("register");

        let target = PeerInfo::new(b_id, vec![b.listen_multiaddr()]);
        let mut stream = a.open_stream(&target, "/echo").await.expect("open");
        let message = Message::request(MessageType::FindNode, b"target".to_vec());
        write_message(&mut stream, &message).await.expect("write");
        let reply = read_message(&mut stream).await.expect("read").expect("reply");
        assert_eq!(reply.key, b"target".to_vec());

        a.shutdown();
        b.shutdown();
    }

    /// Forwards the remote info of every inbound stream.
    struct Recorder(tokio::sync::mpsc::UnboundedSender<PeerInfo>);

    #[async_trait]
    impl StreamHandler for Recorder {
        async fn handle_stream(&self, remote: PeerInfo, _stream: DhtStream) -> Result<()> {
            let _ = self.0.send(remote);
            Ok(())
        }
    }

    fn is_unspecified(addr: &Multiaddr) -> bool {
        multiaddr_to_socket_addr(addr).is_some_and(|s| s.ip().is_unspecified())
    }

    #[tokio::test]
    async fn wildcard_listener_never_advertises_unspecified_address() {
        let a = TcpTransport::bind("0.0.0.0:0".parse().expect("addr"), PeerId::random())
            .await
            .expect("bind");
        let advertised = a.listen_multiaddrs();
        assert!(!advertised.is_empty());
        assert!(advertised.iter().all(|addr| !is_unspecified(addr)));
        assert!(!is_unspecified(&a.listen_multiaddr()));

        let b_id = PeerId::random();
        let b = TcpTransport::bind("127.0.0.1:0".parse().expect("addr"), b_id.clone())
            .await
            .expect("bind");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.handle("/record", Arc::new(Recorder(tx))).await.expect("register");

        let target = PeerInfo::new(b_id, vec![b.listen_multiaddr()]);
        let _stream = a.open_stream(&target, "/record").await.expect("open");
        let remote = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler ran")
            .expect("remote info");

        assert_eq!(remote.addrs.len(), 1);
        let recorded = multiaddr_to_socket_addr(&remote.addrs[0]).expect("socket addr");
        assert!(!recorded.ip().is_unspecified());
        assert_eq!(recorded.port(), a.local_addr().port());

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn unspecified_header_address_takes_the_observed_ip() {
        let remote: SocketAddr = "192.168.1.7:51000".parse().expect("addr");
        let wildcard = socket_addr_to_multiaddr("0.0.0.0:4001".parse().expect("addr"));
        assert_eq!(
            observed_listen_addr(&wildcard.to_vec(), remote),
            socket_addr_to_multiaddr("192.168.1.7:4001".parse().expect("addr"))
        );

        let explicit = socket_addr_to_multiaddr("10.1.2.3:4001".parse().expect("addr"));
        assert_eq!(observed_listen_addr(&explicit.to_vec(), remote), explicit);
        assert_eq!(observed_listen_addr(b"garbage", remote), socket_addr_to_multiaddr(remote));
    }
}
