//! # Identity and Key-Space Primitives
//!
//! This module defines the identity types used throughout the DHT:
//!
//! - [`Keypair`]: Ed25519 signing keypair of the local node
//! - [`PublicKey`]: protobuf-encodable public key (the `/pk/` record value)
//! - [`PeerId`]: multihash of the encoded public key, the wire identity of a peer
//! - [`KadId`]: 256-bit key-space point derived from a peer id or any key
//! - [`Distance`]: XOR of two key-space points, ordered as an unsigned integer
//! - [`PeerInfo`]: a peer id plus the multiaddrs it can be reached at
//!
//! ## Key Space
//!
//! Peers and keys are never compared directly. Both are hashed into a
//! [`KadId`] with BLAKE3 and compared by XOR distance:
//!
//! | Input | KadId |
//! |-------|-------|
//! | `PeerId` | `BLAKE3(peer id multihash bytes)` |
//! | record key | `BLAKE3(key bytes)` |
//! | CID | `BLAKE3(cid.hash().to_bytes())` (digest only, version/codec ignored) |
//!
//! ## Invariants
//!
//! - XOR distance is symmetric and `d(a, a) == 0`
//! - `Distance` ordering equals big-endian unsigned integer ordering
//! - A `PeerId` always holds a well-formed multihash

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cid::multihash::Multihash;
use ed25519_dalek::{SigningKey, VerifyingKey};
use multiaddr::{Multiaddr, Protocol};
use prost::Message as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Multihash code for SHA2-256.
pub const SHA2_256_CODE: u64 = 0x12;

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("malformed public key encoding: {0}")]
    Encoding(#[from] prost::DecodeError),
    #[error("unsupported key type {0}")]
    UnsupportedKeyType(i32),
    #[error("invalid ed25519 public key")]
    InvalidKey,
    #[error("invalid multihash: {0}")]
    Multihash(String),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

// ============================================================================
// Keys
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
struct PublicKeyProto {
    #[prost(enumeration = "KeyType", tag = "1")]
    key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Protobuf encoding `{ Type: Ed25519, Data: <32 bytes> }`.
    pub fn encode(&self) -> Vec<u8> {
        PublicKeyProto {
            key_type: KeyType::Ed25519 as i32,
            data: self.0.to_bytes().to_vec(),
        }
        .encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
        let proto = PublicKeyProto::decode(bytes)?;
        if proto.key_type != KeyType::Ed25519 as i32 {
            return Err(KeyError::UnsupportedKeyType(proto.key_type));
        }
        let raw: [u8; 32] = proto
            .data
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidKey)?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key_bytes(&self.encode())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0.to_bytes()[..8]))
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Peer Identity
// ============================================================================

/// Wire identity of a peer: the multihash bytes carried in `Peer.id`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// SHA2-256 multihash of an encoded public key.
    pub fn from_public_key_bytes(encoded: &[u8]) -> Self {
        Self(sha256_multihash(encoded))
    }

    /// Accepts any well-formed multihash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let mh = Multihash::<64>::from_bytes(bytes).map_err(|e| KeyError::Multihash(e.to_string()))?;
        Ok(Self(mh.to_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn kad_id(&self) -> KadId {
        KadId::from_key(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// First bytes of the digest, for log fields.
    pub fn short(&self) -> String {
        let digest = self.0.get(2..).unwrap_or(&self.0);
        hex::encode(&digest[..digest.len().min(8)])
    }

    #[cfg(test)]
    pub fn random() -> Self {
        Keypair::generate().peer_id()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&hex::decode(s)?)
    }
}

/// SHA2-256 multihash bytes (`0x12 0x20 <digest>`).
pub fn sha256_multihash(data: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(data);
    let mut out = Vec::with_capacity(34);
    out.push(SHA2_256_CODE as u8);
    out.push(digest.len() as u8);
    out.extend_from_slice(&digest);
    out
}

// ============================================================================
// Key Space
// ============================================================================

/// A point in the 256-bit Kademlia key space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KadId([u8; 32]);

impl KadId {
    pub fn from_key(key: &[u8]) -> Self {
        Self(*blake3::hash(key).as_bytes())
    }

    pub fn from_peer(peer: &PeerId) -> Self {
        peer.kad_id()
    }

    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn distance(&self, other: &KadId) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadId({})", hex::encode(&self.0[..8]))
    }
}

/// XOR distance. The derived ordering compares bytes most-significant first,
/// which is the unsigned big-integer ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    pub const MAX: Distance = Distance([0xff; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Number of leading zero bits; 256 for the zero distance.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                return zeros + byte.leading_zeros();
            }
        }
        zeros
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Peer Info and Addresses
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    pub fn without_addrs(id: PeerId) -> Self {
        Self { id, addrs: Vec::new() }
    }
}

pub fn socket_addr_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::from(addr.ip()))
        .with(Protocol::Tcp(addr.port()))
}

/// First `/ip*/tcp` pair in the address, if any.
pub fn multiaddr_to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut ip: Option<IpAddr> = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(v4) => ip = Some(IpAddr::V4(v4)),
            Protocol::Ip6(v6) => ip = Some(IpAddr::V6(v6)),
            Protocol::Tcp(port) => {
                if let Some(ip) = ip {
                    return Some(SocketAddr::new(ip, port));
                }
            }
            _ => {}
        }
    }
    None
}

/// Loopback, RFC1918, link-local and unique-local addresses.
pub fn is_private_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|proto| match proto {
        Protocol::Ip4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Protocol::Ip6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
        _ => false,
    })
}

/// Rewrites peer info before it is sent to remote peers.
pub type PeerInfoMapper = Arc<dyn Fn(PeerInfo) -> PeerInfo + Send + Sync>;

pub fn passthrough_mapper() -> PeerInfoMapper {
    Arc::new(|info| info)
}

/// Strip loopback, RFC1918, link-local and unique-local addresses.
pub fn remove_private_addresses() -> PeerInfoMapper {
    Arc::new(|mut info: PeerInfo| {
        info.addrs.retain(|a| !is_private_addr(a));
        info
    })
}

pub fn remove_public_addresses() -> PeerInfoMapper {
    Arc::new(|mut info: PeerInfo| {
        info.addrs.retain(is_private_addr);
        info
    })
}
