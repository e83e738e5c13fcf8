//! # Wire Protocol Messages
//!
//! One request/response message type is exchanged on every DHT stream. The
//! schema is protobuf (encoded with `prost`) so that field tags stay
//! compatible with other Kademlia implementations:
//!
//! | Field | Tag | Used by |
//! |-------|-----|---------|
//! | `message_type` | 1 | all |
//! | `key` | 2 | all except PING |
//! | `record` | 3 | GET_VALUE, PUT_VALUE |
//! | `closer_peers` | 8 | FIND_NODE, GET_VALUE, GET_PROVIDERS |
//! | `provider_peers` | 9 | ADD_PROVIDER, GET_PROVIDERS |
//! | `cluster_level_raw` | 10 | echoed back unchanged |
//! | `error` | 16 | error replies |
//!
//! ## Framing
//!
//! Each message is preceded by its length as a big-endian `u32`. Frames larger
//! than [`MAX_MESSAGE_SIZE`] are rejected before the body is read.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use multiaddr::Multiaddr;
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::DhtError;
use crate::identity::{PeerId, PeerInfo};

/// Maximum encoded size of a single message (4 MiB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PutValue => "PUT_VALUE",
            Self::GetValue => "GET_VALUE",
            Self::AddProvider => "ADD_PROVIDER",
            Self::GetProviders => "GET_PROVIDERS",
            Self::FindNode => "FIND_NODE",
            Self::Ping => "PING",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub author: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
    /// RFC 3339 timestamp set by the node that stored the record.
    #[prost(string, tag = "5")]
    pub time_received: String,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            author: Vec::new(),
            signature: Vec::new(),
            time_received: Utc::now().to_rfc3339(),
        }
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.time_received)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn stamp_received(&mut self) {
        self.time_received = Utc::now().to_rfc3339();
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

impl Peer {
    pub fn from_info(info: &PeerInfo, connection: ConnectionType) -> Self {
        Self {
            id: info.id.to_bytes(),
            addrs: info.addrs.iter().map(|a| a.to_vec()).collect(),
            connection: connection as i32,
        }
    }

    /// Peers with an invalid id are dropped; unparseable addresses are skipped.
    pub fn to_info(&self) -> Option<PeerInfo> {
        let id = PeerId::from_bytes(&self.id).ok()?;
        let addrs = self
            .addrs
            .iter()
            .filter_map(|raw| Multiaddr::try_from(raw.clone()).ok())
            .collect();
        Some(PeerInfo::new(id, addrs))
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub message_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub record: Option<Record>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<Peer>,
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<Peer>,
    #[prost(int32, tag = "10")]
    pub cluster_level_raw: i32,
    /// Set on replies to requests that could not be served.
    #[prost(string, tag = "16")]
    pub error: String,
}

impl Message {
    pub fn request(kind: MessageType, key: Vec<u8>) -> Self {
        Self {
            message_type: kind as i32,
            key,
            ..Default::default()
        }
    }

    /// Reply skeleton: same type, key and cluster level as the request.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            message_type: request.message_type,
            key: request.key.clone(),
            cluster_level_raw: request.cluster_level_raw,
            ..Default::default()
        }
    }

    pub fn error_reply(request: &Message, err: &DhtError) -> Self {
        Self {
            error: err.to_string(),
            ..Self::reply_to(request)
        }
    }

    pub fn kind(&self) -> Result<MessageType, DhtError> {
        MessageType::try_from(self.message_type)
            .map_err(|_| DhtError::invalid_message(format!("unknown message type {}", self.message_type)))
    }

    pub fn closer_peer_infos(&self) -> Vec<PeerInfo> {
        self.closer_peers.iter().filter_map(Peer::to_info).collect()
    }

    pub fn provider_peer_infos(&self) -> Vec<PeerInfo> {
        self.provider_peers.iter().filter_map(Peer::to_info).collect()
    }
}

// ============================================================================
// Framing
// ============================================================================

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {} bytes (max {})", payload.len(), MAX_MESSAGE_SIZE);
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean end of stream before the header.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        warn!(size = len, max = MAX_MESSAGE_SIZE, "peer sent oversized frame");
        anyhow::bail!("message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE);
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    write_frame(writer, &message.encode_to_vec()).await
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    match read_frame(reader).await? {
        Some(payload) => {
            let message = Message::decode(payload.as_slice()).context("failed to decode message")?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_survives_framing() {
        let peer = PeerInfo::new(
            PeerId::random(),
            vec!["/ip4/10.0.0.1/tcp/4001".parse().expect("addr")],
        );
        let mut message = Message::request(MessageType::GetProviders, vec![1, 2, 3]);
        message.cluster_level_raw = 7;
        message.provider_peers.push(Peer::from_info(&peer, ConnectionType::Connected));

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &message).await.expect("write");
        let decoded = read_message(&mut b).await.expect("read").expect("frame");

        assert_eq!(decoded.kind(), Ok(MessageType::GetProviders));
        assert_eq!(decoded.cluster_level_raw, 7);
        assert_eq!(decoded.provider_peer_infos(), vec![peer]);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_header() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes())
            .await
            .expect("write");
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_message(&mut b).await.expect("read").is_none());
    }

    #[test]
    fn unknown_type_is_invalid_message() {
        let message = Message {
            message_type: 42,
            ..Default::default()
        };
        assert!(matches!(message.kind(), Err(DhtError::InvalidMessage(_))));
    }

    #[test]
    fn reply_echoes_cluster_level() {
        let mut request = Message::request(MessageType::FindNode, b"key".to_vec());
        request.cluster_level_raw = 3;
        let reply = Message::reply_to(&request);
        assert_eq!(reply.cluster_level_raw, 3);
        assert_eq!(reply.key, b"key".to_vec());
    }

    #[test]
    fn peer_with_invalid_id_is_dropped() {
        let peer = Peer {
            id: vec![0xde, 0xad],
            addrs: Vec::new(),
            connection: 0,
        };
        assert!(peer.to_info().is_none());
    }
}
