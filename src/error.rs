//! # Error Taxonomy
//!
//! Typed errors surfaced by the public DHT API. Internal plumbing (transport,
//! framing, datastore) works with `anyhow::Result` and is converted at the
//! component boundary.
//!
//! | Variant | Meaning | Retry? |
//! |---------|---------|--------|
//! | `InvalidMessage` | Missing or unparseable wire field | never |
//! | `InvalidParameters` | Record failed (or has no) namespace validator | never |
//! | `NotFound` | Exhaustion: nothing found after all candidates | caller's choice |
//! | `Cancelled` | Caller-initiated cancellation | caller's choice |
//! | `Timeout` | Whole-query deadline elapsed | caller's choice |
//! | `Network` | Transport/peer failure outside a query | yes |
//! | `Datastore` | Persistent storage failure | yes |
//! | `Shutdown` | Component actor is gone | no |

use std::fmt::Display;

/// Errors returned by DHT operations.
///
/// `Clone` so that a single in-flight result can be shared between several
/// waiters (see the self-query single-flight).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DhtError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("component has shut down")]
    Shutdown,
}

impl DhtError {
    pub fn invalid_message(reason: impl Display) -> Self {
        Self::InvalidMessage(reason.to_string())
    }

    pub fn invalid_parameters(reason: impl Display) -> Self {
        Self::InvalidParameters(reason.to_string())
    }

    pub fn network(err: impl Display) -> Self {
        Self::Network(err.to_string())
    }

    pub fn datastore(err: impl Display) -> Self {
        Self::Datastore(err.to_string())
    }

    /// Terminal errors must never be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidMessage(_) | Self::InvalidParameters(_))
    }
}

pub type DhtResult<T> = Result<T, DhtError>;
