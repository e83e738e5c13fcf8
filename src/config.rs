//! # DHT Configuration
//!
//! All tunables of the engine live in [`DhtConfig`]. The defaults follow the
//! conventional Kademlia parameters; timing values that the protocol leaves
//! open (record TTLs, republish cadence) are documented next to each constant.

use std::time::Duration;

/// Default Kademlia replication factor (bucket size and closest-set size).
pub const DEFAULT_K: usize = 20;

/// Default Kademlia concurrency factor (parallel RPCs per lookup path).
pub const DEFAULT_ALPHA: usize = 3;

/// Default number of disjoint lookup paths. `1` disables disjoint-path mode.
pub const DEFAULT_DISJOINT_PATHS: usize = 1;

/// Application protocol id negotiated for every DHT stream.
pub const DEFAULT_PROTOCOL: &str = "/ipfs/kad/1.0.0";

/// Per-RPC timeout. A slow peer must not stall the whole query.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole-query deadline.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Validity window of a provider record.
pub const DEFAULT_PROVIDER_VALIDITY: Duration = Duration::from_secs(48 * 60 * 60);

/// Interval of the provider expiry sweep.
pub const DEFAULT_PROVIDER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Number of content digests whose provider sets are cached in memory.
pub const DEFAULT_PROVIDER_CACHE_SIZE: usize = 256;

/// Value records older than this are treated as absent.
pub const DEFAULT_MAX_RECORD_AGE: Duration = Duration::from_secs(36 * 60 * 60);

/// Closest-peers maintenance: tag name applied to the locally-closest peers.
pub const DEFAULT_CLOSE_TAG_NAME: &str = "kad-close";

/// Closest-peers maintenance: value of the close tag.
pub const DEFAULT_CLOSE_TAG_VALUE: u32 = 50;

/// Keep-alive tag name and value applied alongside the close tag.
pub const KEEP_ALIVE_TAG_NAME: &str = "keep-alive";
pub const DEFAULT_KEEP_ALIVE_TAG_VALUE: u32 = 1;

#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and number of closest peers a lookup converges on.
    pub k: usize,
    /// Parallel RPCs per lookup path.
    pub alpha: usize,
    /// Independent lookup paths; candidates are partitioned round-robin.
    pub disjoint_paths: usize,
    pub protocol: String,
    pub rpc_timeout: Duration,
    /// `None` disables the whole-query deadline.
    pub query_timeout: Option<Duration>,

    pub provider_validity: Duration,
    pub provider_cleanup_interval: Duration,
    pub provider_cache_size: usize,
    /// Upper bound on providers returned by a single `find_providers`.
    pub max_providers_per_find: usize,

    pub max_record_age: Duration,

    pub closest_peers_set_size: usize,
    pub closest_peers_update_interval: Duration,
    pub close_tag_name: String,
    pub close_tag_value: u32,
    pub keep_alive_tag_value: u32,

    pub self_query_interval: Duration,
    pub self_query_initial_delay: Duration,
    pub self_query_timeout: Duration,

    pub bucket_refresh_interval: Duration,
    pub bucket_stale_threshold: Duration,

    pub reprovide_interval: Duration,
    /// Local provider records older than this are re-announced.
    pub reprovide_threshold: Duration,

    /// Client-mode nodes query the network but never answer inbound RPCs.
    pub client_mode: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            disjoint_paths: DEFAULT_DISJOINT_PATHS,
            protocol: DEFAULT_PROTOCOL.to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            query_timeout: Some(DEFAULT_QUERY_TIMEOUT),
            provider_validity: DEFAULT_PROVIDER_VALIDITY,
            provider_cleanup_interval: DEFAULT_PROVIDER_CLEANUP_INTERVAL,
            provider_cache_size: DEFAULT_PROVIDER_CACHE_SIZE,
            max_providers_per_find: DEFAULT_K,
            max_record_age: DEFAULT_MAX_RECORD_AGE,
            closest_peers_set_size: DEFAULT_K,
            closest_peers_update_interval: Duration::from_millis(5_000),
            close_tag_name: DEFAULT_CLOSE_TAG_NAME.to_string(),
            close_tag_value: DEFAULT_CLOSE_TAG_VALUE,
            keep_alive_tag_value: DEFAULT_KEEP_ALIVE_TAG_VALUE,
            self_query_interval: Duration::from_secs(5 * 60),
            self_query_initial_delay: Duration::from_secs(1),
            self_query_timeout: Duration::from_secs(5),
            bucket_refresh_interval: Duration::from_secs(10 * 60),
            bucket_stale_threshold: Duration::from_secs(30 * 60),
            reprovide_interval: Duration::from_secs(60 * 60),
            reprovide_threshold: Duration::from_secs(24 * 60 * 60),
            client_mode: false,
        }
    }
}

impl DhtConfig {
    /// Clamp values that would make the engine degenerate (zero-width lookups,
    /// zero-capacity caches).
    pub fn normalized(mut self) -> Self {
        self.k = self.k.max(1);
        self.alpha = self.alpha.max(1);
        self.disjoint_paths = self.disjoint_paths.max(1);
        self.provider_cache_size = self.provider_cache_size.max(1);
        self.closest_peers_set_size = self.closest_peers_set_size.max(1);
        self.max_providers_per_find = self.max_providers_per_find.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DhtConfig::default();
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.disjoint_paths, 1);
        assert_eq!(config.protocol, "/ipfs/kad/1.0.0");
        assert_eq!(config.closest_peers_update_interval, Duration::from_millis(5_000));
        assert_eq!(config.close_tag_name, "kad-close");
        assert_eq!(config.close_tag_value, 50);
        assert_eq!(config.keep_alive_tag_value, 1);
        assert!(!config.client_mode);
    }

    #[test]
    fn normalized_clamps_zero_values() {
        let config = DhtConfig {
            k: 0,
            alpha: 0,
            disjoint_paths: 0,
            provider_cache_size: 0,
            ..DhtConfig::default()
        }
        .normalized();
        assert_eq!(config.k, 1);
        assert_eq!(config.alpha, 1);
        assert_eq!(config.disjoint_paths, 1);
        assert_eq!(config.provider_cache_size, 1);
    }
}
