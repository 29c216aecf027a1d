use std::net::SocketAddr;
use std::time::Duration;

use crate::common::Id;
use crate::db::DatabaseSettings;

/// Default replication factor, also the bucket size.
pub const DEFAULT_K: usize = crate::routing::MAX_BUCKET_SIZE_K;
/// Default number of parallel requests of a lookup.
pub const DEFAULT_ALPHA: usize = 3;
/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Default cap of failed pings while looking for a bootstrap host.
pub const DEFAULT_MAX_BOOTSTRAP_FAILURES: usize = 5;
/// Default number of worker threads.
pub const DEFAULT_EXECUTOR_THREADS: usize = 8;
/// Default number of responses kept for retransmitted requests.
pub const DEFAULT_RESPONSE_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone)]
/// Dht Configurations
///
/// Every option is fixed once the node is built.
pub struct Config {
    /// Bootstrap nodes
    ///
    /// Defaults to none, where only the routing table is used.
    pub bootstrap: Vec<SocketAddr>,
    /// Address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0:0`
    pub bind_address: SocketAddr,
    /// Explicit node Id.
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// Whether this node can not receive unsolicited traffic.
    ///
    /// Firewalled nodes are never added to other nodes' routing tables.
    ///
    /// Defaults to `false`
    pub firewalled: bool,
    /// Replication factor, the number of closest nodes lookups and stores target.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// Number of parallel requests during a lookup.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take to give up on dead nodes.
    /// The shorter, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Number of failed pings after which bootstrapping gives up.
    ///
    /// Defaults to [DEFAULT_MAX_BOOTSTRAP_FAILURES]
    pub max_bootstrap_failures: usize,
    /// Refresh every bucket after bootstrapping, not just the stale ones.
    ///
    /// Defaults to `false`
    pub refresh_all_buckets: bool,
    /// Worker threads running requests.
    ///
    /// Defaults to [DEFAULT_EXECUTOR_THREADS]
    pub executor_threads: usize,
    /// Responses remembered to answer retransmitted requests.
    ///
    /// Defaults to [DEFAULT_RESPONSE_CACHE_SIZE]
    pub response_cache_size: usize,
    /// Value store limits.
    pub database: DatabaseSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            id: None,
            firewalled: false,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_bootstrap_failures: DEFAULT_MAX_BOOTSTRAP_FAILURES,
            refresh_all_buckets: false,
            executor_threads: DEFAULT_EXECUTOR_THREADS,
            response_cache_size: DEFAULT_RESPONSE_CACHE_SIZE,
            database: DatabaseSettings::default(),
        }
    }
}
