use std::time::Duration;

use crate::common::MAX_BUCKET_SIZE_K;

/// Degree of parallelism of lookups and stores.
pub const ALPHA: usize = 3;
/// How long a bucket may go without a lookup before it gets refreshed.
pub const T_REFRESH: Duration = Duration::from_secs(60 * 60);
/// How old an item published by another node gets before it is replicated.
pub const T_REPLICATE: Duration = Duration::from_secs(60 * 60);
/// How old an item published by this node gets before it is republished.
pub const T_REPUBLISH: Duration = Duration::from_secs(24 * 60 * 60);
/// How old an item gets before it is deleted.
pub const T_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60 + 5);
/// Default request timeout before abandoning a call to a non-responding node.
pub const T_RESPONSETIMEOUT: Duration = Duration::from_secs(10);
/// How long a successful liveness probe spares a bucket head from being probed again.
pub const PING_THROTTLE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
/// Protocol configurations
pub struct Config {
    /// Number of contacts queried in parallel per lookup round,
    /// and number of concurrent STORE calls.
    ///
    /// Defaults to [ALPHA]
    pub alpha: usize,
    /// Bucket size, and number of contacts returned by lookups.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Defaults to [T_REFRESH]
    pub refresh_interval: Duration,
    /// Interval of the replicate then expire pass, and the age at which
    /// items published by other nodes are replicated.
    ///
    /// Defaults to [T_REPLICATE]
    pub replicate_interval: Duration,
    /// Age at which items published by this node are republished.
    ///
    /// Defaults to [T_REPUBLISH]
    pub republish_interval: Duration,
    /// Age at which items are deleted regardless of their publisher.
    ///
    /// Defaults to [T_EXPIRE]
    pub expire_after: Duration,
    /// Request timeout duration, also the period of the timeout sweep.
    ///
    /// The shorter this duration is, the sooner dead contacts are evicted, but
    /// the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [T_RESPONSETIMEOUT]
    pub response_timeout: Duration,
    /// Defaults to [PING_THROTTLE]
    pub ping_throttle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpha: ALPHA,
            k: MAX_BUCKET_SIZE_K,
            refresh_interval: T_REFRESH,
            replicate_interval: T_REPLICATE,
            republish_interval: T_REPUBLISH,
            expire_after: T_EXPIRE,
            response_timeout: T_RESPONSETIMEOUT,
            ping_throttle: PING_THROTTLE,
        }
    }
}
