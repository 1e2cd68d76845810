use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A blocklisted domain seen resolving to an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub address: IpAddr,
    pub domain: String,
    pub seen_at: SystemTime,
}

/// One blackholed address, as held by the cache and mirrored in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub address: IpAddr,
    pub domain: String,
    pub last_seen: SystemTime,
}

impl BlockEntry {
    pub fn new(address: IpAddr, domain: impl Into<String>, last_seen: SystemTime) -> Self {
        Self {
            address,
            domain: domain.into(),
            last_seen,
        }
    }

    /// Time elapsed since `last_seen`, zero if `last_seen` lies in the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or_default()
    }
}

pub fn to_unix_millis(ts: SystemTime) -> i64 {
    ts.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn from_unix_millis(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}
