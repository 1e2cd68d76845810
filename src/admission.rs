//! Turns matching observations into cache, store and route decisions.
//!
//! An address gets at most one route emission per TTL window: the first
//! sighting inserts it and emits a route, later sightings only refresh its
//! last-seen time in the cache and the store.

use crate::blocklist::DomainMatcher;
use crate::cache::{TimedCache, Touch};
use crate::dnstap::ObservationHandler;
use crate::error::{IngestError, StoreError};
use crate::routes::RouteSink;
use crate::stats::StatsCollector;
use crate::store::DurableStore;
use crate::types::{BlockEntry, Observation};
use std::net::IpAddr;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Outcome of the startup pass over the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Aged past the TTL while the process was down.
    pub expired: usize,
    /// No longer on the blocklist.
    pub vanished: usize,
}

pub struct RecordAdmission {
    cache: TimedCache,
    matcher: Arc<DomainMatcher>,
    store: Arc<dyn DurableStore>,
    routes: Arc<dyn RouteSink>,
    stats: Arc<StatsCollector>,
    /// True once closed. Store writers hold a read guard for as long as they
    /// touch the store, so `close` returns only after the last of them.
    closed: Arc<RwLock<bool>>,
}

impl RecordAdmission {
    pub fn new(
        ttl: Duration,
        matcher: Arc<DomainMatcher>,
        store: Arc<dyn DurableStore>,
        routes: Arc<dyn RouteSink>,
        stats: Arc<StatsCollector>,
    ) -> Arc<Self> {
        let closed = Arc::new(RwLock::new(false));
        let cache = {
            let store = store.clone();
            let routes = routes.clone();
            let stats = stats.clone();
            let closed = closed.clone();
            TimedCache::new(ttl, move |entry: BlockEntry| {
                // Recursive: `admit` may already hold a read guard when a
                // pre-expired touch runs this callback inline.
                let closed = closed.read_recursive();
                if *closed {
                    return;
                }
                info!("{} ({}) expired", entry.address, entry.domain);
                stats.inc_expired();
                if let Err(e) = store.delete(entry.address) {
                    error!("Unable to delete {} from store: {}", entry.address, e);
                }
                routes.entry_expired(&entry);
            })
        };

        Arc::new(Self {
            cache,
            matcher,
            store,
            routes,
            stats,
            closed,
        })
    }

    pub fn cache(&self) -> &TimedCache {
        &self.cache
    }

    /// Records that `domain` resolved to `address` at `now`. Returns true if
    /// the address was not blackholed yet and a route was requested.
    pub fn admit(&self, address: IpAddr, domain: &str, now: SystemTime) -> bool {
        let closed = self.closed.read();
        if *closed {
            debug!("Ignoring {} ({}) after shutdown", address, domain);
            return false;
        }

        let entry = BlockEntry::new(address, domain, now);
        let touch = self.cache.add_or_touch(entry.clone());

        match touch {
            Touch::Inserted | Touch::Refreshed => self.mirror(&entry),
            Touch::Stale | Touch::Expired => {
                debug!("{} ({}) not admitted: {:?}", address, domain, touch);
            }
        }

        if !touch.is_new() {
            if touch == Touch::Refreshed {
                self.stats.inc_refreshed();
            }
            return false;
        }

        info!("{}: {}", domain, address);
        self.stats.inc_new_routes();
        self.routes.route_needed(address);
        true
    }

    fn mirror(&self, entry: &BlockEntry) {
        if let Err(e) = self.store.upsert(entry) {
            error!(
                "Unable to add ({}, {}) to store: {}",
                entry.address, entry.domain, e
            );
        }
    }

    /// Rebuilds the cache from the store before any traffic is accepted.
    /// Entries past the TTL or no longer blocklisted are deleted; the rest
    /// keep their original last-seen time and get their route re-emitted.
    pub fn restore(&self, now: SystemTime) -> Result<RestoreReport, StoreError> {
        let mut report = RestoreReport::default();
        let ttl = self.cache.ttl();

        for entry in self.store.fetch_all()? {
            if entry.age(now) >= ttl {
                if self.forget(&entry) {
                    report.expired += 1;
                }
                continue;
            }

            if !self.matcher.has(&entry.domain) {
                if self.forget(&entry) {
                    report.vanished += 1;
                }
                continue;
            }

            let address = entry.address;
            match self.cache.add_or_touch(entry) {
                Touch::Inserted => {
                    self.routes.route_needed(address);
                    report.restored += 1;
                }
                // Crossed the TTL between the age check and the insert; the
                // expiry callback already removed it from the store.
                Touch::Expired => report.expired += 1,
                touch => warn!("Duplicate stored entry for {}: {:?}", address, touch),
            }
        }

        Ok(report)
    }

    fn forget(&self, entry: &BlockEntry) -> bool {
        match self.store.delete(entry.address) {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to delete {} from store: {}", entry.address, e);
                false
            }
        }
    }

    /// Stops admitting observations and cancels all pending expiry timers.
    /// Waits for in-flight admissions and expiry callbacks, so no store
    /// writes are issued after this returns.
    pub fn close(&self) {
        *self.closed.write() = true;
        let dropped = self.cache.clear();
        debug!("Admission closed, {} cached entries released", dropped);
    }
}

impl ObservationHandler for RecordAdmission {
    fn observe(&self, observation: Observation) {
        self.admit(
            observation.address,
            &observation.domain,
            observation.seen_at,
        );
    }

    fn ingest_error(&self, peer: &str, error: &IngestError) {
        warn!("dnstap error from {}: {}", peer, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct RecordingRoutes {
        routes: Mutex<Vec<IpAddr>>,
        expired: Mutex<Vec<BlockEntry>>,
    }

    impl RouteSink for RecordingRoutes {
        fn route_needed(&self, address: IpAddr) {
            self.routes.lock().push(address);
        }

        fn entry_expired(&self, entry: &BlockEntry) {
            self.expired.lock().push(entry.clone());
        }
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);

    struct Harness {
        admission: Arc<RecordAdmission>,
        store: Arc<MemoryStore>,
        routes: Arc<RecordingRoutes>,
    }

    fn harness(ttl: Duration, blocklist: &str, stored: Vec<BlockEntry>) -> Harness {
        let matcher = Arc::new(DomainMatcher::new());
        matcher.load_reader(blocklist.as_bytes()).unwrap();
        let store = Arc::new(MemoryStore::with_entries(stored));
        let routes = Arc::new(RecordingRoutes::default());
        let admission = RecordAdmission::new(
            ttl,
            matcher,
            store.clone(),
            routes.clone(),
            Arc::new(StatsCollector::new()),
        );
        Harness {
            admission,
            store,
            routes,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_emits_route_once() {
        let h = harness(DAY, "evil.com\n", vec![]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let now = SystemTime::now();

        assert!(h.admission.admit(ip, "www.evil.com", now));
        assert_eq!(*h.routes.routes.lock(), vec![ip]);
        assert_eq!(h.admission.cache().count(), 1);
        assert_eq!(h.store.len(), 1);

        let later = now + Duration::from_secs(60);
        assert!(!h.admission.admit(ip, "www.evil.com", later));
        assert_eq!(h.routes.routes.lock().len(), 1);
        assert_eq!(h.store.get(&ip).unwrap().last_seen, later);
        assert_eq!(h.admission.cache().get(&ip).unwrap().last_seen, later);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_sighting_does_not_regress_store() {
        let h = harness(DAY, "evil.com\n", vec![]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let now = SystemTime::now();

        h.admission.admit(ip, "evil.com", now);
        h.admission.admit(ip, "evil.com", now - Duration::from_secs(30));
        assert_eq!(h.store.get(&ip).unwrap().last_seen, now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_deletes_from_store() {
        let ttl = Duration::from_secs(60);
        let h = harness(ttl, "evil.com\n", vec![]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        h.admission.admit(ip, "evil.com", SystemTime::now());
        tokio::time::sleep(ttl + Duration::from_secs(1)).await;

        assert!(!h.admission.cache().exists(&ip));
        assert!(h.store.get(&ip).is_none());
        assert_eq!(h.routes.expired.lock().len(), 1);
        assert_eq!(h.routes.routes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_reconciles_store() {
        let now = SystemTime::now();
        let fresh: IpAddr = "1.1.1.1".parse().unwrap();
        let stale: IpAddr = "2.2.2.2".parse().unwrap();
        let vanished: IpAddr = "3.3.3.3".parse().unwrap();
        let fresh_seen = now - Duration::from_secs(3600);

        let h = harness(
            DAY,
            "evil.com\n",
            vec![
                BlockEntry::new(fresh, "www.evil.com", fresh_seen),
                BlockEntry::new(stale, "evil.com", now - Duration::from_secs(25 * 3600)),
                BlockEntry::new(vanished, "formerly-bad.org", now - Duration::from_secs(60)),
            ],
        );

        let report = h.admission.restore(now).unwrap();
        assert_eq!(
            report,
            RestoreReport {
                restored: 1,
                expired: 1,
                vanished: 1
            }
        );

        assert_eq!(*h.routes.routes.lock(), vec![fresh]);
        assert!(h.admission.cache().exists(&fresh));
        assert!(!h.admission.cache().exists(&stale));
        assert!(!h.admission.cache().exists(&vanished));
        // Original last-seen is preserved.
        assert_eq!(h.admission.cache().get(&fresh).unwrap().last_seen, fresh_seen);
        assert_eq!(h.store.len(), 1);
        assert!(h.store.get(&fresh).is_some());
        // Removed entries never went through the expiry callback.
        assert!(h.routes.expired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_admission_ignores_observations() {
        let h = harness(Duration::from_secs(60), "evil.com\n", vec![]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        h.admission.admit(ip, "evil.com", SystemTime::now());

        h.admission.close();
        assert_eq!(h.admission.cache().count(), 0);
        assert!(!h.admission.admit("5.6.7.8".parse().unwrap(), "evil.com", SystemTime::now()));

        // Timers were cancelled: the store keeps the entry for the next start.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.store.get(&ip).is_some());
        assert!(h.routes.expired.lock().is_empty());
    }

    struct SlowExpiry {
        started: Mutex<Option<mpsc::Sender<()>>>,
        finished: AtomicBool,
    }

    impl RouteSink for SlowExpiry {
        fn route_needed(&self, _address: IpAddr) {}

        fn entry_expired(&self, _entry: &BlockEntry) {
            if let Some(started) = self.started.lock().take() {
                let _ = started.send(());
            }
            std::thread::sleep(Duration::from_millis(200));
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_waits_for_running_expiry() {
        let (started_tx, started_rx) = mpsc::channel();
        let routes = Arc::new(SlowExpiry {
            started: Mutex::new(Some(started_tx)),
            finished: AtomicBool::new(false),
        });
        let matcher = Arc::new(DomainMatcher::new());
        matcher.load_reader("evil.com\n".as_bytes()).unwrap();
        let store = Arc::new(MemoryStore::new());
        let admission = RecordAdmission::new(
            Duration::from_millis(20),
            matcher,
            store.clone(),
            routes.clone(),
            Arc::new(StatsCollector::new()),
        );

        admission.admit("1.2.3.4".parse().unwrap(), "evil.com", SystemTime::now());
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // The callback is mid-flight; close must not return before it ends.
        admission.close();
        assert!(routes.finished.load(Ordering::SeqCst));
        store.close().unwrap();
    }
}
