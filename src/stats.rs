use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::info;

/// Values sampled from other components at dump time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub blackholed: usize,
    pub domains: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub dropped: u64,
    pub observations: u64,
    pub matches: u64,
    pub new_routes: u64,
    pub refreshed: u64,
    pub expired: u64,
    pub connection_errors: u64,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    frames: AtomicU64,
    dropped: AtomicU64,
    observations: AtomicU64,
    matches: AtomicU64,
    new_routes: AtomicU64,
    refreshed: AtomicU64,
    expired: AtomicU64,
    connection_errors: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_observations(&self, n: usize) {
        self.observations.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_matches(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_new_routes(&self) {
        self.new_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refreshed(&self) {
        self.refreshed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_errors(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            observations: self.observations.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            new_routes: self.new_routes.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }

    /// Spawns a task that logs a stats line every `interval`.
    pub fn spawn_reporter<F>(self: Arc<Self>, interval: Duration, gauges: F) -> JoinHandle<()>
    where
        F: Fn() -> Gauges + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.dump_stats(gauges());
            }
        })
    }

    fn dump_stats(&self, gauges: Gauges) {
        let s = self.snapshot();
        info!(
            "STATS DUMP: Frames: {} (dropped {}), Observations: {}, Matches: {} ({:.1}%), NewRoutes: {}, Refreshed: {}, Expired: {}, ConnErrors: {}, Blackholed: {}, Domains: {}",
            s.frames,
            s.dropped,
            s.observations,
            s.matches,
            if s.observations > 0 {
                (s.matches as f64 / s.observations as f64) * 100.0
            } else {
                0.0
            },
            s.new_routes,
            s.refreshed,
            s.expired,
            s.connection_errors,
            gauges.blackholed,
            gauges.domains
        );
    }
}
