//! In-memory set of blackholed addresses, each aged by its own timer.
//!
//! Every live entry owns one timer task on the tokio runtime. A touch aborts
//! the running timer and arms a new one; each arming gets a fresh generation
//! number so a timer that already woke up but lost the race for the lock
//! cannot expire an entry that was refreshed in the meantime.

use crate::types::BlockEntry;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::AbortHandle;
use tokio::time;

/// Outcome of [`TimedCache::add_or_touch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    /// The address was not cached; it is now live with a fresh timer.
    Inserted,
    /// The address was cached; last-seen moved forward and the timer was rearmed.
    Refreshed,
    /// The supplied last-seen is older than the cached one; nothing changed.
    Stale,
    /// The supplied last-seen is already past the TTL; the expiry callback ran
    /// and nothing was inserted.
    Expired,
}

impl Touch {
    pub fn is_new(self) -> bool {
        self == Touch::Inserted
    }
}

struct Slot {
    entry: BlockEntry,
    generation: u64,
    timer: AbortHandle,
}

#[derive(Default)]
struct Slots {
    map: FxHashMap<IpAddr, Slot>,
    next_generation: u64,
}

impl Slots {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Shared {
    ttl: Duration,
    slots: Mutex<Slots>,
    on_expire: Box<dyn Fn(BlockEntry) + Send + Sync>,
}

impl Shared {
    fn expire(&self, address: IpAddr, generation: u64) {
        let expired = {
            let mut slots = self.slots.lock();
            match slots.map.get(&address) {
                Some(slot) if slot.generation == generation => slots.map.remove(&address),
                _ => None,
            }
        };

        // Lock released: the callback may call back into the cache.
        if let Some(slot) = expired {
            (self.on_expire)(slot.entry);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().map.values() {
            slot.timer.abort();
        }
    }
}

/// Cheap to clone; clones share the same entries.
///
/// Mutating calls spawn timer tasks and must run inside a tokio runtime.
#[derive(Clone)]
pub struct TimedCache {
    shared: Arc<Shared>,
}

impl TimedCache {
    pub fn new<F>(ttl: Duration, on_expire: F) -> Self
    where
        F: Fn(BlockEntry) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                ttl,
                slots: Mutex::new(Slots::default()),
                on_expire: Box::new(on_expire),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    pub fn add_or_touch(&self, entry: BlockEntry) -> Touch {
        let age = entry.age(SystemTime::now());
        let remaining = self.shared.ttl.saturating_sub(age);

        let mut slots = self.shared.slots.lock();

        if let Some(slot) = slots.map.get(&entry.address) {
            if entry.last_seen < slot.entry.last_seen {
                return Touch::Stale;
            }
        }

        if remaining.is_zero() {
            // A live entry for this address is necessarily newer than this one.
            if slots.map.contains_key(&entry.address) {
                return Touch::Stale;
            }
            drop(slots);
            (self.shared.on_expire)(entry);
            return Touch::Expired;
        }

        let generation = slots.next_generation();
        let timer = self.arm(entry.address, generation, remaining);

        match slots.map.get_mut(&entry.address) {
            Some(slot) => {
                slot.timer.abort();
                slot.timer = timer;
                slot.generation = generation;
                slot.entry.last_seen = entry.last_seen;
                slot.entry.domain = entry.domain;
                Touch::Refreshed
            }
            None => {
                slots.map.insert(
                    entry.address,
                    Slot {
                        entry,
                        generation,
                        timer,
                    },
                );
                Touch::Inserted
            }
        }
    }

    fn arm(&self, address: IpAddr, generation: u64, delay: Duration) -> AbortHandle {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(address, generation);
            }
        })
        .abort_handle()
    }

    pub fn exists(&self, address: &IpAddr) -> bool {
        self.shared.slots.lock().map.contains_key(address)
    }

    pub fn get(&self, address: &IpAddr) -> Option<BlockEntry> {
        self.shared
            .slots
            .lock()
            .map
            .get(address)
            .map(|slot| slot.entry.clone())
    }

    /// Drops an entry without running the expiry callback.
    pub fn remove(&self, address: &IpAddr) -> Option<BlockEntry> {
        let slot = self.shared.slots.lock().map.remove(address)?;
        slot.timer.abort();
        Some(slot.entry)
    }

    pub fn count(&self) -> usize {
        self.shared.slots.lock().map.len()
    }

    /// Aborts every pending timer and empties the cache without running the
    /// expiry callback. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut slots = self.shared.slots.lock();
            slots.map.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.timer.abort();
        }
        drained.len()
    }
}
