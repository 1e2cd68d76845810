//! Persistence for blackhole entries. The cache is authoritative while the
//! process runs; the store only has to be good enough to rebuild it on the
//! next start.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::BlockEntry;
use std::net::IpAddr;

pub trait DurableStore: Send + Sync {
    /// All persisted entries, in no particular order.
    fn fetch_all(&self) -> Result<Vec<BlockEntry>, StoreError>;

    /// Inserts or overwrites the entry for `entry.address`.
    fn upsert(&self, entry: &BlockEntry) -> Result<(), StoreError>;

    /// Deletes the entry for `address`. Deleting a missing entry is not an error.
    fn delete(&self, address: IpAddr) -> Result<(), StoreError>;

    /// Flushes and releases the store. Later writes fail with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}
