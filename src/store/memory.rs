use super::DurableStore;
use crate::error::StoreError;
use crate::types::BlockEntry;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::IpAddr;

/// Non-persistent store, used when no cache path is configured.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Option<FxHashMap<IpAddr, BlockEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Some(FxHashMap::default())),
        }
    }

    pub fn with_entries(entries: impl IntoIterator<Item = BlockEntry>) -> Self {
        let map = entries.into_iter().map(|e| (e.address, e)).collect();
        Self {
            entries: Mutex::new(Some(map)),
        }
    }

    pub fn get(&self, address: &IpAddr) -> Option<BlockEntry> {
        self.entries.lock().as_ref()?.get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().is_none()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryStore {
    fn fetch_all(&self) -> Result<Vec<BlockEntry>, StoreError> {
        let guard = self.entries.lock();
        let map = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(map.values().cloned().collect())
    }

    fn upsert(&self, entry: &BlockEntry) -> Result<(), StoreError> {
        let mut guard = self.entries.lock();
        let map = guard.as_mut().ok_or(StoreError::Closed)?;
        map.insert(entry.address, entry.clone());
        Ok(())
    }

    fn delete(&self, address: IpAddr) -> Result<(), StoreError> {
        let mut guard = self.entries.lock();
        let map = guard.as_mut().ok_or(StoreError::Closed)?;
        map.remove(&address);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.entries.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let now = SystemTime::now();

        store.upsert(&BlockEntry::new(ip, "evil.com", now)).unwrap();
        store.upsert(&BlockEntry::new(ip, "www.evil.com", now)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&ip).unwrap().domain, "www.evil.com");

        store.delete(ip).unwrap();
        store.delete(ip).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_rejects_writes_after_close() {
        let store = MemoryStore::new();
        store.close().unwrap();
        assert!(store.is_closed());

        let entry = BlockEntry::new("1.2.3.4".parse().unwrap(), "evil.com", SystemTime::now());
        assert!(matches!(store.upsert(&entry), Err(StoreError::Closed)));
        assert!(matches!(store.fetch_all(), Err(StoreError::Closed)));
    }
}
