//! In-memory hot tier.
//!
//! Bounded by entry count. On overflow the single least-recently-accessed
//! entry is evicted (linear scan, fine at the configured sizes). Access order
//! is tracked with a logical clock rather than wall time so ties cannot occur.

use super::CacheEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    last_access: u64,
}

/// Thread-safe LRU cache of recently used entries.
#[derive(Debug)]
pub struct HotTier {
    slots: DashMap<String, Slot>,
    capacity: usize,
    clock: AtomicU64,
    /// Serializes evict-then-insert so the bound holds under concurrency
    insert_lock: Mutex<()>,
}

impl HotTier {
    /// Create a hot tier holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            insert_lock: Mutex::new(()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up an entry and mark it as most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let mut slot = self.slots.get_mut(key)?;
        slot.last_access = self.tick();
        Some(Arc::clone(&slot.entry))
    }

    /// Look up an entry without touching its access time.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.slots.get(key).map(|slot| Arc::clone(&slot.entry))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Insert or replace an entry, evicting the least recently used one when
    /// a new key would exceed capacity. Returns the evicted key, if any.
    pub fn insert(&self, entry: Arc<CacheEntry>) -> Option<String> {
        let _lock = self.insert_lock.lock().unwrap_or_else(|p| p.into_inner());
        let key = entry.key.clone();

        let evicted = if !self.slots.contains_key(&key) && self.slots.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };

        let last_access = self.tick();
        self.slots.insert(key, Slot { entry, last_access });
        evicted
    }

    fn evict_lru(&self) -> Option<String> {
        let victim = self
            .slots
            .iter()
            .min_by_key(|slot| slot.last_access)
            .map(|slot| slot.key().clone())?;
        self.slots.remove(&victim);
        debug!("Hot tier evicted {}", victim);
        Some(victim)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.slots.remove(key).map(|(_, slot)| slot.entry)
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
