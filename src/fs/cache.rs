//! In-memory LRU cache for fetched block content, keyed by stripped
//! block locator (hash+size). Evicts least-recently-accessed entries
//! when the byte budget is exceeded.

use std::collections::HashMap;
use std::time::Instant;

struct CachedBlock {
    data: Vec<u8>,
    accessed_at: Instant,
    size: usize,
}

pub struct BlockCache {
    entries: HashMap<String, CachedBlock>,
    current_size: usize,
    max_size: usize,
}

impl BlockCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            current_size: 0,
            max_size,
        }
    }

    /// Cached block bytes, bumping the entry's access stamp.
    pub fn get(&mut self, key: &str) -> Option<&[u8]> {
        let entry = self.entries.get_mut(key)?;
        entry.accessed_at = Instant::now();
        Some(&entry.data)
    }

    /// Insert block bytes, evicting stale entries until the budget
    /// holds. A block larger than the whole budget still lands and
    /// becomes the next insertion's first victim.
    pub fn set(&mut self, key: &str, data: Vec<u8>) {
        if let Some(old) = self.entries.remove(key) {
            self.current_size = self.current_size.saturating_sub(old.size);
        }
        let size = data.len();
        while self.current_size + size > self.max_size && !self.entries.is_empty() {
            self.evict_lru();
        }
        self.entries.insert(
            key.to_string(),
            CachedBlock {
                data,
                accessed_at: Instant::now(),
                size,
            },
        );
        self.current_size += size;
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.accessed_at)
            .map(|(key, _)| key.clone());
        let Some(key) = oldest else { return };
        if let Some(entry) = self.entries.remove(&key) {
            self.current_size = self.current_size.saturating_sub(entry.size);
        }
    }

    /// Current total size of cached block data in bytes.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Drop all cached blocks. Used on unmount.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }
}
