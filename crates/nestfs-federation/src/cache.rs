//! Selective entry cache.
//!
//! Reads made with the `CACHE` input option buffer the whole entry here,
//! keyed by entry name and stamped with the entry's modification stamp at
//! the time of the read. A buffered copy stays valid after its container is
//! closed or replaced; a lookup only hits while the stamp still matches the
//! mounted model.
//!
//! The cache is mutated on a missed read and on a synchronization with
//! `CLEAR_CACHE`, nowhere else.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Cache counters of one mount point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that had to read the container
    pub misses: u64,
    /// Buffered entries
    pub entries: usize,
}

#[derive(Debug)]
struct CachedEntry {
    stamp: u64,
    data: Arc<[u8]>,
}

/// Per-controller buffer of entry contents.
#[derive(Debug, Default)]
pub struct SelectiveCache {
    entries: HashMap<String, CachedEntry>,
    hits: u64,
    misses: u64,
}

impl SelectiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry buffered at `stamp`.
    pub fn lookup(&mut self, name: &str, stamp: u64) -> Option<Arc<[u8]>> {
        match self.entries.get(name) {
            Some(cached) if cached.stamp == stamp => {
                self.hits += 1;
                Some(cached.data.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Buffer an entry read at `stamp`, replacing any older copy.
    pub fn insert(&mut self, name: &str, stamp: u64, data: Arc<[u8]>) {
        self.entries
            .insert(String::from(name), CachedEntry { stamp, data });
    }

    /// Drop every buffered entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}
