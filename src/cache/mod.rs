//! # Tile Cache
//!
//! A byte-bounded, strict-LRU cache for attribute tiles. Keys are
//! `(attribute_file_uri, offset)` pairs; attribute files are written once
//! and never rewritten, so a key is globally unique for the lifetime of
//! the process.
//!
//! The cache is advisory: an insert larger than the whole capacity is
//! dropped silently and still reports success, and readers fall back to
//! the VFS on miss. One internal mutex serializes read and insert; reads
//! touch recency, so concurrent readers contend briefly but observe atomic
//! read-then-promote behavior.
//!
//! ## Eviction
//!
//! Strict least-recently-used order, tracked with a monotonically
//! increasing access sequence per entry and a `BTreeMap` from sequence to
//! key. Eviction pops the smallest sequence until the incoming value
//! fits.
//!
//! Invariant: total held bytes never exceed the configured capacity at any
//! observable moment.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

use crate::uri::Uri;

/// Cache key: attribute file URI plus tile offset within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub uri: Uri,
    pub offset: u64,
}

impl TileKey {
    pub fn new(uri: Uri, offset: u64) -> Self {
        Self { uri, offset }
    }
}

struct CacheEntry {
    bytes: Vec<u8>,
    seq: u64,
}

struct CacheInner {
    entries: HashMap<TileKey, CacheEntry>,
    recency: BTreeMap<u64, TileKey>,
    next_seq: u64,
    total_bytes: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &TileKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.seq);
            entry.seq = seq;
            self.recency.insert(seq, key.clone());
        }
    }

    fn remove_lru(&mut self) -> bool {
        let Some((&seq, _)) = self.recency.iter().next() else {
            return false;
        };
        let key = self.recency.remove(&seq).expect("recency entry present");
        let entry = self.entries.remove(&key).expect("cache entry present");
        self.total_bytes -= entry.bytes.len() as u64;
        true
    }

    fn remove(&mut self, key: &TileKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.seq);
            self.total_bytes -= entry.bytes.len() as u64;
        }
    }
}

/// Byte-bounded strict-LRU tile cache.
pub struct TileCache {
    capacity: u64,
    inner: Mutex<CacheInner>,
}

impl TileCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_seq: 0,
                total_bytes: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// On hit, copies the first `nbytes` of the cached value into `buffer`
    /// (resized to fit) and promotes the entry; returns whether the key
    /// was in cache. A cached value shorter than `nbytes` counts as a
    /// miss: the caller asked for more than was ever stored under this
    /// key, which only happens across incompatible callers.
    pub fn read(&self, key: &TileKey, buffer: &mut Vec<u8>, nbytes: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(key) else {
            return false;
        };
        if (entry.bytes.len() as u64) < nbytes {
            return false;
        }
        buffer.resize(nbytes as usize, 0);
        buffer.copy_from_slice(&entry.bytes[..nbytes as usize]);
        inner.touch(key);
        true
    }

    /// Inserts `bytes` under `key`, evicting least-recently-used entries
    /// until the total fits. Values larger than the whole capacity are
    /// dropped silently; the cache is advisory, not a store.
    pub fn insert(&self, key: TileKey, bytes: Vec<u8>) {
        let incoming = bytes.len() as u64;
        if incoming > self.capacity {
            trace!(
                uri = %key.uri,
                offset = key.offset,
                size = incoming,
                "tile exceeds cache capacity, dropped"
            );
            return;
        }

        let mut inner = self.inner.lock();
        inner.remove(&key);
        while inner.total_bytes + incoming > self.capacity {
            if !inner.remove_lru() {
                break;
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += incoming;
        inner.recency.insert(seq, key.clone());
        inner.entries.insert(key, CacheEntry { bytes, seq });
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.total_bytes = 0;
    }
}
