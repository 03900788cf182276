//! Bounded embedding cache with LRU eviction and TTL expiry.
//!
//! Entries live in a fixed-capacity arena (`Vec` of slots) threaded by an
//! intrusive doubly linked list of slot indices, most recent at the head.
//! Lookups go through a `HashMap` from key to slot index. Eviction is
//! explicit: expired entries are dropped on access, and the tail is reused
//! when the arena is full.
//!
//! The cache is a pure optimization. A miss only costs a recomputation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::content_hash;

/// Cache key: hash of the text plus the model version that produced the vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub text_hash: String,
    pub model_version: String,
}

impl CacheKey {
    pub fn new(text: &str, model_version: &str) -> Self {
        Self {
            text_hash: content_hash(text),
            model_version: model_version.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub text_hash: String,
    pub vector: Vec<f32>,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups served from cache, `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    key: CacheKey,
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct EmbeddingCache {
    capacity: usize,
    ttl: Duration,
    index: HashMap<CacheKey, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity.min(4096)),
            free: Vec::new(),
            head: None,
            tail: None,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a vector, refreshing its recency. Expired entries are removed
    /// and reported as a miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<Vec<f32>> {
        let now = Instant::now();
        let Some(&idx) = self.index.get(key) else {
            self.misses += 1;
            return None;
        };

        if self.slots[idx].entry.is_expired(now) {
            self.remove_slot(idx);
            self.misses += 1;
            return None;
        }

        self.unlink(idx);
        self.push_front(idx);
        self.hits += 1;
        Some(self.slots[idx].entry.vector.clone())
    }

    /// Insert or refresh a vector. Evicts the least recently used entry
    /// when the arena is full.
    pub fn insert(&mut self, key: CacheKey, vector: Vec<f32>) {
        let entry = CacheEntry {
            text_hash: key.text_hash.clone(),
            vector,
            created_at: Instant::now(),
            ttl: self.ttl,
        };

        if let Some(&idx) = self.index.get(&key) {
            self.slots[idx].entry = entry;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        if self.index.len() >= self.capacity {
            if let Some(tail) = self.tail {
                self.remove_slot(tail);
                self.evictions += 1;
            }
        }

        let slot = Slot {
            key: key.clone(),
            entry,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                i
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    fn remove_slot(&mut self, idx: usize) {
        self.unlink(idx);
        let key = self.slots[idx].key.clone();
        self.index.remove(&key);
        self.slots[idx].entry.vector = Vec::new();
        self.free.push(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None if self.head == Some(idx) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None if self.tail == Some(idx) => self.tail = prev,
            None => {}
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].next = self.head;
        self.slots[idx].prev = None;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}
