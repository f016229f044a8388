//! Bounded LRU+TTL cache shared between the fingerprint fast path and the
//! build-artifact cache.
//!
//! The cache holds two distinct value kinds in the *same* keyspace and the
//! *same* eviction list, per spec: artifact bytes keyed by content
//! fingerprint (`Get`/`Set`), and fingerprint strings keyed by the cheap
//! [`crate::fingerprint::MetadataKey`] (`GetHash`/`SetHash`). An entry used
//! for the latter purpose carries its payload in `hash` with an empty
//! `value`; sizing always accounts for whichever payload is populated.
//!
//! Per the design notes, eviction is an intrusive doubly-linked list with a
//! sentinel head/tail, not a crate like `lru` (which has no notion of TTL
//! or byte-size accounting) — see `DESIGN.md`. To stay free of `unsafe`,
//! the list is built over a `Vec<Node>` arena addressed by index rather
//! than raw pointers: the same algorithmic shape, expressed safely.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const HEAD_SENTINEL: usize = 0;
const TAIL_SENTINEL: usize = 1;

struct Node {
    key: String,
    value: Vec<u8>,
    hash: String,
    created_at: Instant,
    last_access: Instant,
    size: u64,
    prev: usize,
    next: usize,
}

impl Node {
    fn sentinel() -> Self {
        Self {
            key: String::new(),
            value: Vec::new(),
            hash: String::new(),
            created_at: Instant::now(),
            last_access: Instant::now(),
            size: 0,
            prev: HEAD_SENTINEL,
            next: TAIL_SENTINEL,
        }
    }
}

struct Inner {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
    current_size: u64,
}

impl Inner {
    fn new() -> Self {
        let mut nodes = Vec::with_capacity(2);
        nodes.push(Node::sentinel()); // HEAD_SENTINEL
        nodes.push(Node::sentinel()); // TAIL_SENTINEL
        nodes[HEAD_SENTINEL].next = TAIL_SENTINEL;
        nodes[TAIL_SENTINEL].prev = HEAD_SENTINEL;
        Self {
            nodes,
            index: HashMap::new(),
            free: Vec::new(),
            current_size: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn push_front(&mut self, idx: usize) {
        let old_first = self.nodes[HEAD_SENTINEL].next;
        self.nodes[idx].prev = HEAD_SENTINEL;
        self.nodes[idx].next = old_first;
        self.nodes[HEAD_SENTINEL].next = idx;
        self.nodes[old_first].prev = idx;
    }

    fn move_to_front(&mut self, idx: usize) {
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_entry(&mut self, idx: usize) {
        self.unlink(idx);
        let node = &mut self.nodes[idx];
        self.current_size -= node.size;
        node.key.clear();
        node.value = Vec::new();
        node.hash.clear();
        node.size = 0;
        self.free.push(idx);
    }

    fn is_expired(&self, idx: usize, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.nodes[idx].created_at) > ttl
    }

    fn evict_for_space(&mut self, incoming: u64, max_size: u64) {
        while self.current_size + incoming > max_size {
            let lru = self.nodes[TAIL_SENTINEL].prev;
            if lru == HEAD_SENTINEL {
                break; // list empty
            }
            let key = self.nodes[lru].key.clone();
            self.index.remove(&key);
            self.remove_entry(lru);
        }
    }

    fn allocate(&mut self) -> usize {
        if let Some(idx) = self.free.pop() {
            idx
        } else {
            self.nodes.push(Node::sentinel());
            self.nodes.len() - 1
        }
    }
}

/// Bounded, concurrent LRU+TTL store. See module docs.
pub struct LruTtlCache {
    inner: RwLock<Inner>,
    max_size: u64,
    ttl: Duration,
}

/// `(entry_count, current_size_bytes, max_size_bytes)`.
pub struct CacheStats {
    pub count: usize,
    pub current_size: u64,
    pub max_size: u64,
}

impl LruTtlCache {
    pub fn new(max_size: u64, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            max_size,
            ttl,
        }
    }

    /// Look up an artifact by fingerprint. Expired entries are purged and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let idx = *inner.index.get(key)?;
        if inner.is_expired(idx, self.ttl, Instant::now()) {
            inner.index.remove(key);
            inner.remove_entry(idx);
            return None;
        }
        inner.nodes[idx].last_access = Instant::now();
        inner.move_to_front(idx);
        Some(inner.nodes[idx].value.clone())
    }

    /// Store an artifact under its fingerprint, evicting LRU entries from
    /// the tail while the cache would otherwise exceed `max_size`.
    pub fn set(&self, key: &str, value: Vec<u8>) {
        let size = key.len() as u64 + value.len() as u64;
        let mut inner = self.inner.write().expect("cache lock poisoned");
        self.upsert(&mut inner, key, value, String::new(), size);
    }

    /// Look up a cached fingerprint by metadata key.
    pub fn get_hash(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let idx = *inner.index.get(key)?;
        if inner.is_expired(idx, self.ttl, Instant::now()) {
            inner.index.remove(key);
            inner.remove_entry(idx);
            return None;
        }
        inner.nodes[idx].last_access = Instant::now();
        inner.move_to_front(idx);
        Some(inner.nodes[idx].hash.clone())
    }

    /// Store a metadata-key → fingerprint association.
    pub fn set_hash(&self, key: &str, hash: &str) {
        let size = key.len() as u64 + hash.len() as u64;
        let mut inner = self.inner.write().expect("cache lock poisoned");
        self.upsert(&mut inner, key, Vec::new(), hash.to_string(), size);
    }

    fn upsert(&self, inner: &mut Inner, key: &str, value: Vec<u8>, hash: String, size: u64) {
        if let Some(&idx) = inner.index.get(key) {
            let old_size = inner.nodes[idx].size;
            inner.current_size = inner.current_size - old_size + size;
            inner.nodes[idx].value = value;
            inner.nodes[idx].hash = hash;
            inner.nodes[idx].size = size;
            inner.nodes[idx].created_at = Instant::now();
            inner.nodes[idx].last_access = Instant::now();
            inner.move_to_front(idx);
            // currentSize must never go negative: evict if the update grew it past max.
            inner.evict_for_space(0, self.max_size);
            return;
        }
        inner.evict_for_space(size, self.max_size);
        let idx = inner.allocate();
        {
            let node = &mut inner.nodes[idx];
            node.key = key.to_string();
            node.value = value;
            node.hash = hash;
            node.size = size;
            node.created_at = Instant::now();
            node.last_access = Instant::now();
        }
        inner.current_size += size;
        inner.index.insert(key.to_string(), idx);
        inner.push_front(idx);
        // The entry above may itself exceed max_size (nothing was evictable
        // before it existed, e.g. an empty or zero-capacity cache) — now
        // that it's linked in, it can evict itself the same way the
        // existing-key branch above does.
        inner.evict_for_space(0, self.max_size);
    }

    /// Drop every entry and reset byte accounting. Idempotent.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        *inner = Inner::new();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().expect("cache lock poisoned");
        CacheStats {
            count: inner.index.len(),
            current_size: inner.current_size,
            max_size: self.max_size,
        }
    }

    /// Walks the LRU list and asserts `map.len() == list.len()`, bounded by
    /// a cycle guard. Exposed for the testable-property suite in `tests/`.
    #[doc(hidden)]
    pub fn debug_list_len(&self) -> usize {
        let inner = self.inner.read().expect("cache lock poisoned");
        let mut count = 0usize;
        let mut cur = inner.nodes[HEAD_SENTINEL].next;
        let guard = inner.nodes.len() + 1;
        while cur != TAIL_SENTINEL {
            count += 1;
            cur = inner.nodes[cur].next;
            if count > guard {
                panic!("cache LRU list cycle detected");
            }
        }
        count
    }
}
