//! Small shared utilities.

use std::collections::VecDeque;

use ahash::AHashMap;
use std::hash::Hash;

/// Bounded least-recently-used cache for expensive-to-open handles.
///
/// An explicitly owned, injected resource: components that need handle
/// reuse receive one rather than reaching for process-wide state.
#[derive(Debug)]
pub struct HandleCache<K, V> {
    capacity: usize,
    entries: AHashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> HandleCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        HandleCache {
            capacity: capacity.max(1),
            entries: AHashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Fetch a handle, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.touch(key);
            self.entries.get(key)
        } else {
            None
        }
    }

    /// Insert a handle, evicting the least recently used entry when at
    /// capacity. Returns the evicted handle, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                evicted = self.entries.remove(&oldest);
            }
        }
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        } else {
            self.touch(&key);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
    }
}
