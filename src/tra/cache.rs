//! Affinity results shared by all workers.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;

#[derive(Debug, Default)]
struct TypeCache {
    values: HashMap<String, String>,
    order: VecDeque<String>,
}

/// Affinity type -> key -> host, bounded per type with FIFO eviction.
#[derive(Debug)]
pub struct TraCache {
    max_items: usize,
    types: DashMap<String, TypeCache>,
}

impl TraCache {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            types: DashMap::new(),
        }
    }

    pub fn get(&self, affinity_type: &str, key: &str) -> Option<String> {
        self.types
            .get(affinity_type)
            .and_then(|cache| cache.values.get(key).cloned())
    }

    pub fn insert(&self, affinity_type: &str, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let mut cache = self.types.entry(affinity_type.to_string()).or_default();
        if cache.values.insert(key.clone(), value.into()).is_none() {
            cache.order.push_back(key);
        }
        while cache.values.len() > self.max_items {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.values.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drop one entry, returning the host it mapped to.
    pub fn remove(&self, affinity_type: &str, key: &str) -> Option<String> {
        let mut cache = self.types.get_mut(affinity_type)?;
        let removed = cache.values.remove(key)?;
        cache.order.retain(|queued| queued != key);
        Some(removed)
    }

    pub fn len(&self, affinity_type: &str) -> usize {
        self.types.get(affinity_type).map_or(0, |cache| cache.values.len())
    }
}
