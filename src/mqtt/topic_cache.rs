//! Last-seen value per topic
//!
//! Backs publish and receive deduplication in the session worker. The worker is
//! the only owner, so no locking happens here.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TopicValueCache {
    values: HashMap<String, String>,
}

impl TopicValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` for `topic` and returns `true` if it differs from the cached one.
    ///
    /// Topics and values are compared case-insensitively. An unchanged value leaves
    /// the cache untouched and returns `false`.
    pub fn update(&mut self, topic: &str, value: &str) -> bool {
        let key = topic.to_lowercase();
        match self.values.get(&key) {
            Some(current) if current.to_lowercase() == value.to_lowercase() => false,
            _ => {
                self.values.insert(key, value.to_string());
                true
            }
        }
    }

    /// Drops the cached value of a single topic
    pub fn forget(&mut self, topic: &str) {
        self.values.remove(&topic.to_lowercase());
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
