//! Per-connection attribute store.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::query::QueryValue;

/// Key-value state query code keeps for the lifetime of one connection.
#[derive(Debug, Default)]
pub struct AttributeStore {
    values: RwLock<HashMap<String, QueryValue>>,
}

impl AttributeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<QueryValue> {
        self.values.read().get(key).cloned()
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: QueryValue) -> Option<QueryValue> {
        self.values.write().insert(key.into(), value)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &str) -> Option<QueryValue> {
        self.values.write().remove(key)
    }

    /// Whether `key` is set.
    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of stored attributes.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}
