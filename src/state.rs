//! Per-dispatch key/value scratchpad passed into and out of agents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key/value data plus string metadata flowing through one dispatch.
///
/// A `State` is owned by whoever is currently working on it. Parallel
/// agents receive independent clones, so no interior locking is needed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    data: HashMap<String, Value>,
    #[serde(default)]
    meta: HashMap<String, String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded with an event payload.
    pub fn from_data(data: HashMap<String, Value>) -> Self {
        Self {
            data,
            meta: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    /// Data keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Metadata keys in sorted order.
    pub fn meta_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.meta.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.meta
    }

    /// Overwrite this state's data and metadata with everything in `source`.
    pub fn merge(&mut self, source: &State) {
        for (k, v) in &source.data {
            self.data.insert(k.clone(), v.clone());
        }
        for (k, v) in &source.meta {
            self.meta.insert(k.clone(), v.clone());
        }
    }

    /// Overwrite data keys with the given map, leaving metadata alone.
    pub fn merge_data(&mut self, data: &HashMap<String, Value>) {
        for (k, v) in data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Overwrite metadata keys with the given map.
    pub fn merge_meta(&mut self, meta: &HashMap<String, String>) {
        for (k, v) in meta {
            self.meta.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.meta.is_empty()
    }
}
