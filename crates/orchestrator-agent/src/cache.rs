//! In-memory response cache keyed by (agent id or capability, operation,
//! canonical input hash). Fine-grained per-key locking; never holds a lock
//! across an agent call.

use crate::types::CacheEntry;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A stable hash of (selector, operation, canonical JSON input).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(selector: &str, operation: &str, input: &serde_json::Value) -> Self {
        let canonical = canonical_json(input);
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        selector.hash(&mut hasher);
        operation.hash(&mut hasher);
        canonical.hash(&mut hasher);
        Self(format!("{selector}:{operation}:{:x}", hasher.finish()))
    }
}

/// Serialize with sorted object keys so logically-identical inputs always
/// hash to the same key regardless of field order.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted: Vec<(String, serde_json::Value)> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                serde_json::Value::Object(sorted.into_iter().collect())
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn put(&self, key: CacheKey, payload: serde_json::Value, ttl: Duration) {
        if !self.config.enabled {
            return;
        }
        self.entries.write().unwrap().insert(
            key,
            CacheEntry {
                payload,
                stored_at: std::time::Instant::now(),
                ttl,
            },
        );
    }

    /// Cache reads never revive an expired entry.
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        if !self.config.enabled {
            return None;
        }
        let entries = self.entries.read().unwrap();
        entries.get(key).filter(|e| e.is_fresh()).map(|e| e.payload.clone())
    }
}
