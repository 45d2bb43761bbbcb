//! Shared key/value store propagated across devices during a run

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use tandem_common::DataMap;

/// Concurrency-safe shared data. Conflicting writes are last-writer-wins.
#[derive(Debug, Clone, Default)]
pub struct SharedData {
    inner: Arc<RwLock<DataMap>>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    /// Insert every entry of `data`, overwriting existing keys
    pub fn merge(&self, data: &DataMap) {
        let mut inner = self.inner.write();
        for (key, value) in data {
            inner.insert(key.clone(), value.clone());
        }
    }

    /// Discard every entry and start over from `data`
    pub fn replace(&self, data: DataMap) {
        *self.inner.write() = data;
    }

    pub fn snapshot(&self) -> DataMap {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites() {
        let shared = SharedData::new();
        shared.set("a", json!(1));
        shared.set("b", json!(2));

        let mut update = DataMap::new();
        update.insert("b".into(), json!("two"));
        shared.merge(&update);

        assert_eq!(shared.get("a"), Some(json!(1)));
        assert_eq!(shared.get("b"), Some(json!("two")));
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn test_replace_drops_old_entries() {
        let shared = SharedData::new();
        shared.set("stale", json!(1));

        let mut fresh = DataMap::new();
        fresh.insert("seed".into(), json!("x"));
        shared.replace(fresh);

        assert_eq!(shared.get("stale"), None);
        assert_eq!(shared.get("seed"), Some(json!("x")));
    }

    #[test]
    fn test_clones_share_storage() {
        let shared = SharedData::new();
        let other = shared.clone();
        other.set("k", json!(true));
        assert_eq!(shared.get("k"), Some(json!(true)));
    }
}
