use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use super::Storage;
use crate::error::{Error, Result};

type Buckets = HashMap<String, HashMap<String, Value>>;

/// Ephemeral storage. Closing it is a no-op so the same instance can be
/// handed to a fresh downloader to simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<Buckets>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn setup(&self, buckets: &[&str]) -> Result<()> {
        let mut data = self.buckets.write();
        for bucket in buckets {
            data.entry((*bucket).to_string()).or_default();
        }
        Ok(())
    }

    fn put(&self, bucket: &str, key: &str, value: Value) -> Result<()> {
        let mut data = self.buckets.write();
        let entries = data
            .get_mut(bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        let data = self.buckets.read();
        let entries = data
            .get(bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn list(&self, bucket: &str) -> Result<Vec<Value>> {
        let data = self.buckets.read();
        let entries = data
            .get(bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))?;
        Ok(entries.values().cloned().collect())
    }

    fn pop(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        let mut data = self.buckets.write();
        let entries = data
            .get_mut(bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))?;
        Ok(entries.remove(key))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(entries) = self.buckets.write().get_mut(bucket) {
            entries.remove(key);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.buckets.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_put_requires_bucket() {
        let storage = MemoryStorage::new();
        let result = storage.put("missing", "k", json!(1));
        assert!(matches!(result, Err(Error::BucketNotFound(_))));
    }

    #[test]
    fn test_pop_removes_value() {
        let storage = MemoryStorage::new();
        assert_ok!(storage.setup(&["save"]));
        assert_ok!(storage.put("save", "a", json!({"downloaded": 10})));

        let popped = assert_ok!(storage.pop("save", "a"));
        assert_eq!(popped, Some(json!({"downloaded": 10})));
        assert_eq!(storage.get("save", "a").unwrap(), None);
        assert_eq!(storage.pop("save", "a").unwrap(), None);
    }

    #[test]
    fn test_clear_drops_buckets() {
        let storage = MemoryStorage::new();
        storage.setup(&["task"]).unwrap();
        storage.put("task", "a", json!("x")).unwrap();
        assert_ok!(storage.clear());
        assert_err!(storage.list("task"));
    }
}
