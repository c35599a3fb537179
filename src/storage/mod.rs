//! Bucketed key/value persistence used by the downloader.
//!
//! Values are opaque JSON documents; the downloader decides what goes in
//! them. Two backends ship with the crate: [`MemoryStorage`] for embedding
//! and tests, and [`FileStorage`] for durable single-file persistence.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

pub trait Storage: Send + Sync {
    /// Create the given buckets if they do not exist yet.
    fn setup(&self, buckets: &[&str]) -> Result<()>;

    fn put(&self, bucket: &str, key: &str, value: Value) -> Result<()>;

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>>;

    /// Every value stored in a bucket, in no particular order.
    fn list(&self, bucket: &str) -> Result<Vec<Value>>;

    /// Read and delete a value in one step.
    fn pop(&self, bucket: &str, key: &str) -> Result<Option<Value>>;

    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Drop every bucket and all of their contents.
    fn clear(&self) -> Result<()>;
}

/// Typed helpers on top of the raw JSON contract.
pub trait StorageExt: Storage {
    fn put_json<T: Serialize + ?Sized>(&self, bucket: &str, key: &str, value: &T) -> Result<()> {
        self.put(bucket, key, serde_json::to_value(value)?)
    }

    fn get_json<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>> {
        match self.get(bucket, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
