//! Durable key/value storage port.
//!
//! Precached assets, the active-generation pointer and the replay queue all live in one
//! flat key space behind the [`Storage`] trait:
//!
//! - `precache/<tag>/body/<path>#<fingerprint>`: asset bytes
//! - `precache/<tag>/meta/<path>#<fingerprint>`: asset metadata (JSON)
//! - `worker/active-generation`: tag of the active generation
//! - `queue/<name>/<seq>`: queued request (JSON)
//!
//! Two implementations are provided: [`MemoryStorage`] for tests and embedding, and
//! [`FileStorage`] for the CLI host.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value as a whole
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Store `value` under `key` only if the key is free. Returns whether it was stored;
    /// an existing value is never replaced.
    async fn put_new(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys starting with `prefix`, in ascending order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Load and deserialize a JSON record
pub async fn load_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON record
pub async fn save_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, bytes).await
}

/// Delete every key under `prefix`, returning how many were removed
pub async fn delete_prefix(storage: &dyn Storage, prefix: &str) -> Result<usize, StorageError> {
    let keys = storage.list_keys(prefix).await?;
    let mut removed = 0;
    for key in keys {
        if storage.delete(&key).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let storage = MemoryStorage::new();
        let record = Record {
            name: "tiles".into(),
            count: 3,
        };
        save_json(&storage, "a/record", &record).await.unwrap();

        let loaded: Option<Record> = load_json(&storage, "a/record").await.unwrap();
        assert_eq!(loaded, Some(record));

        let missing: Option<Record> = load_json(&storage, "a/other").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let storage = MemoryStorage::new();
        storage.put("precache/a/1", vec![1]).await.unwrap();
        storage.put("precache/a/2", vec![2]).await.unwrap();
        storage.put("precache/b/1", vec![3]).await.unwrap();

        assert_eq!(delete_prefix(&storage, "precache/a/").await.unwrap(), 2);
        assert_eq!(
            storage.list_keys("precache/").await.unwrap(),
            vec!["precache/b/1".to_string()]
        );
    }
}
