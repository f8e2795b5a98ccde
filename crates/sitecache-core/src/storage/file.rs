use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::Storage;
use crate::error::StorageError;

/// Suffix marker for in-progress writes; never part of a digest file name
const TEMP_MARKER: &str = ".tmp";

/// Length of a file name: hex SHA-256 of the key
const NAME_LEN: usize = 64;

/// Directory-backed store, one file per key.
///
/// File names are the hex SHA-256 of the key, so they stay short whatever the key
/// length. Each file starts with the key itself (u32 little-endian length, then the
/// UTF-8 bytes), followed by the value. Writes go to a temp file first and are moved
/// into place, so a reader never observes a partially written value.
pub struct FileStorage {
    root: PathBuf,
    temp_counter: AtomicU64,
}

fn file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn is_record_name(name: &str) -> bool {
    name.len() == NAME_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn encode_record(key: &str, value: &[u8]) -> Result<Vec<u8>, StorageError> {
    let len = u32::try_from(key.len()).map_err(|_| StorageError::InvalidKey(key.to_string()))?;
    let mut record = Vec::with_capacity(4 + key.len() + value.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(value);
    Ok(record)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        file: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Split a record into its key and value
fn decode_record(path: &Path, mut record: Vec<u8>) -> Result<(String, Vec<u8>), StorageError> {
    if record.len() < 4 {
        return Err(corrupt(path, "missing key header"));
    }
    let len = u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
    let end = 4usize
        .checked_add(len)
        .filter(|end| *end <= record.len())
        .ok_or_else(|| corrupt(path, "key header longer than file"))?;
    let key = String::from_utf8(record[4..end].to_vec()).map_err(|_| corrupt(path, "key is not UTF-8"))?;
    let value = record.split_off(end);
    Ok((key, value))
}

/// Read only the key header of a record file
async fn read_key(path: &Path) -> Result<String, StorageError> {
    let mut file = fs::File::open(path).await?;
    let mut len = [0u8; 4];
    file.read_exact(&mut len)
        .await
        .map_err(|_| corrupt(path, "missing key header"))?;
    let mut key = vec![0u8; u32::from_le_bytes(len) as usize];
    file.read_exact(&mut key)
        .await
        .map_err(|_| corrupt(path, "key header longer than file"))?;
    String::from_utf8(key).map_err(|_| corrupt(path, "key is not UTF-8"))
}

impl FileStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let storage = Self {
            root,
            temp_counter: AtomicU64::new(0),
        };
        storage.remove_stale_temp_files().await?;
        Ok(storage)
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(file_name(key)))
    }

    /// Write the full record for `key` to a fresh temp file
    async fn write_temp(&self, key: &str, value: &[u8]) -> Result<PathBuf, StorageError> {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .root
            .join(format!("{}{}{}", file_name(key), TEMP_MARKER, n));
        fs::write(&temp, encode_record(key, value)?).await?;
        Ok(temp)
    }

    /// Leftovers from writes interrupted by a crash
    async fn remove_stale_temp_files(&self) -> Result<(), StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().contains(TEMP_MARKER) {
                debug!(file = ?name, "Removing stale temp file");
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.key_path(key)?;
        let record = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (stored_key, value) = decode_record(&path, record)?;
        if stored_key != key {
            return Err(corrupt(&path, format!("holds key {:?}, expected {:?}", stored_key, key)));
        }
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        let temp = self.write_temp(key, &value).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn put_new(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError> {
        let path = self.key_path(key)?;
        let temp = self.write_temp(key, &value).await?;
        // Linking fails when the target exists, also against other processes
        let linked = fs::hard_link(&temp, &path).await;
        let _ = fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !is_record_name(&name) {
                debug!(file = %name, "Ignoring foreign file in storage directory");
                continue;
            }
            let key = match read_key(&entry.path()).await {
                Ok(key) => key,
                // Deleted between listing and reading
                Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(file = %name, error = %e, "Skipping unreadable storage file");
                    continue;
                }
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
