use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::warn;

use crate::storage::{StorageError, content_hash};

/// A durable record that knows its own identity within a collection.
pub trait Record: Serialize + DeserializeOwned {
    fn id(&self) -> &str;
}

/// Structured record store: get-all/put/delete-by-id over a named
/// collection, one JSON file per record. An optional byte quota bounds the
/// serialized size of the whole collection on `replace_all`; callers that
/// hit it are expected to retry with fewer records.
#[derive(Clone, Debug)]
pub struct RecordStore<T> {
    dir: PathBuf,
    quota_bytes: Option<usize>,
    _record: PhantomData<T>,
}

impl<T: Record> RecordStore<T> {
    pub fn new(base_dir: &std::path::Path, collection: &str, quota_bytes: Option<usize>) -> Self {
        Self {
            dir: base_dir.join(collection),
            quota_bytes,
            _record: PhantomData,
        }
    }

    /// Every readable record in the collection, in unspecified order.
    /// Unreadable or unparsable record files are skipped, not fatal.
    pub async fn get_all(&self) -> Result<Vec<T>, StorageError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %path.display(), "skipping unreadable record: {err}");
                    continue;
                }
            };
            match serde_json::from_slice::<T>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), "skipping corrupt record: {err}");
                }
            }
        }
        Ok(records)
    }

    /// Insert or replace one record, keyed by its id.
    pub async fn put(&self, record: &T) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        let payload = serde_json::to_vec_pretty(record)?;
        fs::write(self.dir.join(Self::file_name(record.id())), payload).await?;
        Ok(())
    }

    /// Delete by id; deleting a nonexistent record is a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.dir.join(Self::file_name(id))).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the whole collection with `records`. When a quota is
    /// configured and the serialized records would exceed it, nothing is
    /// written and `QuotaExceeded` is returned.
    pub async fn replace_all(&self, records: &[T]) -> Result<(), StorageError> {
        let mut files = Vec::with_capacity(records.len());
        let mut needed = 0;
        for record in records {
            let payload = serde_json::to_vec_pretty(record)?;
            needed += payload.len();
            files.push((Self::file_name(record.id()), payload));
        }
        if let Some(quota) = self.quota_bytes {
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }

        fs::create_dir_all(&self.dir).await?;
        let keep: HashSet<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let stale = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| !keep.contains(name))
                .unwrap_or(false);
            if stale {
                let _ = fs::remove_file(&path).await;
            }
        }
        for (name, payload) in files {
            fs::write(self.dir.join(name), payload).await?;
        }
        Ok(())
    }

    fn file_name(id: &str) -> String {
        format!("{}.json", content_hash(id.as_bytes()))
    }
}
