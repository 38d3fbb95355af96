pub mod kv;
pub mod records;

pub use kv::KvStore;
pub use records::{Record, RecordStore};

use sha2::{Digest, Sha256};

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("collection exceeds storage quota ({needed} > {quota} bytes)")]
    QuotaExceeded { needed: usize, quota: usize },
}

pub fn content_hash(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}
