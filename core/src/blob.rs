//! Blob store for shared files
//!
//! Relays only ever carry a `fileTransfer` notice with a link; the bytes go
//! through a [`BlobStore`] the clients agree on.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Largest accepted upload (10 MiB)
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const URL_SCHEME: &str = "blob://";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("File of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("Invalid file name: {0}")]
    InvalidName(String),
    #[error("Invalid blob url: {0}")]
    InvalidUrl(String),
}

/// Where shared file bytes live, addressed by the url `put` returns.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return a link for a `fileTransfer` payload
    async fn put(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, BlobError>;

    /// Fetch a previously stored blob, `None` if unknown
    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>, BlobError>;
}

/// In-process store returning `blob://<uuid>/<file_name>` links.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    max_bytes: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_limit(MAX_UPLOAD_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(BlobError::InvalidName(file_name.to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(BlobError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        let url = format!("{}{}/{}", URL_SCHEME, Uuid::new_v4(), file_name);
        self.blobs.write().insert(url.clone(), bytes);
        Ok(url)
    }

    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>, BlobError> {
        if !url.starts_with(URL_SCHEME) {
            return Err(BlobError::InvalidUrl(url.to_string()));
        }
        Ok(self.blobs.read().get(url).cloned())
    }
}
