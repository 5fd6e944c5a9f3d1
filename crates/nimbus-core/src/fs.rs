//! Filesystem-backed blob store.

use crate::clients::{BlobStore, ClientError};
use crate::types::ObjectMeta;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;

/// Blob store rooted at a local directory.
///
/// Objects live at `<root>/<bucket>/<key>`.
pub struct FsBlobStore {
    root: Utf8PathBuf,
}

impl FsBlobStore {
    pub fn new(root: &Utf8Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Get the root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<Utf8PathBuf, ClientError> {
        if bucket.is_empty() || key.split('/').any(|part| part == "..") {
            return Err(ClientError::Rejected {
                service: "blob store",
                message: format!("invalid object path: {}/{}", bucket, key),
            });
        }
        Ok(self.root.join(bucket).join(key.trim_start_matches('/')))
    }
}

fn io_error(path: &Utf8Path, e: std::io::Error) -> ClientError {
    ClientError::Unavailable {
        service: "blob store",
        message: format!("{}: {}", path, e),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, ClientError> {
        let path = self.object_path(bucket, key)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(ObjectMeta {
            size: metadata.len(),
            last_modified,
        }))
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ClientError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| io_error(&path, e))
    }
}
