//! Durable storage abstraction and the filesystem implementation.
//!
//! The transfer engine writes through [`StorageTarget`] so the pipeline
//! never depends on a concrete store. Writes are staged: data lands in a
//! temporary object first and only an explicit commit publishes it under
//! the final path, so a failed transfer never leaves a partial object
//! visible.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::AcquireError;

/// Suffix for staged objects that have not been committed yet.
const STAGING_SUFFIX: &str = ".part";

/// A durable object store the transfer engine can stream into.
#[async_trait]
pub trait StorageTarget: Send + Sync {
    /// Opens a staged write for `object_path`.
    ///
    /// `content_type` is advisory; stores that track it (object storage)
    /// persist it, stores that do not (plain filesystems) ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::TransferFailed`] when the staging object
    /// cannot be created.
    async fn begin_resumable_write(
        &self,
        object_path: &str,
        content_type: &str,
    ) -> Result<Box<dyn WriteHandle>, AcquireError>;
}

/// An open staged write.
///
/// Consumed by exactly one of [`commit`](WriteHandle::commit) or
/// [`abort`](WriteHandle::abort); dropping without either leaves the staging
/// object behind for the store's own cleanup.
#[async_trait]
pub trait WriteHandle: Send {
    /// Appends a chunk, returning the total bytes written so far.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::TransferFailed`] on write failure.
    async fn write(&mut self, chunk: &[u8]) -> Result<u64, AcquireError>;

    /// Publishes the staged object, returning its stored location.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::TransferFailed`] when flushing or publishing
    /// fails.
    async fn commit(self: Box<Self>) -> Result<String, AcquireError>;

    /// Discards the staged object.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::TransferFailed`] when the staging object
    /// cannot be removed.
    async fn abort(self: Box<Self>) -> Result<(), AcquireError>;
}

// ==================== Filesystem Implementation ====================

/// Filesystem-backed storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    /// When set, committed locations are URLs under this base instead of
    /// filesystem paths.
    public_base_url: Option<String>,
}

impl FsStorage {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    /// Serves committed objects as URLs under `base_url`.
    #[must_use]
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        self.public_base_url = Some(base.trim_end_matches('/').to_string());
        self
    }

    /// Resolves and validates an object path against the root.
    fn resolve(&self, object_path: &str) -> Result<PathBuf, AcquireError> {
        if object_path.is_empty()
            || object_path.starts_with('/')
            || Path::new(object_path)
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(AcquireError::transfer_failed(
                object_path,
                "object path must be a relative path without traversal",
            ));
        }
        Ok(self.root.join(object_path))
    }
}

#[async_trait]
impl StorageTarget for FsStorage {
    async fn begin_resumable_write(
        &self,
        object_path: &str,
        _content_type: &str,
    ) -> Result<Box<dyn WriteHandle>, AcquireError> {
        let final_path = self.resolve(object_path)?;
        let staging_path = staging_path_for(&final_path);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AcquireError::transfer_failed(object_path, format!("creating directories: {e}"))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&staging_path)
            .await
            .map_err(|e| {
                AcquireError::transfer_failed(object_path, format!("opening staging file: {e}"))
            })?;

        debug!(object_path, staging = %staging_path.display(), "staged write opened");

        Ok(Box::new(FsWriteHandle {
            file,
            staging_path,
            final_path,
            location: self.location_for(object_path),
            object_path: object_path.to_string(),
            written: 0,
        }))
    }
}

impl FsStorage {
    /// The location string a commit under `object_path` will report.
    fn location_for(&self, object_path: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/{object_path}"),
            None => self.root.join(object_path).display().to_string(),
        }
    }
}

fn staging_path_for(final_path: &Path) -> PathBuf {
    let mut staging = final_path.as_os_str().to_owned();
    staging.push(STAGING_SUFFIX);
    PathBuf::from(staging)
}

/// One staged filesystem write.
struct FsWriteHandle {
    file: File,
    staging_path: PathBuf,
    final_path: PathBuf,
    location: String,
    object_path: String,
    written: u64,
}

#[async_trait]
impl WriteHandle for FsWriteHandle {
    async fn write(&mut self, chunk: &[u8]) -> Result<u64, AcquireError> {
        self.file.write_all(chunk).await.map_err(|e| {
            AcquireError::transfer_failed(&self.object_path, format!("write failed: {e}"))
        })?;
        self.written += chunk.len() as u64;
        Ok(self.written)
    }

    async fn commit(mut self: Box<Self>) -> Result<String, AcquireError> {
        self.file.flush().await.map_err(|e| {
            AcquireError::transfer_failed(&self.object_path, format!("flush failed: {e}"))
        })?;
        self.file.sync_all().await.map_err(|e| {
            AcquireError::transfer_failed(&self.object_path, format!("sync failed: {e}"))
        })?;
        drop(self.file);

        // Atomic publish: the final path either has the whole object or
        // nothing.
        tokio::fs::rename(&self.staging_path, &self.final_path)
            .await
            .map_err(|e| {
                AcquireError::transfer_failed(&self.object_path, format!("publish failed: {e}"))
            })?;

        debug!(
            object_path = %self.object_path,
            bytes = self.written,
            "staged write committed"
        );
        Ok(self.location)
    }

    async fn abort(self: Box<Self>) -> Result<(), AcquireError> {
        drop(self.file);
        if let Err(error) = tokio::fs::remove_file(&self.staging_path).await {
            warn!(
                staging = %self.staging_path.display(),
                %error,
                "failed to remove staging file"
            );
            return Err(AcquireError::transfer_failed(
                &self.object_path,
                format!("abort cleanup failed: {error}"),
            ));
        }
        debug!(object_path = %self.object_path, "staged write aborted");
        Ok(())
    }
}
