//! Storage systems
//!
//! Bytes are addressed by (storage group, storage system, relative path),
//! plus an entry name when the object lives inside a container. Drivers
//! only see that narrow contract; path templates, containers and Location
//! bookkeeping live above them.

pub mod container;
pub mod filesystem;
pub mod retrieve;

pub use container::{read_container_entry, ContainerSession, ContainerWriter};
pub use filesystem::FilesystemStorage;
pub use retrieve::{
    InMemoryQcHistory, QcHistory, QcRetrieveDecorator, QcUpdate, RetrieveService, RetrievedObject,
    StorageRetrieveService,
};

use crate::error::{ArcError, ArcResult};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// `write` refuses to overwrite; callers pick another path
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O failure: {0}")]
    Io(String),

    /// Unknown storage group or system, or a read-only system
    #[error("Storage configuration: {0}")]
    Config(String),
}

impl From<StorageError> for ArcError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Config(msg) => ArcError::Config(msg),
            other => ArcError::StorageIo(other.to_string()),
        }
    }
}

/// Read/write/delete contract of a storage system driver
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Create a new object; fails with `AlreadyExists` rather than overwrite
    async fn write(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError>;

    /// Read an object, or one entry of a container object
    async fn read(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
        entry_name: Option<&str>,
    ) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, group_id: &str, system_id: &str, path: &str)
        -> Result<(), StorageError>;

    async fn exists(&self, group_id: &str, system_id: &str, path: &str)
        -> Result<bool, StorageError>;

    /// Local directory of a storage system, for writers that need file access
    ///
    /// Container targets require it.
    fn local_root(&self, group_id: &str, system_id: &str) -> Result<PathBuf, StorageError> {
        Err(StorageError::Config(format!(
            "Storage system {}/{} has no local directory",
            group_id, system_id
        )))
    }
}

/// Run an I/O future under the configured timeout
pub async fn with_io_timeout<T, F>(operation: &str, timeout_ms: u64, fut: F) -> ArcResult<T>
where
    F: Future<Output = ArcResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms, "I/O operation timed out");
            Err(ArcError::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            })
        }
    }
}

/// Highest `-N` suffix tried before a path is considered unavailable
pub const MAX_PATH_SUFFIX: u32 = 1000;

/// Write a new object at `path`, or at the first free `-N` variant of it
///
/// Returns the path actually written.
pub async fn write_unique(
    storage: &dyn StorageDriver,
    group_id: &str,
    system_id: &str,
    path: &str,
    bytes: &[u8],
    timeout_ms: u64,
) -> ArcResult<String> {
    let mut candidate = path.to_string();
    for n in 1..=MAX_PATH_SUFFIX {
        let result = with_io_timeout("write object", timeout_ms, async {
            Ok(storage.write(group_id, system_id, &candidate, bytes).await)
        })
        .await?;
        match result {
            Ok(()) => return Ok(candidate),
            Err(StorageError::AlreadyExists(_)) => {
                tracing::debug!(path = %candidate, "Storage path taken, trying suffix");
                candidate = with_suffix(path, n);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ArcError::StorageIo(format!("No free storage path for {}", path)))
}

/// Insert `-N` before the extension of the last path component
pub fn with_suffix(path: &str, n: u32) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}-{}{}", dir, &file[..dot], n, &file[dot..]),
        _ => format!("{}{}-{}", dir, file, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix("a/b/C0FFEE", 1), "a/b/C0FFEE-1");
        assert_eq!(with_suffix("a/b/series.zip", 2), "a/b/series-2.zip");
        assert_eq!(with_suffix("x.tar", 1), "x-1.tar");
        assert_eq!(with_suffix("dir.d/file", 3), "dir.d/file-3");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let result: ArcResult<()> = with_io_timeout("slow write", 10, async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ArcError::Timeout { timeout_ms: 10, .. })));
    }

    #[test]
    fn test_storage_errors_are_storage_failures() {
        let err: ArcError = StorageError::NotFound("x".to_string()).into();
        assert_eq!(err.category(), crate::error::ErrorCategory::StorageFailure);
    }
}
