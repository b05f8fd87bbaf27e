//! Filesystem storage driver
//!
//! Each storage system maps to a directory. Relative system paths in the
//! configuration resolve against the root folder.

use super::container::read_container_entry;
use super::{StorageDriver, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use strata_common::config::{ArchiveConfig, ContainerFormat};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
struct SystemEntry {
    base: PathBuf,
    read_only: bool,
    container: Option<ContainerFormat>,
}

#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    systems: HashMap<(String, String), SystemEntry>,
}

impl FilesystemStorage {
    pub fn new(config: &ArchiveConfig, root_folder: &Path) -> Self {
        let mut systems = HashMap::new();
        for group in &config.storage_groups {
            for system in &group.systems {
                let base = if system.path.is_absolute() {
                    system.path.clone()
                } else {
                    root_folder.join(&system.path)
                };
                systems.insert(
                    (group.group_id.clone(), system.system_id.clone()),
                    SystemEntry {
                        base,
                        read_only: system.read_only,
                        container: group.container.as_ref().map(|c| c.format),
                    },
                );
            }
        }
        Self { systems }
    }

    fn entry(&self, group_id: &str, system_id: &str) -> Result<&SystemEntry, StorageError> {
        self.systems
            .get(&(group_id.to_string(), system_id.to_string()))
            .ok_or_else(|| {
                StorageError::Config(format!("Unknown storage system {}/{}", group_id, system_id))
            })
    }

    /// Absolute path of an object; rejects paths escaping the system root
    pub fn resolve(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
    ) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::Io(format!("Invalid storage path: {}", path)));
        }
        Ok(self.entry(group_id, system_id)?.base.join(relative))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.display().to_string()),
        _ => StorageError::Io(format!("{}: {}", path.display(), err)),
    }
}

#[async_trait]
impl StorageDriver for FilesystemStorage {
    async fn write(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        if self.entry(group_id, system_id)?.read_only {
            return Err(StorageError::Config(format!(
                "Storage system {}/{} is read-only",
                group_id, system_id
            )));
        }
        let target = self.resolve(group_id, system_id, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
            .map_err(|e| io_error(&target, e))?;

        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&target).await;
            return Err(io_error(&target, e));
        }

        tracing::debug!(group_id, system_id, path, bytes = bytes.len(), "Wrote object");
        Ok(())
    }

    async fn read(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
        entry_name: Option<&str>,
    ) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(group_id, system_id, path)?;
        match entry_name {
            None => tokio::fs::read(&target).await.map_err(|e| io_error(&target, e)),
            Some(entry) => {
                let format = self.entry(group_id, system_id)?.container.ok_or_else(|| {
                    StorageError::Config(format!("Storage group {} has no container", group_id))
                })?;
                let entry = entry.to_string();
                tokio::task::spawn_blocking(move || read_container_entry(&target, format, &entry))
                    .await
                    .map_err(|e| StorageError::Io(format!("Container read task failed: {}", e)))?
            }
        }
    }

    async fn delete(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
    ) -> Result<(), StorageError> {
        let target = self.resolve(group_id, system_id, path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| io_error(&target, e))?;
        tracing::debug!(group_id, system_id, path, "Deleted object");
        Ok(())
    }

    async fn exists(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
    ) -> Result<bool, StorageError> {
        let target = self.resolve(group_id, system_id, path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| io_error(&target, e))
    }

    fn local_root(&self, group_id: &str, system_id: &str) -> Result<PathBuf, StorageError> {
        let entry = self.entry(group_id, system_id)?;
        if entry.read_only {
            return Err(StorageError::Config(format!(
                "Storage system {}/{} is read-only",
                group_id, system_id
            )));
        }
        Ok(entry.base.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::config::{Availability, StorageGroupConfig, StorageSystemConfig};
    use tempfile::TempDir;

    fn storage(root: &Path) -> FilesystemStorage {
        let config = ArchiveConfig {
            storage_groups: vec![StorageGroupConfig {
                group_id: "ONLINE".to_string(),
                availability: Availability::Online,
                path_format: strata_common::config::DEFAULT_PATH_FORMAT.to_string(),
                systems: vec![StorageSystemConfig {
                    system_id: "fs1".to_string(),
                    path: PathBuf::from("online"),
                    read_only: false,
                }],
                active_system: None,
                container: None,
                file_cache: None,
            }],
            ..Default::default()
        };
        FilesystemStorage::new(&config, root)
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp = TempDir::new().unwrap();
        let fs = storage(temp.path());

        fs.write("ONLINE", "fs1", "a/b/obj", b"bytes").await.unwrap();
        assert!(temp.path().join("online/a/b/obj").exists());
        assert!(fs.exists("ONLINE", "fs1", "a/b/obj").await.unwrap());
        assert_eq!(fs.read("ONLINE", "fs1", "a/b/obj", None).await.unwrap(), b"bytes");

        fs.delete("ONLINE", "fs1", "a/b/obj").await.unwrap();
        assert!(!fs.exists("ONLINE", "fs1", "a/b/obj").await.unwrap());
        assert!(matches!(
            fs.read("ONLINE", "fs1", "a/b/obj", None).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_never_overwrites() {
        let temp = TempDir::new().unwrap();
        let fs = storage(temp.path());

        fs.write("ONLINE", "fs1", "obj", b"first").await.unwrap();
        assert!(matches!(
            fs.write("ONLINE", "fs1", "obj", b"second").await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(fs.read("ONLINE", "fs1", "obj", None).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_rejects_unknown_system_and_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let fs = storage(temp.path());

        assert!(matches!(
            fs.write("NEARLINE", "fs1", "obj", b"x").await,
            Err(StorageError::Config(_))
        ));
        assert!(fs.resolve("ONLINE", "fs1", "../outside").is_err());
        assert!(fs.resolve("ONLINE", "fs1", "/abs").is_err());
    }
}
