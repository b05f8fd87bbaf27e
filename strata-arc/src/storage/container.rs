//! Container packaging (zip / tar)
//!
//! A container session writes every entry into `<container>.part` and
//! renames it into place on finalize, so readers and retries never observe
//! a half-written container. Sessions targeting the same container path
//! queue on a per-path lock; one writer owns a container at a time.

use super::{with_suffix, StorageError, MAX_PATH_SUFFIX};
use crate::error::{ArcError, ArcResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use strata_common::config::ContainerFormat;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

enum ContainerSink {
    Zip(ZipWriter<File>),
    Tar(tar::Builder<File>),
}

impl ContainerSink {
    fn create(format: ContainerFormat, file: File) -> Self {
        match format {
            ContainerFormat::Zip => ContainerSink::Zip(ZipWriter::new(file)),
            ContainerFormat::Tar => {
                let mut builder = tar::Builder::new(file);
                builder.mode(tar::HeaderMode::Deterministic);
                ContainerSink::Tar(builder)
            }
        }
    }

    fn add(&mut self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            ContainerSink::Zip(zip) => {
                let options =
                    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
                zip.start_file(name, options)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                zip.write_all(bytes)
            }
            ContainerSink::Tar(builder) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(bytes.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, bytes)
            }
        }
    }

    /// Write the trailer and flush to disk
    fn finish(self) -> std::io::Result<()> {
        let file = match self {
            ContainerSink::Zip(zip) => zip
                .finish()
                .map_err(|e| std::io::Error::other(e.to_string()))?,
            ContainerSink::Tar(builder) => builder.into_inner()?,
        };
        file.sync_all()
    }
}

async fn blocking<T, F>(f: F) -> ArcResult<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArcError::StorageIo(format!("Container task failed: {}", e)))?
        .map_err(|e| ArcError::StorageIo(e.to_string()))
}

/// Opens container sessions and serializes writers per container path
#[derive(Default)]
pub struct ContainerWriter {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl ContainerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Drop idle entries so the registry does not grow with every container
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Start a container under `system_root/relative_path`
    ///
    /// Waits for any other session on the same path. If a finished container
    /// already exists there, a `-N` suffix is appended.
    pub async fn open(
        &self,
        format: ContainerFormat,
        system_root: &Path,
        relative_path: &str,
        checksum_entry: Option<String>,
    ) -> ArcResult<ContainerSession> {
        let guard = self
            .lock_for(&system_root.join(relative_path))
            .lock_owned()
            .await;

        let mut chosen = relative_path.to_string();
        let mut n = 0;
        while tokio::fs::try_exists(system_root.join(&chosen)).await? {
            n += 1;
            if n > MAX_PATH_SUFFIX {
                return Err(ArcError::StorageIo(format!(
                    "No free container path for {}",
                    relative_path
                )));
            }
            chosen = with_suffix(relative_path, n);
        }

        let final_path = system_root.join(&chosen);
        let mut part_name = final_path.as_os_str().to_owned();
        part_name.push(".part");
        let part_path = PathBuf::from(part_name);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = part_path.clone();
        let file = blocking(move || File::create(&part)).await?;

        tracing::debug!(container = %final_path.display(), ?format, "Opened container session");

        Ok(ContainerSession {
            _guard: guard,
            relative_path: chosen,
            final_path,
            part_path,
            sink: Some(ContainerSink::create(format, file)),
            checksum_entry,
            checksums: Vec::new(),
            finalized: false,
        })
    }
}

/// One container being written
pub struct ContainerSession {
    _guard: OwnedMutexGuard<()>,
    relative_path: String,
    final_path: PathBuf,
    part_path: PathBuf,
    sink: Option<ContainerSink>,
    checksum_entry: Option<String>,
    checksums: Vec<(String, String)>,
    finalized: bool,
}

impl ContainerSession {
    /// Path of the container relative to its storage system
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn entry_count(&self) -> usize {
        self.checksums.len()
    }

    pub async fn add_entry(&mut self, name: &str, bytes: Vec<u8>) -> ArcResult<()> {
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| ArcError::StorageIo("Container session already failed".to_string()))?;
        let entry = name.to_string();
        let track_checksum = self.checksum_entry.is_some();

        let (sink, digest) = blocking(move || {
            let digest = track_checksum.then(|| format!("{:x}", Sha256::digest(&bytes)));
            sink.add(&entry, &bytes)?;
            Ok((sink, digest))
        })
        .await?;

        self.sink = Some(sink);
        self.checksums.push((name.to_string(), digest.unwrap_or_default()));
        Ok(())
    }

    /// Finish the container and move it into place
    pub async fn finalize(mut self) -> ArcResult<String> {
        if let Some(manifest_name) = self.checksum_entry.clone() {
            let manifest: String = self
                .checksums
                .iter()
                .map(|(name, digest)| format!("{}  {}\n", digest, name))
                .collect();
            self.add_entry(&manifest_name, manifest.into_bytes()).await?;
        }

        let sink = self
            .sink
            .take()
            .ok_or_else(|| ArcError::StorageIo("Container session already failed".to_string()))?;
        let part = self.part_path.clone();
        let target = self.final_path.clone();
        blocking(move || {
            sink.finish()?;
            std::fs::rename(&part, &target)
        })
        .await?;

        self.finalized = true;
        tracing::info!(
            container = %self.final_path.display(),
            entries = self.checksums.len(),
            "Finalized container"
        );
        Ok(self.relative_path.clone())
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if !self.finalized {
            self.sink = None;
            if let Err(e) = std::fs::remove_file(&self.part_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(part = %self.part_path.display(), error = %e, "Failed to remove unfinished container");
                }
            }
        }
    }
}

/// Extract one entry from a finished container (blocking)
pub fn read_container_entry(
    path: &Path,
    format: ContainerFormat,
    entry_name: &str,
) -> Result<Vec<u8>, StorageError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        _ => StorageError::Io(format!("{}: {}", path.display(), e)),
    })?;
    let missing = || StorageError::NotFound(format!("{}!{}", path.display(), entry_name));
    let io = |e: std::io::Error| StorageError::Io(format!("{}: {}", path.display(), e));

    let mut out = Vec::new();
    match format {
        ContainerFormat::Zip => {
            let mut archive =
                ZipArchive::new(file).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut entry = archive.by_name(entry_name).map_err(|e| match e {
                zip::result::ZipError::FileNotFound => missing(),
                other => StorageError::Io(other.to_string()),
            })?;
            entry.read_to_end(&mut out).map_err(io)?;
        }
        ContainerFormat::Tar => {
            let mut archive = tar::Archive::new(file);
            let mut found = false;
            for entry in archive.entries().map_err(io)? {
                let mut entry = entry.map_err(io)?;
                let matches = entry
                    .path()
                    .map(|p| &*p == Path::new(entry_name))
                    .unwrap_or(false);
                if matches {
                    entry.read_to_end(&mut out).map_err(io)?;
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(missing());
            }
        }
    }
    Ok(out)
}
