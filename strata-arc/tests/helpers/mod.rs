//! Test Helper Utilities
//!
//! Shared archive topology, object builders and event helpers for the
//! strata-arc integration tests. Not every test binary uses every helper.
#![allow(dead_code)]

use serde_json::{json, Value};
use sqlx::pool::PoolConnection;
use sqlx::Sqlite;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_arc::Archive;
use strata_common::config::{
    AeConfig, ArchiveConfig, ArchivingAction, ArchivingRule, Availability, ContainerConfig,
    ContainerFormat, DigestAlgorithm, DuplicatePolicy, FileCacheConfig, QcUpdateScope,
    StorageGroupConfig, StorageSystemConfig, DEFAULT_PATH_FORMAT,
};
use strata_common::events::ArchiveEvent;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const ONLINE: &str = "ONLINE";
pub const NEARLINE_FLAT: &str = "NEARLINE_FLAT";
pub const NEARLINE_ZIP: &str = "NEARLINE_ZIP";
pub const NEARLINE_TAR: &str = "NEARLINE_TAR";

/// AE rejecting changed re-sends
pub const AE_REJECT: &str = "STRATA";
/// AE replacing changed re-sends
pub const AE_REPLACE: &str = "STRATA_REPLACE";

pub const SOURCE_AET: &str = "MODALITY1";

/// Archive over a temporary root folder; the folder lives as long as this value
pub struct TestArchive {
    pub dir: TempDir,
    pub archive: Archive,
}

impl TestArchive {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub async fn conn(&self) -> PoolConnection<Sqlite> {
        self.archive.pool.acquire().await.unwrap()
    }

    /// Store an object from [`SOURCE_AET`] through [`AE_REJECT`]
    pub async fn store(&self, bytes: &[u8]) -> strata_arc::ArcResult<strata_arc::ingest::StoreOutcome> {
        self.archive.store.store(SOURCE_AET, AE_REJECT, bytes).await
    }
}

fn system(system_id: &str, path: &str) -> StorageSystemConfig {
    StorageSystemConfig {
        system_id: system_id.to_string(),
        path: PathBuf::from(path),
        read_only: false,
    }
}

fn group(group_id: &str, availability: Availability, path: &str) -> StorageGroupConfig {
    StorageGroupConfig {
        group_id: group_id.to_string(),
        availability,
        path_format: DEFAULT_PATH_FORMAT.to_string(),
        systems: vec![system("fs1", path)],
        active_system: None,
        container: None,
        file_cache: None,
    }
}

fn ae(ae_title: &str, duplicate_policy: DuplicatePolicy) -> AeConfig {
    AeConfig {
        ae_title: ae_title.to_string(),
        storage_group_id: ONLINE.to_string(),
        retrieve_aets: vec![ae_title.to_string()],
        digest_algorithm: Some(DigestAlgorithm::Sha256),
        duplicate_policy,
        qc_update_scope: QcUpdateScope::Deactivate,
    }
}

/// One online group, three nearline groups (flat, zip, tar) and two AEs; no rules
pub fn topology() -> ArchiveConfig {
    let mut zip = group(NEARLINE_ZIP, Availability::Nearline, "nearline_zip");
    zip.container = Some(ContainerConfig {
        format: ContainerFormat::Zip,
        path_format: strata_common::config::DEFAULT_CONTAINER_PATH_FORMAT.to_string(),
        checksum_entry: None,
    });
    zip.file_cache = Some(FileCacheConfig {
        directory: PathBuf::from("cache"),
    });

    let mut tar = group(NEARLINE_TAR, Availability::Nearline, "nearline_tar");
    tar.container = Some(ContainerConfig {
        format: ContainerFormat::Tar,
        path_format: strata_common::config::DEFAULT_CONTAINER_PATH_FORMAT.to_string(),
        checksum_entry: Some("SHA256SUMS".to_string()),
    });

    ArchiveConfig {
        ae: vec![
            ae(AE_REJECT, DuplicatePolicy::Reject),
            ae(AE_REPLACE, DuplicatePolicy::Replace),
        ],
        storage_groups: vec![
            group(ONLINE, Availability::Online, "online"),
            group(NEARLINE_FLAT, Availability::Nearline, "nearline_flat"),
            zip,
            tar,
        ],
        ..ArchiveConfig::default()
    }
}

/// Immediately eligible rule archiving everything to `targets`
pub fn rule(targets: &[&str], action: ArchivingAction) -> ArchivingRule {
    ArchivingRule {
        source_ae_titles: Vec::new(),
        delay_seconds: 0,
        storage_group_ids: targets.iter().map(|t| t.to_string()).collect(),
        action,
    }
}

/// Open an archive with a fresh database under a temporary root folder
pub async fn setup(config: ArchiveConfig) -> TestArchive {
    let dir = TempDir::new().unwrap();
    let database_path = dir.path().join("strata.db");
    let archive = Archive::open(config, dir.path(), &database_path)
        .await
        .unwrap();
    TestArchive { dir, archive }
}

/// Minimal object of patient `patient_id`
pub fn object(study: &str, series: &str, sop: &str, patient_id: &str) -> Value {
    json!({
        "StudyInstanceUID": study,
        "SeriesInstanceUID": series,
        "SOPInstanceUID": sop,
        "SOPClassUID": "1.2.840.10008.5.1.4.1.1.2",
        "Modality": "CT",
        "PatientID": patient_id,
        "IssuerOfPatientID": "HOSP",
        "PatientName": "Doe^John",
    })
}

pub fn encode(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

/// Wait up to two seconds for an event matching `pred`
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<ArchiveEvent>, pred: F) -> ArchiveEvent
where
    F: Fn(&ArchiveEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Regular files below `dir`, recursively
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}
