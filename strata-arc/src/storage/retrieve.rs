//! Retrieval of stored objects
//!
//! [`StorageRetrieveService`] reads the bytes of the best available Location.
//! [`QcRetrieveDecorator`] wraps any retrieve service and rewrites the
//! returned dataset after quality-control changes (UID updates, patient
//! identifier changes), according to the calling AE's update scope.

use crate::error::{ArcError, ArcResult};
use crate::ingest::dataset::{keyword, Dataset, DatasetParser};
use crate::models::{Location, LocationStatus};
use crate::storage::{with_io_timeout, StorageDriver};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use strata_common::config::{ArchiveConfig, Availability, QcUpdateScope};
use uuid::Uuid;

/// Object read back from storage
#[derive(Debug, Clone)]
pub struct RetrievedObject {
    pub location: Location,
    pub dataset: Dataset,
}

#[async_trait]
pub trait RetrieveService: Send + Sync {
    /// Read one SOP instance on behalf of `ae_title`
    async fn retrieve(&self, ae_title: &str, sop_iuid: &str) -> ArcResult<RetrievedObject>;
}

pub struct StorageRetrieveService {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    root_folder: PathBuf,
    storage: Arc<dyn StorageDriver>,
    parser: Arc<dyn DatasetParser>,
}

impl StorageRetrieveService {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        root_folder: impl Into<PathBuf>,
        storage: Arc<dyn StorageDriver>,
        parser: Arc<dyn DatasetParser>,
    ) -> Self {
        Self {
            pool,
            config,
            root_folder: root_folder.into(),
            storage,
            parser,
        }
    }

    fn availability(&self, group_id: &str) -> Availability {
        self.config
            .storage_group(group_id)
            .map(|g| g.availability)
            .unwrap_or(Availability::Offline)
    }

    /// Best tier first, the authoritative Location before copies on the same tier
    fn pick_location(&self, mut locations: Vec<Location>) -> Option<Location> {
        locations.sort_by_key(|l| {
            (
                self.availability(&l.group_id),
                l.status != LocationStatus::Stored,
                l.pk,
            )
        });
        locations.into_iter().next()
    }

    /// Cache file for a container entry, if the group has a file cache
    fn cache_path(&self, location: &Location) -> Option<PathBuf> {
        let entry = location.entry_name.as_deref()?;
        let cache = self.config.storage_group(&location.group_id)?.file_cache.as_ref()?;
        let dir = if cache.directory.is_absolute() {
            cache.directory.clone()
        } else {
            self.root_folder.join(&cache.directory)
        };
        let relative = Path::new(&location.system_id)
            .join(&location.storage_path)
            .join(entry);
        relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| dir.join(relative))
    }

    async fn read_location(&self, location: &Location) -> ArcResult<Vec<u8>> {
        let cache_path = self.cache_path(location);
        if let Some(path) = &cache_path {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    tracing::debug!(path = %path.display(), "File cache hit");
                    return Ok(bytes);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "File cache unreadable"),
            }
        }

        let bytes = with_io_timeout("read object", self.config.io_timeout_ms, async {
            Ok(self
                .storage
                .read(
                    &location.group_id,
                    &location.system_id,
                    &location.storage_path,
                    location.entry_name.as_deref(),
                )
                .await?)
        })
        .await?;

        if let Some(path) = &cache_path {
            if let Err(e) = fill_cache(path, &bytes).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to fill file cache");
            }
        }
        Ok(bytes)
    }
}

async fn fill_cache(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Concurrent fills of one entry each write their own part file
    let mut part = path.as_os_str().to_owned();
    part.push(format!(".{}.part", Uuid::new_v4()));
    tokio::fs::write(&part, bytes).await?;
    tokio::fs::rename(&part, path).await
}

#[async_trait]
impl RetrieveService for StorageRetrieveService {
    async fn retrieve(&self, ae_title: &str, sop_iuid: &str) -> ArcResult<RetrievedObject> {
        let mut conn = self.pool.acquire().await?;
        let locations = crate::db::locations::locations_of_sop(&mut conn, sop_iuid).await?;
        drop(conn);

        let location = self
            .pick_location(locations)
            .ok_or_else(|| ArcError::NotFound(format!("No location for {}", sop_iuid)))?;

        tracing::debug!(
            ae_title,
            sop_iuid,
            group_id = %location.group_id,
            storage_path = %location.storage_path,
            entry_name = ?location.entry_name,
            "Retrieving object"
        );

        let bytes = self.read_location(&location).await?;
        let dataset = self.parser.parse(&bytes)?;
        Ok(RetrievedObject { location, dataset })
    }
}

/// One recorded quality-control change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcUpdate {
    pub old: String,
    pub new: String,
}

/// Lookup of quality-control changes applied after objects were stored
pub trait QcHistory: Send + Sync {
    /// Current value of a study, series or instance UID
    fn updated_uid(&self, old_uid: &str) -> Option<String>;

    /// Current value of a patient identifier
    fn updated_patient_id(&self, old_id: &str) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct InMemoryQcHistory {
    uids: RwLock<HashMap<String, String>>,
    patient_ids: RwLock<HashMap<String, String>>,
}

impl InMemoryQcHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_uid(&self, update: QcUpdate) {
        if let Ok(mut uids) = self.uids.write() {
            uids.insert(update.old, update.new);
        }
    }

    pub fn record_patient_id(&self, update: QcUpdate) {
        if let Ok(mut ids) = self.patient_ids.write() {
            ids.insert(update.old, update.new);
        }
    }
}

impl QcHistory for InMemoryQcHistory {
    fn updated_uid(&self, old_uid: &str) -> Option<String> {
        self.uids.read().ok()?.get(old_uid).cloned()
    }

    fn updated_patient_id(&self, old_id: &str) -> Option<String> {
        self.patient_ids.read().ok()?.get(old_id).cloned()
    }
}

/// Retrieve service rewriting objects with recorded quality-control changes
pub struct QcRetrieveDecorator<R> {
    inner: R,
    history: Arc<dyn QcHistory>,
    config: Arc<ArchiveConfig>,
}

impl<R: RetrieveService> QcRetrieveDecorator<R> {
    pub fn new(inner: R, history: Arc<dyn QcHistory>, config: Arc<ArchiveConfig>) -> Self {
        Self {
            inner,
            history,
            config,
        }
    }

    fn coerce(&self, scope: QcUpdateScope, dataset: &mut Dataset) -> usize {
        let mut updated = 0;
        if scope == QcUpdateScope::Patient {
            if let Some(new_id) = dataset
                .string(keyword::PATIENT_ID)
                .and_then(|id| self.history.updated_patient_id(&id))
            {
                dataset.set_string(keyword::PATIENT_ID, &new_id);
                updated += 1;
            }
        }
        // Patient scope includes the study-level reference update
        if matches!(scope, QcUpdateScope::Patient | QcUpdateScope::Study) {
            updated += dataset.replace_uids(&|uid| self.history.updated_uid(uid));
        }
        updated
    }
}

#[async_trait]
impl<R: RetrieveService> RetrieveService for QcRetrieveDecorator<R> {
    async fn retrieve(&self, ae_title: &str, sop_iuid: &str) -> ArcResult<RetrievedObject> {
        let mut object = self.inner.retrieve(ae_title, sop_iuid).await?;

        let scope = self
            .config
            .ae(ae_title)
            .map(|ae| ae.qc_update_scope)
            .unwrap_or_default();
        if scope == QcUpdateScope::Deactivate {
            return Ok(object);
        }

        let updated = self.coerce(scope, &mut object.dataset);
        if updated > 0 {
            tracing::info!(ae_title, sop_iuid, ?scope, updated, "Applied QC updates to retrieved object");
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use strata_common::config::AeConfig;

    struct FixedRetrieve(Dataset);

    #[async_trait]
    impl RetrieveService for FixedRetrieve {
        async fn retrieve(&self, _ae_title: &str, _sop_iuid: &str) -> ArcResult<RetrievedObject> {
            Ok(RetrievedObject {
                location: Location {
                    pk: 1,
                    instance_fk: 1,
                    group_id: "ONLINE".to_string(),
                    system_id: "fs1".to_string(),
                    storage_path: "a/b".to_string(),
                    entry_name: None,
                    digest: None,
                    object_size: 0,
                    status: LocationStatus::Stored,
                    created_at: Utc::now(),
                },
                dataset: self.0.clone(),
            })
        }
    }

    fn ae(title: &str, scope: QcUpdateScope) -> AeConfig {
        AeConfig {
            ae_title: title.to_string(),
            storage_group_id: "ONLINE".to_string(),
            retrieve_aets: vec![],
            digest_algorithm: None,
            duplicate_policy: Default::default(),
            qc_update_scope: scope,
        }
    }

    fn decorator() -> QcRetrieveDecorator<FixedRetrieve> {
        let dataset = match json!({
            "PatientID": "P1",
            "StudyInstanceUID": "1.1",
            "SeriesInstanceUID": "1.1.1",
            "SOPInstanceUID": "1.1.1.1"
        }) {
            serde_json::Value::Object(map) => Dataset::from_map(map),
            _ => unreachable!(),
        };

        let history = InMemoryQcHistory::new();
        history.record_uid(QcUpdate { old: "1.1".into(), new: "2.2".into() });
        history.record_patient_id(QcUpdate { old: "P1".into(), new: "P9".into() });

        let config = ArchiveConfig {
            ae: vec![
                ae("OFF", QcUpdateScope::Deactivate),
                ae("STUDY", QcUpdateScope::Study),
                ae("PATIENT", QcUpdateScope::Patient),
            ],
            ..Default::default()
        };
        QcRetrieveDecorator::new(FixedRetrieve(dataset), Arc::new(history), Arc::new(config))
    }

    #[tokio::test]
    async fn test_deactivated_scope_returns_object_untouched() {
        let object = decorator().retrieve("OFF", "1.1.1.1").await.unwrap();
        assert_eq!(object.dataset.study_iuid().as_deref(), Some("1.1"));
        assert_eq!(object.dataset.string("PatientID").as_deref(), Some("P1"));
    }

    #[tokio::test]
    async fn test_study_scope_rewrites_uids_only() {
        let object = decorator().retrieve("STUDY", "1.1.1.1").await.unwrap();
        assert_eq!(object.dataset.study_iuid().as_deref(), Some("2.2"));
        assert_eq!(object.dataset.series_iuid().as_deref(), Some("1.1.1"));
        assert_eq!(object.dataset.string("PatientID").as_deref(), Some("P1"));
    }

    #[tokio::test]
    async fn test_patient_scope_includes_study_updates() {
        let object = decorator().retrieve("PATIENT", "1.1.1.1").await.unwrap();
        assert_eq!(object.dataset.study_iuid().as_deref(), Some("2.2"));
        assert_eq!(object.dataset.string("PatientID").as_deref(), Some("P9"));
    }

    #[tokio::test]
    async fn test_unknown_ae_is_untouched() {
        let object = decorator().retrieve("NOBODY", "1.1.1.1").await.unwrap();
        assert_eq!(object.dataset.study_iuid().as_deref(), Some("1.1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cache_fills_leave_one_complete_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fs1").join("c.zip").join("1.1.1.1");
        let bytes = Arc::new(vec![7u8; 256 * 1024]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let bytes = Arc::clone(&bytes);
                tokio::spawn(async move { fill_cache(&path, &bytes).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(std::fs::read(&path).unwrap(), *bytes);
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
