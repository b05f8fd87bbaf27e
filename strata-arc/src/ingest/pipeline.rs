//! Store pipeline
//!
//! One [`StoreSession`] per incoming object:
//!
//! ```text
//! create_session → spool → parse → coerce → persist → notify
//! ```
//!
//! `persist` runs subject resolution, hierarchy find-or-create, the duplicate
//! check and the primary Location insert in a single transaction. Any failure
//! rolls that transaction back, deletes bytes already written to storage and
//! leaves the session `Rejected`. The spool directory is removed on every
//! exit path.

use crate::db::{hierarchy, locations, subjects};
use crate::db::hierarchy::{NewInstance, NewSeries, NewStudy};
use crate::error::{ArcError, ArcResult};
use crate::identity::IdentityResolver;
use crate::ingest::coercion::{AttributeCoercion, RuleBasedCoercion};
use crate::ingest::dataset::{keyword, DatasetParser, JsonDatasetParser};
use crate::ingest::path_format::{PathContext, PathFormat};
use crate::ingest::session::StoreSession;
use crate::models::{InstanceExistsAction, Location, LocationStatus, NewLocation, StoreState};
use crate::storage::{with_io_timeout, write_unique, StorageDriver};
use crate::utils::{begin_monitored, retry_on_conflict, retry_on_lock};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256, Sha512};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::config::{ArchiveConfig, DigestAlgorithm, DuplicatePolicy};
use strata_common::events::{ArchiveEvent, EventBus};

const SPOOL_FILE_NAME: &str = "object";

/// "Stored" signal handed to listeners after commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub series_iuid: String,
    pub study_iuid: String,
    pub sop_iuid: String,
    pub source_aet: String,
    /// Storage group of the primary Location
    pub group_id: String,
}

/// Consumer of "stored" signals
///
/// Delivery is at-least-once; implementations must be idempotent.
#[async_trait]
pub trait StoreListener: Send + Sync {
    async fn stored(&self, event: &StoredEvent) -> ArcResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Stored,
    /// Byte-identical re-send, nothing written
    Ignored,
    /// Differing content replaced a stored instance
    Replaced,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub action: StoreAction,
    pub sop_iuid: String,
    pub series_iuid: String,
    pub study_iuid: String,
    pub subject_pk: i64,
    pub instance_pk: i64,
    /// Primary Location written by this store
    pub location: Option<Location>,
}

/// Result of one committed persist attempt
struct Persisted {
    outcome: StoreOutcome,
    /// Locations dropped by a replace; their bytes are deleted after commit
    superseded: Vec<Location>,
}

/// Bytes written during a persist attempt, deleted again if it does not commit
struct WrittenObject {
    group_id: String,
    system_id: String,
    path: String,
}

/// Decide what to do with a SOP instance that is already stored
pub fn instance_exists_action(
    stored_digest: Option<&str>,
    incoming_digest: Option<&str>,
    policy: DuplicatePolicy,
) -> InstanceExistsAction {
    match (stored_digest, incoming_digest) {
        (Some(stored), Some(incoming)) if stored == incoming => InstanceExistsAction::Ignore,
        _ => match policy {
            DuplicatePolicy::Replace => InstanceExistsAction::Replace,
            DuplicatePolicy::Reject => InstanceExistsAction::Reject,
        },
    }
}

/// Digest of a file, read in 1MB chunks on the blocking pool
async fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> ArcResult<String> {
    fn hash_with<D: Digest>(path: &Path) -> std::io::Result<String> {
        use std::io::Read;

        let mut file = std::fs::File::open(path)?;
        let mut hasher = D::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect())
    }

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || match algorithm {
        DigestAlgorithm::Sha256 => hash_with::<Sha256>(&path),
        DigestAlgorithm::Sha512 => hash_with::<Sha512>(&path),
    })
    .await
    .map_err(|e| ArcError::Spool(format!("Digest task failed: {}", e)))?
    .map_err(|e| ArcError::Spool(format!("Failed to digest spooled object: {}", e)))
}

pub struct StoreService {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    spool_root: PathBuf,
    storage: Arc<dyn StorageDriver>,
    resolver: IdentityResolver,
    parser: Arc<dyn DatasetParser>,
    coercion: Arc<dyn AttributeCoercion>,
    listeners: Vec<Arc<dyn StoreListener>>,
    event_bus: EventBus,
}

impl StoreService {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        root_folder: &Path,
        storage: Arc<dyn StorageDriver>,
        resolver: IdentityResolver,
        event_bus: EventBus,
    ) -> Self {
        let coercion = Arc::new(RuleBasedCoercion::new(config.coercion_rules.clone()));
        Self {
            pool,
            config,
            spool_root: root_folder.join("spool"),
            storage,
            resolver,
            parser: Arc::new(JsonDatasetParser),
            coercion,
            listeners: Vec::new(),
            event_bus,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn DatasetParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_coercion(mut self, coercion: Arc<dyn AttributeCoercion>) -> Self {
        self.coercion = coercion;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn StoreListener>) {
        self.listeners.push(listener);
    }

    pub fn spool_root(&self) -> &Path {
        &self.spool_root
    }

    /// Open a session for an object sent by `source_aet` to the local AE `local_aet`
    pub fn create_session(&self, source_aet: &str, local_aet: &str) -> ArcResult<StoreSession> {
        let ae = self
            .config
            .ae(local_aet)
            .ok_or_else(|| ArcError::Config(format!("Unknown AE title {}", local_aet)))?;
        let session = StoreSession::new(source_aet, ae.clone(), &self.spool_root);
        tracing::debug!(
            session_id = %session.id,
            source_aet,
            local_aet,
            "Store session created"
        );
        Ok(session)
    }

    /// Stage incoming bytes in the session spool directory
    pub async fn spool(&self, session: &mut StoreSession, bytes: &[u8]) -> ArcResult<PathBuf> {
        let path = self.write_spool(session, bytes).await?;
        session.transition_to(StoreState::Spooled);
        Ok(path)
    }

    /// Write the spool file and record its size and digest
    async fn write_spool(&self, session: &mut StoreSession, bytes: &[u8]) -> ArcResult<PathBuf> {
        let path = session.spool_dir.join(SPOOL_FILE_NAME);
        let spool_dir = session.spool_dir.clone();

        with_io_timeout("spool", self.config.io_timeout_ms, async {
            tokio::fs::create_dir_all(&spool_dir)
                .await
                .map_err(|e| ArcError::Spool(format!("{}: {}", spool_dir.display(), e)))?;
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| ArcError::Spool(format!("{}: {}", path.display(), e)))
        })
        .await?;

        session.context.object_size = bytes.len() as u64;
        session.context.digest = match session.ae.digest_algorithm {
            Some(algorithm) => Some(digest_file(&path, algorithm).await?),
            None => None,
        };
        session.context.spool_path = Some(path.clone());

        tracing::debug!(
            session_id = %session.id,
            size = bytes.len(),
            digest = ?session.context.digest,
            "Object spooled"
        );
        Ok(path)
    }

    /// Decode the spooled object
    pub async fn parse(&self, session: &mut StoreSession) -> ArcResult<()> {
        let path = session
            .context
            .spool_path
            .clone()
            .ok_or_else(|| ArcError::Spool("Nothing spooled".to_string()))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ArcError::Spool(format!("{}: {}", path.display(), e)))?;

        session.context.dataset = Some(self.parser.parse(&bytes)?);
        session.transition_to(StoreState::Parsed);
        Ok(())
    }

    /// Apply attribute coercion rules; rule errors leave the dataset unchanged
    ///
    /// A changed dataset is re-encoded over the spool file, so the stored
    /// bytes and their digest reflect the coerced attributes.
    pub async fn coerce(&self, session: &mut StoreSession) -> ArcResult<()> {
        if let Some(dataset) = &session.context.dataset {
            let mut coerced = dataset.clone();
            match self.coercion.coerce(&session.source_aet, &mut coerced) {
                Ok(0) => {}
                Ok(changed) => match self.parser.encode(&coerced) {
                    Ok(encoded) => {
                        tracing::debug!(session_id = %session.id, changed, "Attributes coerced");
                        session.context.dataset = Some(coerced);
                        self.write_spool(session, &encoded).await?;
                    }
                    Err(e) => tracing::warn!(
                        session_id = %session.id,
                        error = %e,
                        "Coerced dataset could not be encoded, keeping dataset unchanged"
                    ),
                },
                Err(e) => tracing::warn!(
                    session_id = %session.id,
                    source_aet = %session.source_aet,
                    error = %e,
                    "Attribute coercion failed, keeping dataset unchanged"
                ),
            }
        }
        session.transition_to(StoreState::Coerced);
        Ok(())
    }

    /// Persist subject, hierarchy, instance and primary Location in one transaction
    pub async fn persist(&self, session: &mut StoreSession) -> ArcResult<StoreOutcome> {
        let path = session
            .context
            .spool_path
            .clone()
            .ok_or_else(|| ArcError::Spool("Nothing spooled".to_string()))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ArcError::Spool(format!("{}: {}", path.display(), e)))?;

        let persisted = {
            let session: &StoreSession = session;
            let bytes: &[u8] = &bytes;
            retry_on_lock("persist", self.config.db_lock_wait_ms, move || {
                retry_on_conflict("persist", move || self.persist_once(session, bytes))
            })
            .await?
        };

        session.transition_to(StoreState::HierarchyResolved);
        session.transition_to(StoreState::Persisted);

        for location in &persisted.superseded {
            self.delete_bytes(location).await;
        }

        let outcome = persisted.outcome;
        tracing::info!(
            session_id = %session.id,
            source_aet = %session.source_aet,
            sop_iuid = %outcome.sop_iuid,
            series_iuid = %outcome.series_iuid,
            action = ?outcome.action,
            "Object persisted"
        );
        Ok(outcome)
    }

    async fn persist_once(&self, session: &StoreSession, bytes: &[u8]) -> ArcResult<Persisted> {
        let mut tx = begin_monitored(&self.pool, "persist").await?;
        let mut written = None;

        let result = match tx.conn() {
            Ok(conn) => self.persist_in_tx(conn, session, bytes, &mut written).await,
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(persisted) => tx.commit().await.map(|_| persisted),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        };

        if result.is_err() {
            if let Some(object) = written {
                if let Err(e) = self
                    .storage
                    .delete(&object.group_id, &object.system_id, &object.path)
                    .await
                {
                    tracing::warn!(path = %object.path, error = %e, "Failed to delete uncommitted object");
                }
            }
        }
        result
    }

    async fn persist_in_tx(
        &self,
        conn: &mut SqliteConnection,
        session: &StoreSession,
        bytes: &[u8],
        written: &mut Option<WrittenObject>,
    ) -> ArcResult<Persisted> {
        let dataset = session
            .context
            .dataset
            .as_ref()
            .ok_or_else(|| ArcError::Parse("Object not parsed".to_string()))?;
        let required = |kw: &str| {
            dataset
                .string(kw)
                .ok_or_else(|| ArcError::Parse(format!("missing {}", kw)))
        };
        let study_iuid = required(keyword::STUDY_INSTANCE_UID)?;
        let series_iuid = required(keyword::SERIES_INSTANCE_UID)?;
        let sop_iuid = required(keyword::SOP_INSTANCE_UID)?;

        let ae = &session.ae;
        let group = self.config.storage_group(&ae.storage_group_id).ok_or_else(|| {
            ArcError::Config(format!("Unknown storage group {}", ae.storage_group_id))
        })?;
        let system = group.write_system().ok_or_else(|| {
            ArcError::Config(format!("Storage group {} has no writable system", group.group_id))
        })?;
        let now = Utc::now();

        let subject = self
            .resolver
            .resolve(conn, &dataset.subject_demographics(), now)
            .await?;

        let (study_pk, study_subject) = match hierarchy::find_study(conn, &study_iuid).await? {
            Some(study) => {
                if study.subject_fk != subject.pk {
                    tracing::warn!(
                        study_iuid = %study_iuid,
                        study_subject = study.subject_fk,
                        resolved_subject = subject.pk,
                        "Object resolves to another subject than its study, keeping study subject"
                    );
                }
                (study.pk, study.subject_fk)
            }
            None => {
                let new_study = NewStudy {
                    study_iuid: study_iuid.clone(),
                    study_date: dataset.string(keyword::STUDY_DATE),
                    study_description: dataset.string(keyword::STUDY_DESCRIPTION),
                    accession_no: dataset.string(keyword::ACCESSION_NUMBER),
                };
                (
                    hierarchy::insert_study(conn, subject.pk, &new_study, now).await?,
                    subject.pk,
                )
            }
        };

        let series_pk = match hierarchy::find_series(conn, &series_iuid).await? {
            Some(series) => {
                if series.study_fk != study_pk {
                    tracing::warn!(
                        series_iuid = %series_iuid,
                        study_iuid = %study_iuid,
                        "Series already belongs to another study"
                    );
                }
                series.pk
            }
            None => {
                let new_series = NewSeries {
                    series_iuid: series_iuid.clone(),
                    series_number: dataset.int(keyword::SERIES_NUMBER),
                    modality: dataset.string(keyword::MODALITY),
                    source_aet: Some(session.source_aet.clone()),
                };
                let pk = hierarchy::insert_series(conn, study_pk, &new_series, now).await?;
                let request = dataset.request_attributes();
                if !request.is_empty() {
                    hierarchy::insert_request_attributes(conn, pk, &request, self.resolver.fuzzy())
                        .await?;
                }
                pk
            }
        };

        let retrieve_aets = if ae.retrieve_aets.is_empty() {
            vec![ae.ae_title.clone()]
        } else {
            ae.retrieve_aets.clone()
        };
        let new_instance = NewInstance {
            sop_iuid: sop_iuid.clone(),
            sop_cuid: dataset.string(keyword::SOP_CLASS_UID),
            instance_number: dataset.int(keyword::INSTANCE_NUMBER),
            digest: session.context.digest.clone(),
            object_size: bytes.len() as i64,
            retrieve_aets,
        };

        let (action, instance_pk, superseded, previous_series) =
            match hierarchy::find_instance(conn, &sop_iuid).await? {
                Some(existing) => {
                    match instance_exists_action(
                        existing.digest.as_deref(),
                        session.context.digest.as_deref(),
                        ae.duplicate_policy,
                    ) {
                        InstanceExistsAction::Ignore => {
                            tracing::info!(sop_iuid = %sop_iuid, "Identical object already stored, ignoring");
                            return Ok(Persisted {
                                outcome: StoreOutcome {
                                    action: StoreAction::Ignored,
                                    sop_iuid,
                                    series_iuid,
                                    study_iuid,
                                    subject_pk: study_subject,
                                    instance_pk: existing.pk,
                                    location: None,
                                },
                                superseded: Vec::new(),
                            });
                        }
                        InstanceExistsAction::Reject => {
                            return Err(ArcError::DuplicateInstance { sop_iuid });
                        }
                        InstanceExistsAction::Replace => {
                            let superseded =
                                locations::delete_locations_of_instance(conn, existing.pk).await?;
                            hierarchy::replace_instance_content(
                                conn,
                                existing.pk,
                                series_pk,
                                &new_instance,
                                now,
                            )
                            .await?;
                            let previous_series =
                                (existing.series_fk != series_pk).then_some(existing.series_fk);
                            (StoreAction::Replaced, existing.pk, superseded, previous_series)
                        }
                    }
                }
                None => (
                    StoreAction::Stored,
                    hierarchy::insert_instance(conn, series_pk, &new_instance, now).await?,
                    Vec::new(),
                    None,
                ),
            };

        let path = PathFormat::parse(&group.path_format)?.format(&PathContext {
            study_iuid: &study_iuid,
            series_iuid: &series_iuid,
            sop_iuid: &sop_iuid,
            now,
        });
        let path = write_unique(
            self.storage.as_ref(),
            &group.group_id,
            &system.system_id,
            &path,
            bytes,
            self.config.io_timeout_ms,
        )
        .await?;
        *written = Some(WrittenObject {
            group_id: group.group_id.clone(),
            system_id: system.system_id.clone(),
            path: path.clone(),
        });

        let new_location = NewLocation {
            instance_fk: instance_pk,
            group_id: group.group_id.clone(),
            system_id: system.system_id.clone(),
            storage_path: path,
            entry_name: None,
            digest: session.context.digest.clone(),
            object_size: bytes.len() as i64,
            status: LocationStatus::Stored,
        };
        let location_pk = locations::insert_location(conn, &new_location, now).await?;

        hierarchy::refresh_series_summary(conn, series_pk, now).await?;
        hierarchy::refresh_study_summary(conn, study_pk, now).await?;
        hierarchy::update_study_availability(conn, study_pk, |g| {
            self.config.storage_group(g).map(|g| g.availability)
        })
        .await?;
        subjects::refresh_num_studies(conn, study_subject, now).await?;

        // A replacement under another series leaves the old one behind
        if let Some(old_series) = previous_series {
            hierarchy::refresh_series_summary(conn, old_series, now).await?;
            if let Some(old_study) = hierarchy::study_pk_of_series(conn, old_series).await? {
                if old_study != study_pk {
                    hierarchy::refresh_study_summary(conn, old_study, now).await?;
                    hierarchy::update_study_availability(conn, old_study, |g| {
                        self.config.storage_group(g).map(|g| g.availability)
                    })
                    .await?;
                }
            }
            tracing::info!(
                sop_iuid = %sop_iuid,
                series_iuid = %series_iuid,
                "Replaced instance moved to another series"
            );
        }

        Ok(Persisted {
            outcome: StoreOutcome {
                action,
                sop_iuid,
                series_iuid,
                study_iuid,
                subject_pk: study_subject,
                instance_pk,
                location: Some(Location {
                    pk: location_pk,
                    instance_fk: new_location.instance_fk,
                    group_id: new_location.group_id,
                    system_id: new_location.system_id,
                    storage_path: new_location.storage_path,
                    entry_name: None,
                    digest: new_location.digest,
                    object_size: new_location.object_size,
                    status: new_location.status,
                    created_at: now,
                }),
            },
            superseded,
        })
    }

    async fn delete_bytes(&self, location: &Location) {
        // Packed entries stay in their container
        if location.entry_name.is_some() {
            return;
        }
        if let Err(e) = self
            .storage
            .delete(&location.group_id, &location.system_id, &location.storage_path)
            .await
        {
            tracing::warn!(
                group_id = %location.group_id,
                path = %location.storage_path,
                error = %e,
                "Failed to delete replaced object"
            );
        }
    }

    /// Deliver the "stored" signal to listeners and the event bus
    ///
    /// Listeners also see ignored re-sends, so a sender retrying after a
    /// failed delivery gets the signal through. A listener failure fails the
    /// store once lock retries are exhausted.
    pub async fn notify(&self, session: &mut StoreSession, outcome: &StoreOutcome) -> ArcResult<()> {
        let event = StoredEvent {
            series_iuid: outcome.series_iuid.clone(),
            study_iuid: outcome.study_iuid.clone(),
            sop_iuid: outcome.sop_iuid.clone(),
            source_aet: session.source_aet.clone(),
            group_id: session.ae.storage_group_id.clone(),
        };

        for listener in &self.listeners {
            retry_on_lock("store_listener", self.config.db_lock_wait_ms, || {
                listener.stored(&event)
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    series_iuid = %event.series_iuid,
                    sop_iuid = %event.sop_iuid,
                    error = %e,
                    "Store listener failed"
                );
                e
            })?;
        }

        if outcome.action != StoreAction::Ignored {
            self.event_bus.emit_lossy(ArchiveEvent::ObjectStored {
                series_uid: event.series_iuid,
                sop_instance_uid: event.sop_iuid,
                source_aet: event.source_aet,
                group_id: event.group_id,
                timestamp: Utc::now(),
            });
        }
        session.transition_to(StoreState::Notified);
        Ok(())
    }

    async fn run_session(
        &self,
        session: &mut StoreSession,
        bytes: &[u8],
    ) -> ArcResult<StoreOutcome> {
        self.spool(session, bytes).await?;
        self.parse(session).await?;
        self.coerce(session).await?;
        let outcome = self.persist(session).await?;
        self.notify(session, &outcome).await?;
        Ok(outcome)
    }

    fn rejected(&self, source_aet: &str, sop_iuid: Option<String>, err: &ArcError) {
        let category = err.category();
        tracing::warn!(
            source_aet,
            sop_iuid = ?sop_iuid,
            category = category.as_str(),
            error = %err,
            "Store rejected"
        );
        self.event_bus.emit_lossy(ArchiveEvent::StoreRejected {
            sop_instance_uid: sop_iuid,
            source_aet: source_aet.to_string(),
            category: category.as_str().to_string(),
            reason: err.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Store one object end to end
    pub async fn store(
        &self,
        source_aet: &str,
        local_aet: &str,
        bytes: &[u8],
    ) -> ArcResult<StoreOutcome> {
        let mut session = match self.create_session(source_aet, local_aet) {
            Ok(session) => session,
            Err(e) => {
                self.rejected(source_aet, None, &e);
                return Err(e);
            }
        };

        let result = self.run_session(&mut session, bytes).await;
        if let Err(e) = &result {
            session.reject();
            self.rejected(source_aet, session.sop_iuid(), e);
        }
        session.cleanup().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_digest_is_ignored_regardless_of_policy() {
        for policy in [DuplicatePolicy::Reject, DuplicatePolicy::Replace] {
            assert_eq!(
                instance_exists_action(Some("ab"), Some("ab"), policy),
                InstanceExistsAction::Ignore
            );
        }
    }

    #[test]
    fn test_differing_or_unknown_digest_follows_policy() {
        assert_eq!(
            instance_exists_action(Some("ab"), Some("cd"), DuplicatePolicy::Reject),
            InstanceExistsAction::Reject
        );
        assert_eq!(
            instance_exists_action(Some("ab"), Some("cd"), DuplicatePolicy::Replace),
            InstanceExistsAction::Replace
        );
        assert_eq!(
            instance_exists_action(None, None, DuplicatePolicy::Reject),
            InstanceExistsAction::Reject
        );
    }

    #[tokio::test]
    async fn test_digest_file_is_lowercase_hex() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("obj");
        std::fs::write(&path, b"abc").unwrap();

        let sha256 = digest_file(&path, DigestAlgorithm::Sha256).await.unwrap();
        assert_eq!(
            sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let sha512 = digest_file(&path, DigestAlgorithm::Sha512).await.unwrap();
        assert_eq!(sha512.len(), 128);
    }
}
