//! Archiving scheduler
//!
//! Polls for due archiving tasks, claims them with a conditional update and
//! copies or moves the series' objects to the target storage group.
//!
//! **Per task:**
//! 1. Re-read the source Locations of every instance of the series that is
//!    still missing on the target group
//! 2. Write the bytes: one file per instance for flat groups, one container
//!    per task for zip/tar groups
//! 3. In one transaction insert the target Locations (and for a move drop
//!    the source Locations, handing the role of instances already on the
//!    target to their existing copy), then mark the task FINISHED
//! 4. On failure reschedule with exponential backoff, or mark FAILED once
//!    the retry limit is exceeded
//!
//! Several schedulers may run against the same database; the claim is the
//! only coordination between them.

use crate::db::locations::{HandoverLocation, SeriesLocation};
use crate::db::{hierarchy, locations, tasks};
use crate::error::{ArcError, ArcResult};
use crate::ingest::path_format::{PathContext, PathFormat};
use crate::models::{ArchivingTask, Location, LocationStatus, NewLocation};
use crate::storage::{with_io_timeout, write_unique, ContainerWriter, StorageDriver};
use crate::utils::{begin_monitored, retry_on_lock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use strata_common::config::{ArchiveConfig, ArchivingAction, StorageGroupConfig};
use strata_common::events::{ArchiveEvent, EventBus};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Target placement of one archived instance
struct ArchivedObject {
    source: SeriesLocation,
    storage_path: String,
    entry_name: Option<String>,
}

pub struct ArchivingScheduler {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    storage: Arc<dyn StorageDriver>,
    containers: Arc<ContainerWriter>,
    event_bus: EventBus,
}

impl ArchivingScheduler {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        storage: Arc<dyn StorageDriver>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pool,
            config,
            storage,
            containers: Arc::new(ContainerWriter::new()),
            event_bus,
        }
    }

    /// Share one container writer between schedulers of the same process
    pub fn with_container_writer(mut self, containers: Arc<ContainerWriter>) -> Self {
        self.containers = containers;
        self
    }

    /// Poll loop; returns when `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.config.scheduler.poll_interval_ms.max(1));
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(poll_interval_ms = poll.as_millis() as u64, "Archiving scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Archiving scheduler stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Archiving scheduler tick failed");
                    }
                }
            }
        }
    }

    /// Execute every task due now; returns the number of tasks executed
    pub async fn tick(&self) -> ArcResult<usize> {
        self.run_due_tasks(Utc::now()).await
    }

    pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> ArcResult<usize> {
        let scheduler = &self.config.scheduler;
        let stale_before = now - secs(scheduler.stale_claim_secs);

        let due = retry_on_lock("due_tasks", self.config.db_lock_wait_ms, || async {
            let mut conn = self.pool.acquire().await?;
            let recovered = tasks::recover_stale_claims(&mut conn, stale_before, now).await?;
            if recovered > 0 {
                tracing::warn!(recovered, "Rescheduled abandoned archiving tasks");
            }
            tasks::due_tasks(&mut conn, now, scheduler.batch_size).await
        })
        .await?;

        let mut executed = 0;
        for task in due {
            match self.claim(&task).await {
                Ok(()) => {}
                Err(ArcError::TaskClaimConflict { task_id }) => {
                    tracing::debug!(task_id, "Archiving task claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.execute(&task).await;
            executed += 1;
        }
        Ok(executed)
    }

    async fn claim(&self, task: &ArchivingTask) -> ArcResult<()> {
        let claimed = retry_on_lock("claim_task", self.config.db_lock_wait_ms, || async {
            let mut conn = self.pool.acquire().await?;
            tasks::claim_task(&mut conn, task.pk, Utc::now()).await
        })
        .await?;
        if claimed {
            Ok(())
        } else {
            Err(ArcError::TaskClaimConflict { task_id: task.pk })
        }
    }

    async fn execute(&self, task: &ArchivingTask) {
        tracing::info!(
            task_id = task.pk,
            series_iuid = %task.series_iuid,
            source_group = %task.source_group_id,
            target_group = %task.target_group_id,
            action = task.action.as_str(),
            "Executing archiving task"
        );
        if let Err(e) = self.archive(task).await {
            if let Err(db_err) = self.handle_failure(task, &e).await {
                tracing::error!(
                    task_id = task.pk,
                    error = %db_err,
                    "Failed to record archiving task failure"
                );
            }
        }
    }

    async fn archive(&self, task: &ArchivingTask) -> ArcResult<()> {
        let target = self.config.storage_group(&task.target_group_id).ok_or_else(|| {
            ArcError::Config(format!("Unknown storage group {}", task.target_group_id))
        })?;
        let system_id = target
            .write_system()
            .ok_or_else(|| {
                ArcError::Config(format!("Storage group {} has no writable system", target.group_id))
            })?
            .system_id
            .clone();

        let (study_iuid, pending, handover) = {
            let mut conn = self.pool.acquire().await?;
            let study_iuid = hierarchy::study_uid_of_series(&mut conn, &task.series_iuid)
                .await?
                .ok_or_else(|| ArcError::NotFound(format!("Series {}", task.series_iuid)))?;
            let pending = locations::series_locations_pending(
                &mut conn,
                &task.series_iuid,
                &task.source_group_id,
                &task.target_group_id,
            )
            .await?;
            let handover = match task.action {
                ArchivingAction::Move => {
                    locations::series_locations_on_both(
                        &mut conn,
                        &task.series_iuid,
                        &task.source_group_id,
                        &task.target_group_id,
                    )
                    .await?
                }
                ArchivingAction::Copy => Vec::new(),
            };
            (study_iuid, pending, handover)
        };

        let now = Utc::now();
        let archived = if pending.is_empty() {
            Vec::new()
        } else if let Some(container) = &target.container {
            let root = self.storage.local_root(&target.group_id, &system_id)?;
            let path = format!(
                "{}.{}",
                PathFormat::parse(&container.path_format)?.format(&PathContext {
                    study_iuid: &study_iuid,
                    series_iuid: &task.series_iuid,
                    sop_iuid: &pending[0].sop_iuid,
                    now,
                }),
                container.format.extension()
            );

            let mut session = self
                .containers
                .open(container.format, &root, &path, container.checksum_entry.clone())
                .await?;
            for item in &pending {
                let bytes = self.read_source(&item.location).await?;
                session.add_entry(&item.sop_iuid, bytes).await?;
            }
            let container_path = session.finalize().await?;

            pending
                .into_iter()
                .map(|source| ArchivedObject {
                    entry_name: Some(source.sop_iuid.clone()),
                    storage_path: container_path.clone(),
                    source,
                })
                .collect()
        } else {
            self.write_flat(target, &system_id, &study_iuid, task, pending, now)
                .await?
        };

        let count = (archived.len() + handover.len()) as u64;
        if let Err(e) = self.commit(task, &system_id, &archived, &handover).await {
            self.discard(&target.group_id, &system_id, &archived).await;
            return Err(e);
        }

        if task.action == ArchivingAction::Move {
            let sources = archived
                .iter()
                .map(|object| &object.source.location)
                .chain(handover.iter().map(|h| &h.source));
            for location in sources {
                self.delete_source(location).await;
            }
        }

        tracing::info!(
            task_id = task.pk,
            series_iuid = %task.series_iuid,
            target_group = %task.target_group_id,
            instances = count,
            "Archiving task finished"
        );
        self.event_bus.emit_lossy(ArchiveEvent::ArchivingTaskFinished {
            task_id: task.pk,
            group_id: task.target_group_id.clone(),
            series_uid: task.series_iuid.clone(),
            instances: count,
            timestamp: Utc::now(),
        });

        // The task is finished; a failed follow-up must not reschedule it
        if let Err(e) = self.schedule_follow_up(task).await {
            tracing::error!(task_id = task.pk, error = %e, "Failed to schedule follow-up task");
        }
        Ok(())
    }

    async fn read_source(&self, location: &Location) -> ArcResult<Vec<u8>> {
        with_io_timeout("read source object", self.config.io_timeout_ms, async {
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
        .await
    }

    /// Copy every pending object to its own path on a flat target
    async fn write_flat(
        &self,
        target: &StorageGroupConfig,
        system_id: &str,
        study_iuid: &str,
        task: &ArchivingTask,
        pending: Vec<SeriesLocation>,
        now: DateTime<Utc>,
    ) -> ArcResult<Vec<ArchivedObject>> {
        let format = PathFormat::parse(&target.path_format)?;
        let mut archived = Vec::with_capacity(pending.len());

        for source in pending {
            let written = async {
                let bytes = self.read_source(&source.location).await?;
                let path = format.format(&PathContext {
                    study_iuid,
                    series_iuid: &task.series_iuid,
                    sop_iuid: &source.sop_iuid,
                    now,
                });
                write_unique(
                    self.storage.as_ref(),
                    &target.group_id,
                    system_id,
                    &path,
                    &bytes,
                    self.config.io_timeout_ms,
                )
                .await
            }
            .await;

            match written {
                Ok(storage_path) => archived.push(ArchivedObject {
                    source,
                    storage_path,
                    entry_name: None,
                }),
                Err(e) => {
                    self.discard(&target.group_id, system_id, &archived).await;
                    return Err(e);
                }
            }
        }
        Ok(archived)
    }

    /// Record target Locations and finish the task in one transaction
    async fn commit(
        &self,
        task: &ArchivingTask,
        system_id: &str,
        archived: &[ArchivedObject],
        handover: &[HandoverLocation],
    ) -> ArcResult<()> {
        retry_on_lock("archive_commit", self.config.db_lock_wait_ms, || async {
            let now = Utc::now();
            let mut tx = begin_monitored(&self.pool, "archive_commit").await?;
            let conn = tx.conn()?;

            for object in archived {
                let source = &object.source.location;
                let status = match task.action {
                    ArchivingAction::Copy => LocationStatus::Archived,
                    // The authoritative role moves with the bytes
                    ArchivingAction::Move => source.status,
                };
                locations::insert_location(
                    conn,
                    &NewLocation {
                        instance_fk: source.instance_fk,
                        group_id: task.target_group_id.clone(),
                        system_id: system_id.to_string(),
                        storage_path: object.storage_path.clone(),
                        entry_name: object.entry_name.clone(),
                        digest: source.digest.clone(),
                        object_size: source.object_size,
                        status,
                    },
                    now,
                )
                .await?;
                if task.action == ArchivingAction::Move {
                    locations::delete_location(conn, source.pk).await?;
                }
            }

            // Instances already copied to the target: the existing copy takes the role
            for h in handover {
                if h.source.status == LocationStatus::Stored {
                    locations::set_location_status(conn, h.target_pk, LocationStatus::Stored)
                        .await?;
                }
                locations::delete_location(conn, h.source.pk).await?;
            }

            if let Some(study_iuid) = hierarchy::study_uid_of_series(conn, &task.series_iuid).await? {
                if let Some(study) = hierarchy::find_study(conn, &study_iuid).await? {
                    hierarchy::update_study_availability(conn, study.pk, |g| {
                        self.config.storage_group(g).map(|g| g.availability)
                    })
                    .await?;
                }
            }
            tasks::finish_task(conn, task.pk, now).await?;
            tx.commit().await
        })
        .await
    }

    /// Remove target bytes written by an attempt that did not commit
    async fn discard(&self, group_id: &str, system_id: &str, archived: &[ArchivedObject]) {
        let mut paths: Vec<&str> = archived.iter().map(|a| a.storage_path.as_str()).collect();
        paths.dedup();
        for path in paths {
            if let Err(e) = self.storage.delete(group_id, system_id, path).await {
                tracing::warn!(group_id, path, error = %e, "Failed to remove uncommitted archive object");
            }
        }
    }

    async fn delete_source(&self, location: &Location) {
        // Other entries of a source container may still be referenced
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
                "Failed to delete moved source object"
            );
        }
    }

    /// Schedule another task if instances arrived while this one was processing
    async fn schedule_follow_up(&self, task: &ArchivingTask) -> ArcResult<()> {
        let now = Utc::now();
        let created = retry_on_lock("follow_up_task", self.config.db_lock_wait_ms, || async {
            let mut conn = self.pool.acquire().await?;
            let missing = locations::count_missing_on_group(
                &mut conn,
                &task.series_iuid,
                &task.source_group_id,
                &task.target_group_id,
            )
            .await?;
            if missing == 0 {
                return Ok(None);
            }
            tasks::schedule_task(
                &mut conn,
                &task.series_iuid,
                &task.source_group_id,
                &task.target_group_id,
                task.action,
                now,
                now,
            )
            .await
        })
        .await?;

        if let Some(task_id) = created {
            tracing::info!(
                task_id,
                previous_task_id = task.pk,
                series_iuid = %task.series_iuid,
                "Scheduled follow-up archiving task for late arrivals"
            );
            self.event_bus.emit_lossy(ArchiveEvent::ArchivingTaskScheduled {
                task_id,
                series_uid: task.series_iuid.clone(),
                group_id: task.target_group_id.clone(),
                earliest_eligible_at: now,
                timestamp: now,
            });
        }
        Ok(())
    }

    async fn handle_failure(&self, task: &ArchivingTask, error: &ArcError) -> ArcResult<()> {
        let scheduler = &self.config.scheduler;
        let retries = task.retries + 1;
        let message = error.to_string();
        let now = Utc::now();

        if retries > scheduler.max_retries {
            retry_on_lock("fail_task", self.config.db_lock_wait_ms, || async {
                let mut conn = self.pool.acquire().await?;
                tasks::fail_task(&mut conn, task.pk, retries, &message, now).await
            })
            .await?;

            let exhausted = ArcError::TaskRetryExhausted {
                task_id: task.pk,
                retries,
                last_error: message.clone(),
            };
            tracing::error!(
                task_id = task.pk,
                series_iuid = %task.series_iuid,
                target_group = %task.target_group_id,
                error = %exhausted,
                "Archiving task failed"
            );
            self.event_bus.emit_lossy(ArchiveEvent::ArchivingTaskFailed {
                task_id: task.pk,
                group_id: task.target_group_id.clone(),
                series_uid: task.series_iuid.clone(),
                retries,
                error: message,
                timestamp: now,
            });
        } else {
            let delay = backoff_secs(scheduler.retry_backoff_secs, scheduler.max_backoff_secs, retries);
            let earliest = now + secs(delay);
            retry_on_lock("reschedule_task", self.config.db_lock_wait_ms, || async {
                let mut conn = self.pool.acquire().await?;
                tasks::reschedule_task(&mut conn, task.pk, retries, earliest, &message, now).await
            })
            .await?;

            tracing::warn!(
                task_id = task.pk,
                series_iuid = %task.series_iuid,
                retries,
                retry_in_secs = delay,
                error = %message,
                "Archiving task failed, rescheduled"
            );
        }
        Ok(())
    }

    /// Schedule an immediately eligible copy of every series of a study
    pub async fn copy_study(
        &self,
        study_iuid: &str,
        source_group: &str,
        target_group: &str,
    ) -> ArcResult<Vec<ArchivingTask>> {
        self.schedule_study(study_iuid, source_group, target_group, ArchivingAction::Copy)
            .await
    }

    /// Schedule an immediately eligible move of every series of a study
    pub async fn move_study(
        &self,
        study_iuid: &str,
        source_group: &str,
        target_group: &str,
    ) -> ArcResult<Vec<ArchivingTask>> {
        self.schedule_study(study_iuid, source_group, target_group, ArchivingAction::Move)
            .await
    }

    async fn schedule_study(
        &self,
        study_iuid: &str,
        source_group: &str,
        target_group: &str,
        action: ArchivingAction,
    ) -> ArcResult<Vec<ArchivingTask>> {
        for group in [source_group, target_group] {
            if self.config.storage_group(group).is_none() {
                return Err(ArcError::Config(format!("Unknown storage group {}", group)));
            }
        }
        if source_group == target_group {
            return Err(ArcError::Config(format!(
                "Source and target storage group are both {}",
                source_group
            )));
        }

        let now = Utc::now();
        let created = retry_on_lock("schedule_study", self.config.db_lock_wait_ms, || async {
            let mut tx = begin_monitored(&self.pool, "schedule_study").await?;
            let conn = tx.conn()?;
            let series = hierarchy::series_uids_of_study(conn, study_iuid).await?;
            if series.is_empty() {
                return Err(ArcError::NotFound(format!("Study {}", study_iuid)));
            }
            let mut created = Vec::new();
            for series_iuid in &series {
                if let Some(pk) = tasks::schedule_task(
                    conn,
                    series_iuid,
                    source_group,
                    target_group,
                    action,
                    now,
                    now,
                )
                .await?
                {
                    if let Some(task) = tasks::load_task(conn, pk).await? {
                        created.push(task);
                    }
                }
            }
            tx.commit().await?;
            Ok(created)
        })
        .await?;

        for task in &created {
            self.event_bus.emit_lossy(ArchiveEvent::ArchivingTaskScheduled {
                task_id: task.pk,
                series_uid: task.series_iuid.clone(),
                group_id: task.target_group_id.clone(),
                earliest_eligible_at: task.earliest_eligible_at,
                timestamp: now,
            });
        }
        tracing::info!(
            study_iuid,
            source_group,
            target_group,
            action = action.as_str(),
            tasks = created.len(),
            "Study archiving scheduled"
        );
        Ok(created)
    }
}

/// Longest honored delay (ten years)
const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 3600;

fn secs(s: u64) -> ChronoDuration {
    ChronoDuration::seconds(s.min(MAX_DELAY_SECS) as i64)
}

/// `base * 2^(retries - 1)`, capped at `max`
pub fn backoff_secs(base: u64, max: u64, retries: u32) -> u64 {
    let exponent = retries.saturating_sub(1).min(63);
    base.saturating_mul(1u64 << exponent).min(max)
}
