//! Archiving rule engine and scheduler integration tests
//!
//! Tasks are driven with `run_due_tasks` so that tests control the clock;
//! one test runs the polling loop itself.

mod helpers;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use helpers::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_arc::archiving::ArchivingScheduler;
use strata_arc::db::{hierarchy, locations, tasks};
use strata_arc::models::{LocationStatus, TaskStatus};
use strata_arc::storage::{
    FilesystemStorage, RetrieveService, StorageDriver, StorageError,
};
use strata_arc::ArcError;
use strata_common::config::{ArchiveConfig, ArchivingAction, Availability};
use strata_common::events::ArchiveEvent;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn with_rule(targets: &[&str], action: ArchivingAction) -> ArchiveConfig {
    let mut config = topology();
    config.archiving_rules.push(rule(targets, action));
    config
}

async fn store_series(t: &TestArchive, study: &str, series: &str, count: usize) {
    for n in 1..=count {
        let sop = format!("{}.{}", series, n);
        t.store(&encode(&object(study, series, &sop, "P1"))).await.unwrap();
    }
}

#[tokio::test]
async fn test_burst_coalesces_into_one_zip_per_series() {
    let t = setup(with_rule(&[NEARLINE_ZIP], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 3).await;
    store_series(&t, "1.1", "1.1.2", 2).await;

    let mut conn = t.conn().await;
    let scheduled = tasks::all_tasks(&mut conn).await.unwrap();
    assert_eq!(scheduled.len(), 2);
    assert!(scheduled.iter().all(|task| task.status == TaskStatus::Scheduled));
    drop(conn);

    let executed = t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap();
    assert_eq!(executed, 2);

    let mut conn = t.conn().await;
    for task in tasks::all_tasks(&mut conn).await.unwrap() {
        assert_eq!(task.status, TaskStatus::Finished);
    }

    let locs = locations::locations_of_sop(&mut conn, "1.1.1.2").await.unwrap();
    assert_eq!(locs.len(), 2);
    let archived = locs.iter().find(|l| l.group_id == NEARLINE_ZIP).unwrap();
    assert_eq!(archived.status, LocationStatus::Archived);
    assert_eq!(archived.entry_name.as_deref(), Some("1.1.1.2"));
    assert!(archived.storage_path.ends_with(".zip"));

    // Instances of one series share a container
    let sibling = locations::locations_of_sop(&mut conn, "1.1.1.3").await.unwrap();
    let sibling = sibling.iter().find(|l| l.group_id == NEARLINE_ZIP).unwrap();
    assert_eq!(sibling.storage_path, archived.storage_path);
    assert_eq!(files_under(&t.root().join("nearline_zip")).len(), 2);

    let bytes = t
        .archive
        .storage
        .read(NEARLINE_ZIP, "fs1", &archived.storage_path, Some("1.1.1.2"))
        .await
        .unwrap();
    let stored: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(stored["SOPInstanceUID"], "1.1.1.2");

    // A copy keeps the study on its best tier
    let study = hierarchy::find_study(&mut conn, "1.1").await.unwrap().unwrap();
    assert_eq!(study.availability, Availability::Online);
}

#[tokio::test]
async fn test_move_hands_over_stored_role() {
    let t = setup(with_rule(&[NEARLINE_FLAT], ArchivingAction::Move)).await;
    store_series(&t, "1.1", "1.1.1", 2).await;

    t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap();

    let mut conn = t.conn().await;
    for sop in ["1.1.1.1", "1.1.1.2"] {
        let locs = locations::locations_of_sop(&mut conn, sop).await.unwrap();
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].group_id, NEARLINE_FLAT);
        assert_eq!(locs[0].status, LocationStatus::Stored);
        assert!(t.root().join("nearline_flat").join(&locs[0].storage_path).is_file());
    }
    assert!(files_under(&t.root().join("online")).is_empty());
    assert_eq!(locations::count_instances_without_stored(&mut conn).await.unwrap(), 0);

    let study = hierarchy::find_study(&mut conn, "1.1").await.unwrap().unwrap();
    assert_eq!(study.availability, Availability::Nearline);
}

#[tokio::test]
async fn test_tar_target_carries_checksum_manifest() {
    let t = setup(with_rule(&[NEARLINE_TAR], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 2).await;

    let mut events = t.archive.event_bus.subscribe();
    t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ArchiveEvent::ArchivingTaskFinished { .. })
    })
    .await;
    if let ArchiveEvent::ArchivingTaskFinished {
        instances,
        group_id,
        ..
    } = event
    {
        assert_eq!(instances, 2);
        assert_eq!(group_id, NEARLINE_TAR);
    }

    let mut conn = t.conn().await;
    let locs = locations::locations_of_sop(&mut conn, "1.1.1.1").await.unwrap();
    let archived = locs.iter().find(|l| l.group_id == NEARLINE_TAR).unwrap();
    assert!(archived.storage_path.ends_with(".tar"));

    let manifest = t
        .archive
        .storage
        .read(NEARLINE_TAR, "fs1", &archived.storage_path, Some("SHA256SUMS"))
        .await
        .unwrap();
    let manifest = String::from_utf8(manifest).unwrap();
    let digest = archived.digest.clone().unwrap();
    assert!(manifest.contains(&format!("{}  1.1.1.1", digest)));
    assert_eq!(manifest.lines().count(), 2);
}

#[tokio::test]
async fn test_rule_delay_defers_eligibility() {
    let mut config = topology();
    let mut delayed = rule(&[NEARLINE_FLAT], ArchivingAction::Copy);
    delayed.delay_seconds = 600;
    config.archiving_rules.push(delayed);
    let t = setup(config).await;
    store_series(&t, "1.1", "1.1.1", 1).await;

    assert_eq!(t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + ChronoDuration::seconds(601);
    assert_eq!(t.archive.scheduler.run_due_tasks(later).await.unwrap(), 1);
}

#[tokio::test]
async fn test_rule_skips_group_already_holding_the_object() {
    let t = setup(with_rule(&[ONLINE, NEARLINE_FLAT], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 1).await;

    let mut conn = t.conn().await;
    let scheduled = tasks::all_tasks(&mut conn).await.unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].target_group_id, NEARLINE_FLAT);
    assert_eq!(scheduled[0].source_group_id, ONLINE);
}

#[tokio::test]
async fn test_failures_back_off_then_fail() {
    let mut config = with_rule(&[NEARLINE_FLAT], ArchivingAction::Copy);
    config.scheduler.max_retries = 1;
    config.scheduler.retry_backoff_secs = 60;
    let t = setup(config).await;
    store_series(&t, "1.1", "1.1.1", 1).await;

    // Source bytes vanish; every attempt fails
    for file in files_under(&t.root().join("online")) {
        std::fs::remove_file(file).unwrap();
    }
    let mut events = t.archive.event_bus.subscribe();

    let now = Utc::now();
    assert_eq!(t.archive.scheduler.run_due_tasks(now).await.unwrap(), 1);
    let mut conn = t.conn().await;
    let task = tasks::all_tasks(&mut conn).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(task.retries, 1);
    assert!(task.last_error.is_some());
    assert!(task.earliest_eligible_at >= now + ChronoDuration::seconds(59));
    drop(conn);

    assert_eq!(t.archive.scheduler.run_due_tasks(now).await.unwrap(), 0);

    let later = now + ChronoDuration::seconds(120);
    assert_eq!(t.archive.scheduler.run_due_tasks(later).await.unwrap(), 1);

    let mut conn = t.conn().await;
    let task = tasks::load_task(&mut conn, task.pk).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retries, 2);

    let event = wait_for_event(&mut events, |e| matches!(e, ArchiveEvent::ArchivingTaskFailed { .. })).await;
    if let ArchiveEvent::ArchivingTaskFailed { task_id, retries, .. } = event {
        assert_eq!(task_id, task.pk);
        assert_eq!(retries, 2);
    }

    let locs = locations::locations_of_sop(&mut conn, "1.1.1.1").await.unwrap();
    assert!(locs.iter().all(|l| l.group_id == ONLINE));
    assert!(files_under(&t.root().join("nearline_flat")).is_empty());

    // A failed task no longer blocks new requests for the series
    drop(conn);
    let outcome = t.store(&encode(&object("1.1", "1.1.1", "1.1.1.9", "P1"))).await.unwrap();
    let mut conn = t.conn().await;
    let series_tasks = tasks::tasks_of_series(&mut conn, &outcome.series_iuid).await.unwrap();
    assert_eq!(series_tasks.len(), 2);
}

#[tokio::test]
async fn test_claim_is_exclusive_and_stale_claims_recover() {
    let t = setup(with_rule(&[NEARLINE_FLAT], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 1).await;

    let mut conn = t.conn().await;
    let task = tasks::all_tasks(&mut conn).await.unwrap().remove(0);
    let long_ago = Utc::now() - ChronoDuration::hours(2);
    assert!(tasks::claim_task(&mut conn, task.pk, long_ago).await.unwrap());
    assert!(!tasks::claim_task(&mut conn, task.pk, long_ago).await.unwrap());
    drop(conn);

    // The abandoned claim is older than the stale threshold and gets picked up again
    assert_eq!(t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap(), 1);
    let mut conn = t.conn().await;
    let task = tasks::load_task(&mut conn, task.pk).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Finished);
}

#[tokio::test]
async fn test_fresh_claim_is_left_alone() {
    let t = setup(with_rule(&[NEARLINE_FLAT], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 1).await;

    let mut conn = t.conn().await;
    let task = tasks::all_tasks(&mut conn).await.unwrap().remove(0);
    assert!(tasks::claim_task(&mut conn, task.pk, Utc::now()).await.unwrap());
    drop(conn);

    assert_eq!(t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap(), 0);
    let mut conn = t.conn().await;
    let task = tasks::load_task(&mut conn, task.pk).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
}

/// Filesystem storage whose first source read blocks until released
struct GatedStorage {
    inner: FilesystemStorage,
    reading: Arc<Notify>,
    release: Arc<Notify>,
    gated: AtomicBool,
}

#[async_trait]
impl StorageDriver for GatedStorage {
    async fn write(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.inner.write(group_id, system_id, path, bytes).await
    }

    async fn read(
        &self,
        group_id: &str,
        system_id: &str,
        path: &str,
        entry_name: Option<&str>,
    ) -> Result<Vec<u8>, StorageError> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.reading.notify_one();
            self.release.notified().await;
        }
        self.inner.read(group_id, system_id, path, entry_name).await
    }

    async fn delete(&self, group_id: &str, system_id: &str, path: &str) -> Result<(), StorageError> {
        self.inner.delete(group_id, system_id, path).await
    }

    async fn exists(&self, group_id: &str, system_id: &str, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(group_id, system_id, path).await
    }

    fn local_root(&self, group_id: &str, system_id: &str) -> Result<PathBuf, StorageError> {
        self.inner.local_root(group_id, system_id)
    }
}

#[tokio::test]
async fn test_arrival_during_processing_gets_follow_up_task() {
    let t = setup(with_rule(&[NEARLINE_FLAT], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 1).await;

    let reading = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let storage = GatedStorage {
        inner: FilesystemStorage::new(&t.archive.config, t.root()),
        reading: Arc::clone(&reading),
        release: Arc::clone(&release),
        gated: AtomicBool::new(true),
    };
    let scheduler = Arc::new(ArchivingScheduler::new(
        t.archive.pool.clone(),
        Arc::clone(&t.archive.config),
        Arc::new(storage),
        t.archive.event_bus.clone(),
    ));

    let running = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_due_tasks(Utc::now()).await })
    };
    tokio::time::timeout(Duration::from_secs(2), reading.notified())
        .await
        .unwrap();

    // The PROCESSING task absorbs the new request
    t.store(&encode(&object("1.1", "1.1.1", "1.1.1.2", "P1"))).await.unwrap();
    let mut conn = t.conn().await;
    assert_eq!(tasks::all_tasks(&mut conn).await.unwrap().len(), 1);
    drop(conn);

    release.notify_one();
    assert_eq!(running.await.unwrap().unwrap(), 1);

    let mut conn = t.conn().await;
    let all = tasks::all_tasks(&mut conn).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].status, TaskStatus::Finished);
    assert_eq!(all[1].status, TaskStatus::Scheduled);
    drop(conn);

    scheduler.run_due_tasks(Utc::now()).await.unwrap();
    let mut conn = t.conn().await;
    let late = locations::locations_of_sop(&mut conn, "1.1.1.2").await.unwrap();
    assert!(late.iter().any(|l| l.group_id == NEARLINE_FLAT));
}

#[tokio::test]
async fn test_copy_study_schedules_every_series() {
    let t = setup(topology()).await;
    store_series(&t, "1.1", "1.1.1", 2).await;
    store_series(&t, "1.1", "1.1.2", 1).await;

    let created = t
        .archive
        .scheduler
        .copy_study("1.1", ONLINE, NEARLINE_FLAT)
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|task| task.action == ArchivingAction::Copy));

    assert_eq!(t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap(), 2);
    let mut conn = t.conn().await;
    for sop in ["1.1.1.1", "1.1.1.2", "1.1.2.1"] {
        let locs = locations::locations_of_sop(&mut conn, sop).await.unwrap();
        assert_eq!(locs.len(), 2, "{} should be on both groups", sop);
    }
}

#[tokio::test]
async fn test_move_after_copy_drops_source_and_promotes_copy() {
    let t = setup(topology()).await;
    store_series(&t, "1.1", "1.1.1", 2).await;
    let scheduler = &t.archive.scheduler;

    scheduler.copy_study("1.1", ONLINE, NEARLINE_FLAT).await.unwrap();
    assert_eq!(scheduler.run_due_tasks(Utc::now()).await.unwrap(), 1);

    // Arrives after the copy, so the move has to write it
    t.store(&encode(&object("1.1", "1.1.1", "1.1.1.3", "P1"))).await.unwrap();

    let mut events = t.archive.event_bus.subscribe();
    scheduler.move_study("1.1", ONLINE, NEARLINE_FLAT).await.unwrap();
    assert_eq!(scheduler.run_due_tasks(Utc::now()).await.unwrap(), 1);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ArchiveEvent::ArchivingTaskFinished { .. })
    })
    .await;
    if let ArchiveEvent::ArchivingTaskFinished { instances, .. } = event {
        assert_eq!(instances, 3);
    }

    let mut conn = t.conn().await;
    for sop in ["1.1.1.1", "1.1.1.2", "1.1.1.3"] {
        let locs = locations::locations_of_sop(&mut conn, sop).await.unwrap();
        assert_eq!(locs.len(), 1, "{} should only remain on the target", sop);
        assert_eq!(locs[0].group_id, NEARLINE_FLAT);
        assert_eq!(locs[0].status, LocationStatus::Stored);
    }
    assert!(files_under(&t.root().join("online")).is_empty());
    assert_eq!(files_under(&t.root().join("nearline_flat")).len(), 3);
    assert_eq!(locations::count_instances_without_stored(&mut conn).await.unwrap(), 0);

    let study = hierarchy::find_study(&mut conn, "1.1").await.unwrap().unwrap();
    assert_eq!(study.availability, Availability::Nearline);
}

#[tokio::test]
async fn test_study_operations_validate_input() {
    let t = setup(topology()).await;
    store_series(&t, "1.1", "1.1.1", 1).await;
    let scheduler = &t.archive.scheduler;

    assert!(matches!(
        scheduler.move_study("1.1", ONLINE, ONLINE).await,
        Err(ArcError::Config(_))
    ));
    assert!(matches!(
        scheduler.copy_study("1.1", ONLINE, "NOWHERE").await,
        Err(ArcError::Config(_))
    ));
    assert!(matches!(
        scheduler.copy_study("9.9", ONLINE, NEARLINE_FLAT).await,
        Err(ArcError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_retrieve_reads_container_entry_through_file_cache() {
    let t = setup(with_rule(&[NEARLINE_ZIP], ArchivingAction::Move)).await;
    store_series(&t, "1.1", "1.1.1", 1).await;
    t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap();

    let service = t.archive.retrieve_service();
    let first = service.retrieve(AE_REJECT, "1.1.1.1").await.unwrap();
    assert_eq!(first.location.group_id, NEARLINE_ZIP);
    assert_eq!(first.dataset.sop_iuid().as_deref(), Some("1.1.1.1"));
    assert_eq!(files_under(&t.root().join("cache")).len(), 1);

    // Served from the cache once the container is gone
    for file in files_under(&t.root().join("nearline_zip")) {
        std::fs::remove_file(file).unwrap();
    }
    let second = service.retrieve(AE_REJECT, "1.1.1.1").await.unwrap();
    assert_eq!(second.dataset, first.dataset);
}

#[tokio::test]
async fn test_retrieve_prefers_online_copy() {
    let t = setup(with_rule(&[NEARLINE_FLAT], ArchivingAction::Copy)).await;
    store_series(&t, "1.1", "1.1.1", 1).await;
    t.archive.scheduler.run_due_tasks(Utc::now()).await.unwrap();

    let object = t
        .archive
        .retrieve_service()
        .retrieve(AE_REJECT, "1.1.1.1")
        .await
        .unwrap();
    assert_eq!(object.location.group_id, ONLINE);
    assert_eq!(object.location.status, LocationStatus::Stored);
}

#[tokio::test]
async fn test_run_loop_archives_until_cancelled() {
    let mut config = with_rule(&[NEARLINE_FLAT], ArchivingAction::Copy);
    config.scheduler.poll_interval_ms = 20;
    let t = setup(config).await;
    let mut events = t.archive.event_bus.subscribe();

    let cancel = CancellationToken::new();
    let handle = {
        let scheduler = Arc::clone(&t.archive.scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    store_series(&t, "1.1", "1.1.1", 1).await;
    wait_for_event(&mut events, |e| matches!(e, ArchiveEvent::ArchivingTaskFinished { .. })).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
