//! Archiving rule engine
//!
//! Turns "stored" signals into archiving tasks. A pending task for the same
//! (series, target group) absorbs the request, so a burst of stores into one
//! series yields a single task. A signal for a series with nothing left to
//! archive on the target schedules nothing, so redelivery is harmless.

use crate::db::{locations, tasks};
use crate::error::ArcResult;
use crate::ingest::{StoreListener, StoredEvent};
use crate::models::ArchivingTask;
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use strata_common::config::ArchiveConfig;
use strata_common::events::{ArchiveEvent, EventBus};

/// Longest honored debounce delay (one year)
const MAX_DELAY_SECS: u64 = 365 * 24 * 3600;

pub struct ArchivingRuleEngine {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    event_bus: EventBus,
}

impl ArchivingRuleEngine {
    pub fn new(pool: SqlitePool, config: Arc<ArchiveConfig>, event_bus: EventBus) -> Self {
        Self {
            pool,
            config,
            event_bus,
        }
    }

    /// Schedule tasks for every matching rule and target group
    ///
    /// Returns the tasks created by this call; requests absorbed by an
    /// already pending task are not returned.
    pub async fn on_stored(&self, event: &StoredEvent) -> ArcResult<Vec<ArchivingTask>> {
        let now = Utc::now();
        let mut created = Vec::new();

        for rule in self
            .config
            .archiving_rules
            .iter()
            .filter(|r| r.matches_source(&event.source_aet))
        {
            let earliest = now + Duration::seconds(rule.delay_seconds.min(MAX_DELAY_SECS) as i64);

            for target in &rule.storage_group_ids {
                // Already there
                if *target == event.group_id {
                    continue;
                }
                let task = retry_on_lock("schedule_task", self.config.db_lock_wait_ms, || async {
                    let mut conn = self.pool.acquire().await?;
                    // Redelivered signal for a series already archived there
                    let missing = locations::count_missing_on_group(
                        &mut conn,
                        &event.series_iuid,
                        &event.group_id,
                        target,
                    )
                    .await?;
                    if missing == 0 {
                        return Ok(None);
                    }
                    let Some(pk) = tasks::schedule_task(
                        &mut conn,
                        &event.series_iuid,
                        &event.group_id,
                        target,
                        rule.action,
                        earliest,
                        now,
                    )
                    .await?
                    else {
                        return Ok(None);
                    };
                    tasks::load_task(&mut conn, pk).await
                })
                .await?;

                if let Some(task) = task {
                    tracing::info!(
                        task_id = task.pk,
                        series_iuid = %task.series_iuid,
                        target_group = %task.target_group_id,
                        action = task.action.as_str(),
                        earliest_eligible_at = %task.earliest_eligible_at,
                        "Archiving task scheduled"
                    );
                    self.event_bus.emit_lossy(ArchiveEvent::ArchivingTaskScheduled {
                        task_id: task.pk,
                        series_uid: task.series_iuid.clone(),
                        group_id: task.target_group_id.clone(),
                        earliest_eligible_at: task.earliest_eligible_at,
                        timestamp: now,
                    });
                    created.push(task);
                } else {
                    tracing::debug!(
                        series_iuid = %event.series_iuid,
                        target_group = %target,
                        "Store absorbed by a pending task or already archived"
                    );
                }
            }
        }
        Ok(created)
    }
}

#[async_trait]
impl StoreListener for ArchivingRuleEngine {
    async fn stored(&self, event: &StoredEvent) -> ArcResult<()> {
        self.on_stored(event).await.map(|_| ())
    }
}
