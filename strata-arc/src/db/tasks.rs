//! Archiving task persistence
//!
//! Claiming is a single conditional UPDATE; it is the only coordination
//! point between concurrently running schedulers.

use crate::error::ArcResult;
use crate::models::{ArchivingTask, TaskStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use strata_common::config::ArchivingAction;
use strata_common::time::{from_millis, to_millis};

const TASK_COLUMNS: &str = "pk, series_iuid, source_group_id, target_group_id, action, status, \
     earliest_eligible_at, retries, last_error, claimed_at, created_at, updated_at";

fn task_from_row(row: &SqliteRow) -> ArchivingTask {
    let action: String = row.get("action");
    let status: String = row.get("status");
    let retries: i64 = row.get("retries");
    ArchivingTask {
        pk: row.get("pk"),
        series_iuid: row.get("series_iuid"),
        source_group_id: row.get("source_group_id"),
        target_group_id: row.get("target_group_id"),
        action: ArchivingAction::parse(&action).unwrap_or_default(),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Scheduled),
        earliest_eligible_at: from_millis(row.get("earliest_eligible_at")),
        retries: u32::try_from(retries).unwrap_or(0),
        last_error: row.get("last_error"),
        claimed_at: row.get::<Option<i64>, _>("claimed_at").map(from_millis),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

/// Insert a SCHEDULED task unless one is already pending for (series, target)
///
/// Returns the new task id, or `None` when an existing SCHEDULED/PROCESSING
/// task absorbed the request.
pub async fn schedule_task(
    conn: &mut SqliteConnection,
    series_iuid: &str,
    source_group: &str,
    target_group: &str,
    action: ArchivingAction,
    earliest_eligible_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ArcResult<Option<i64>> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO archiving_tasks (
            series_iuid, source_group_id, target_group_id, action, status,
            earliest_eligible_at, retries, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, 'SCHEDULED', ?, 0, ?, ?)
        "#,
    )
    .bind(series_iuid)
    .bind(source_group)
    .bind(target_group)
    .bind(action.as_str())
    .bind(to_millis(earliest_eligible_at))
    .bind(to_millis(now))
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok((result.rows_affected() == 1).then(|| result.last_insert_rowid()))
}

pub async fn load_task(conn: &mut SqliteConnection, pk: i64) -> ArcResult<Option<ArchivingTask>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM archiving_tasks WHERE pk = ?",
        TASK_COLUMNS
    ))
    .bind(pk)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(task_from_row))
}

pub async fn tasks_of_series(
    conn: &mut SqliteConnection,
    series_iuid: &str,
) -> ArcResult<Vec<ArchivingTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM archiving_tasks WHERE series_iuid = ? ORDER BY pk",
        TASK_COLUMNS
    ))
    .bind(series_iuid)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(task_from_row).collect())
}

pub async fn all_tasks(conn: &mut SqliteConnection) -> ArcResult<Vec<ArchivingTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM archiving_tasks ORDER BY pk",
        TASK_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(task_from_row).collect())
}

/// SCHEDULED tasks whose eligibility time has passed, oldest first
pub async fn due_tasks(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    limit: u32,
) -> ArcResult<Vec<ArchivingTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM archiving_tasks \
         WHERE status = 'SCHEDULED' AND earliest_eligible_at <= ? \
         ORDER BY earliest_eligible_at, pk LIMIT ?",
        TASK_COLUMNS
    ))
    .bind(to_millis(now))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(task_from_row).collect())
}

/// Atomically move a task from SCHEDULED to PROCESSING
///
/// Returns false if another scheduler got there first.
pub async fn claim_task(
    conn: &mut SqliteConnection,
    pk: i64,
    now: DateTime<Utc>,
) -> ArcResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE archiving_tasks
        SET status = 'PROCESSING', claimed_at = ?, updated_at = ?
        WHERE pk = ? AND status = 'SCHEDULED'
        "#,
    )
    .bind(to_millis(now))
    .bind(to_millis(now))
    .bind(pk)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn finish_task(
    conn: &mut SqliteConnection,
    pk: i64,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE archiving_tasks
        SET status = 'FINISHED', last_error = NULL, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(to_millis(now))
    .bind(pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Put a failed task back in the queue with a later eligibility time
pub async fn reschedule_task(
    conn: &mut SqliteConnection,
    pk: i64,
    retries: u32,
    earliest_eligible_at: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE archiving_tasks
        SET status = 'SCHEDULED', retries = ?, earliest_eligible_at = ?, last_error = ?,
            claimed_at = NULL, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(i64::from(retries))
    .bind(to_millis(earliest_eligible_at))
    .bind(error)
    .bind(to_millis(now))
    .bind(pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fail_task(
    conn: &mut SqliteConnection,
    pk: i64,
    retries: u32,
    error: &str,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE archiving_tasks
        SET status = 'FAILED', retries = ?, last_error = ?, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(i64::from(retries))
    .bind(error)
    .bind(to_millis(now))
    .bind(pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Revert PROCESSING tasks claimed before `claimed_before` to SCHEDULED
pub async fn recover_stale_claims(
    conn: &mut SqliteConnection,
    claimed_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ArcResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE archiving_tasks
        SET status = 'SCHEDULED', claimed_at = NULL, updated_at = ?
        WHERE status = 'PROCESSING' AND claimed_at < ?
        "#,
    )
    .bind(to_millis(now))
    .bind(to_millis(claimed_before))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
