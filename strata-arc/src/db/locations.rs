//! Location persistence

use crate::error::ArcResult;
use crate::models::{Location, LocationStatus, NewLocation};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use strata_common::time::{from_millis, to_millis};

const LOCATION_COLUMNS: &str = "l.pk, l.instance_fk, l.group_id, l.system_id, l.storage_path, \
     l.entry_name, l.digest, l.object_size, l.status, l.created_at";

fn location_from_row(row: &SqliteRow) -> Location {
    let status: String = row.get("status");
    Location {
        pk: row.get("pk"),
        instance_fk: row.get("instance_fk"),
        group_id: row.get("group_id"),
        system_id: row.get("system_id"),
        storage_path: row.get("storage_path"),
        entry_name: row.get("entry_name"),
        digest: row.get("digest"),
        object_size: row.get("object_size"),
        status: LocationStatus::parse(&status).unwrap_or(LocationStatus::Stored),
        created_at: from_millis(row.get("created_at")),
    }
}

/// Source Location of one instance to be archived
#[derive(Debug, Clone)]
pub struct SeriesLocation {
    pub sop_iuid: String,
    pub location: Location,
}

pub async fn insert_location(
    conn: &mut SqliteConnection,
    location: &NewLocation,
    now: DateTime<Utc>,
) -> ArcResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO locations (instance_fk, group_id, system_id, storage_path, entry_name,
                               digest, object_size, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(location.instance_fk)
    .bind(&location.group_id)
    .bind(&location.system_id)
    .bind(&location.storage_path)
    .bind(&location.entry_name)
    .bind(&location.digest)
    .bind(location.object_size)
    .bind(location.status.as_str())
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn locations_of_instance(
    conn: &mut SqliteConnection,
    instance_pk: i64,
) -> ArcResult<Vec<Location>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM locations l WHERE l.instance_fk = ? ORDER BY l.pk",
        LOCATION_COLUMNS
    ))
    .bind(instance_pk)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(location_from_row).collect())
}

pub async fn locations_of_sop(
    conn: &mut SqliteConnection,
    sop_iuid: &str,
) -> ArcResult<Vec<Location>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM locations l JOIN instances i ON i.pk = l.instance_fk \
         WHERE i.sop_iuid = ? ORDER BY l.pk",
        LOCATION_COLUMNS
    ))
    .bind(sop_iuid)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(location_from_row).collect())
}

/// Delete all Locations of an instance, returning them for byte cleanup
pub async fn delete_locations_of_instance(
    conn: &mut SqliteConnection,
    instance_pk: i64,
) -> ArcResult<Vec<Location>> {
    let existing = locations_of_instance(conn, instance_pk).await?;
    sqlx::query("DELETE FROM locations WHERE instance_fk = ?")
        .bind(instance_pk)
        .execute(&mut *conn)
        .await?;
    Ok(existing)
}

pub async fn delete_location(conn: &mut SqliteConnection, pk: i64) -> ArcResult<()> {
    sqlx::query("DELETE FROM locations WHERE pk = ?")
        .bind(pk)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Locations on `source_group` of series instances that have none on `target_group`
///
/// Returns one Location per instance (the oldest on the source group). Read
/// at task execution time, so instances stored after the task was scheduled
/// are included.
pub async fn series_locations_pending(
    conn: &mut SqliteConnection,
    series_iuid: &str,
    source_group: &str,
    target_group: &str,
) -> ArcResult<Vec<SeriesLocation>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}, i.sop_iuid
        FROM locations l
        JOIN instances i ON i.pk = l.instance_fk
        JOIN series s ON s.pk = i.series_fk
        WHERE s.series_iuid = ?1 AND i.deleted = 0 AND l.group_id = ?2
          AND l.pk = (
              SELECT MIN(l2.pk) FROM locations l2
              WHERE l2.instance_fk = i.pk AND l2.group_id = ?2
          )
          AND NOT EXISTS (
              SELECT 1 FROM locations t WHERE t.instance_fk = i.pk AND t.group_id = ?3
          )
        ORDER BY i.pk
        "#,
        LOCATION_COLUMNS
    ))
    .bind(series_iuid)
    .bind(source_group)
    .bind(target_group)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SeriesLocation {
            sop_iuid: row.get("sop_iuid"),
            location: location_from_row(row),
        })
        .collect())
}

/// Source Location of an instance that already has a copy on the target group
#[derive(Debug, Clone)]
pub struct HandoverLocation {
    pub source: Location,
    /// Oldest Location of the instance on the target group
    pub target_pk: i64,
}

/// Locations on `source_group` of series instances that already have one on `target_group`
///
/// A move of such an instance writes nothing; the existing target Location
/// takes over and the source is dropped.
pub async fn series_locations_on_both(
    conn: &mut SqliteConnection,
    series_iuid: &str,
    source_group: &str,
    target_group: &str,
) -> ArcResult<Vec<HandoverLocation>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}, (
              SELECT MIN(t.pk) FROM locations t
              WHERE t.instance_fk = i.pk AND t.group_id = ?3
          ) AS target_pk
        FROM locations l
        JOIN instances i ON i.pk = l.instance_fk
        JOIN series s ON s.pk = i.series_fk
        WHERE s.series_iuid = ?1 AND i.deleted = 0 AND l.group_id = ?2
          AND l.pk = (
              SELECT MIN(l2.pk) FROM locations l2
              WHERE l2.instance_fk = i.pk AND l2.group_id = ?2
          )
          AND EXISTS (
              SELECT 1 FROM locations t WHERE t.instance_fk = i.pk AND t.group_id = ?3
          )
        ORDER BY i.pk
        "#,
        LOCATION_COLUMNS
    ))
    .bind(series_iuid)
    .bind(source_group)
    .bind(target_group)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| HandoverLocation {
            source: location_from_row(row),
            target_pk: row.get("target_pk"),
        })
        .collect())
}

pub async fn set_location_status(
    conn: &mut SqliteConnection,
    pk: i64,
    status: LocationStatus,
) -> ArcResult<()> {
    sqlx::query("UPDATE locations SET status = ? WHERE pk = ?")
        .bind(status.as_str())
        .bind(pk)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Series instances on `source_group` that still have no Location on `target_group`
pub async fn count_missing_on_group(
    conn: &mut SqliteConnection,
    series_iuid: &str,
    source_group: &str,
    target_group: &str,
) -> ArcResult<i64> {
    let count = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM instances i
        JOIN series s ON s.pk = i.series_fk
        WHERE s.series_iuid = ?1 AND i.deleted = 0
          AND EXISTS (
              SELECT 1 FROM locations l WHERE l.instance_fk = i.pk AND l.group_id = ?2
          )
          AND NOT EXISTS (
              SELECT 1 FROM locations t WHERE t.instance_fk = i.pk AND t.group_id = ?3
          )
        "#,
    )
    .bind(series_iuid)
    .bind(source_group)
    .bind(target_group)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Non-deleted instances without a `STORED` Location
pub async fn count_instances_without_stored(conn: &mut SqliteConnection) -> ArcResult<i64> {
    let count = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM instances i
        WHERE i.deleted = 0
          AND NOT EXISTS (
              SELECT 1 FROM locations l WHERE l.instance_fk = i.pk AND l.status = 'STORED'
          )
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}
