//! Study / Series / Instance persistence
//!
//! Summary columns are recomputed from the child rows (never incremented) so
//! repeated stores and merges cannot make them drift.

use crate::error::ArcResult;
use crate::identity::FuzzyStr;
use crate::models::{split_values, union_values, Instance, RequestAttributes, Series, Study};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use strata_common::config::Availability;
use strata_common::time::{from_millis, to_millis};

/// Study columns written on creation
#[derive(Debug, Clone, Default)]
pub struct NewStudy {
    pub study_iuid: String,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub accession_no: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSeries {
    pub series_iuid: String,
    pub series_number: Option<i64>,
    pub modality: Option<String>,
    pub source_aet: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub sop_iuid: String,
    pub sop_cuid: Option<String>,
    pub instance_number: Option<i64>,
    pub digest: Option<String>,
    pub object_size: i64,
    pub retrieve_aets: Vec<String>,
}

const STUDY_COLUMNS: &str = "pk, subject_fk, study_iuid, study_date, study_description, \
     accession_no, num_series, num_instances, modalities, sop_classes, retrieve_aets, \
     availability, created_at, updated_at";

const SERIES_COLUMNS: &str = "pk, study_fk, series_iuid, series_number, modality, source_aet, \
     num_instances, sop_classes, retrieve_aets, created_at, updated_at";

const INSTANCE_COLUMNS: &str = "pk, series_fk, sop_iuid, sop_cuid, instance_number, digest, \
     object_size, retrieve_aets, deleted, created_at";

fn study_from_row(row: &SqliteRow) -> Study {
    let availability: String = row.get("availability");
    Study {
        pk: row.get("pk"),
        subject_fk: row.get("subject_fk"),
        study_iuid: row.get("study_iuid"),
        study_date: row.get("study_date"),
        study_description: row.get("study_description"),
        accession_no: row.get("accession_no"),
        num_series: row.get("num_series"),
        num_instances: row.get("num_instances"),
        modalities: split_values(row.get("modalities")),
        sop_classes: split_values(row.get("sop_classes")),
        retrieve_aets: split_values(row.get("retrieve_aets")),
        availability: Availability::parse(&availability).unwrap_or(Availability::Online),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn series_from_row(row: &SqliteRow) -> Series {
    Series {
        pk: row.get("pk"),
        study_fk: row.get("study_fk"),
        series_iuid: row.get("series_iuid"),
        series_number: row.get("series_number"),
        modality: row.get("modality"),
        source_aet: row.get("source_aet"),
        num_instances: row.get("num_instances"),
        sop_classes: split_values(row.get("sop_classes")),
        retrieve_aets: split_values(row.get("retrieve_aets")),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn instance_from_row(row: &SqliteRow) -> Instance {
    Instance {
        pk: row.get("pk"),
        series_fk: row.get("series_fk"),
        sop_iuid: row.get("sop_iuid"),
        sop_cuid: row.get("sop_cuid"),
        instance_number: row.get("instance_number"),
        digest: row.get("digest"),
        object_size: row.get("object_size"),
        retrieve_aets: split_values(row.get("retrieve_aets")),
        deleted: row.get("deleted"),
        created_at: from_millis(row.get("created_at")),
    }
}

// ---- Study ----

pub async fn find_study(conn: &mut SqliteConnection, study_iuid: &str) -> ArcResult<Option<Study>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM studies WHERE study_iuid = ?",
        STUDY_COLUMNS
    ))
    .bind(study_iuid)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(study_from_row))
}

pub async fn load_study(conn: &mut SqliteConnection, pk: i64) -> ArcResult<Option<Study>> {
    let row = sqlx::query(&format!("SELECT {} FROM studies WHERE pk = ?", STUDY_COLUMNS))
        .bind(pk)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(study_from_row))
}

pub async fn studies_of_subject(
    conn: &mut SqliteConnection,
    subject_pk: i64,
) -> ArcResult<Vec<Study>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM studies WHERE subject_fk = ? ORDER BY pk",
        STUDY_COLUMNS
    ))
    .bind(subject_pk)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(study_from_row).collect())
}

pub async fn insert_study(
    conn: &mut SqliteConnection,
    subject_pk: i64,
    study: &NewStudy,
    now: DateTime<Utc>,
) -> ArcResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO studies (subject_fk, study_iuid, study_date, study_description, accession_no,
                             created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(subject_pk)
    .bind(&study.study_iuid)
    .bind(&study.study_date)
    .bind(&study.study_description)
    .bind(&study.accession_no)
    .bind(to_millis(now))
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Re-parent all studies of one subject; returns the number moved
pub async fn move_studies(
    conn: &mut SqliteConnection,
    from_subject: i64,
    to_subject: i64,
    now: DateTime<Utc>,
) -> ArcResult<u64> {
    let result = sqlx::query("UPDATE studies SET subject_fk = ?, updated_at = ? WHERE subject_fk = ?")
        .bind(to_subject)
        .bind(to_millis(now))
        .bind(from_subject)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Recompute study summaries from its series and instances
pub async fn refresh_study_summary(
    conn: &mut SqliteConnection,
    study_pk: i64,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    let series_rows = sqlx::query(
        "SELECT modality, retrieve_aets, sop_classes FROM series WHERE study_fk = ?",
    )
    .bind(study_pk)
    .fetch_all(&mut *conn)
    .await?;

    let mut modalities = String::new();
    let mut retrieve_aets = String::new();
    let mut sop_classes = String::new();
    for row in &series_rows {
        let modality: Option<String> = row.get("modality");
        modalities = union_values(&modalities, modality.as_deref());
        let aets: String = row.get("retrieve_aets");
        retrieve_aets = union_values(&retrieve_aets, aets.split('\\'));
        let classes: String = row.get("sop_classes");
        sop_classes = union_values(&sop_classes, classes.split('\\'));
    }

    sqlx::query(
        r#"
        UPDATE studies
        SET num_series = (SELECT COUNT(*) FROM series WHERE study_fk = ?1),
            num_instances = (
                SELECT COUNT(*) FROM instances i JOIN series s ON s.pk = i.series_fk
                WHERE s.study_fk = ?1 AND i.deleted = 0
            ),
            modalities = ?2, sop_classes = ?3, retrieve_aets = ?4, updated_at = ?5
        WHERE pk = ?1
        "#,
    )
    .bind(study_pk)
    .bind(modalities)
    .bind(sop_classes)
    .bind(retrieve_aets)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Storage groups holding any Location of the study's instances
pub async fn study_location_groups(
    conn: &mut SqliteConnection,
    study_pk: i64,
) -> ArcResult<Vec<String>> {
    let groups = sqlx::query_scalar(
        r#"
        SELECT DISTINCT l.group_id
        FROM locations l
        JOIN instances i ON i.pk = l.instance_fk
        JOIN series s ON s.pk = i.series_fk
        WHERE s.study_fk = ? AND i.deleted = 0
        ORDER BY l.group_id
        "#,
    )
    .bind(study_pk)
    .fetch_all(&mut *conn)
    .await?;
    Ok(groups)
}

pub async fn set_study_availability(
    conn: &mut SqliteConnection,
    study_pk: i64,
    availability: Availability,
) -> ArcResult<()> {
    sqlx::query("UPDATE studies SET availability = ? WHERE pk = ?")
        .bind(availability.as_str())
        .bind(study_pk)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Set the study availability to the best tier holding any of its Locations
///
/// Groups unknown to `tier_of` are skipped. Returns the new availability, or
/// `None` if the study has no Location on a known group.
pub async fn update_study_availability(
    conn: &mut SqliteConnection,
    study_pk: i64,
    tier_of: impl Fn(&str) -> Option<Availability>,
) -> ArcResult<Option<Availability>> {
    let best = study_location_groups(conn, study_pk)
        .await?
        .iter()
        .filter_map(|g| tier_of(g))
        .min();
    if let Some(availability) = best {
        set_study_availability(conn, study_pk, availability).await?;
    }
    Ok(best)
}

// ---- Series ----

pub async fn find_series(
    conn: &mut SqliteConnection,
    series_iuid: &str,
) -> ArcResult<Option<Series>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM series WHERE series_iuid = ?",
        SERIES_COLUMNS
    ))
    .bind(series_iuid)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(series_from_row))
}

/// Series UIDs of a study, in creation order
pub async fn series_uids_of_study(
    conn: &mut SqliteConnection,
    study_iuid: &str,
) -> ArcResult<Vec<String>> {
    let uids = sqlx::query_scalar(
        r#"
        SELECT s.series_iuid FROM series s JOIN studies st ON st.pk = s.study_fk
        WHERE st.study_iuid = ?
        ORDER BY s.pk
        "#,
    )
    .bind(study_iuid)
    .fetch_all(&mut *conn)
    .await?;
    Ok(uids)
}

/// Study UID owning a series
pub async fn study_uid_of_series(
    conn: &mut SqliteConnection,
    series_iuid: &str,
) -> ArcResult<Option<String>> {
    let uid = sqlx::query_scalar(
        r#"
        SELECT st.study_iuid FROM series s JOIN studies st ON st.pk = s.study_fk
        WHERE s.series_iuid = ?
        "#,
    )
    .bind(series_iuid)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(uid)
}

pub async fn insert_series(
    conn: &mut SqliteConnection,
    study_pk: i64,
    series: &NewSeries,
    now: DateTime<Utc>,
) -> ArcResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO series (study_fk, series_iuid, series_number, modality, source_aet,
                            created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(study_pk)
    .bind(&series.series_iuid)
    .bind(series.series_number)
    .bind(&series.modality)
    .bind(&series.source_aet)
    .bind(to_millis(now))
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn study_pk_of_series(
    conn: &mut SqliteConnection,
    series_pk: i64,
) -> ArcResult<Option<i64>> {
    let pk = sqlx::query_scalar("SELECT study_fk FROM series WHERE pk = ?")
        .bind(series_pk)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(pk)
}

/// Recompute series summaries from its non-deleted instances
pub async fn refresh_series_summary(
    conn: &mut SqliteConnection,
    series_pk: i64,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    let rows = sqlx::query(
        "SELECT sop_cuid, retrieve_aets FROM instances WHERE series_fk = ? AND deleted = 0",
    )
    .bind(series_pk)
    .fetch_all(&mut *conn)
    .await?;

    let mut sop_classes = String::new();
    let mut retrieve_aets = String::new();
    for row in &rows {
        let cuid: Option<String> = row.get("sop_cuid");
        sop_classes = union_values(&sop_classes, cuid.as_deref());
        let aets: String = row.get("retrieve_aets");
        retrieve_aets = union_values(&retrieve_aets, aets.split('\\'));
    }

    sqlx::query(
        r#"
        UPDATE series
        SET num_instances = ?, sop_classes = ?, retrieve_aets = ?, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(rows.len() as i64)
    .bind(sop_classes)
    .bind(retrieve_aets)
    .bind(to_millis(now))
    .bind(series_pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Persist request attributes of a newly created series
pub async fn insert_request_attributes(
    conn: &mut SqliteConnection,
    series_pk: i64,
    request: &RequestAttributes,
    fuzzy: &dyn FuzzyStr,
) -> ArcResult<()> {
    let issuer = request.accession_issuer.clone().unwrap_or_default();
    let physician = &request.requesting_physician;
    let family_fuzzy = physician.family.as_deref().map(|f| fuzzy.to_fuzzy(f));
    let given_fuzzy = physician.given.as_deref().map(|g| fuzzy.to_fuzzy(g));

    sqlx::query(
        r#"
        INSERT INTO series_requests (
            series_fk, accession_no, accession_issuer_local, accession_issuer_universal,
            accession_issuer_universal_type, requested_procedure_id, scheduled_procedure_step_id,
            requesting_service, requesting_physician, requesting_physician_ideographic,
            requesting_physician_phonetic, requesting_physician_family_fuzzy,
            requesting_physician_given_fuzzy
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(series_pk)
    .bind(&request.accession_no)
    .bind(&issuer.local_namespace)
    .bind(&issuer.universal_id)
    .bind(&issuer.universal_id_type)
    .bind(&request.requested_procedure_id)
    .bind(&request.scheduled_procedure_step_id)
    .bind(&request.requesting_service)
    .bind(physician.alphabetic())
    .bind(&physician.ideographic)
    .bind(&physician.phonetic)
    .bind(family_fuzzy)
    .bind(given_fuzzy)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---- Instance ----

pub async fn find_instance(
    conn: &mut SqliteConnection,
    sop_iuid: &str,
) -> ArcResult<Option<Instance>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM instances WHERE sop_iuid = ?",
        INSTANCE_COLUMNS
    ))
    .bind(sop_iuid)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(instance_from_row))
}

pub async fn insert_instance(
    conn: &mut SqliteConnection,
    series_pk: i64,
    instance: &NewInstance,
    now: DateTime<Utc>,
) -> ArcResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO instances (series_fk, sop_iuid, sop_cuid, instance_number, digest,
                               object_size, retrieve_aets, deleted, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(series_pk)
    .bind(&instance.sop_iuid)
    .bind(&instance.sop_cuid)
    .bind(instance.instance_number)
    .bind(&instance.digest)
    .bind(instance.object_size)
    .bind(union_values("", instance.retrieve_aets.iter().map(String::as_str)))
    .bind(to_millis(now))
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Overwrite content attributes of a replaced instance
///
/// The instance moves to `series_pk` if the replacement names another series.
pub async fn replace_instance_content(
    conn: &mut SqliteConnection,
    instance_pk: i64,
    series_pk: i64,
    instance: &NewInstance,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE instances
        SET series_fk = ?, sop_cuid = ?, instance_number = ?, digest = ?, object_size = ?,
            retrieve_aets = ?, deleted = 0, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(series_pk)
    .bind(&instance.sop_cuid)
    .bind(instance.instance_number)
    .bind(&instance.digest)
    .bind(instance.object_size)
    .bind(union_values("", instance.retrieve_aets.iter().map(String::as_str)))
    .bind(to_millis(now))
    .bind(instance_pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Non-deleted instances of a series
pub async fn instances_of_series(
    conn: &mut SqliteConnection,
    series_iuid: &str,
) -> ArcResult<Vec<Instance>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM instances WHERE deleted = 0 AND series_fk = \
         (SELECT pk FROM series WHERE series_iuid = ?) ORDER BY pk",
        INSTANCE_COLUMNS
    ))
    .bind(series_iuid)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(instance_from_row).collect())
}
