//! Subject and subject identifier persistence

use crate::error::ArcResult;
use crate::identity::Issuer;
use crate::models::{Subject, SubjectId, SubjectStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use strata_common::time::{from_millis, to_millis};

/// Persisted identifier row
#[derive(Debug, Clone)]
pub struct StoredSubjectId {
    pub pk: i64,
    pub subject_fk: i64,
    pub id: SubjectId,
}

/// Name and demographic columns of a subject
#[derive(Debug, Clone, Default)]
pub struct SubjectAttributes {
    pub name_alphabetic: Option<String>,
    pub name_ideographic: Option<String>,
    pub name_phonetic: Option<String>,
    pub family_name_fuzzy: Option<String>,
    pub given_name_fuzzy: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
}

fn issuer_from_row(row: &SqliteRow) -> Option<Issuer> {
    let issuer = Issuer::new(
        row.get::<Option<String>, _>("issuer_local").as_deref(),
        row.get::<Option<String>, _>("issuer_universal").as_deref(),
        row.get::<Option<String>, _>("issuer_universal_type").as_deref(),
    );
    (!issuer.is_empty()).then_some(issuer)
}

fn stored_id_from_row(row: &SqliteRow) -> StoredSubjectId {
    StoredSubjectId {
        pk: row.get("pk"),
        subject_fk: row.get("subject_fk"),
        id: SubjectId::new(row.get::<String, _>("id_value"), issuer_from_row(row)),
    }
}

/// All identifier rows carrying `value`, regardless of issuer
pub async fn find_ids_by_value(
    conn: &mut SqliteConnection,
    value: &str,
) -> ArcResult<Vec<StoredSubjectId>> {
    let rows = sqlx::query(
        r#"
        SELECT pk, subject_fk, id_value, issuer_local, issuer_universal, issuer_universal_type
        FROM subject_ids
        WHERE id_value = ?
        ORDER BY pk
        "#,
    )
    .bind(value)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(stored_id_from_row).collect())
}

pub async fn ids_of_subject(
    conn: &mut SqliteConnection,
    subject_pk: i64,
) -> ArcResult<Vec<StoredSubjectId>> {
    let rows = sqlx::query(
        r#"
        SELECT pk, subject_fk, id_value, issuer_local, issuer_universal, issuer_universal_type
        FROM subject_ids
        WHERE subject_fk = ?
        ORDER BY pk
        "#,
    )
    .bind(subject_pk)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(stored_id_from_row).collect())
}

pub async fn load_subject(conn: &mut SqliteConnection, pk: i64) -> ArcResult<Option<Subject>> {
    let row = sqlx::query(
        r#"
        SELECT pk, name_alphabetic, name_ideographic, name_phonetic,
               family_name_fuzzy, given_name_fuzzy, birth_date, sex,
               merged_into_fk, status, num_studies, created_at, updated_at
        FROM subjects
        WHERE pk = ?
        "#,
    )
    .bind(pk)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let ids = ids_of_subject(conn, pk)
        .await?
        .into_iter()
        .map(|stored| stored.id)
        .collect();

    let status: String = row.get("status");
    Ok(Some(Subject {
        pk: row.get("pk"),
        ids,
        name_alphabetic: row.get("name_alphabetic"),
        name_ideographic: row.get("name_ideographic"),
        name_phonetic: row.get("name_phonetic"),
        family_name_fuzzy: row.get("family_name_fuzzy"),
        given_name_fuzzy: row.get("given_name_fuzzy"),
        birth_date: row.get("birth_date"),
        sex: row.get("sex"),
        merged_into: row.get("merged_into_fk"),
        status: SubjectStatus::parse(&status).unwrap_or(SubjectStatus::Active),
        num_studies: row.get("num_studies"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }))
}

/// Merge pointer of a subject without loading its identifiers
pub async fn merged_into(conn: &mut SqliteConnection, pk: i64) -> ArcResult<Option<i64>> {
    let merged: Option<Option<i64>> =
        sqlx::query_scalar("SELECT merged_into_fk FROM subjects WHERE pk = ?")
            .bind(pk)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(merged.flatten())
}

pub async fn insert_subject(
    conn: &mut SqliteConnection,
    attrs: &SubjectAttributes,
    now: DateTime<Utc>,
) -> ArcResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO subjects (
            name_alphabetic, name_ideographic, name_phonetic,
            family_name_fuzzy, given_name_fuzzy, birth_date, sex,
            status, num_studies, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 'ACTIVE', 0, ?, ?)
        "#,
    )
    .bind(&attrs.name_alphabetic)
    .bind(&attrs.name_ideographic)
    .bind(&attrs.name_phonetic)
    .bind(&attrs.family_name_fuzzy)
    .bind(&attrs.given_name_fuzzy)
    .bind(&attrs.birth_date)
    .bind(&attrs.sex)
    .bind(to_millis(now))
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Overwrite the name columns (only used while the subject has no name)
pub async fn update_subject_name(
    conn: &mut SqliteConnection,
    pk: i64,
    attrs: &SubjectAttributes,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE subjects
        SET name_alphabetic = ?, name_ideographic = ?, name_phonetic = ?,
            family_name_fuzzy = ?, given_name_fuzzy = ?, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(&attrs.name_alphabetic)
    .bind(&attrs.name_ideographic)
    .bind(&attrs.name_phonetic)
    .bind(&attrs.family_name_fuzzy)
    .bind(&attrs.given_name_fuzzy)
    .bind(to_millis(now))
    .bind(pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_subject_id(
    conn: &mut SqliteConnection,
    subject_pk: i64,
    id: &SubjectId,
) -> ArcResult<i64> {
    let issuer = id.issuer.clone().unwrap_or_default();
    let result = sqlx::query(
        r#"
        INSERT INTO subject_ids (subject_fk, id_value, issuer_local, issuer_universal, issuer_universal_type)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(subject_pk)
    .bind(&id.value)
    .bind(&issuer.local_namespace)
    .bind(&issuer.universal_id)
    .bind(&issuer.universal_id_type)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn update_subject_id_issuer(
    conn: &mut SqliteConnection,
    id_pk: i64,
    issuer: &Issuer,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE subject_ids
        SET issuer_local = ?, issuer_universal = ?, issuer_universal_type = ?
        WHERE pk = ?
        "#,
    )
    .bind(&issuer.local_namespace)
    .bind(&issuer.universal_id)
    .bind(&issuer.universal_id_type)
    .bind(id_pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn mark_merged(
    conn: &mut SqliteConnection,
    loser_pk: i64,
    winner_pk: i64,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE subjects
        SET merged_into_fk = ?, status = ?, num_studies = 0, updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(winner_pk)
    .bind(SubjectStatus::Merged.as_str())
    .bind(to_millis(now))
    .bind(loser_pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Recompute `num_studies` from the studies table
pub async fn refresh_num_studies(
    conn: &mut SqliteConnection,
    subject_pk: i64,
    now: DateTime<Utc>,
) -> ArcResult<()> {
    sqlx::query(
        r#"
        UPDATE subjects
        SET num_studies = (SELECT COUNT(*) FROM studies WHERE subject_fk = ?), updated_at = ?
        WHERE pk = ?
        "#,
    )
    .bind(subject_pk)
    .bind(to_millis(now))
    .bind(subject_pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
