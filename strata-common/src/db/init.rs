//! Database initialization
//!
//! Creates the archive schema on first run and opens existing databases
//! otherwise. Table creation is idempotent (`CREATE TABLE IF NOT EXISTS`);
//! later schema changes go through [`crate::db::migrations`].

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every pooled connection
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas go through the connect options so that every pooled
    // connection gets them, not only the first one.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema_version_table(&pool).await?;

    // Identity
    create_subjects_table(&pool).await?;
    create_subject_ids_table(&pool).await?;

    // Object hierarchy
    create_studies_table(&pool).await?;
    create_series_table(&pool).await?;
    create_series_requests_table(&pool).await?;
    create_instances_table(&pool).await?;
    create_locations_table(&pool).await?;

    // Archiving
    create_archiving_tasks_table(&pool).await?;

    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subjects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subjects (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            name_alphabetic TEXT,
            name_ideographic TEXT,
            name_phonetic TEXT,
            family_name_fuzzy TEXT,
            given_name_fuzzy TEXT,
            birth_date TEXT,
            sex TEXT,
            merged_into_fk INTEGER REFERENCES subjects(pk),
            status TEXT NOT NULL DEFAULT 'ACTIVE'
                CHECK (status IN ('ACTIVE', 'MERGED', 'DELETED')),
            num_studies INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subjects_family_fuzzy ON subjects(family_name_fuzzy)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_subject_ids_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subject_ids (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_fk INTEGER NOT NULL REFERENCES subjects(pk) ON DELETE CASCADE,
            id_value TEXT NOT NULL,
            issuer_local TEXT,
            issuer_universal TEXT,
            issuer_universal_type TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subject_ids_value ON subject_ids(id_value)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subject_ids_subject ON subject_ids(subject_fk)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_studies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS studies (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_fk INTEGER NOT NULL REFERENCES subjects(pk),
            study_iuid TEXT NOT NULL UNIQUE,
            study_date TEXT,
            study_description TEXT,
            accession_no TEXT,
            num_series INTEGER NOT NULL DEFAULT 0,
            num_instances INTEGER NOT NULL DEFAULT 0,
            modalities TEXT NOT NULL DEFAULT '',
            sop_classes TEXT NOT NULL DEFAULT '',
            retrieve_aets TEXT NOT NULL DEFAULT '',
            availability TEXT NOT NULL DEFAULT 'ONLINE',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_studies_subject ON studies(subject_fk)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_series_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            study_fk INTEGER NOT NULL REFERENCES studies(pk) ON DELETE CASCADE,
            series_iuid TEXT NOT NULL UNIQUE,
            series_number INTEGER,
            modality TEXT,
            source_aet TEXT,
            num_instances INTEGER NOT NULL DEFAULT 0,
            sop_classes TEXT NOT NULL DEFAULT '',
            retrieve_aets TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_series_study ON series(study_fk)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_series_requests_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series_requests (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            series_fk INTEGER NOT NULL REFERENCES series(pk) ON DELETE CASCADE,
            accession_no TEXT,
            accession_issuer_local TEXT,
            accession_issuer_universal TEXT,
            accession_issuer_universal_type TEXT,
            requested_procedure_id TEXT,
            scheduled_procedure_step_id TEXT,
            requesting_service TEXT,
            requesting_physician TEXT,
            requesting_physician_ideographic TEXT,
            requesting_physician_phonetic TEXT,
            requesting_physician_family_fuzzy TEXT,
            requesting_physician_given_fuzzy TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_instances_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            series_fk INTEGER NOT NULL REFERENCES series(pk) ON DELETE CASCADE,
            sop_iuid TEXT NOT NULL UNIQUE,
            sop_cuid TEXT,
            instance_number INTEGER,
            digest TEXT,
            object_size INTEGER NOT NULL DEFAULT 0,
            retrieve_aets TEXT NOT NULL DEFAULT '',
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_series ON instances(series_fk)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_locations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS locations (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            instance_fk INTEGER NOT NULL REFERENCES instances(pk) ON DELETE CASCADE,
            group_id TEXT NOT NULL,
            system_id TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            entry_name TEXT,
            digest TEXT,
            object_size INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL CHECK (status IN ('STORED', 'ARCHIVED')),
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_locations_instance ON locations(instance_fk)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_archiving_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS archiving_tasks (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            series_iuid TEXT NOT NULL,
            source_group_id TEXT NOT NULL,
            target_group_id TEXT NOT NULL,
            action TEXT NOT NULL DEFAULT 'COPY' CHECK (action IN ('COPY', 'MOVE')),
            status TEXT NOT NULL DEFAULT 'SCHEDULED'
                CHECK (status IN ('SCHEDULED', 'PROCESSING', 'FINISHED', 'FAILED')),
            earliest_eligible_at INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            claimed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One pending task per (series, target): coalescing is enforced here
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_archiving_tasks_pending
        ON archiving_tasks(series_iuid, target_group_id)
        WHERE status IN ('SCHEDULED', 'PROCESSING')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_archiving_tasks_due ON archiving_tasks(status, earliest_eligible_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
