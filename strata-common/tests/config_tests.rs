//! Tests for TOML configuration loading and root folder resolution

use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use strata_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, ArchivingAction, Availability,
    ContainerFormat, DigestAlgorithm, DuplicatePolicy, QcUpdateScope, DEFAULT_PATH_FORMAT,
};
use strata_common::Error;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
root_folder = "/var/lib/strata"
database_path = "db/archive.db"

[logging]
level = "debug"

[scheduler]
poll_interval_ms = 500
max_retries = 5

[[ae]]
ae_title = "STRATA"
storage_group_id = "ONLINE"
retrieve_aets = ["STRATA"]
duplicate_policy = "REPLACE"
qc_update_scope = "STUDY"

[[storage_groups]]
group_id = "ONLINE"
availability = "ONLINE"
systems = [{ system_id = "fs1", path = "/srv/online" }]

[[storage_groups]]
group_id = "NEARLINE_ZIP"
availability = "NEARLINE"
systems = [{ system_id = "nas1", path = "/srv/nearline" }]
container = { format = "zip", checksum_entry = "SHA256SUM" }
file_cache = { directory = "/srv/cache" }

[[archiving_rules]]
source_ae_titles = ["SRC"]
delay_seconds = 1
storage_group_ids = ["NEARLINE_ZIP"]

[[coercion_rules]]
source_ae_titles = ["SRC"]
set = { InstitutionName = "General Hospital" }
remove = ["OtherPatientIDsSequence"]
"#;

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("strata.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_full_config_parses() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(temp_dir.path(), FULL_CONFIG);

    let config = load_toml_config(&path).unwrap();

    assert_eq!(config.root_folder, Some(PathBuf::from("/var/lib/strata")));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
        config.database_path(Path::new("/var/lib/strata")),
        PathBuf::from("/var/lib/strata/db/archive.db")
    );

    let archive = &config.archive;
    assert_eq!(archive.scheduler.poll_interval_ms, 500);
    assert_eq!(archive.scheduler.max_retries, 5);
    // Unset scheduler keys keep their defaults
    assert_eq!(archive.scheduler.batch_size, 10);

    let ae = archive.ae("STRATA").unwrap();
    assert_eq!(ae.digest_algorithm, Some(DigestAlgorithm::Sha256));
    assert_eq!(ae.duplicate_policy, DuplicatePolicy::Replace);
    assert_eq!(ae.qc_update_scope, QcUpdateScope::Study);

    let online = archive.storage_group("ONLINE").unwrap();
    assert_eq!(online.availability, Availability::Online);
    assert_eq!(online.path_format, DEFAULT_PATH_FORMAT);

    let nearline = archive.storage_group("NEARLINE_ZIP").unwrap();
    let container = nearline.container.as_ref().unwrap();
    assert_eq!(container.format, ContainerFormat::Zip);
    assert_eq!(container.checksum_entry.as_deref(), Some("SHA256SUM"));
    assert!(nearline.file_cache.is_some());

    let rule = &archive.archiving_rules[0];
    assert_eq!(rule.delay_seconds, 1);
    assert_eq!(rule.action, ArchivingAction::Copy);

    assert_eq!(
        archive.coercion_rules[0].set.get("InstitutionName").map(String::as_str),
        Some("General Hospital")
    );
}

#[test]
fn test_minimal_config_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(temp_dir.path(), "");

    let config = load_toml_config(&path).unwrap();

    assert!(config.root_folder.is_none());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.archive.scheduler.poll_interval_ms, 3_000);
    assert_eq!(config.archive.io_timeout_ms, 60_000);
    assert_eq!(
        config.database_path(Path::new("/data")),
        PathBuf::from("/data/strata.db")
    );
}

#[test]
fn test_rule_with_unknown_group_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        temp_dir.path(),
        r#"
[[storage_groups]]
group_id = "ONLINE"
availability = "ONLINE"
systems = [{ system_id = "fs1", path = "/srv/online" }]

[[archiving_rules]]
storage_group_ids = ["MISSING"]
"#,
    );

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("MISSING")));
}

#[test]
fn test_duplicate_group_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        temp_dir.path(),
        r#"
[[storage_groups]]
group_id = "ONLINE"
availability = "ONLINE"
systems = [{ system_id = "fs1", path = "/a" }]

[[storage_groups]]
group_id = "ONLINE"
availability = "NEARLINE"
systems = [{ system_id = "fs2", path = "/b" }]
"#,
    );

    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(temp_dir.path(), "root_folder = [");

    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
fn test_missing_file_is_config_error() {
    let result = load_toml_config(Path::new("/nonexistent/strata.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_root_folder_cli_has_priority() {
    env::set_var("STRATA_TEST_ROOT", "/tmp/from-env");

    let root = resolve_root_folder(
        Some(Path::new("/tmp/from-cli")),
        "STRATA_TEST_ROOT",
        Some(Path::new("/tmp/from-toml")),
    );
    assert_eq!(root, PathBuf::from("/tmp/from-cli"));

    env::remove_var("STRATA_TEST_ROOT");
}

#[test]
#[serial]
fn test_root_folder_env_over_toml() {
    env::set_var("STRATA_TEST_ROOT", "/tmp/from-env");

    let root = resolve_root_folder(None, "STRATA_TEST_ROOT", Some(Path::new("/tmp/from-toml")));
    assert_eq!(root, PathBuf::from("/tmp/from-env"));

    env::remove_var("STRATA_TEST_ROOT");
}

#[test]
#[serial]
fn test_root_folder_toml_then_default() {
    env::remove_var("STRATA_TEST_ROOT");

    let root = resolve_root_folder(None, "STRATA_TEST_ROOT", Some(Path::new("/tmp/from-toml")));
    assert_eq!(root, PathBuf::from("/tmp/from-toml"));

    let fallback = resolve_root_folder(None, "STRATA_TEST_ROOT", None);
    assert!(fallback.to_string_lossy().contains("strata"));
}

#[test]
#[serial]
fn test_config_path_cli_and_env() {
    env::set_var("STRATA_TEST_CONFIG", "/tmp/env.toml");

    assert_eq!(
        resolve_config_path(Some(Path::new("/tmp/cli.toml")), "STRATA_TEST_CONFIG"),
        Some(PathBuf::from("/tmp/cli.toml"))
    );
    assert_eq!(
        resolve_config_path(None, "STRATA_TEST_CONFIG"),
        Some(PathBuf::from("/tmp/env.toml"))
    );

    env::remove_var("STRATA_TEST_CONFIG");
}
