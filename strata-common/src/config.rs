//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration is a single TOML file. Besides the usual root
//! folder / database / logging keys it carries the archive topology: the
//! local AE titles, storage groups with their systems and availability
//! tier, archiving rules, attribute coercion rules and scheduler tuning.
//!
//! ```toml
//! root_folder = "/var/lib/strata"
//!
//! [logging]
//! level = "info"
//!
//! [[ae]]
//! ae_title = "STRATA"
//! storage_group_id = "ONLINE"
//!
//! [[storage_groups]]
//! group_id = "ONLINE"
//! availability = "ONLINE"
//! systems = [{ system_id = "fs1", path = "/srv/online" }]
//!
//! [[storage_groups]]
//! group_id = "NEARLINE_ZIP"
//! availability = "NEARLINE"
//! systems = [{ system_id = "nas1", path = "/srv/nearline" }]
//! container = { format = "zip" }
//!
//! [[archiving_rules]]
//! source_ae_titles = ["SRC"]
//! delay_seconds = 60
//! storage_group_ids = ["NEARLINE_ZIP"]
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Default storage path template: date, then study/series/instance UID hashes
pub const DEFAULT_PATH_FORMAT: &str =
    "{now,date,yyyy/MM/dd}/{0020000D,hash}/{0020000E,hash}/{00080018,hash}";

/// Default container path template (the format extension is appended)
pub const DEFAULT_CONTAINER_PATH_FORMAT: &str =
    "{now,date,yyyy/MM/dd}/{0020000D,hash}/{0020000E,hash}";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for database, spool and relative storage paths
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// SQLite database file (relative paths resolve against the root folder)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Archive topology and tuning
    #[serde(flatten)]
    pub archive: ArchiveConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Archive configuration consumed by the ingestion pipeline, rule engine and scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Local application entities accepting objects
    pub ae: Vec<AeConfig>,
    /// Storage system groups (online, nearline, offline tiers)
    pub storage_groups: Vec<StorageGroupConfig>,
    /// Replication/move rules evaluated after every store
    pub archiving_rules: Vec<ArchivingRule>,
    /// Attribute rewrite rules applied during ingestion
    pub coercion_rules: Vec<CoercionRule>,
    /// Archiving scheduler tuning
    pub scheduler: SchedulerConfig,
    /// Timeout applied to spool and storage I/O, in milliseconds
    pub io_timeout_ms: u64,
    /// Maximum time to keep retrying a transaction on SQLite lock contention
    pub db_lock_wait_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            ae: Vec::new(),
            storage_groups: Vec::new(),
            archiving_rules: Vec::new(),
            coercion_rules: Vec::new(),
            scheduler: SchedulerConfig::default(),
            io_timeout_ms: 60_000,
            db_lock_wait_ms: 5_000,
        }
    }
}

/// Per-AE ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AeConfig {
    pub ae_title: String,

    /// Online storage group receiving the primary Location
    pub storage_group_id: String,

    /// AE titles advertised as retrieve AETs on stored entities
    #[serde(default)]
    pub retrieve_aets: Vec<String>,

    /// Digest computed over spooled bytes; `None` disables duplicate digest comparison
    #[serde(default = "default_digest_algorithm")]
    pub digest_algorithm: Option<DigestAlgorithm>,

    /// What to do with a re-sent SOP instance whose digest differs
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// How retrieved objects are rewritten after quality-control changes
    #[serde(default)]
    pub qc_update_scope: QcUpdateScope,
}

fn default_digest_algorithm() -> Option<DigestAlgorithm> {
    Some(DigestAlgorithm::Sha256)
}

/// Digest algorithm for spooled objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
}

/// Handling of a stored SOP instance that arrives again with different content
///
/// Byte-identical re-sends (equal digest) are always ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DuplicatePolicy {
    /// Fail the store with a duplicate-instance error
    #[default]
    Reject,
    /// Overwrite the instance and drop its prior Locations
    Replace,
}

/// Quality-control reference update scope used at retrieve time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QcUpdateScope {
    /// Retrieved objects are returned untouched
    #[default]
    Deactivate,
    /// Rewrite patient-level identifiers as well as study/series/instance UIDs
    Patient,
    /// Rewrite study/series/instance UIDs only
    Study,
}

/// Availability tier of a storage group
///
/// Ordered from fastest to slowest so `min()` yields the best tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Availability {
    Online,
    Nearline,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Online => "ONLINE",
            Availability::Nearline => "NEARLINE",
            Availability::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(Availability::Online),
            "NEARLINE" => Some(Availability::Nearline),
            "OFFLINE" => Some(Availability::Offline),
            _ => None,
        }
    }
}

/// Named collection of storage systems sharing an availability tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageGroupConfig {
    pub group_id: String,

    pub availability: Availability,

    /// Path template for standalone objects
    #[serde(default = "default_path_format")]
    pub path_format: String,

    pub systems: Vec<StorageSystemConfig>,

    /// System receiving new writes; defaults to the first writable system
    #[serde(default)]
    pub active_system: Option<String>,

    /// Pack archived objects into zip/tar containers instead of flat files
    #[serde(default)]
    pub container: Option<ContainerConfig>,

    /// Read-through cache for entries extracted from containers
    #[serde(default)]
    pub file_cache: Option<FileCacheConfig>,
}

fn default_path_format() -> String {
    DEFAULT_PATH_FORMAT.to_string()
}

fn default_container_path_format() -> String {
    DEFAULT_CONTAINER_PATH_FORMAT.to_string()
}

impl StorageGroupConfig {
    pub fn system(&self, system_id: &str) -> Option<&StorageSystemConfig> {
        self.systems.iter().find(|s| s.system_id == system_id)
    }

    /// System that receives new writes for this group
    pub fn write_system(&self) -> Option<&StorageSystemConfig> {
        match &self.active_system {
            Some(id) => self.system(id).filter(|s| !s.read_only),
            None => self.systems.iter().find(|s| !s.read_only),
        }
    }
}

/// One storage system (a mount point / directory) in a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSystemConfig {
    pub system_id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// Container packaging for a storage group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub format: ContainerFormat,

    /// Path template for containers, evaluated once per series write
    #[serde(default = "default_container_path_format")]
    pub path_format: String,

    /// Name of an extra entry listing the sha-256 digest of every other entry
    #[serde(default)]
    pub checksum_entry: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Zip,
    Tar,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Zip => "zip",
            ContainerFormat::Tar => "tar",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheConfig {
    /// Directory holding extracted container entries
    pub directory: PathBuf,
}

/// Archiving rule: which stores trigger which replication/move jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivingRule {
    /// Source AE titles this rule applies to; empty matches every source
    #[serde(default)]
    pub source_ae_titles: Vec<String>,

    /// Debounce delay before the scheduled task becomes eligible
    #[serde(default)]
    pub delay_seconds: u64,

    /// Target storage groups
    pub storage_group_ids: Vec<String>,

    #[serde(default)]
    pub action: ArchivingAction,
}

impl ArchivingRule {
    pub fn matches_source(&self, source_aet: &str) -> bool {
        self.source_ae_titles.is_empty() || self.source_ae_titles.iter().any(|a| a == source_aet)
    }
}

/// Copy keeps the source Location, move removes it once the target is durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArchivingAction {
    #[default]
    Copy,
    Move,
}

impl ArchivingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchivingAction::Copy => "COPY",
            ArchivingAction::Move => "MOVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COPY" => Some(ArchivingAction::Copy),
            "MOVE" => Some(ArchivingAction::Move),
            _ => None,
        }
    }
}

/// Attribute rewrite rule applied to objects from matching sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoercionRule {
    /// Source AE titles this rule applies to; empty matches every source
    #[serde(default)]
    pub source_ae_titles: Vec<String>,

    /// Attributes to set (keyword → value)
    #[serde(default)]
    pub set: BTreeMap<String, String>,

    /// Attributes to remove
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Archiving scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll interval of the scheduler loop
    pub poll_interval_ms: u64,
    /// Maximum tasks claimed per tick
    pub batch_size: u32,
    /// Failed executions tolerated before a task is marked FAILED
    pub max_retries: u32,
    /// Base retry delay; doubled for every further retry
    pub retry_backoff_secs: u64,
    /// Upper bound for the retry delay
    pub max_backoff_secs: u64,
    /// PROCESSING tasks older than this are considered abandoned and rescheduled
    pub stale_claim_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            batch_size: 10,
            max_retries: 3,
            retry_backoff_secs: 60,
            max_backoff_secs: 3_600,
            stale_claim_secs: 3_600,
        }
    }
}

impl ArchiveConfig {
    pub fn ae(&self, ae_title: &str) -> Option<&AeConfig> {
        self.ae.iter().find(|a| a.ae_title == ae_title)
    }

    pub fn storage_group(&self, group_id: &str) -> Option<&StorageGroupConfig> {
        self.storage_groups.iter().find(|g| g.group_id == group_id)
    }

    /// Check cross references between AEs, rules and storage groups
    pub fn validate(&self) -> Result<()> {
        let mut group_ids = HashSet::new();
        for group in &self.storage_groups {
            if !group_ids.insert(group.group_id.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate storage group: {}",
                    group.group_id
                )));
            }
            if group.systems.is_empty() {
                return Err(Error::Config(format!(
                    "Storage group {} has no storage systems",
                    group.group_id
                )));
            }
            if group.write_system().is_none() {
                return Err(Error::Config(format!(
                    "Storage group {} has no writable active system",
                    group.group_id
                )));
            }
            check_braces(&group.path_format)?;
            if let Some(container) = &group.container {
                check_braces(&container.path_format)?;
            }
        }

        for ae in &self.ae {
            if !group_ids.contains(ae.storage_group_id.as_str()) {
                return Err(Error::Config(format!(
                    "AE {} references unknown storage group {}",
                    ae.ae_title, ae.storage_group_id
                )));
            }
        }

        for rule in &self.archiving_rules {
            if rule.storage_group_ids.is_empty() {
                return Err(Error::Config(
                    "Archiving rule without target storage groups".to_string(),
                ));
            }
            for target in &rule.storage_group_ids {
                if !group_ids.contains(target.as_str()) {
                    return Err(Error::Config(format!(
                        "Archiving rule references unknown storage group {}",
                        target
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_braces(format: &str) -> Result<()> {
    let mut depth = 0i32;
    for c in format.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(Error::Config(format!("Unbalanced path format: {}", format)));
        }
    }
    if depth != 0 {
        return Err(Error::Config(format!("Unbalanced path format: {}", format)));
    }
    Ok(())
}

impl TomlConfig {
    /// Database file path, resolved against the root folder
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        match &self.database_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root_folder.join(p),
            None => root_folder.join("strata.db"),
        }
    }
}

/// Load and validate a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    config.archive.validate()?;

    tracing::debug!(
        path = %path.display(),
        storage_groups = config.archive.storage_groups.len(),
        archiving_rules = config.archive.archiving_rules.len(),
        "Loaded TOML config"
    );

    Ok(config)
}

/// Config file resolution:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `~/.config/strata/strata.toml`
/// 4. `/etc/strata/strata.toml`
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        return Some(PathBuf::from(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("strata").join("strata.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/strata/strata.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_root: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        return PathBuf::from(path);
    }

    if let Some(path) = toml_root {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/strata (or /var/lib/strata for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("strata"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/strata"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("strata"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/strata"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("strata"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\strata"))
    } else {
        PathBuf::from("./strata_data")
    }
}
