//! strata-arc library interface
//!
//! Ingestion and tiering core of the archive: subject identity resolution,
//! the per-object store pipeline, archiving rules and the archiving
//! scheduler. [`Archive`] wires the components together the way the
//! `strata-arc` binary runs them; tests build the same wiring.

pub mod archiving;
pub mod db;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod models;
pub mod storage;
pub mod utils;

pub use crate::error::{ArcError, ArcResult, ErrorCategory};

use crate::archiving::{ArchivingRuleEngine, ArchivingScheduler};
use crate::identity::{ExtendedSoundex, IdentityResolver};
use crate::ingest::dataset::JsonDatasetParser;
use crate::ingest::StoreService;
use crate::storage::{FilesystemStorage, StorageDriver, StorageRetrieveService};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::config::ArchiveConfig;
use strata_common::events::EventBus;

/// Capacity of the archive event bus
const EVENT_BUS_CAPACITY: usize = 1000;

/// Wired archive components sharing one pool, configuration and event bus
pub struct Archive {
    pub pool: SqlitePool,
    pub config: Arc<ArchiveConfig>,
    pub root_folder: PathBuf,
    pub event_bus: EventBus,
    pub storage: Arc<dyn StorageDriver>,
    pub resolver: IdentityResolver,
    pub store: StoreService,
    pub rules: Arc<ArchivingRuleEngine>,
    pub scheduler: Arc<ArchivingScheduler>,
}

impl Archive {
    /// Wire components over an initialized database
    pub fn new(pool: SqlitePool, config: ArchiveConfig, root_folder: &Path) -> Self {
        let config = Arc::new(config);
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let storage: Arc<dyn StorageDriver> =
            Arc::new(FilesystemStorage::new(&config, root_folder));
        let resolver = IdentityResolver::new(Arc::new(ExtendedSoundex));

        let rules = Arc::new(ArchivingRuleEngine::new(
            pool.clone(),
            Arc::clone(&config),
            event_bus.clone(),
        ));
        let mut store = StoreService::new(
            pool.clone(),
            Arc::clone(&config),
            root_folder,
            Arc::clone(&storage),
            resolver.clone(),
            event_bus.clone(),
        );
        store.add_listener(rules.clone());

        let scheduler = Arc::new(ArchivingScheduler::new(
            pool.clone(),
            Arc::clone(&config),
            Arc::clone(&storage),
            event_bus.clone(),
        ));

        Self {
            pool,
            config,
            root_folder: root_folder.to_path_buf(),
            event_bus,
            storage,
            resolver,
            store,
            rules,
            scheduler,
        }
    }

    /// Validate the configuration, open the database and wire components
    pub async fn open(
        config: ArchiveConfig,
        root_folder: &Path,
        database_path: &Path,
    ) -> ArcResult<Self> {
        config.validate()?;
        let pool = strata_common::db::init::init_database(database_path).await?;
        Ok(Self::new(pool, config, root_folder))
    }

    /// Retrieve service over this archive's storage
    pub fn retrieve_service(&self) -> StorageRetrieveService {
        StorageRetrieveService::new(
            self.pool.clone(),
            Arc::clone(&self.config),
            self.root_folder.clone(),
            Arc::clone(&self.storage),
            Arc::new(JsonDatasetParser),
        )
    }
}
