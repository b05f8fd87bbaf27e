//! # Strata Common Library
//!
//! Shared code for the strata archive services:
//! - Database schema, migrations and entity models
//! - Event types (ArchiveEvent enum) and the EventBus
//! - Configuration loading (TOML bootstrap, storage topology, archiving rules)
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
