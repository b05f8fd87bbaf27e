//! Tiering of stored objects
//!
//! The rule engine turns "stored" signals into archiving tasks; the
//! scheduler executes them against the target storage groups.

pub mod rules;
pub mod scheduler;

pub use rules::ArchivingRuleEngine;
pub use scheduler::{backoff_secs, ArchivingScheduler};
