//! Shared helpers for database access

pub mod db_retry;
pub mod pool_monitor;

pub use db_retry::{retry_on_conflict, retry_on_lock};
pub use pool_monitor::{begin_monitored, MonitoredTransaction};
