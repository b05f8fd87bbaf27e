//! SQL for archive entities
//!
//! Functions take a `&mut SqliteConnection` so the same code runs against a
//! pooled connection or inside the store transaction.

pub mod hierarchy;
pub mod locations;
pub mod subjects;
pub mod tasks;
