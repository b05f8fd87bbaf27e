//! Object ingestion
//!
//! Spool, parse, coerce and persist incoming objects, then signal listeners.

pub mod coercion;
pub mod dataset;
pub mod path_format;
pub mod pipeline;
pub mod session;

pub use coercion::{AttributeCoercion, RuleBasedCoercion};
pub use dataset::{Dataset, DatasetParser, JsonDatasetParser};
pub use path_format::{PathContext, PathFormat};
pub use pipeline::{
    instance_exists_action, StoreAction, StoreListener, StoreOutcome, StoreService, StoredEvent,
};
pub use session::{StoreContext, StoreSession};
