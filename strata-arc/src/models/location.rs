//! Physical placements of instance bytes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a Location
///
/// `Stored` marks the authoritative placement: every non-deleted instance
/// keeps at least one. Copies made by archiving tasks are `Archived`; a move
/// hands the `Stored` role over to the target Location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocationStatus {
    Stored,
    Archived,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Stored => "STORED",
            LocationStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STORED" => Some(LocationStatus::Stored),
            "ARCHIVED" => Some(LocationStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub pk: i64,
    pub instance_fk: i64,
    pub group_id: String,
    pub system_id: String,
    /// Path relative to the storage system root (the container path for packed entries)
    pub storage_path: String,
    /// Entry inside the container, if the object is packed
    pub entry_name: Option<String>,
    pub digest: Option<String>,
    pub object_size: i64,
    pub status: LocationStatus,
    pub created_at: DateTime<Utc>,
}

/// Location to be inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLocation {
    pub instance_fk: i64,
    pub group_id: String,
    pub system_id: String,
    pub storage_path: String,
    pub entry_name: Option<String>,
    pub digest: Option<String>,
    pub object_size: i64,
    pub status: LocationStatus,
}
