//! Archiving task model
//!
//! One task per (series, target storage group). Tasks move through
//! SCHEDULED → PROCESSING → FINISHED, or back to SCHEDULED with a backoff on
//! failure, and end in FAILED once the retry limit is exceeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::config::ArchivingAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Waiting for `earliest_eligible_at`
    Scheduled,
    /// Claimed by a scheduler instance
    Processing,
    Finished,
    /// Retry limit exceeded; left for operator inspection
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(TaskStatus::Scheduled),
            "PROCESSING" => Some(TaskStatus::Processing),
            "FINISHED" => Some(TaskStatus::Finished),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivingTask {
    pub pk: i64,
    pub series_iuid: String,
    pub source_group_id: String,
    pub target_group_id: String,
    pub action: ArchivingAction,
    pub status: TaskStatus,
    pub earliest_eligible_at: DateTime<Utc>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
