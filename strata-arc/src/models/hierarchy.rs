//! Study / Series / Instance hierarchy
//!
//! Each level keeps denormalized summaries of its children (counts and
//! multi-valued sets) that are recomputed whenever an instance is added, so
//! listings never need to scan the level below.

use crate::identity::{Issuer, PersonName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::config::Availability;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub pk: i64,
    pub subject_fk: i64,
    pub study_iuid: String,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub accession_no: Option<String>,
    pub num_series: i64,
    pub num_instances: i64,
    pub modalities: Vec<String>,
    pub sop_classes: Vec<String>,
    pub retrieve_aets: Vec<String>,
    /// Best availability tier among the study's instance Locations
    pub availability: Availability,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub pk: i64,
    pub study_fk: i64,
    pub series_iuid: String,
    pub series_number: Option<i64>,
    pub modality: Option<String>,
    pub source_aet: Option<String>,
    pub num_instances: i64,
    pub sop_classes: Vec<String>,
    pub retrieve_aets: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub pk: i64,
    pub series_fk: i64,
    pub sop_iuid: String,
    pub sop_cuid: Option<String>,
    pub instance_number: Option<i64>,
    pub digest: Option<String>,
    pub object_size: i64,
    pub retrieve_aets: Vec<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Order/request context of a series, written once when the series is created
///
/// Absent values stay absent (wildcards) rather than becoming empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttributes {
    pub accession_no: Option<String>,
    pub accession_issuer: Option<Issuer>,
    pub requested_procedure_id: Option<String>,
    pub scheduled_procedure_step_id: Option<String>,
    pub requesting_service: Option<String>,
    pub requesting_physician: PersonName,
}

impl RequestAttributes {
    /// True if the request carries no information worth persisting
    pub fn is_empty(&self) -> bool {
        self.accession_no.is_none()
            && self.requested_procedure_id.is_none()
            && self.scheduled_procedure_step_id.is_none()
            && self.requesting_service.is_none()
            && self.requesting_physician.is_wildcard()
    }
}
