//! Subject (patient) identity records

use crate::identity::Issuer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier value with its optional assigning authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectId {
    pub value: String,
    pub issuer: Option<Issuer>,
}

impl SubjectId {
    pub fn new(value: impl Into<String>, issuer: Option<Issuer>) -> Self {
        Self {
            value: value.into(),
            issuer: issuer.filter(|i| !i.is_empty()),
        }
    }

    /// Parse the HL7 CX form `value^^^namespace&universal&type`
    pub fn parse_cx(s: &str) -> Self {
        let mut parts = s.split('^');
        let value = parts.next().unwrap_or("").trim();
        let issuer = parts.nth(2).map(Issuer::parse);
        Self::new(value, issuer)
    }

    /// Same identifier value under matching (or wildcard) issuers
    pub fn matches(&self, other: &SubjectId) -> bool {
        self.value == other.value
            && crate::identity::issuer::issuers_match(self.issuer.as_ref(), other.issuer.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubjectStatus {
    Active,
    /// Merged into another subject; lookups redirect through `merged_into`
    Merged,
    Deleted,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectStatus::Active => "ACTIVE",
            SubjectStatus::Merged => "MERGED",
            SubjectStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SubjectStatus::Active),
            "MERGED" => Some(SubjectStatus::Merged),
            "DELETED" => Some(SubjectStatus::Deleted),
            _ => None,
        }
    }
}

/// Persisted subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub pk: i64,
    pub ids: Vec<SubjectId>,
    pub name_alphabetic: Option<String>,
    pub name_ideographic: Option<String>,
    pub name_phonetic: Option<String>,
    pub family_name_fuzzy: Option<String>,
    pub given_name_fuzzy: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
    /// Surviving subject after a merge (lookup key, not ownership)
    pub merged_into: Option<i64>,
    pub status: SubjectStatus,
    pub num_studies: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subject {
    /// True if any name representation is present
    pub fn has_name(&self) -> bool {
        self.name_alphabetic.is_some()
            || self.name_ideographic.is_some()
            || self.name_phonetic.is_some()
    }
}
