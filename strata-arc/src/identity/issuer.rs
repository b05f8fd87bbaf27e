//! Issuer of an identifier
//!
//! An issuer names the assigning authority of a subject identifier or an
//! accession number: a local namespace, a universal ID and the type of the
//! universal ID. Any component may be absent, and an issuer with no
//! components at all is a wildcard that matches everything.
//!
//! Two issuers *match* when no component definitely contradicts the other
//! and at least one non-wildcard value is shared. Values are compared across
//! positions, so a local namespace `G1` matches a universal ID `G1`.
//! Two different local namespaces, or two different universal IDs, always
//! keep identifiers apart even when the identifier values are equal.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issuer {
    pub local_namespace: Option<String>,
    pub universal_id: Option<String>,
    pub universal_id_type: Option<String>,
}

/// Empty or whitespace-only components are absent
fn component(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Issuer {
    pub fn new(
        local_namespace: Option<&str>,
        universal_id: Option<&str>,
        universal_id_type: Option<&str>,
    ) -> Self {
        Self {
            local_namespace: component(local_namespace),
            universal_id: component(universal_id),
            universal_id_type: component(universal_id_type),
        }
    }

    /// Issuer known only by its local namespace
    pub fn local(namespace: &str) -> Self {
        Self::new(Some(namespace), None, None)
    }

    /// Issuer known only by its universal ID
    pub fn universal(universal_id: &str, universal_id_type: &str) -> Self {
        Self::new(None, Some(universal_id), Some(universal_id_type))
    }

    /// Parse the HL7 `namespace&universal&type` form
    pub fn parse(s: &str) -> Self {
        let mut parts = s.splitn(3, '&');
        let local = parts.next();
        let universal = parts.next();
        let universal_type = parts.next();
        Self::new(local, universal, universal_type)
    }

    /// Wildcard issuer (no component present)
    pub fn is_empty(&self) -> bool {
        self.local_namespace.is_none() && self.universal_id.is_none()
    }

    fn values(&self) -> impl Iterator<Item = &str> {
        self.local_namespace
            .as_deref()
            .into_iter()
            .chain(self.universal_id.as_deref())
    }

    /// Components present on both sides that disagree
    pub fn conflicts_with(&self, other: &Issuer) -> bool {
        if let (Some(a), Some(b)) = (&self.local_namespace, &other.local_namespace) {
            if a != b {
                return true;
            }
        }
        if let (Some(a), Some(b)) = (&self.universal_id, &other.universal_id) {
            if a != b {
                return true;
            }
            if let (Some(ta), Some(tb)) = (&self.universal_id_type, &other.universal_id_type) {
                if ta != tb {
                    return true;
                }
            }
        }
        false
    }

    /// Whether two issuers may denote the same assigning authority
    pub fn matches(&self, other: &Issuer) -> bool {
        if self.is_empty() || other.is_empty() {
            return true;
        }
        if self.conflicts_with(other) {
            return false;
        }
        self.values().any(|v| other.values().any(|o| o == v))
    }

    /// Fill absent components from a matching issuer
    ///
    /// Never replaces a present component. Returns true if anything changed.
    pub fn merge_from(&mut self, other: &Issuer) -> bool {
        let mut changed = false;
        for (mine, theirs) in [
            (&mut self.local_namespace, &other.local_namespace),
            (&mut self.universal_id, &other.universal_id),
            (&mut self.universal_id_type, &other.universal_id_type),
        ] {
            if mine.is_none() && theirs.is_some() {
                *mine = theirs.clone();
                changed = true;
            }
        }
        changed
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local_namespace.as_deref().unwrap_or(""))?;
        if self.universal_id.is_some() || self.universal_id_type.is_some() {
            write!(
                f,
                "&{}&{}",
                self.universal_id.as_deref().unwrap_or(""),
                self.universal_id_type.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

/// Combine two optional issuers the way identifier matching sees them
///
/// An absent issuer is a wildcard.
pub fn issuers_match(a: Option<&Issuer>, b: Option<&Issuer>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.matches(b),
        _ => true,
    }
}
