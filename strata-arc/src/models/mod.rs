//! Data models for strata-arc
//!
//! Entities of the archive hierarchy (Subject → Study → Series → Instance),
//! their storage Locations, archiving tasks and the per-store state machine.

pub mod archiving_task;
pub mod hierarchy;
pub mod location;
pub mod store_session;
pub mod subject;

pub use archiving_task::{ArchivingTask, TaskStatus};
pub use hierarchy::{Instance, RequestAttributes, Series, Study};
pub use location::{Location, LocationStatus, NewLocation};
pub use store_session::{InstanceExistsAction, StoreState, StateTransition};
pub use subject::{Subject, SubjectId, SubjectStatus};

/// Separator of multi-valued summary attributes (`CT\MR`)
pub const MULTI_VALUE_SEPARATOR: char = '\\';

/// Split a stored multi-valued attribute
pub fn split_values(s: &str) -> Vec<String> {
    s.split(MULTI_VALUE_SEPARATOR)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Union of a stored multi-valued attribute with new values, sorted and deduplicated
pub fn union_values<'a>(stored: &'a str, values: impl IntoIterator<Item = &'a str>) -> String {
    let mut set: std::collections::BTreeSet<&str> = stored
        .split(MULTI_VALUE_SEPARATOR)
        .filter(|v| !v.is_empty())
        .collect();
    set.extend(values.into_iter().filter(|v| !v.is_empty()));
    set.into_iter()
        .collect::<Vec<_>>()
        .join(&MULTI_VALUE_SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_values_is_idempotent() {
        let once = union_values("", ["MR", "CT"]);
        assert_eq!(once, "CT\\MR");
        assert_eq!(union_values(&once, ["CT"]), "CT\\MR");
        assert_eq!(union_values(&once, ["US", ""]), "CT\\MR\\US");
        assert_eq!(split_values("CT\\MR"), vec!["CT", "MR"]);
        assert!(split_values("").is_empty());
    }
}
