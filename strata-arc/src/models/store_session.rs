//! Store operation state machine
//!
//! Every store operation progresses through:
//! INITIALIZED → SPOOLED → PARSED → COERCED → HIERARCHY_RESOLVED → PERSISTED → NOTIFIED
//!
//! REJECTED is reachable from any non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreState {
    Initialized,
    /// Bytes staged in the session spool directory
    Spooled,
    Parsed,
    /// Attribute rewrite rules applied
    Coerced,
    /// Subject resolved inside the store transaction
    HierarchyResolved,
    /// Transaction committed
    Persisted,
    /// Stored signal delivered to listeners
    Notified,
    /// Failed; the transaction was rolled back
    Rejected,
}

impl StoreState {
    /// Successor on the happy path
    pub fn next(&self) -> Option<StoreState> {
        match self {
            StoreState::Initialized => Some(StoreState::Spooled),
            StoreState::Spooled => Some(StoreState::Parsed),
            StoreState::Parsed => Some(StoreState::Coerced),
            StoreState::Coerced => Some(StoreState::HierarchyResolved),
            StoreState::HierarchyResolved => Some(StoreState::Persisted),
            StoreState::Persisted => Some(StoreState::Notified),
            StoreState::Notified | StoreState::Rejected => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreState::Notified | StoreState::Rejected)
    }

    /// Whether `to` may follow this state
    pub fn can_transition_to(&self, to: StoreState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == StoreState::Rejected || self.next() == Some(to)
    }
}

/// Recorded state change of one store session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_state: StoreState,
    pub new_state: StoreState,
    pub transitioned_at: DateTime<Utc>,
}

/// Outcome of the duplicate check for an already stored SOP instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceExistsAction {
    /// Byte-identical re-send; nothing is written
    Ignore,
    /// Differing content, overwrite allowed; prior Locations are dropped
    Replace,
    /// Differing content, overwrite forbidden
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_order() {
        let mut state = StoreState::Initialized;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            visited.push(state);
        }
        assert_eq!(visited.len(), 7);
        assert_eq!(state, StoreState::Notified);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_rejected_reachable_from_any_non_terminal_state() {
        for state in [
            StoreState::Initialized,
            StoreState::Spooled,
            StoreState::Parsed,
            StoreState::Coerced,
            StoreState::HierarchyResolved,
            StoreState::Persisted,
        ] {
            assert!(state.can_transition_to(StoreState::Rejected), "{:?}", state);
        }
        assert!(!StoreState::Notified.can_transition_to(StoreState::Rejected));
        assert!(!StoreState::Rejected.can_transition_to(StoreState::Initialized));
    }

    #[test]
    fn test_states_cannot_be_skipped() {
        assert!(!StoreState::Initialized.can_transition_to(StoreState::Parsed));
        assert!(!StoreState::Spooled.can_transition_to(StoreState::Persisted));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&StoreState::HierarchyResolved).unwrap();
        assert_eq!(json, "\"HIERARCHY_RESOLVED\"");
    }
}
