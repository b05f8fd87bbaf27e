//! Per-object store session
//!
//! A session owns the spool directory of one incoming object and records
//! every state change. Dropping a session that was never cleaned up removes
//! its spool directory.

use crate::ingest::dataset::Dataset;
use crate::models::{StateTransition, StoreState};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use strata_common::config::AeConfig;
use uuid::Uuid;

/// Data accumulated while the object moves through the pipeline
#[derive(Debug, Clone, Default)]
pub struct StoreContext {
    pub spool_path: Option<PathBuf>,
    pub object_size: u64,
    /// Hex digest of the spooled bytes, if the AE computes one
    pub digest: Option<String>,
    pub dataset: Option<Dataset>,
}

#[derive(Debug)]
pub struct StoreSession {
    pub id: Uuid,
    /// Calling AE title of the sender
    pub source_aet: String,
    /// Receiving AE
    pub ae: AeConfig,
    pub spool_dir: PathBuf,
    pub state: StoreState,
    pub transitions: Vec<StateTransition>,
    pub started_at: DateTime<Utc>,
    pub context: StoreContext,
    cleaned: bool,
}

impl StoreSession {
    pub fn new(source_aet: impl Into<String>, ae: AeConfig, spool_root: &Path) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            source_aet: source_aet.into(),
            ae,
            spool_dir: spool_root.join(id.to_string()),
            state: StoreState::Initialized,
            transitions: Vec::new(),
            started_at: Utc::now(),
            context: StoreContext::default(),
            cleaned: false,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: StoreState) -> StateTransition {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(
                session_id = %self.id,
                from = ?self.state,
                to = ?new_state,
                "Unexpected store state transition"
            );
        }
        let transition = StateTransition {
            session_id: self.id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;
        self.transitions.push(transition.clone());
        transition
    }

    /// Move to `Rejected` unless already terminal
    pub fn reject(&mut self) {
        if !self.state.is_terminal() {
            self.transition_to(StoreState::Rejected);
        }
    }

    pub fn sop_iuid(&self) -> Option<String> {
        self.context.dataset.as_ref().and_then(Dataset::sop_iuid)
    }

    /// Remove the spool directory; safe to call more than once
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        match tokio::fs::remove_dir_all(&self.spool_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                session_id = %self.id,
                spool_dir = %self.spool_dir.display(),
                error = %e,
                "Failed to remove spool directory"
            ),
        }
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.spool_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ae() -> AeConfig {
        AeConfig {
            ae_title: "STRATA".to_string(),
            storage_group_id: "ONLINE".to_string(),
            retrieve_aets: vec![],
            digest_algorithm: None,
            duplicate_policy: Default::default(),
            qc_update_scope: Default::default(),
        }
    }

    #[test]
    fn test_transitions_are_recorded() {
        let dir = TempDir::new().unwrap();
        let mut session = StoreSession::new("SRC", ae(), dir.path());
        session.transition_to(StoreState::Spooled);
        session.reject();
        session.reject();

        assert_eq!(session.state, StoreState::Rejected);
        assert_eq!(session.transitions.len(), 2);
        assert_eq!(session.transitions[1].old_state, StoreState::Spooled);
        assert!(session.transitions.iter().all(|t| t.session_id == session.id));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut session = StoreSession::new("SRC", ae(), dir.path());
        tokio::fs::create_dir_all(&session.spool_dir).await.unwrap();
        tokio::fs::write(session.spool_dir.join("object"), b"x").await.unwrap();

        session.cleanup().await;
        session.cleanup().await;
        assert!(!session.spool_dir.exists());
    }

    #[test]
    fn test_drop_removes_spool_dir() {
        let dir = TempDir::new().unwrap();
        let spool_dir = {
            let session = StoreSession::new("SRC", ae(), dir.path());
            std::fs::create_dir_all(&session.spool_dir).unwrap();
            session.spool_dir.clone()
        };
        assert!(!spool_dir.exists());
    }
}
