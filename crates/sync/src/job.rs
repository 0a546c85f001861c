//! Per-job identity and state machine
//!
//! A job is identified by `<owner>|<container-uuid>` and moves through
//! `INIT → SCANNING → SYNCING ↔ SYNCED` until it terminates in `STOPPED`
//! or `ERROR`. Transitions are validated; an illegal one is a bug in the
//! engine, not an operator error, and is rejected loudly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::crypto::KeyFingerprint;

use crate::index::Conflict;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid job id: {0}")]
    BadId(String),
    #[error("illegal state transition: {from} -> {to}")]
    BadTransition { from: SyncState, to: SyncState },
}

/// `<owner>|<container-uuid>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId {
    pub owner: KeyFingerprint,
    pub container: Uuid,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.owner, self.container)
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, JobError> {
        let (owner, container) = s.split_once('|').ok_or_else(|| JobError::BadId(s.into()))?;
        Ok(JobId {
            owner: owner.parse().map_err(|_| JobError::BadId(s.into()))?,
            container: Uuid::parse_str(container).map_err(|_| JobError::BadId(s.into()))?,
        })
    }
}

impl TryFrom<String> for JobId {
    type Error = JobError;

    fn try_from(s: String) -> Result<Self, JobError> {
        s.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> String {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    Init,
    Scanning,
    Syncing,
    Synced,
    Stopped,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Init => "INIT",
            SyncState::Scanning => "SCANNING",
            SyncState::Syncing => "SYNCING",
            SyncState::Synced => "SYNCED",
            SyncState::Stopped => "STOPPED",
            SyncState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Stopped)
    }

    /// Legal transitions. `stop` is allowed from anywhere, and any state
    /// may fail into `ERROR`.
    pub fn can_transition_to(&self, to: SyncState) -> bool {
        if to == SyncState::Stopped || to == SyncState::Error {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (SyncState::Init, SyncState::Scanning)
                | (SyncState::Scanning, SyncState::Syncing)
                | (SyncState::Syncing, SyncState::Synced)
                | (SyncState::Synced, SyncState::Syncing)
        )
    }
}

/// Mutable job status shared between the engine task and the daemon.
#[derive(Debug)]
pub struct JobStatus {
    state: SyncState,
    pub last_error: Option<String>,
    pub conflicts: Vec<Conflict>,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus {
            state: SyncState::Init,
            last_error: None,
            conflicts: Vec::new(),
        }
    }
}

impl JobStatus {
    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn transition(&mut self, to: SyncState) -> Result<(), JobError> {
        if !self.state.can_transition_to(to) {
            return Err(JobError::BadTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!("sync state {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!("sync job failed: {}", error);
        self.last_error = Some(error);
        if self.state.can_transition_to(SyncState::Error) {
            self.state = SyncState::Error;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_job_id_round_trip() {
        let raw = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77|5c34712e-e0a8-4b67-9317-9c3dbb1a4282";
        let id: JobId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
        assert!("nonsense".parse::<JobId>().is_err());
    }

    #[test]
    fn test_state_machine_shape() {
        use SyncState::*;
        assert!(Init.can_transition_to(Scanning));
        assert!(Scanning.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Synced.can_transition_to(Syncing));
        assert!(Synced.can_transition_to(Stopped));
        assert!(Syncing.can_transition_to(Error));
        assert!(!Stopped.can_transition_to(Syncing));
        assert!(!Stopped.can_transition_to(Error));
        assert!(!Init.can_transition_to(Synced));
    }

    #[test]
    fn test_error_keeps_message_until_stop() {
        let mut status = JobStatus::default();
        status.transition(SyncState::Scanning).unwrap();
        status.fail("backend exploded");
        assert_eq!(status.state(), SyncState::Error);
        assert!(status.last_error.as_deref().unwrap().contains("exploded"));
        status.transition(SyncState::Stopped).unwrap();
        assert_eq!(status.state(), SyncState::Stopped);
    }
}
