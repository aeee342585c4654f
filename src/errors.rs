//! Typed error hierarchy for the machine phase engine.
//!
//! Three enums cover the three failure surfaces:
//! - `PhaseError` — what a caller of `MachineSession` sees
//! - `RemoteError` — Remote Store Gateway failures
//! - `MergeRejected` — a stale snapshot discarded during reconciliation

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::phase::Phase;

/// Errors surfaced to callers of the transition API.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Cannot {event} while the machine is in phase {phase}")]
    Precondition { phase: Phase, event: &'static str },

    #[error("A transition is already in flight for machine {machine_id}")]
    Conflict { machine_id: String },

    #[error("Remote write failed: {0}")]
    RemoteWrite(#[source] RemoteError),

    #[error("Local cache error: {0}")]
    Cache(#[source] anyhow::Error),
}

impl PhaseError {
    /// True for errors that reflect an impossible request from the current phase.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors from the Remote Store Gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Machine {machine_id} not found")]
    NotFound { machine_id: String },

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
}

/// A remote snapshot was discarded because it was not newer than the held one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Snapshot at {offered} is not newer than held status change at {held}")]
pub struct MergeRejected {
    pub held: DateTime<Utc>,
    pub offered: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_error_names_current_phase() {
        let err = PhaseError::Precondition {
            phase: Phase::Idle,
            event: "begin production",
        };
        assert!(err.is_precondition());
        assert!(err.to_string().contains("idle"));
        assert!(err.to_string().contains("begin production"));
    }

    #[test]
    fn conflict_error_carries_machine() {
        let err = PhaseError::Conflict {
            machine_id: "M-01".to_string(),
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("M-01"));
    }

    #[test]
    fn remote_write_wraps_remote_error_as_source() {
        use std::error::Error as _;
        let err = PhaseError::RemoteWrite(RemoteError::Unavailable("offline".into()));
        let source = err.source().expect("source");
        assert!(source.to_string().contains("offline"));
    }

    #[test]
    fn timeout_reports_operation() {
        let err = RemoteError::Timeout {
            operation: "set_machine_status",
            after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("set_machine_status"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PhaseError::Conflict {
            machine_id: "x".into(),
        });
        assert_std_error(&RemoteError::Rejected("x".into()));
        let now = Utc::now();
        assert_std_error(&MergeRejected {
            held: now,
            offered: now,
        });
    }
}
