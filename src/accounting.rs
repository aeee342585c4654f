//! Phase time accounting.
//!
//! Accumulators hold whole seconds per phase for one order. The open timer
//! (`phase_started_at`) is consumed exactly once when its phase is closed
//! out, so replaying a close-out never credits the same interval twice.
//! Elapsed deltas are floored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Running per-phase totals for one order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAccumulators {
    pub setup_seconds: u64,
    pub production_seconds: u64,
    pub stopped_seconds: u64,
    /// Start of the phase currently being timed; `None` once consumed.
    #[serde(default)]
    pub phase_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status_change_at: Option<DateTime<Utc>>,
}

impl PhaseAccumulators {
    /// Fresh accumulators for an order whose first setup begins at `now`.
    pub fn started(now: DateTime<Utc>) -> Self {
        let mut acc = Self::default();
        acc.open(now);
        acc
    }

    /// Start timing a new phase at `now`.
    pub fn open(&mut self, now: DateTime<Utc>) {
        self.phase_started_at = Some(now);
        self.last_status_change_at = Some(now);
    }

    /// Credit the open interval to `phase` and consume the timer.
    ///
    /// Returns the seconds credited. A second call without an intervening
    /// `open` credits nothing.
    pub fn close_out(&mut self, phase: Phase, now: DateTime<Utc>) -> u64 {
        let Some(started) = self.phase_started_at.take() else {
            return 0;
        };
        let secs = elapsed_seconds(started, now);
        match phase {
            Phase::Setup => self.setup_seconds = self.setup_seconds.saturating_add(secs),
            Phase::Production => {
                self.production_seconds = self.production_seconds.saturating_add(secs)
            }
            Phase::Stopped => self.stopped_seconds = self.stopped_seconds.saturating_add(secs),
            // Untimed phases; the interval is dropped
            Phase::Idle | Phase::Suspended | Phase::Completed => return 0,
        }
        self.last_status_change_at = Some(now);
        secs
    }

    /// Mark a status change that does not start a new timed phase.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_status_change_at = Some(now);
    }

    pub fn total_seconds(&self) -> u64 {
        self.setup_seconds + self.production_seconds + self.stopped_seconds
    }

    /// Floored seconds since the open timer started, 0 if none is open.
    pub fn live_elapsed(&self, now: DateTime<Utc>) -> u64 {
        self.phase_started_at
            .map(|started| elapsed_seconds(started, now))
            .unwrap_or(0)
    }

    /// Accumulated total plus the open interval.
    pub fn total_with_live(&self, now: DateTime<Utc>) -> u64 {
        self.total_seconds() + self.live_elapsed(now)
    }
}

/// Whole seconds from `from` to `to`, floored and clamped at zero.
pub fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    // num_seconds truncates toward zero, which is a floor for non-negative spans
    (to - from).num_seconds().max(0) as u64
}

/// Where a resumed timer took its start instant from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Cache,
    Remote,
}

/// Pick the start instant for the live counter after a restart.
///
/// The durable cache wins; the remote `status_change_at` is the fallback.
/// Never yields "now", so a restart cannot zero a running phase.
pub fn recover_phase_start(
    cached: Option<&PhaseAccumulators>,
    remote_status_change_at: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, RecoverySource)> {
    if let Some(started) = cached.and_then(|acc| acc.phase_started_at) {
        return Some((started, RecoverySource::Cache));
    }
    remote_status_change_at.map(|at| (at, RecoverySource::Remote))
}
