//! Shift labels for production records.
//!
//! Shift assignment is a lookup the finalize path consults; it is swappable
//! through `ShiftResolver`.

use chrono::{DateTime, FixedOffset, Local, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const UNASSIGNED_SHIFT: &str = "unassigned";

pub trait ShiftResolver: Send + Sync {
    fn shift_label(&self, at: DateTime<Utc>) -> String;
}

/// A shift covering `[start_hour, end_hour)` of the local day. Wraps midnight
/// when `end_hour < start_hour`; covers nothing when the two are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub label: String,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ShiftWindow {
    pub fn new(label: &str, start_hour: u32, end_hour: u32) -> Self {
        Self {
            label: label.to_string(),
            start_hour,
            end_hour,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        match self.start_hour.cmp(&self.end_hour) {
            Ordering::Less => hour >= self.start_hour && hour < self.end_hour,
            Ordering::Greater => hour >= self.start_hour || hour < self.end_hour,
            Ordering::Equal => false,
        }
    }
}

pub fn default_shifts() -> Vec<ShiftWindow> {
    vec![
        ShiftWindow::new("A", 6, 14),
        ShiftWindow::new("B", 14, 22),
        ShiftWindow::new("C", 22, 6),
    ]
}

/// Hour-range shift table evaluated in a fixed local offset.
#[derive(Debug, Clone)]
pub struct ShiftCalendar {
    windows: Vec<ShiftWindow>,
    offset: FixedOffset,
}

impl ShiftCalendar {
    pub fn new(windows: Vec<ShiftWindow>, offset: FixedOffset) -> Self {
        Self { windows, offset }
    }

    /// Calendar in the host's current UTC offset.
    pub fn local(windows: Vec<ShiftWindow>) -> Self {
        Self::new(windows, Local::now().offset().fix())
    }
}

impl ShiftResolver for ShiftCalendar {
    fn shift_label(&self, at: DateTime<Utc>) -> String {
        let hour = at.with_timezone(&self.offset).hour();
        self.windows
            .iter()
            .find(|w| w.contains(hour))
            .map(|w| w.label.clone())
            .unwrap_or_else(|| UNASSIGNED_SHIFT.to_string())
    }
}
