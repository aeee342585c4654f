//! Sequencing after an order is finalized.
//!
//! The finalize write path (production record, machine release, order status)
//! must fully succeed before the next queued order is looked up; a partial
//! failure is returned to the caller and the machine keeps its phase.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::RemoteError;
use crate::phase::{ActiveAssignment, Phase};
use crate::remote::{
    MachineStatusUpdate, OrderStatus, ProductionDelta, QueuedOrder, RemoteGateway, bounded,
};
use crate::shift::ShiftResolver;

/// First order eligible to run next on `machine_id`.
///
/// Skips `exclude_order_id` and terminal orders; ordered by sequence
/// position, then creation time.
pub fn next_eligible<'a>(
    orders: impl Iterator<Item = &'a QueuedOrder>,
    machine_id: &str,
    exclude_order_id: &str,
) -> Option<&'a QueuedOrder> {
    orders
        .filter(|o| o.machine_id == machine_id)
        .filter(|o| o.order_id != exclude_order_id)
        .filter(|o| !o.status.is_terminal())
        .min_by(|a, b| {
            a.sequence_position
                .cmp(&b.sequence_position)
                .then_with(|| a.created_at.cmp(&b.created_at))
        })
}

/// Counts reported when finalizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeCounts {
    pub good_count: u32,
    pub scrap_count: u32,
}

pub struct SequencingController {
    gateway: Arc<dyn RemoteGateway>,
    shifts: Arc<dyn ShiftResolver>,
    timeout: Duration,
}

impl SequencingController {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        shifts: Arc<dyn ShiftResolver>,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            shifts,
            timeout,
        }
    }

    /// Build the production record for the order being finalized.
    pub fn production_delta(
        &self,
        assignment: &ActiveAssignment,
        counts: FinalizeCounts,
        finished_at: DateTime<Utc>,
    ) -> ProductionDelta {
        ProductionDelta {
            order_id: assignment.order_id.clone(),
            good_count: counts.good_count,
            scrap_count: counts.scrap_count,
            phase_start: assignment
                .production_started_at
                .unwrap_or(assignment.order_started_at),
            phase_end: finished_at,
            shift_label: self.shifts.shift_label(finished_at),
        }
    }

    /// Persist the finalize: record output, release the machine, complete the order.
    ///
    /// Stops at the first failing step. The operator stays on the machine
    /// record.
    pub async fn persist_finalize(
        &self,
        assignment: &ActiveAssignment,
        counts: FinalizeCounts,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RemoteError> {
        let delta = self.production_delta(assignment, counts, finished_at);
        bounded(
            "record_production_delta",
            self.timeout,
            self.gateway.record_production_delta(&delta),
        )
        .await?;

        let release = MachineStatusUpdate {
            machine_id: assignment.machine_id.clone(),
            status: Phase::Idle,
            status_change_at: finished_at,
            order_id: None,
            operator_id: None,
            stop_reason: None,
        };
        bounded(
            "set_machine_status",
            self.timeout,
            self.gateway.set_machine_status(&release),
        )
        .await?;

        bounded(
            "set_order_status",
            self.timeout,
            self.gateway
                .set_order_status(&assignment.order_id, OrderStatus::Completed),
        )
        .await?;

        info!(
            machine_id = %assignment.machine_id,
            order_id = %assignment.order_id,
            good = counts.good_count,
            scrap = counts.scrap_count,
            shift = %delta.shift_label,
            "order finalized"
        );
        Ok(())
    }

    /// Next order to run after `finished_order_id`, if any.
    pub async fn next_order(
        &self,
        machine_id: &str,
        finished_order_id: &str,
    ) -> Result<Option<QueuedOrder>, RemoteError> {
        let next = bounded(
            "get_next_queued_order",
            self.timeout,
            self.gateway
                .get_next_queued_order(machine_id, finished_order_id),
        )
        .await?;
        match &next {
            Some(order) => debug!(%machine_id, next_order = %order.order_id, "next order queued"),
            None => debug!(%machine_id, "no queued order; machine returns to idle"),
        }
        Ok(next)
    }

    /// Mark the successor as running.
    pub async fn activate(&self, order_id: &str) -> Result<(), RemoteError> {
        bounded(
            "set_order_status",
            self.timeout,
            self.gateway
                .set_order_status(order_id, OrderStatus::InProgress),
        )
        .await
    }

    /// Mark a suspended order remotely.
    pub async fn suspend(&self, order_id: &str) -> Result<(), RemoteError> {
        bounded(
            "set_order_status",
            self.timeout,
            self.gateway
                .set_order_status(order_id, OrderStatus::Suspended),
        )
        .await
    }
}
