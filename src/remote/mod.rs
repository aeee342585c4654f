//! Remote Store Gateway contract.
//!
//! The remote store is the assignment authority shared by every client: it
//! says which order and operator a machine has and in which status. It is
//! not trusted for timing. Implementations: `memory::MemoryGateway`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::RemoteError;
use crate::phase::{MachineId, OperatorId, OrderId, Phase};

pub use memory::MemoryGateway;

/// Authoritative view of one machine as last read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMachineSnapshot {
    pub machine_id: MachineId,
    pub status: Phase,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub operator_id: Option<OperatorId>,
    #[serde(default)]
    pub status_change_at: Option<DateTime<Utc>>,
}

impl RemoteMachineSnapshot {
    pub fn idle(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            status: Phase::Idle,
            order_id: None,
            operator_id: None,
            status_change_at: None,
        }
    }
}

/// Marks who produced a change notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTag(String);

impl SourceTag {
    /// A fresh tag for one logical client session.
    pub fn new_session() -> Self {
        Self(format!("session:{}", Uuid::new_v4()))
    }

    /// Changes written directly to the store by another party.
    pub fn database() -> Self {
        Self("database".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Out-of-band announcement of a machine status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub machine_id: MachineId,
    pub status: Phase,
    #[serde(default)]
    pub operator_id: Option<OperatorId>,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub status_change_at: Option<DateTime<Utc>>,
    pub source: SourceTag,
}

impl ChangeNotification {
    pub fn from_update(update: &MachineStatusUpdate, source: &SourceTag) -> Self {
        Self {
            machine_id: update.machine_id.clone(),
            status: update.status,
            operator_id: update.operator_id.clone(),
            order_id: update.order_id.clone(),
            status_change_at: Some(update.status_change_at),
            source: source.clone(),
        }
    }
}

/// Arguments of `set_machine_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatusUpdate {
    pub machine_id: MachineId,
    pub status: Phase,
    pub status_change_at: DateTime<Utc>,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub operator_id: Option<OperatorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    InProgress,
    Suspended,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

/// A production order queued on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOrder {
    pub order_id: OrderId,
    pub machine_id: MachineId,
    pub status: OrderStatus,
    /// Explicit queue position; ties fall back to creation order.
    pub sequence_position: i64,
    pub created_at: DateTime<Utc>,
}

/// Output recorded when an order is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionDelta {
    pub order_id: OrderId,
    pub good_count: u32,
    pub scrap_count: u32,
    pub phase_start: DateTime<Utc>,
    pub phase_end: DateTime<Utc>,
    pub shift_label: String,
}

/// Mutation/query interface and change feed of the shared store.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn get_machine(&self, machine_id: &str) -> Result<RemoteMachineSnapshot, RemoteError>;

    async fn set_machine_status(&self, update: &MachineStatusUpdate) -> Result<(), RemoteError>;

    /// Notifications for one machine, or for every machine when `None`.
    async fn subscribe_change_feed(
        &self,
        machine_id: Option<&str>,
    ) -> Result<BoxStream<'static, ChangeNotification>, RemoteError>;

    async fn publish_change(&self, notification: &ChangeNotification) -> Result<(), RemoteError>;

    async fn get_next_queued_order(
        &self,
        machine_id: &str,
        exclude_order_id: &str,
    ) -> Result<Option<QueuedOrder>, RemoteError>;

    async fn set_order_status(&self, order_id: &str, status: OrderStatus)
    -> Result<(), RemoteError>;

    async fn record_production_delta(&self, delta: &ProductionDelta) -> Result<(), RemoteError>;
}

/// Run a remote call with an upper bound on how long it may take.
pub async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout { operation, after }),
    }
}
