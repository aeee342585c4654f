//! In-process remote store with a broadcast change feed.
//!
//! Holds machines, queued orders and production records behind one mutex and
//! fans notifications out over a `tokio::sync::broadcast` channel, the way
//! the dashboard server fans board updates out to websocket clients. Used by
//! the CLI simulation and by tests, which can inject latency and failures.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{
    ChangeNotification, MachineStatusUpdate, OrderStatus, ProductionDelta, QueuedOrder,
    RemoteGateway, RemoteMachineSnapshot, SourceTag,
};
use crate::errors::RemoteError;
use crate::phase::MachineId;
use crate::sequencing::next_eligible;

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct StoreState {
    machines: HashMap<MachineId, RemoteMachineSnapshot>,
    orders: Vec<QueuedOrder>,
    production: Vec<ProductionDelta>,
}

#[derive(Default)]
struct FailurePlan {
    /// Remaining forced failures per operation name.
    failing: HashMap<&'static str, usize>,
    latency: Option<Duration>,
}

pub struct MemoryGateway {
    state: Mutex<StoreState>,
    failures: Mutex<FailurePlan>,
    feed: broadcast::Sender<ChangeNotification>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        let (feed, _rx) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            failures: Mutex::new(FailurePlan::default()),
            feed,
        }
    }

    /// Register an idle machine.
    pub fn add_machine(&self, machine_id: &str) {
        self.with_state(|s| {
            s.machines
                .entry(machine_id.to_string())
                .or_insert_with(|| RemoteMachineSnapshot::idle(machine_id));
        });
    }

    pub fn enqueue_order(&self, order: QueuedOrder) {
        self.with_state(|s| s.orders.push(order));
    }

    pub fn machine(&self, machine_id: &str) -> Option<RemoteMachineSnapshot> {
        self.with_state(|s| s.machines.get(machine_id).cloned())
    }

    pub fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.with_state(|s| {
            s.orders
                .iter()
                .find(|o| o.order_id == order_id)
                .map(|o| o.status)
        })
    }

    pub fn production_records(&self) -> Vec<ProductionDelta> {
        self.with_state(|s| s.production.clone())
    }

    /// Write a snapshot as another party would and announce it as a database change.
    pub fn override_machine(&self, snapshot: RemoteMachineSnapshot) {
        let notification = ChangeNotification {
            machine_id: snapshot.machine_id.clone(),
            status: snapshot.status,
            operator_id: snapshot.operator_id.clone(),
            order_id: snapshot.order_id.clone(),
            status_change_at: snapshot.status_change_at,
            source: SourceTag::database(),
        };
        self.with_state(|s| {
            s.machines.insert(snapshot.machine_id.clone(), snapshot);
        });
        let _ = self.feed.send(notification);
    }

    /// Make the next `times` calls of `operation` fail as unavailable.
    pub fn fail_times(&self, operation: &'static str, times: usize) {
        if let Ok(mut plan) = self.failures.lock() {
            plan.failing.insert(operation, times);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut plan) = self.failures.lock() {
            plan.latency = latency;
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    async fn enter(&self, operation: &'static str) -> Result<(), RemoteError> {
        let latency = {
            let mut plan = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = plan.failing.get_mut(operation)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(RemoteError::Unavailable(format!(
                    "{} failed (injected)",
                    operation
                )));
            }
            plan.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn get_machine(&self, machine_id: &str) -> Result<RemoteMachineSnapshot, RemoteError> {
        self.enter("get_machine").await?;
        self.machine(machine_id)
            .ok_or_else(|| RemoteError::NotFound {
                machine_id: machine_id.to_string(),
            })
    }

    async fn set_machine_status(&self, update: &MachineStatusUpdate) -> Result<(), RemoteError> {
        self.enter("set_machine_status").await?;
        self.with_state(|s| -> Result<(), RemoteError> {
            let machine = s
                .machines
                .get_mut(&update.machine_id)
                .ok_or_else(|| RemoteError::NotFound {
                    machine_id: update.machine_id.clone(),
                })?;
            machine.status = update.status;
            machine.status_change_at = Some(update.status_change_at);
            machine.order_id = update.order_id.clone();
            // The operator stays on the machine record when an order is released
            if update.operator_id.is_some() {
                machine.operator_id = update.operator_id.clone();
            }
            Ok(())
        })
    }

    async fn subscribe_change_feed(
        &self,
        machine_id: Option<&str>,
    ) -> Result<BoxStream<'static, ChangeNotification>, RemoteError> {
        self.enter("subscribe_change_feed").await?;
        let filter = machine_id.map(str::to_string);
        let rx = self.feed.subscribe();
        let feed = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => return Some((notification, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |n| {
            let keep = filter.as_deref().is_none_or(|m| m == n.machine_id);
            async move { keep }
        });
        Ok(feed.boxed())
    }

    async fn publish_change(&self, notification: &ChangeNotification) -> Result<(), RemoteError> {
        self.enter("publish_change").await?;
        // No subscribers is not an error
        let _ = self.feed.send(notification.clone());
        Ok(())
    }

    async fn get_next_queued_order(
        &self,
        machine_id: &str,
        exclude_order_id: &str,
    ) -> Result<Option<QueuedOrder>, RemoteError> {
        self.enter("get_next_queued_order").await?;
        Ok(self.with_state(|s| {
            next_eligible(s.orders.iter(), machine_id, exclude_order_id).cloned()
        }))
    }

    async fn set_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), RemoteError> {
        self.enter("set_order_status").await?;
        self.with_state(|s| -> Result<(), RemoteError> {
            let order = s
                .orders
                .iter_mut()
                .find(|o| o.order_id == order_id)
                .ok_or_else(|| RemoteError::Rejected(format!("Unknown order {}", order_id)))?;
            order.status = status;
            Ok(())
        })
    }

    async fn record_production_delta(&self, delta: &ProductionDelta) -> Result<(), RemoteError> {
        self.enter("record_production_delta").await?;
        self.with_state(|s| s.production.push(delta.clone()));
        Ok(())
    }
}
