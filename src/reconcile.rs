//! Reconciliation between local phase state, the durable cache, the remote
//! store and change notifications from other clients.
//!
//! Merge rule: the remote store decides identity (which order, which
//! operator, which status); local state decides timing. Per machine, the
//! held `status_change_at` only moves forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::accounting::{PhaseAccumulators, RecoverySource, recover_phase_start};
use crate::cache::{CacheDocument, DurableCache};
use crate::errors::{MergeRejected, RemoteError};
use crate::phase::{ActiveAssignment, MachineId, OperatorId, OrderId, Phase};
use crate::remote::{
    ChangeNotification, MachineStatusUpdate, RemoteGateway, RemoteMachineSnapshot, SourceTag,
    bounded,
};

/// One row of the display mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatusEntry {
    pub machine_id: MachineId,
    pub status: Phase,
    pub order_id: Option<OrderId>,
    pub operator_id: Option<OperatorId>,
    pub status_change_at: Option<DateTime<Utc>>,
}

impl MachineStatusEntry {
    /// What the store should say for a machine running `assignment`.
    pub fn for_assignment(assignment: &ActiveAssignment) -> Self {
        Self {
            machine_id: assignment.machine_id.clone(),
            status: assignment.phase,
            order_id: Some(assignment.order_id.clone()),
            operator_id: Some(assignment.operator_id.clone()),
            status_change_at: Some(assignment.phase_started_at),
        }
    }
}

impl From<&ChangeNotification> for MachineStatusEntry {
    fn from(n: &ChangeNotification) -> Self {
        Self {
            machine_id: n.machine_id.clone(),
            status: n.status,
            order_id: n.order_id.clone(),
            operator_id: n.operator_id.clone(),
            status_change_at: n.status_change_at,
        }
    }
}

impl From<&RemoteMachineSnapshot> for MachineStatusEntry {
    fn from(s: &RemoteMachineSnapshot) -> Self {
        Self {
            machine_id: s.machine_id.clone(),
            status: s.status,
            order_id: s.order_id.clone(),
            operator_id: s.operator_id.clone(),
            status_change_at: s.status_change_at,
        }
    }
}

/// What to do with an incoming notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Self-originated; already applied, only the mirror is refreshed.
    MirrorOnly,
    /// Fetch a fresh snapshot of the machine and reconcile.
    Refetch { machine_id: MachineId },
}

/// Result of merging a snapshot into local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Local state already agrees with the snapshot.
    Unchanged,
    /// Local state is replaced wholesale.
    Replaced {
        assignment: ActiveAssignment,
        accumulators: PhaseAccumulators,
    },
    /// The machine no longer has an active order.
    Cleared { previous_order: OrderId },
}

/// Decide how a snapshot changes local state.
///
/// `local` is the session's current assignment and accumulators; `cached` is
/// the shared durable cache, consulted when another session on the same
/// profile already recorded timing for the order. `now` is only used when
/// the snapshot carries no timestamp.
pub fn merge_snapshot(
    local: Option<(&ActiveAssignment, &PhaseAccumulators)>,
    snapshot: &RemoteMachineSnapshot,
    cached: &CacheDocument,
    operator_fallback: &str,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let remote_order = snapshot
        .order_id
        .as_deref()
        .filter(|_| snapshot.status.is_active());

    let Some(remote_order) = remote_order else {
        return match local {
            Some((a, _)) => MergeOutcome::Cleared {
                previous_order: a.order_id.clone(),
            },
            None => MergeOutcome::Unchanged,
        };
    };

    let changed_at = snapshot.status_change_at.unwrap_or(now);
    let operator = snapshot
        .operator_id
        .clone()
        .unwrap_or_else(|| operator_fallback.to_string());

    // Another session under this profile may already hold the exact state
    if let Some(shared) = cached
        .assignment(&snapshot.machine_id)
        .filter(|a| a.order_id == remote_order && a.phase == snapshot.status)
    {
        let accumulators = cached
            .accumulators(remote_order)
            .cloned()
            .unwrap_or_else(|| PhaseAccumulators::started(shared.phase_started_at));
        let mut assignment = shared.clone();
        assignment.operator_id = operator;
        if let Some((a, acc)) = local
            && *a == assignment
            && *acc == accumulators
        {
            return MergeOutcome::Unchanged;
        }
        return MergeOutcome::Replaced {
            assignment,
            accumulators,
        };
    }

    match local {
        Some((a, acc)) if a.order_id == remote_order => {
            if a.phase == snapshot.status {
                if a.operator_id == operator {
                    return MergeOutcome::Unchanged;
                }
                let mut assignment = a.clone();
                assignment.operator_id = operator;
                return MergeOutcome::Replaced {
                    assignment,
                    accumulators: acc.clone(),
                };
            }

            // Same order moved to another phase elsewhere: close our running
            // phase at the remote change instant and start the new one there
            let mut accumulators = acc.clone();
            accumulators.close_out(a.phase, changed_at);
            accumulators.open(changed_at);
            let mut assignment = a.clone();
            assignment.operator_id = operator;
            assignment.stopped_from = match snapshot.status {
                Phase::Stopped if a.phase.is_billable() => Some(a.phase),
                Phase::Stopped => a.stopped_from,
                _ => None,
            };
            if snapshot.status != Phase::Stopped {
                assignment.stop_reason = None;
            }
            if snapshot.status == Phase::Production && assignment.production_started_at.is_none()
            {
                assignment.production_started_at = Some(changed_at);
            }
            assignment.phase = snapshot.status;
            assignment.phase_started_at = changed_at;
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            }
        }
        _ => {
            let shared = cached.accumulators(remote_order);
            let (started, _) = recover_phase_start(shared, Some(changed_at))
                .unwrap_or((changed_at, RecoverySource::Remote));
            let mut accumulators = shared.cloned().unwrap_or_default();
            if accumulators.phase_started_at.is_none() {
                accumulators.open(started);
            }
            let assignment = ActiveAssignment {
                machine_id: snapshot.machine_id.clone(),
                order_id: remote_order.to_string(),
                operator_id: operator,
                phase: snapshot.status,
                phase_started_at: started,
                stopped_from: None,
                stop_reason: None,
                order_started_at: changed_at,
                production_started_at: (snapshot.status == Phase::Production)
                    .then_some(changed_at),
            };
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            }
        }
    }
}

#[derive(Default)]
struct ReconcileState {
    /// Last accepted status change per machine, with what it said.
    held: HashMap<MachineId, (DateTime<Utc>, MachineStatusEntry)>,
    mirror: BTreeMap<MachineId, MachineStatusEntry>,
}

/// Write path, notification routing and the monotonic merge guard.
pub struct Reconciler {
    gateway: Arc<dyn RemoteGateway>,
    source: SourceTag,
    timeout: Duration,
    state: Mutex<ReconcileState>,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn RemoteGateway>, source: SourceTag, timeout: Duration) -> Self {
        Self {
            gateway,
            source,
            timeout,
            state: Mutex::new(ReconcileState::default()),
        }
    }

    pub fn source(&self) -> &SourceTag {
        &self.source
    }

    /// Write-path step 1: durable cache. Failures are logged, never fatal.
    pub fn persist_local(
        &self,
        cache: &dyn DurableCache,
        f: &mut dyn FnMut(&mut CacheDocument),
    ) -> bool {
        match cache.update(f) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to write local phase cache");
                false
            }
        }
    }

    /// Write-path steps 2 and 3: remote status, then announce the change.
    pub async fn push_remote(&self, update: &MachineStatusUpdate) -> Result<(), RemoteError> {
        self.note_local(update);
        bounded(
            "set_machine_status",
            self.timeout,
            self.gateway.set_machine_status(update),
        )
        .await?;

        let notification = ChangeNotification::from_update(update, &self.source);
        bounded(
            "publish_change",
            self.timeout,
            self.gateway.publish_change(&notification),
        )
        .await?;
        debug!(
            machine_id = %update.machine_id,
            status = %update.status,
            "status change published"
        );
        Ok(())
    }

    /// Announce a change whose remote write already happened elsewhere.
    pub async fn announce(&self, update: &MachineStatusUpdate) -> Result<(), RemoteError> {
        self.note_local(update);
        let notification = ChangeNotification::from_update(update, &self.source);
        bounded(
            "publish_change",
            self.timeout,
            self.gateway.publish_change(&notification),
        )
        .await
    }

    /// Decide how to handle `notification` for a session on `selected_machine`.
    pub fn route(&self, notification: &ChangeNotification, selected_machine: &str) -> Route {
        self.observe(notification);
        if notification.source == self.source || notification.machine_id != selected_machine {
            return Route::MirrorOnly;
        }
        debug!(
            machine_id = %notification.machine_id,
            source = %notification.source,
            "foreign change on selected machine"
        );
        Route::Refetch {
            machine_id: notification.machine_id.clone(),
        }
    }

    /// Refresh the display mirror from a notification.
    pub fn observe(&self, notification: &ChangeNotification) {
        self.with_state(|s| {
            s.mirror.insert(
                notification.machine_id.clone(),
                MachineStatusEntry::from(notification),
            );
        });
    }

    /// Refresh the display mirror from a fetched snapshot.
    pub fn observe_snapshot(&self, snapshot: &RemoteMachineSnapshot) {
        self.with_state(|s| {
            s.mirror.insert(
                snapshot.machine_id.clone(),
                MachineStatusEntry::from(snapshot),
            );
        });
    }

    pub fn mirror(&self) -> Vec<MachineStatusEntry> {
        self.with_state(|s| s.mirror.values().cloned().collect())
    }

    pub async fn fetch(&self, machine_id: &str) -> Result<RemoteMachineSnapshot, RemoteError> {
        let snapshot = bounded(
            "get_machine",
            self.timeout,
            self.gateway.get_machine(machine_id),
        )
        .await?;
        self.observe_snapshot(&snapshot);
        Ok(snapshot)
    }

    /// Seed the held timestamp for a machine from restored local state.
    pub fn hold(&self, machine_id: &str, at: DateTime<Utc>, entry: MachineStatusEntry) {
        self.with_state(|s| {
            let newer = s
                .held
                .get(machine_id)
                .is_none_or(|(held, _)| at > *held);
            if newer {
                s.held.insert(machine_id.to_string(), (at, entry));
            }
        });
    }

    pub fn held_at(&self, machine_id: &str) -> Option<DateTime<Utc>> {
        self.with_state(|s| s.held.get(machine_id).map(|(at, _)| *at))
    }

    /// Monotonic guard: accept `snapshot` only if it moves the machine forward.
    ///
    /// An older timestamp is rejected. An equal timestamp is rejected when it
    /// says nothing new, and accepted when it carries a different status or
    /// identity (two writes landing in the same instant).
    pub fn admit(&self, snapshot: &RemoteMachineSnapshot) -> Result<(), MergeRejected> {
        let Some(offered) = snapshot.status_change_at else {
            return Ok(());
        };
        let entry = MachineStatusEntry::from(snapshot);
        self.with_state(|s| {
            if let Some((held, held_entry)) = s.held.get(&snapshot.machine_id) {
                let stale = offered < *held || (offered == *held && *held_entry == entry);
                if stale {
                    return Err(MergeRejected {
                        held: *held,
                        offered,
                    });
                }
            }
            s.held
                .insert(snapshot.machine_id.clone(), (offered, entry));
            Ok(())
        })
    }

    /// Log the outcome of a merge.
    pub fn log_outcome(&self, machine_id: &str, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Unchanged => debug!(%machine_id, "snapshot agrees with local state"),
            MergeOutcome::Replaced { assignment, .. } => info!(
                %machine_id,
                order_id = %assignment.order_id,
                phase = %assignment.phase,
                "local assignment replaced from remote snapshot"
            ),
            MergeOutcome::Cleared { previous_order } => info!(
                %machine_id,
                %previous_order,
                "remote released the machine; local assignment cleared"
            ),
        }
    }

    fn note_local(&self, update: &MachineStatusUpdate) {
        let entry = MachineStatusEntry {
            machine_id: update.machine_id.clone(),
            status: update.status,
            order_id: update.order_id.clone(),
            operator_id: update.operator_id.clone(),
            status_change_at: Some(update.status_change_at),
        };
        self.with_state(|s| {
            s.mirror.insert(update.machine_id.clone(), entry.clone());
            let newer = s
                .held
                .get(&update.machine_id)
                .is_none_or(|(held, _)| update.status_change_at >= *held);
            if newer {
                s.held
                    .insert(update.machine_id.clone(), (update.status_change_at, entry));
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ReconcileState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryGateway;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn snapshot(order: Option<&str>, status: Phase, at: i64) -> RemoteMachineSnapshot {
        RemoteMachineSnapshot {
            machine_id: "M-01".into(),
            status,
            order_id: order.map(str::to_string),
            operator_id: Some("op-7".into()),
            status_change_at: Some(t(at)),
        }
    }

    fn local(order: &str, phase: Phase, started: i64) -> (ActiveAssignment, PhaseAccumulators) {
        let mut a = ActiveAssignment::begin_setup("M-01", order, "op-7", t(0));
        a.phase = phase;
        a.phase_started_at = t(started);
        let mut acc = PhaseAccumulators::started(t(0));
        acc.setup_seconds = 100;
        acc.phase_started_at = Some(t(started));
        (a, acc)
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(
            Arc::new(MemoryGateway::new()),
            SourceTag::new_session(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_same_order_same_phase_keeps_local_timing() {
        let (a, acc) = local("O1", Phase::Production, 100);
        let outcome = merge_snapshot(
            Some((&a, &acc)),
            &snapshot(Some("O1"), Phase::Production, 500),
            &CacheDocument::default(),
            "op-7",
            t(600),
        );
        assert_eq!(outcome, MergeOutcome::Unchanged);
    }

    #[test]
    fn test_operator_change_replaces_identity_only() {
        let (a, acc) = local("O1", Phase::Production, 100);
        let mut snap = snapshot(Some("O1"), Phase::Production, 500);
        snap.operator_id = Some("supervisor".into());
        match merge_snapshot(Some((&a, &acc)), &snap, &CacheDocument::default(), "op-7", t(600)) {
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            } => {
                assert_eq!(assignment.operator_id, "supervisor");
                assert_eq!(accumulators, acc);
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_phase_change_closes_local_phase_at_remote_instant() {
        let (a, acc) = local("O1", Phase::Production, 100);
        match merge_snapshot(
            Some((&a, &acc)),
            &snapshot(Some("O1"), Phase::Stopped, 160),
            &CacheDocument::default(),
            "op-7",
            t(200),
        ) {
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            } => {
                assert_eq!(assignment.phase, Phase::Stopped);
                assert_eq!(assignment.stopped_from, Some(Phase::Production));
                assert_eq!(accumulators.production_seconds, 60);
                assert_eq!(accumulators.setup_seconds, 100);
                assert_eq!(accumulators.phase_started_at, Some(t(160)));
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }
    }

    #[test]
    fn test_new_order_uses_cached_timing_when_present() {
        let mut cached = CacheDocument::default();
        let mut acc = PhaseAccumulators::started(t(10));
        acc.setup_seconds = 42;
        cached.orders.insert("O2".into(), acc.clone());
        match merge_snapshot(
            None,
            &snapshot(Some("O2"), Phase::Setup, 50),
            &cached,
            "op-7",
            t(60),
        ) {
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            } => {
                assert_eq!(assignment.order_id, "O2");
                assert_eq!(accumulators.setup_seconds, 42);
                assert_eq!(accumulators.phase_started_at, Some(t(10)));
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }
    }

    #[test]
    fn test_new_order_without_cache_seeds_from_remote_timestamp() {
        match merge_snapshot(
            None,
            &snapshot(Some("O2"), Phase::Production, 50),
            &CacheDocument::default(),
            "op-7",
            t(60),
        ) {
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            } => {
                assert_eq!(assignment.phase_started_at, t(50));
                assert_eq!(accumulators.total_seconds(), 0);
                assert_eq!(accumulators.live_elapsed(t(60)), 10);
                assert_eq!(assignment.production_started_at, Some(t(50)));
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_cache_assignment_is_adopted() {
        let (shared, shared_acc) = local("O2", Phase::Setup, 70);
        let mut cached = CacheDocument::default();
        cached.record(&shared, &shared_acc);
        let (a, acc) = local("O1", Phase::Production, 10);
        match merge_snapshot(
            Some((&a, &acc)),
            &snapshot(Some("O2"), Phase::Setup, 70),
            &cached,
            "op-7",
            t(80),
        ) {
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            } => {
                assert_eq!(assignment, shared);
                assert_eq!(accumulators, shared_acc);
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }
    }

    #[test]
    fn test_idle_snapshot_clears_local() {
        let (a, acc) = local("O1", Phase::Setup, 0);
        let outcome = merge_snapshot(
            Some((&a, &acc)),
            &snapshot(None, Phase::Idle, 30),
            &CacheDocument::default(),
            "op-7",
            t(40),
        );
        assert_eq!(
            outcome,
            MergeOutcome::Cleared {
                previous_order: "O1".into()
            }
        );
        let outcome = merge_snapshot(
            None,
            &snapshot(None, Phase::Idle, 30),
            &CacheDocument::default(),
            "op-7",
            t(40),
        );
        assert_eq!(outcome, MergeOutcome::Unchanged);
    }

    #[test]
    fn test_admit_rejects_older_snapshot() {
        let rec = reconciler();
        rec.admit(&snapshot(Some("O1"), Phase::Setup, 100)).unwrap();
        let err = rec
            .admit(&snapshot(Some("O1"), Phase::Production, 50))
            .unwrap_err();
        assert_eq!(err.held, t(100));
        assert_eq!(err.offered, t(50));
        assert_eq!(rec.held_at("M-01"), Some(t(100)));
    }

    #[test]
    fn test_admit_equal_timestamp_only_when_content_differs() {
        let rec = reconciler();
        rec.admit(&snapshot(None, Phase::Idle, 100)).unwrap();
        assert!(rec.admit(&snapshot(None, Phase::Idle, 100)).is_err());
        assert!(rec.admit(&snapshot(Some("O2"), Phase::Setup, 100)).is_ok());
    }

    #[test]
    fn test_route_own_tag_is_mirror_only() {
        let rec = reconciler();
        let own = ChangeNotification {
            machine_id: "M-01".into(),
            status: Phase::Setup,
            operator_id: None,
            order_id: Some("O1".into()),
            status_change_at: Some(t(1)),
            source: rec.source().clone(),
        };
        assert_eq!(rec.route(&own, "M-01"), Route::MirrorOnly);
        assert_eq!(rec.mirror().len(), 1);

        let foreign = ChangeNotification {
            source: SourceTag::database(),
            ..own.clone()
        };
        assert_eq!(
            rec.route(&foreign, "M-01"),
            Route::Refetch {
                machine_id: "M-01".into()
            }
        );

        let elsewhere = ChangeNotification {
            source: SourceTag::database(),
            machine_id: "M-02".into(),
            ..own
        };
        assert_eq!(rec.route(&elsewhere, "M-01"), Route::MirrorOnly);
        assert_eq!(rec.mirror().len(), 2);
    }

    #[tokio::test]
    async fn test_push_remote_writes_and_announces() {
        use futures_util::StreamExt;

        let store = Arc::new(MemoryGateway::new());
        store.add_machine("M-01");
        let rec = Reconciler::new(store.clone(), SourceTag::new_session(), Duration::from_secs(1));
        let mut feed = store.subscribe_change_feed(None).await.unwrap();
        let update = MachineStatusUpdate {
            machine_id: "M-01".into(),
            status: Phase::Setup,
            status_change_at: t(5),
            order_id: Some("O1".into()),
            operator_id: Some("op-7".into()),
            stop_reason: None,
        };
        rec.push_remote(&update).await.unwrap();

        assert_eq!(store.machine("M-01").unwrap().status, Phase::Setup);
        let n = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&n.source, rec.source());
        assert_eq!(rec.held_at("M-01"), Some(t(5)));
    }

    #[test]
    fn test_persist_local_reports_success() {
        let rec = reconciler();
        let cache = crate::cache::MemoryCache::new();
        let (a, acc) = local("O1", Phase::Setup, 0);
        assert!(rec.persist_local(&cache, &mut |doc: &mut CacheDocument| doc.record(&a, &acc)));
        assert!(cache.load().unwrap().assignment("M-01").is_some());
    }
}
