//! Machine session: the operator-facing facade over the phase engine.
//!
//! One session drives one selected machine for one operator. Transitions are
//! serialized per session; a request that arrives while another is in flight
//! is rejected with a conflict. Local effects of a transition (state, cache)
//! are applied before any remote call; remote failures degrade sync instead
//! of rolling the transition back.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accounting::PhaseAccumulators;
use crate::cache::{CacheDocument, DurableCache};
use crate::clock::Clock;
use crate::config::ShopfloorConfig;
use crate::errors::{MergeRejected, PhaseError, RemoteError};
use crate::phase::{
    ActiveAssignment, MachineId, OperatorId, OrderId, Phase, PhaseEvent, PhaseMachine, Step,
    StepContext,
};
use crate::reconcile::{MachineStatusEntry, MergeOutcome, Reconciler, Route, merge_snapshot};
use crate::remote::{
    ChangeNotification, MachineStatusUpdate, OrderStatus, RemoteGateway, SourceTag, bounded,
};
use crate::sequencing::{FinalizeCounts, SequencingController};
use crate::shift::ShiftResolver;

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub machine_id: MachineId,
    pub operator_id: OperatorId,
    pub tick_interval: Duration,
    pub remote_timeout: Duration,
    pub max_write_attempts: u32,
}

impl SessionOptions {
    pub fn new(machine_id: &str, operator_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            operator_id: operator_id.to_string(),
            tick_interval: Duration::from_secs(1),
            remote_timeout: Duration::from_secs(5),
            max_write_attempts: 3,
        }
    }

    pub fn from_config(config: &ShopfloorConfig) -> Self {
        Self {
            machine_id: config.toml.session.machine_id.clone(),
            operator_id: config.toml.session.operator_id.clone(),
            tick_interval: config.tick_interval(),
            remote_timeout: config.remote_timeout(),
            max_write_attempts: config.toml.remote.max_write_attempts,
        }
    }
}

/// Whether the remote store has seen every local change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Degraded { reason: String, attempts: u32 },
}

impl SyncStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// What produced a phase change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    Transition,
    Sequencing,
    Merge,
    Restore,
    Selection,
}

/// Delivered to `on_phase_changed` listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseChange {
    pub machine_id: MachineId,
    pub phase: Phase,
    pub assignment: Option<ActiveAssignment>,
    pub accumulators: PhaseAccumulators,
    pub cause: ChangeCause,
}

/// Result of handling a notification or refreshing from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Only the status mirror changed.
    Mirrored,
    Merged(MergeOutcome),
    /// Snapshot was stale; local state kept.
    Rejected(MergeRejected),
}

/// A remote write that has not landed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingWrite {
    /// Machine status write plus its announcement.
    Status(MachineStatusUpdate),
    /// Announcement only; the status itself is already stored.
    Announce(MachineStatusUpdate),
    Order {
        order_id: OrderId,
        status: OrderStatus,
    },
}

impl PendingWrite {
    fn status_machine(&self) -> Option<&str> {
        match self {
            Self::Status(u) | Self::Announce(u) => Some(&u.machine_id),
            Self::Order { .. } => None,
        }
    }

    /// True for a status write about `machine_id` older than `at`.
    fn older_than(&self, machine_id: &str, at: DateTime<Utc>) -> bool {
        match self {
            Self::Status(u) | Self::Announce(u) => {
                u.machine_id == machine_id && u.status_change_at < at
            }
            Self::Order { .. } => false,
        }
    }
}

struct SessionState {
    machine_id: MachineId,
    operator_id: OperatorId,
    assignment: Option<ActiveAssignment>,
    accumulators: PhaseAccumulators,
    sync: SyncStatus,
    pending: Vec<PendingWrite>,
}

type Listener = Arc<dyn Fn(&PhaseChange) + Send + Sync>;

/// Clears the in-flight flag when the transition finishes.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MachineSession {
    clock: Arc<dyn Clock>,
    cache: Arc<dyn DurableCache>,
    gateway: Arc<dyn RemoteGateway>,
    reconciler: Reconciler,
    sequencing: SequencingController,
    remote_timeout: Duration,
    tick_interval: Duration,
    max_write_attempts: u32,
    state: Mutex<SessionState>,
    in_flight: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    elapsed: watch::Sender<u64>,
}

impl MachineSession {
    pub fn new(
        opts: SessionOptions,
        clock: Arc<dyn Clock>,
        cache: Arc<dyn DurableCache>,
        gateway: Arc<dyn RemoteGateway>,
        shifts: Arc<dyn ShiftResolver>,
    ) -> Self {
        let source = SourceTag::new_session();
        let reconciler = Reconciler::new(gateway.clone(), source, opts.remote_timeout);
        let sequencing = SequencingController::new(gateway.clone(), shifts, opts.remote_timeout);
        let (elapsed, _rx) = watch::channel(0);
        Self {
            clock,
            cache,
            gateway,
            reconciler,
            sequencing,
            remote_timeout: opts.remote_timeout,
            tick_interval: opts.tick_interval,
            max_write_attempts: opts.max_write_attempts,
            state: Mutex::new(SessionState {
                machine_id: opts.machine_id,
                operator_id: opts.operator_id,
                assignment: None,
                accumulators: PhaseAccumulators::default(),
                sync: SyncStatus::Synced,
                pending: Vec::new(),
            }),
            in_flight: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            elapsed,
        }
    }

    pub fn source_tag(&self) -> &SourceTag {
        self.reconciler.source()
    }

    pub fn machine_id(&self) -> MachineId {
        self.with_state(|s| s.machine_id.clone())
    }

    pub fn current_phase(&self) -> Phase {
        self.with_state(|s| s.assignment.as_ref().map_or(Phase::Idle, |a| a.phase))
    }

    pub fn current_assignment(&self) -> Option<ActiveAssignment> {
        self.with_state(|s| s.assignment.clone())
    }

    pub fn accumulators(&self) -> PhaseAccumulators {
        self.with_state(|s| s.accumulators.clone())
    }

    /// Live seconds in the current phase; 0 unless the phase is billable.
    pub fn elapsed_seconds_in_current_phase(&self) -> u64 {
        let now = self.clock.now();
        self.with_state(|s| match &s.assignment {
            Some(a) if a.phase.is_billable() => s.accumulators.live_elapsed(now),
            _ => 0,
        })
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.with_state(|s| s.sync.clone())
    }

    /// Display mirror of every machine this session has heard about.
    pub fn machine_statuses(&self) -> Vec<MachineStatusEntry> {
        self.reconciler.mirror()
    }

    /// Register a callback fired after every transition or merge.
    pub fn on_phase_changed(&self, callback: impl Fn(&PhaseChange) + Send + Sync + 'static) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(Arc::new(callback));
    }

    /// Rebuild state after a restart: durable cache first, then the store.
    ///
    /// A running phase resumes from its recorded start, never from zero. The
    /// store is consulted for identity; an unreachable store leaves the
    /// cached state in place. Rejected with a conflict while a transition is
    /// in flight.
    pub async fn restore(&self) -> Result<Option<ActiveAssignment>, PhaseError> {
        let _guard = self.begin()?;
        let doc = self.cache.load().map_err(PhaseError::Cache)?;
        let machine_id = self.machine_id();

        if let Some(assignment) = doc.assignment(&machine_id).cloned() {
            let mut accumulators = doc
                .accumulators(&assignment.order_id)
                .cloned()
                .unwrap_or_default();
            // Timer already consumed or missing: resume from the recorded phase start
            if accumulators.phase_started_at.is_none() {
                accumulators.open(assignment.phase_started_at);
            }
            self.reconciler.hold(
                &machine_id,
                assignment.phase_started_at,
                MachineStatusEntry::for_assignment(&assignment),
            );
            info!(
                %machine_id,
                order_id = %assignment.order_id,
                phase = %assignment.phase,
                elapsed = accumulators.live_elapsed(self.clock.now()),
                "restored assignment from local cache"
            );
            self.with_state(|s| {
                s.assignment = Some(assignment);
                s.accumulators = accumulators;
            });
            self.notify(ChangeCause::Restore);
        }

        if let Err(e) = self.refresh().await {
            warn!(
                %machine_id,
                error = %e,
                "store unavailable during restore; continuing from local state"
            );
        }
        Ok(self.current_assignment())
    }

    /// Switch the session to another machine.
    ///
    /// The previous assignment is dropped from this session only; its timing
    /// stays in the cache.
    pub async fn select_machine(&self, machine_id: &str) -> Result<ReconcileOutcome, PhaseError> {
        let _guard = self.begin()?;
        let doc = self.cache.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read local phase cache");
            CacheDocument::default()
        });
        let adopted = doc.assignment(machine_id).cloned().map(|a| {
            let acc = doc
                .accumulators(&a.order_id)
                .cloned()
                .unwrap_or_else(|| PhaseAccumulators::started(a.phase_started_at));
            (a, acc)
        });
        if let Some((a, _)) = &adopted {
            self.reconciler.hold(
                machine_id,
                a.phase_started_at,
                MachineStatusEntry::for_assignment(a),
            );
        }
        self.with_state(|s| {
            s.machine_id = machine_id.to_string();
            match adopted {
                Some((a, acc)) => {
                    s.assignment = Some(a);
                    s.accumulators = acc;
                }
                None => {
                    s.assignment = None;
                    s.accumulators = PhaseAccumulators::default();
                }
            }
        });
        info!(%machine_id, "machine selected");
        self.notify(ChangeCause::Selection);

        self.refresh()
            .await
            .map_err(PhaseError::RemoteWrite)
    }

    /// Validate and execute one transition.
    ///
    /// Ordinary transitions commit locally first, then write to the store;
    /// a failed remote write is kept as pending and reported through
    /// `sync_status`. Finalize is the exception: its remote writes must all
    /// succeed before anything changes locally.
    pub async fn request_transition(
        &self,
        event: PhaseEvent,
    ) -> Result<ActiveAssignment, PhaseError> {
        let _guard = self.begin()?;
        let now = self.clock.now();
        let (current, accumulators, machine_id, operator_id) = self.with_state(|s| {
            (
                s.assignment.clone(),
                s.accumulators.clone(),
                s.machine_id.clone(),
                s.operator_id.clone(),
            )
        });
        let ctx = StepContext {
            machine_id: &machine_id,
            operator_id: &operator_id,
            now,
        };
        let step = PhaseMachine::apply(current.as_ref(), &accumulators, &event, &ctx)?;
        info!(
            %machine_id,
            order_id = %step.assignment.order_id,
            event = event.name(),
            from = %current.as_ref().map_or(Phase::Idle, |a| a.phase),
            to = %step.assignment.phase,
            "phase transition"
        );

        match event {
            PhaseEvent::Finalize {
                good_count,
                scrap_count,
            } => {
                self.finalize(
                    step,
                    FinalizeCounts {
                        good_count,
                        scrap_count,
                    },
                    now,
                )
                .await
            }
            PhaseEvent::Suspend => self.suspend(step, now).await,
            _ => {
                self.commit(&step, ChangeCause::Transition);
                self.write(PendingWrite::Status(status_update(&step.assignment)))
                    .await;
                Ok(step.assignment)
            }
        }
    }

    /// Handle one change-feed notification.
    pub async fn handle_notification(
        &self,
        notification: &ChangeNotification,
    ) -> Result<ReconcileOutcome, RemoteError> {
        let selected = self.machine_id();
        match self.reconciler.route(notification, &selected) {
            Route::MirrorOnly => Ok(ReconcileOutcome::Mirrored),
            Route::Refetch { .. } => self.refresh().await,
        }
    }

    /// Fetch the selected machine from the store and merge it.
    pub async fn refresh(&self) -> Result<ReconcileOutcome, RemoteError> {
        let machine_id = self.machine_id();
        let snapshot = self.reconciler.fetch(&machine_id).await?;
        if let Err(rejected) = self.reconciler.admit(&snapshot) {
            debug!(
                %machine_id,
                held = %rejected.held,
                offered = %rejected.offered,
                "stale snapshot rejected"
            );
            return Ok(ReconcileOutcome::Rejected(rejected));
        }

        let doc = self.cache.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read local phase cache");
            CacheDocument::default()
        });
        let now = self.clock.now();
        let outcome = self.with_state(|s| {
            if s.machine_id != machine_id {
                return None;
            }
            let local = s.assignment.as_ref().map(|a| (a, &s.accumulators));
            let outcome = merge_snapshot(local, &snapshot, &doc, &s.operator_id, now);
            match &outcome {
                MergeOutcome::Unchanged => {}
                MergeOutcome::Replaced {
                    assignment,
                    accumulators,
                } => {
                    s.assignment = Some(assignment.clone());
                    s.accumulators = accumulators.clone();
                }
                MergeOutcome::Cleared { .. } => {
                    s.assignment = None;
                    s.accumulators = PhaseAccumulators::default();
                }
            }
            Some(outcome)
        });
        // Machine switched while the fetch was outstanding
        let Some(outcome) = outcome else {
            return Ok(ReconcileOutcome::Mirrored);
        };

        self.reconciler.log_outcome(&machine_id, &outcome);
        if let Some(at) = snapshot.status_change_at
            && !matches!(outcome, MergeOutcome::Unchanged)
        {
            self.drop_superseded(&machine_id, at);
        }
        match &outcome {
            MergeOutcome::Unchanged => {}
            MergeOutcome::Replaced {
                assignment,
                accumulators,
            } => {
                self.reconciler
                    .persist_local(self.cache.as_ref(), &mut |doc: &mut CacheDocument| {
                        doc.record(assignment, accumulators)
                    });
                self.notify(ChangeCause::Merge);
            }
            MergeOutcome::Cleared { .. } => {
                self.reconciler
                    .persist_local(self.cache.as_ref(), &mut |doc: &mut CacheDocument| {
                        doc.clear_assignment(&machine_id)
                    });
                self.notify(ChangeCause::Merge);
            }
        }
        Ok(ReconcileOutcome::Merged(outcome))
    }

    /// Re-send writes that failed earlier.
    ///
    /// Each pending write gets up to `max_write_attempts` tries; the first
    /// write that still fails stops the retry and keeps the rest pending.
    pub async fn retry_sync(&self) -> Result<SyncStatus, PhaseError> {
        let _guard = self.begin()?;
        let pending = self.with_state(|s| std::mem::take(&mut s.pending));
        if pending.is_empty() {
            return Ok(self.with_state(|s| {
                s.sync = SyncStatus::Synced;
                s.sync.clone()
            }));
        }

        for (index, write) in pending.iter().enumerate() {
            if let Some(machine_id) = write.status_machine()
                && let Some(held) = self.reconciler.held_at(machine_id)
                && write.older_than(machine_id, held)
            {
                debug!(%machine_id, %held, "pending status write superseded; skipped");
                continue;
            }
            let mut failure = None;
            for attempt in 1..=self.max_write_attempts {
                match self.send(write).await {
                    Ok(()) => {
                        failure = None;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "retrying remote write failed");
                        failure = Some(e);
                    }
                }
            }
            let failure = match failure {
                Some(e) => Some(e),
                // Zero attempts configured: nothing was sent
                None if self.max_write_attempts == 0 => {
                    Some(RemoteError::Unavailable("retries disabled".to_string()))
                }
                None => None,
            };
            if let Some(e) = failure {
                let attempts = self.max_write_attempts;
                self.with_state(|s| {
                    let mut rest = pending[index..].to_vec();
                    rest.append(&mut s.pending);
                    s.pending = compact(rest);
                    let previous = match &s.sync {
                        SyncStatus::Degraded { attempts, .. } => *attempts,
                        SyncStatus::Synced => 0,
                    };
                    s.sync = SyncStatus::Degraded {
                        reason: e.to_string(),
                        attempts: previous + attempts,
                    };
                });
                return Err(PhaseError::RemoteWrite(e));
            }
        }

        let status = self.with_state(|s| {
            if s.pending.is_empty() {
                s.sync = SyncStatus::Synced;
            }
            s.sync.clone()
        });
        info!("pending remote writes delivered");
        Ok(status)
    }

    /// Receiver for the live elapsed counter published by the ticker.
    pub fn watch_elapsed(&self) -> watch::Receiver<u64> {
        self.elapsed.subscribe()
    }

    /// Publish live elapsed seconds every tick until the session is dropped.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let secs = session.elapsed_seconds_in_current_phase();
                session.elapsed.send_replace(secs);
            }
        })
    }

    /// Apply the read/merge path to every notification until the feed ends.
    pub async fn run_change_feed(self: &Arc<Self>) -> Result<(), RemoteError> {
        let mut feed = bounded(
            "subscribe_change_feed",
            self.remote_timeout,
            self.gateway.subscribe_change_feed(None),
        )
        .await?;
        info!(source = %self.source_tag(), "listening for machine changes");

        while let Some(notification) = feed.next().await {
            match self.handle_notification(&notification).await {
                Ok(outcome) => debug!(
                    machine_id = %notification.machine_id,
                    source = %notification.source,
                    ?outcome,
                    "notification handled"
                ),
                Err(e) => warn!(
                    machine_id = %notification.machine_id,
                    error = %e,
                    "failed to refetch machine after notification"
                ),
            }
        }
        info!("change feed closed");
        Ok(())
    }

    async fn finalize(
        &self,
        step: Step,
        counts: FinalizeCounts,
        now: DateTime<Utc>,
    ) -> Result<ActiveAssignment, PhaseError> {
        let completed = step.assignment;
        self.sequencing
            .persist_finalize(&completed, counts, now)
            .await
            .map_err(|e| {
                warn!(
                    machine_id = %completed.machine_id,
                    order_id = %completed.order_id,
                    error = %e,
                    "finalize not persisted; phase unchanged"
                );
                PhaseError::RemoteWrite(e)
            })?;

        let machine_id = completed.machine_id.clone();
        let order_id = completed.order_id.clone();
        self.reconciler
            .persist_local(self.cache.as_ref(), &mut |doc: &mut CacheDocument| {
                doc.clear_order(&order_id);
                doc.clear_assignment(&machine_id);
            });
        self.with_state(|s| {
            s.assignment = None;
            s.accumulators = PhaseAccumulators::default();
        });
        self.notify_with(
            ChangeCause::Transition,
            Phase::Completed,
            Some(completed.clone()),
            step.accumulators,
        );
        self.write(PendingWrite::Announce(release_update(&machine_id, now)))
            .await;

        let next = match self.sequencing.next_order(&machine_id, &order_id).await {
            Ok(next) => next,
            Err(e) => {
                warn!(%machine_id, error = %e, "next order lookup failed; machine stays idle");
                return Ok(completed);
            }
        };
        let Some(next) = next else {
            info!(%machine_id, "no queued order; machine idle");
            return Ok(completed);
        };

        let ctx = StepContext {
            machine_id: &machine_id,
            operator_id: &completed.operator_id,
            now,
        };
        let successor = PhaseMachine::apply(
            None,
            &PhaseAccumulators::default(),
            &PhaseEvent::AssignOrderAndBeginSetup {
                order_id: next.order_id.clone(),
            },
            &ctx,
        )?;
        info!(
            %machine_id,
            order_id = %next.order_id,
            "next order entered setup"
        );
        self.commit(&successor, ChangeCause::Sequencing);
        self.write(PendingWrite::Status(status_update(&successor.assignment)))
            .await;
        self.write(PendingWrite::Order {
            order_id: next.order_id,
            status: OrderStatus::InProgress,
        })
        .await;
        Ok(completed)
    }

    async fn suspend(
        &self,
        step: Step,
        now: DateTime<Utc>,
    ) -> Result<ActiveAssignment, PhaseError> {
        let suspended = step.assignment;
        let accumulators = step.accumulators;
        self.reconciler
            .persist_local(self.cache.as_ref(), &mut |doc: &mut CacheDocument| {
                doc.record(&suspended, &accumulators)
            });
        self.with_state(|s| {
            s.assignment = None;
            s.accumulators = PhaseAccumulators::default();
        });
        self.notify_with(
            ChangeCause::Transition,
            Phase::Suspended,
            Some(suspended.clone()),
            accumulators,
        );

        self.write(PendingWrite::Status(release_update(
            &suspended.machine_id,
            now,
        )))
        .await;
        self.write(PendingWrite::Order {
            order_id: suspended.order_id.clone(),
            status: OrderStatus::Suspended,
        })
        .await;
        Ok(suspended)
    }

    /// Local half of the write path: state then durable cache.
    fn commit(&self, step: &Step, cause: ChangeCause) {
        self.reconciler
            .persist_local(self.cache.as_ref(), &mut |doc: &mut CacheDocument| {
                doc.record(&step.assignment, &step.accumulators)
            });
        self.with_state(|s| {
            s.assignment = Some(step.assignment.clone());
            s.accumulators = step.accumulators.clone();
        });
        self.notify(cause);
    }

    /// Remote half of the write path. Failure degrades sync.
    async fn write(&self, write: PendingWrite) {
        match self.send(&write).await {
            Ok(()) => self.with_state(|s| {
                // A delivered status supersedes older undelivered ones
                if let Some(machine) = write.status_machine() {
                    s.pending.retain(|p| p.status_machine() != Some(machine));
                }
                if s.pending.is_empty() {
                    s.sync = SyncStatus::Synced;
                }
            }),
            Err(e) => {
                warn!(error = %e, "remote write failed; sync degraded");
                self.with_state(|s| {
                    s.pending.push(write);
                    s.pending = compact(std::mem::take(&mut s.pending));
                    let attempts = match &s.sync {
                        SyncStatus::Degraded { attempts, .. } => attempts + 1,
                        SyncStatus::Synced => 1,
                    };
                    s.sync = SyncStatus::Degraded {
                        reason: e.to_string(),
                        attempts,
                    };
                });
            }
        }
    }

    async fn send(&self, write: &PendingWrite) -> Result<(), RemoteError> {
        match write {
            PendingWrite::Status(update) => self.reconciler.push_remote(update).await,
            PendingWrite::Announce(update) => self.reconciler.announce(update).await,
            PendingWrite::Order { order_id, status } => match status {
                OrderStatus::Suspended => self.sequencing.suspend(order_id).await,
                _ => self.sequencing.activate(order_id).await,
            },
        }
    }

    /// Forget status writes the store has already moved past.
    fn drop_superseded(&self, machine_id: &str, at: DateTime<Utc>) {
        self.with_state(|s| {
            let before = s.pending.len();
            s.pending.retain(|p| !p.older_than(machine_id, at));
            if s.pending.len() != before {
                debug!(
                    %machine_id,
                    dropped = before - s.pending.len(),
                    "pending status writes superseded"
                );
            }
            if s.pending.is_empty() {
                s.sync = SyncStatus::Synced;
            }
        });
    }

    fn begin(&self) -> Result<InFlight<'_>, PhaseError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PhaseError::Conflict {
                machine_id: self.machine_id(),
            })?;
        Ok(InFlight(&self.in_flight))
    }

    fn notify(&self, cause: ChangeCause) {
        let (phase, assignment, accumulators) = self.with_state(|s| {
            (
                s.assignment.as_ref().map_or(Phase::Idle, |a| a.phase),
                s.assignment.clone(),
                s.accumulators.clone(),
            )
        });
        self.notify_with(cause, phase, assignment, accumulators);
    }

    fn notify_with(
        &self,
        cause: ChangeCause,
        phase: Phase,
        assignment: Option<ActiveAssignment>,
        accumulators: PhaseAccumulators,
    ) {
        let change = PhaseChange {
            machine_id: self.machine_id(),
            phase,
            assignment,
            accumulators,
            cause,
        };
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(&change);
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

fn status_update(assignment: &ActiveAssignment) -> MachineStatusUpdate {
    MachineStatusUpdate {
        machine_id: assignment.machine_id.clone(),
        status: assignment.phase,
        status_change_at: assignment.phase_started_at,
        order_id: Some(assignment.order_id.clone()),
        operator_id: Some(assignment.operator_id.clone()),
        stop_reason: assignment.stop_reason.clone(),
    }
}

/// Machine back to idle with no order; the operator stays on the record.
fn release_update(machine_id: &str, at: DateTime<Utc>) -> MachineStatusUpdate {
    MachineStatusUpdate {
        machine_id: machine_id.to_string(),
        status: Phase::Idle,
        status_change_at: at,
        order_id: None,
        operator_id: None,
        stop_reason: None,
    }
}

/// Keep only the newest status write per machine.
fn compact(pending: Vec<PendingWrite>) -> Vec<PendingWrite> {
    let mut out: Vec<PendingWrite> = Vec::with_capacity(pending.len());
    for write in pending.into_iter().rev() {
        let superseded = write.status_machine().is_some_and(|m| {
            out.iter().any(|w| w.status_machine() == Some(m))
        });
        if !superseded {
            out.push(write);
        }
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::remote::{MemoryGateway, QueuedOrder, RemoteMachineSnapshot};
    use crate::shift::{ShiftCalendar, default_shifts};
    use chrono::{Duration as ChronoDuration, FixedOffset, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    struct Rig {
        clock: Arc<ManualClock>,
        cache: MemoryCache,
        store: Arc<MemoryGateway>,
    }

    impl Rig {
        fn new() -> Self {
            let store = Arc::new(MemoryGateway::new());
            store.add_machine("M-01");
            Self {
                clock: Arc::new(ManualClock::new(t(0))),
                cache: MemoryCache::new(),
                store,
            }
        }

        fn session(&self) -> MachineSession {
            let mut opts = SessionOptions::new("M-01", "op-7");
            opts.remote_timeout = Duration::from_secs(1);
            opts.max_write_attempts = 2;
            MachineSession::new(
                opts,
                self.clock.clone(),
                Arc::new(self.cache.clone()),
                self.store.clone(),
                Arc::new(ShiftCalendar::new(
                    default_shifts(),
                    FixedOffset::east_opt(0).unwrap(),
                )),
            )
        }

        fn queue(&self, order_id: &str, position: i64) {
            self.store.enqueue_order(QueuedOrder {
                order_id: order_id.to_string(),
                machine_id: "M-01".to_string(),
                status: OrderStatus::Pending,
                sequence_position: position,
                created_at: t(0),
            });
        }
    }

    fn assign(order: &str) -> PhaseEvent {
        PhaseEvent::AssignOrderAndBeginSetup {
            order_id: order.to_string(),
        }
    }

    #[tokio::test]
    async fn test_transition_writes_cache_and_store() {
        let rig = Rig::new();
        let session = rig.session();
        let a = session.request_transition(assign("O1")).await.unwrap();
        assert_eq!(a.phase, Phase::Setup);

        let doc = rig.cache.load().unwrap();
        assert_eq!(doc.assignment("M-01").unwrap().order_id, "O1");
        let remote = rig.store.machine("M-01").unwrap();
        assert_eq!(remote.status, Phase::Setup);
        assert_eq!(remote.order_id.as_deref(), Some("O1"));
        assert_eq!(remote.status_change_at, Some(t(0)));
        assert_eq!(session.sync_status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_illegal_transition_names_phase() {
        let rig = Rig::new();
        let session = rig.session();
        let err = session
            .request_transition(PhaseEvent::BeginProduction)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PhaseError::Precondition {
                phase: Phase::Idle,
                ..
            }
        ));
        assert_eq!(session.current_phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_elapsed_only_for_billable_phases() {
        let rig = Rig::new();
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();
        rig.clock.advance_secs(42);
        assert_eq!(session.elapsed_seconds_in_current_phase(), 42);
        session
            .request_transition(PhaseEvent::RequestStop { reason: None })
            .await
            .unwrap();
        rig.clock.advance_secs(5);
        assert_eq!(session.elapsed_seconds_in_current_phase(), 0);
        assert_eq!(session.accumulators().setup_seconds, 42);
    }

    #[tokio::test]
    async fn test_remote_failure_degrades_without_rollback() {
        let rig = Rig::new();
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();
        rig.clock.advance_secs(10);
        rig.store.fail_times("set_machine_status", 1);

        let a = session
            .request_transition(PhaseEvent::BeginProduction)
            .await
            .unwrap();
        assert_eq!(a.phase, Phase::Production);
        assert_eq!(session.current_phase(), Phase::Production);
        assert!(session.sync_status().is_degraded());
        assert_eq!(rig.store.machine("M-01").unwrap().status, Phase::Setup);

        let status = session.retry_sync().await.unwrap();
        assert_eq!(status, SyncStatus::Synced);
        assert_eq!(rig.store.machine("M-01").unwrap().status, Phase::Production);
    }

    #[tokio::test]
    async fn test_retry_sync_keeps_pending_when_store_still_down() {
        let rig = Rig::new();
        let session = rig.session();
        rig.store.fail_times("set_machine_status", 5);
        session.request_transition(assign("O1")).await.unwrap();

        let err = session.retry_sync().await.unwrap_err();
        assert!(matches!(err, PhaseError::RemoteWrite(_)));
        match session.sync_status() {
            SyncStatus::Degraded { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected degraded, got {:?}", other),
        }

        // 1 + 2 failures used, 2 left; the next retry burns them both
        assert!(session.retry_sync().await.is_err());
        assert_eq!(session.retry_sync().await.unwrap(), SyncStatus::Synced);
        assert_eq!(rig.store.machine("M-01").unwrap().status, Phase::Setup);
    }

    #[tokio::test]
    async fn test_restore_conflicts_with_transition_in_flight() {
        let rig = Rig::new();
        let session = rig.session();
        rig.store.set_latency(Some(Duration::from_millis(100)));

        let (assigned, restored) =
            tokio::join!(session.request_transition(assign("O1")), session.restore());
        assert_eq!(assigned.unwrap().phase, Phase::Setup);
        assert!(restored.unwrap_err().is_conflict());
        assert_eq!(session.current_phase(), Phase::Setup);
    }

    #[tokio::test]
    async fn test_merged_snapshot_supersedes_pending_status_write() {
        let rig = Rig::new();
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();
        rig.clock.advance_secs(10);
        rig.store.fail_times("set_machine_status", 1);
        session
            .request_transition(PhaseEvent::BeginProduction)
            .await
            .unwrap();
        assert!(session.sync_status().is_degraded());

        rig.clock.advance_secs(10);
        rig.store.override_machine(RemoteMachineSnapshot {
            machine_id: "M-01".into(),
            status: Phase::Stopped,
            order_id: Some("O1".into()),
            operator_id: Some("supervisor".into()),
            status_change_at: Some(t(20)),
        });
        let outcome = session.refresh().await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Merged(MergeOutcome::Replaced { .. })
        ));
        assert_eq!(session.current_phase(), Phase::Stopped);
        assert_eq!(session.sync_status(), SyncStatus::Synced);

        assert_eq!(session.retry_sync().await.unwrap(), SyncStatus::Synced);
        let remote = rig.store.machine("M-01").unwrap();
        assert_eq!(remote.status, Phase::Stopped);
        assert_eq!(remote.status_change_at, Some(t(20)));
    }

    #[tokio::test]
    async fn test_retry_skips_status_older_than_held() {
        let rig = Rig::new();
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();
        rig.clock.advance_secs(10);
        rig.store.fail_times("set_machine_status", 1);
        session
            .request_transition(PhaseEvent::BeginProduction)
            .await
            .unwrap();

        // Same order and phase, stamped later by another client
        rig.clock.advance_secs(10);
        rig.store.override_machine(RemoteMachineSnapshot {
            machine_id: "M-01".into(),
            status: Phase::Production,
            order_id: Some("O1".into()),
            operator_id: Some("op-7".into()),
            status_change_at: Some(t(20)),
        });
        let outcome = session.refresh().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Merged(MergeOutcome::Unchanged));
        assert!(session.sync_status().is_degraded());

        assert_eq!(session.retry_sync().await.unwrap(), SyncStatus::Synced);
        let remote = rig.store.machine("M-01").unwrap();
        assert_eq!(remote.status_change_at, Some(t(20)));
        assert_eq!(session.accumulators().setup_seconds, 10);
    }

    #[tokio::test]
    async fn test_suspend_releases_machine_and_keeps_timing_cached() {
        let rig = Rig::new();
        rig.queue("O1", 1);
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();
        rig.clock.advance_secs(30);

        let suspended = session.request_transition(PhaseEvent::Suspend).await.unwrap();
        assert_eq!(suspended.phase, Phase::Suspended);
        assert_eq!(session.current_phase(), Phase::Idle);
        assert!(session.current_assignment().is_none());

        let doc = rig.cache.load().unwrap();
        assert_eq!(doc.accumulators("O1").unwrap().setup_seconds, 30);
        assert!(doc.assignment("M-01").is_none());
        assert_eq!(rig.store.order_status("O1"), Some(OrderStatus::Suspended));
        assert_eq!(rig.store.machine("M-01").unwrap().status, Phase::Idle);
    }

    #[tokio::test]
    async fn test_failed_finalize_leaves_phase_untouched() {
        let rig = Rig::new();
        rig.queue("O1", 1);
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();
        session
            .request_transition(PhaseEvent::BeginProduction)
            .await
            .unwrap();
        rig.clock.advance_secs(60);
        rig.store.fail_times("record_production_delta", 1);

        let err = session
            .request_transition(PhaseEvent::Finalize {
                good_count: 5,
                scrap_count: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::RemoteWrite(_)));
        assert_eq!(session.current_phase(), Phase::Production);
        assert_eq!(session.elapsed_seconds_in_current_phase(), 60);
        assert!(rig.cache.load().unwrap().accumulators("O1").is_some());
    }

    #[tokio::test]
    async fn test_listeners_see_every_change() {
        let rig = Rig::new();
        let session = rig.session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_phase_changed(move |c| sink.lock().unwrap().push((c.phase, c.cause)));

        session.request_transition(assign("O1")).await.unwrap();
        session
            .request_transition(PhaseEvent::RequestStop {
                reason: Some("jam".into()),
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Phase::Setup, ChangeCause::Transition),
                (Phase::Stopped, ChangeCause::Transition),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_reason_reaches_store() {
        let rig = Rig::new();
        let session = rig.session();
        let mut feed = rig.store.subscribe_change_feed(Some("M-01")).await.unwrap();
        session.request_transition(assign("O1")).await.unwrap();
        session
            .request_transition(PhaseEvent::RequestStop {
                reason: Some("tool change".into()),
            })
            .await
            .unwrap();
        assert_eq!(
            session.current_assignment().unwrap().stop_reason.as_deref(),
            Some("tool change")
        );

        let first = feed.next().await.unwrap();
        let second = feed.next().await.unwrap();
        assert_eq!(first.status, Phase::Setup);
        assert_eq!(second.status, Phase::Stopped);
        assert_eq!(&second.source, session.source_tag());
    }

    #[tokio::test]
    async fn test_select_machine_adopts_remote_assignment() {
        let rig = Rig::new();
        rig.store.add_machine("M-02");
        rig.store.override_machine(RemoteMachineSnapshot {
            machine_id: "M-02".into(),
            status: Phase::Production,
            order_id: Some("O7".into()),
            operator_id: Some("op-9".into()),
            status_change_at: Some(t(-120)),
        });
        let session = rig.session();
        session.request_transition(assign("O1")).await.unwrap();

        let outcome = session.select_machine("M-02").await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Merged(MergeOutcome::Replaced { .. })
        ));
        assert_eq!(session.machine_id(), "M-02");
        let a = session.current_assignment().unwrap();
        assert_eq!(a.order_id, "O7");
        assert_eq!(a.operator_id, "op-9");
        assert_eq!(session.elapsed_seconds_in_current_phase(), 120);
        // O1 timing is untouched in the cache
        assert!(rig.cache.load().unwrap().accumulators("O1").is_some());
    }

    #[tokio::test]
    async fn test_ticker_publishes_elapsed() {
        let rig = Rig::new();
        let mut opts = SessionOptions::new("M-01", "op-7");
        opts.tick_interval = Duration::from_millis(10);
        let session = Arc::new(MachineSession::new(
            opts,
            rig.clock.clone(),
            Arc::new(rig.cache.clone()),
            rig.store.clone(),
            Arc::new(ShiftCalendar::new(
                default_shifts(),
                FixedOffset::east_opt(0).unwrap(),
            )),
        ));
        let mut rx = session.watch_elapsed();
        session.request_transition(assign("O1")).await.unwrap();
        rig.clock.advance_secs(7);

        let ticker = session.spawn_ticker();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|secs| *secs == 7))
            .await
            .unwrap()
            .unwrap();
        ticker.abort();
    }

    #[test]
    fn test_compact_keeps_newest_status_per_machine() {
        let older = release_update("M-01", t(0));
        let newer = release_update("M-01", t(5));
        let order = PendingWrite::Order {
            order_id: "O1".into(),
            status: OrderStatus::Suspended,
        };
        let out = compact(vec![
            PendingWrite::Status(older),
            order.clone(),
            PendingWrite::Status(newer.clone()),
        ]);
        assert_eq!(out, vec![order, PendingWrite::Status(newer)]);
    }
}
