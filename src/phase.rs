//! Operational phases and the transition table.
//!
//! `PhaseMachine::apply` is pure: it validates an event against the current
//! assignment and returns the replacement assignment and accumulators.
//! Committing the result (cache, remote, listeners) is the session's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::accounting::PhaseAccumulators;
use crate::errors::PhaseError;

pub type MachineId = String;
pub type OrderId = String;
pub type OperatorId = String;

/// Operational stage of a machine/order pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Setup,
    Production,
    Stopped,
    Suspended,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Setup => "setup",
            Self::Production => "production",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }

    /// Phases whose live elapsed time is shown to the operator.
    pub fn is_billable(&self) -> bool {
        matches!(self, Self::Setup | Self::Production)
    }

    /// Phases during which an order is on the machine.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Setup | Self::Production | Self::Stopped)
    }

    /// Phases that end the assignment.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Suspended | Self::Completed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "setup" => Ok(Self::Setup),
            "production" => Ok(Self::Production),
            "stopped" => Ok(Self::Stopped),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Operator-requested transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    AssignOrderAndBeginSetup {
        order_id: OrderId,
    },
    BeginProduction,
    RequestStop {
        #[serde(default)]
        reason: Option<String>,
    },
    Resume,
    Suspend,
    Finalize {
        good_count: u32,
        scrap_count: u32,
    },
}

impl PhaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AssignOrderAndBeginSetup { .. } => "assign order and begin setup",
            Self::BeginProduction => "begin production",
            Self::RequestStop { .. } => "request stop",
            Self::Resume => "resume",
            Self::Suspend => "suspend",
            Self::Finalize { .. } => "finalize",
        }
    }
}

/// The order currently on a machine and the phase it is in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAssignment {
    pub machine_id: MachineId,
    pub order_id: OrderId,
    pub operator_id: OperatorId,
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    /// Phase interrupted by the current stop; the only valid resume target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_from: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// When the order's first setup began.
    pub order_started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_started_at: Option<DateTime<Utc>>,
}

impl ActiveAssignment {
    pub fn begin_setup(
        machine_id: &str,
        order_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            order_id: order_id.to_string(),
            operator_id: operator_id.to_string(),
            phase: Phase::Setup,
            phase_started_at: now,
            stopped_from: None,
            stop_reason: None,
            order_started_at: now,
            production_started_at: None,
        }
    }
}

/// Replacement state produced by one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub assignment: ActiveAssignment,
    pub accumulators: PhaseAccumulators,
}

/// Who is asking and when.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub machine_id: &'a str,
    pub operator_id: &'a str,
    pub now: DateTime<Utc>,
}

pub struct PhaseMachine;

impl PhaseMachine {
    /// Validate `event` from the current assignment and return the phase it leads to.
    pub fn target(
        current: Option<&ActiveAssignment>,
        event: &PhaseEvent,
    ) -> Result<Phase, PhaseError> {
        let phase = current
            .map(|a| a.phase)
            .filter(|p| !p.is_terminal())
            .unwrap_or(Phase::Idle);
        let illegal = || PhaseError::Precondition {
            phase,
            event: event.name(),
        };

        match (phase, event) {
            (Phase::Idle, PhaseEvent::AssignOrderAndBeginSetup { .. }) => Ok(Phase::Setup),
            (Phase::Setup, PhaseEvent::BeginProduction) => Ok(Phase::Production),
            (Phase::Setup | Phase::Production, PhaseEvent::RequestStop { .. }) => {
                Ok(Phase::Stopped)
            }
            (Phase::Stopped, PhaseEvent::Resume) => current
                .and_then(|a| a.stopped_from)
                .filter(|p| matches!(p, Phase::Setup | Phase::Production))
                .ok_or_else(illegal),
            (p, PhaseEvent::Suspend) if p.is_active() => Ok(Phase::Suspended),
            (p, PhaseEvent::Finalize { .. }) if p.is_active() => Ok(Phase::Completed),
            _ => Err(illegal()),
        }
    }

    /// Apply `event`, closing out the outgoing phase exactly once.
    pub fn apply(
        current: Option<&ActiveAssignment>,
        accumulators: &PhaseAccumulators,
        event: &PhaseEvent,
        ctx: &StepContext<'_>,
    ) -> Result<Step, PhaseError> {
        let target = Self::target(current, event)?;

        if let PhaseEvent::AssignOrderAndBeginSetup { order_id } = event {
            return Ok(Step {
                assignment: ActiveAssignment::begin_setup(
                    ctx.machine_id,
                    order_id,
                    ctx.operator_id,
                    ctx.now,
                ),
                accumulators: PhaseAccumulators::started(ctx.now),
            });
        }

        // target() only admits non-assign events with a live assignment
        let Some(current) = current else {
            return Err(PhaseError::Precondition {
                phase: Phase::Idle,
                event: event.name(),
            });
        };

        let mut accumulators = accumulators.clone();
        accumulators.close_out(current.phase, ctx.now);
        if target.is_terminal() {
            accumulators.touch(ctx.now);
        } else {
            accumulators.open(ctx.now);
        }

        let mut assignment = current.clone();
        assignment.phase = target;
        assignment.phase_started_at = ctx.now;
        match event {
            PhaseEvent::RequestStop { reason } => {
                assignment.stopped_from = Some(current.phase);
                assignment.stop_reason = reason.clone();
            }
            PhaseEvent::Resume => {
                assignment.stopped_from = None;
                assignment.stop_reason = None;
            }
            _ => {}
        }
        if target == Phase::Production && assignment.production_started_at.is_none() {
            assignment.production_started_at = Some(ctx.now);
        }

        Ok(Step {
            assignment,
            accumulators,
        })
    }
}
