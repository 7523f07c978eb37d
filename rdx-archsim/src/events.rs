//! Lifecycle events broadcast by a [`Simulation`](crate::sim::Simulation).
//!
//! These are the framework's output sink. Embedders subscribe through
//! [`Simulation::subscribe_system_events`](crate::sim::Simulation::subscribe_system_events)
//! and receive them on a `tokio::sync::broadcast` channel. Sending never
//! blocks, and nobody listening is not an error.

use crate::common::{Tick, TreePhase};
use crate::sched::RunSummary;
use chrono::{DateTime, Utc};

/// Capacity of the system event channel. Slow receivers see `Lagged`.
pub const SYSTEM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// The model tree entered a new lifecycle phase.
    PhaseEntered { phase: TreePhase, at: DateTime<Utc> },
    /// A resource was constructed for the node at `location`.
    ResourceConstructed { location: String, factory: String },
    /// The scheduler DAG was frozen with `events` registered events.
    SchedulerFinalized { events: usize },
    RunStarted { tick: Tick, at: DateTime<Utc> },
    RunFinished { summary: RunSummary, at: DateTime<Utc> },
    /// A condition that was demoted from an error by configuration.
    Warning { message: String },
    TeardownStarted,
}

impl SystemEvent {
    pub(crate) fn phase_entered(phase: TreePhase) -> Self {
        SystemEvent::PhaseEntered { phase, at: Utc::now() }
    }

    pub(crate) fn run_started(tick: Tick) -> Self {
        SystemEvent::RunStarted { tick, at: Utc::now() }
    }

    pub(crate) fn run_finished(summary: RunSummary) -> Self {
        SystemEvent::RunFinished { summary, at: Utc::now() }
    }
}
