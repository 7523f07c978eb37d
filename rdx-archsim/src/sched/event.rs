//! Event declarations, queued occurrences and run results.

use super::Scheduler;
use crate::common::{ClockId, EventId, PortId, SchedulingPhase, Tick};
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;

/// The value carried by one occurrence, if any.
pub type Payload = Option<Box<dyn Any>>;

/// An event callback. Handlers receive the scheduler so they can schedule
/// further work, send on ports and post notifications.
pub type Handler = Box<dyn FnMut(&mut Scheduler, Payload) -> anyhow::Result<()>>;

/// Declaration of a schedulable event.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub(crate) label: String,
    pub(crate) phase: SchedulingPhase,
    pub(crate) clock: Option<ClockId>,
    pub(crate) continuing: bool,
    pub(crate) unique: bool,
}

impl EventSpec {
    /// A continuing, non-unique event on the tick timeline.
    pub fn new(label: impl Into<String>, phase: SchedulingPhase) -> Self {
        Self {
            label: label.into(),
            phase,
            clock: None,
            continuing: true,
            unique: false,
        }
    }

    /// Delays are counted in cycles of `clock` and land on its edges.
    pub fn clock(mut self, clock: ClockId) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Pending occurrences of a non-continuing event do not keep a run alive.
    pub fn non_continuing(mut self) -> Self {
        self.continuing = false;
        self
    }

    /// At most one occurrence per tick; extra schedules are dropped.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

pub(crate) struct EventSlot {
    pub(crate) spec: EventSpec,
    pub(crate) handler: Option<Handler>,
    pub(crate) payload_type: Option<(TypeId, &'static str)>,
    pub(crate) group: u32,
    pub(crate) pending: usize,
    pub(crate) vertex: Option<usize>,
}

/// Ordering key of the event queue. Ties inside one DAG group fall back to
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    pub(crate) tick: Tick,
    pub(crate) phase: usize,
    pub(crate) group: u32,
    pub(crate) seq: u64,
}

pub(crate) struct Occurrence {
    pub(crate) event: EventId,
    pub(crate) key: QueueKey,
    pub(crate) payload: Payload,
    pub(crate) origin: Option<PortId>,
    pub(crate) target: Option<PortId>,
}

/// A read-only view of a pending occurrence handed to cancellation predicates.
pub struct PendingOccurrence<'a> {
    pub event: EventId,
    pub tick: Tick,
    pub phase: SchedulingPhase,
    pub payload: Option<&'a dyn Any>,
}

impl fmt::Debug for PendingOccurrence<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOccurrence")
            .field("event", &self.event)
            .field("tick", &self.tick)
            .field("phase", &self.phase)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Why a call to [`Scheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The requested number of ticks elapsed.
    TickLimit,
    /// Only non-continuing occurrences (or none) were left.
    NoContinuingWork,
    /// A handler called [`Scheduler::stop`].
    Stopped,
    /// A clean-exit timeout fired.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub start_tick: Tick,
    pub end_tick: Tick,
    pub events_dispatched: u64,
    pub reason: StopReason,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticks {}..{} ({} events, {:?})",
            self.start_tick, self.end_tick, self.events_dispatched, self.reason
        )
    }
}
