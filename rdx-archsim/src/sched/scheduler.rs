//! The phased, DAG-ordered event scheduler.

use super::clock::ClockTree;
use super::dag::Dag;
use super::event::{
    EventSlot, EventSpec, Handler, Occurrence, Payload, PendingOccurrence, QueueKey, RunSummary,
    StopReason,
};
use super::sleeper::Sleeper;
use crate::common::{ClockId, Cycle, EventId, OccurrenceId, PortId, SchedulingPhase, Tick, TreePhase};
use crate::error::{SimError, SimResult};
use crate::notify::NotificationHub;
use crate::ports::PortFabric;
use slotmap::SlotMap;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Lifecycle of the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedulerState {
    /// Events and precedences may be declared; nothing can be scheduled.
    Configuring,
    /// The DAG is frozen; scheduling and running are allowed.
    Finalized,
    /// Inside [`Scheduler::run`].
    Running,
    TornDown,
}

/// Single-threaded discrete-event scheduler.
///
/// Time advances in ticks. Each tick is split into the phases of
/// [`SchedulingPhase`], and inside a phase occurrences are ordered by the
/// DAG group of their event, then by insertion order. Ports and notification
/// sources live here too, so handlers can reach everything they need through
/// the `&mut Scheduler` they are given.
pub struct Scheduler {
    state: SchedulerState,
    current_tick: Tick,
    dispatching: Option<(SchedulingPhase, u32)>,
    events: SlotMap<EventId, EventSlot>,
    occurrences: SlotMap<OccurrenceId, Occurrence>,
    queue: BTreeMap<QueueKey, OccurrenceId>,
    unique_pending: BTreeSet<(EventId, Tick)>,
    next_seq: u64,
    precedences: Vec<(EventId, EventId)>,
    dag: Dag,
    phase_base: [u32; SchedulingPhase::ALL.len()],
    clocks: ClockTree,
    pending_continuing: usize,
    stop_requested: bool,
    dispatched_total: u64,
    busy_nanos: Arc<AtomicU64>,
    sleeper: Sleeper,
    binding_open: bool,
    pub(crate) ports: PortFabric,
    pub(crate) notifications: NotificationHub,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Configuring,
            current_tick: 0,
            dispatching: None,
            events: SlotMap::with_key(),
            occurrences: SlotMap::with_key(),
            queue: BTreeMap::new(),
            unique_pending: BTreeSet::new(),
            next_seq: 0,
            precedences: Vec::new(),
            dag: Dag::new(),
            phase_base: [0; SchedulingPhase::ALL.len()],
            clocks: ClockTree::new(),
            pending_continuing: 0,
            stop_requested: false,
            dispatched_total: 0,
            busy_nanos: Arc::new(AtomicU64::new(0)),
            sleeper: Sleeper::new(),
            binding_open: false,
            ports: PortFabric::default(),
            notifications: NotificationHub::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state >= SchedulerState::Finalized
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    /// The phase currently being dispatched, if inside a handler.
    pub fn current_phase(&self) -> Option<SchedulingPhase> {
        self.dispatching.map(|(phase, _)| phase)
    }

    pub fn events_dispatched(&self) -> u64 {
        self.dispatched_total
    }

    /// Accumulated time spent inside handlers. This is the clock used by
    /// CPU-clock timeouts.
    pub fn busy_nanos(&self) -> u64 {
        self.busy_nanos.load(Ordering::Relaxed)
    }

    pub fn clocks(&self) -> &ClockTree {
        &self.clocks
    }

    pub fn clocks_mut(&mut self) -> &mut ClockTree {
        &mut self.clocks
    }

    pub fn sleeper(&mut self) -> &mut Sleeper {
        &mut self.sleeper
    }

    pub fn current_cycle(&self, clock: ClockId) -> SimResult<Cycle> {
        Ok(self.clocks.get(clock)?.current_cycle(self.current_tick))
    }

    pub(crate) fn open_binding(&mut self) {
        self.binding_open = true;
    }

    /// True while ports may still be bound.
    pub fn binding_allowed(&self) -> bool {
        self.binding_open && self.state == SchedulerState::Configuring
    }

    fn scheduler_phase_error(&self, what: &str, message: &str) -> SimError {
        let phase = match self.state {
            SchedulerState::Configuring => TreePhase::Configuring,
            SchedulerState::Finalized | SchedulerState::Running => TreePhase::Finalized,
            SchedulerState::TornDown => TreePhase::Teardown,
        };
        SimError::phase(format!("scheduler.{what}"), phase, message)
    }

    /// Registers an event with a raw handler.
    pub fn register_event(&mut self, spec: EventSpec, handler: Handler) -> SimResult<EventId> {
        self.insert_event(spec, Some(handler), None)
    }

    /// Registers an event that takes no payload.
    pub fn register<F>(&mut self, spec: EventSpec, mut handler: F) -> SimResult<EventId>
    where
        F: FnMut(&mut Scheduler) -> anyhow::Result<()> + 'static,
    {
        self.register_event(spec, Box::new(move |sched, _| handler(sched)))
    }

    /// Registers an event whose occurrences carry a `T`.
    pub fn register_payload<T, F>(&mut self, spec: EventSpec, mut handler: F) -> SimResult<EventId>
    where
        T: 'static,
        F: FnMut(&mut Scheduler, T) -> anyhow::Result<()> + 'static,
    {
        let label = spec.label.clone();
        let wrapped: Handler = Box::new(move |sched, payload| {
            let value = payload
                .and_then(|p| p.downcast::<T>().ok())
                .ok_or_else(|| SimError::TypeMismatch {
                    location: label.clone(),
                    expected: std::any::type_name::<T>().into(),
                    found: "missing or foreign payload".into(),
                })?;
            handler(sched, *value)
        });
        let payload_type = (TypeId::of::<T>(), std::any::type_name::<T>());
        self.insert_event(spec, Some(wrapped), Some(payload_type))
    }

    fn insert_event(
        &mut self,
        spec: EventSpec,
        handler: Option<Handler>,
        payload_type: Option<(TypeId, &'static str)>,
    ) -> SimResult<EventId> {
        if self.state == SchedulerState::TornDown {
            return Err(self.scheduler_phase_error(&spec.label, "scheduler is torn down"));
        }
        if let Some(clock) = spec.clock {
            self.clocks.get(clock)?;
        }
        let group = self.phase_base[spec.phase.index()];
        trace!(label = %spec.label, phase = %spec.phase, "event registered");
        Ok(self.events.insert(EventSlot {
            spec,
            handler,
            payload_type,
            group,
            pending: 0,
            vertex: None,
        }))
    }

    pub fn event_label(&self, event: EventId) -> &str {
        self.events
            .get(event)
            .map(|slot| slot.spec.label.as_str())
            .unwrap_or("<removed>")
    }

    pub fn event_phase(&self, event: EventId) -> Option<SchedulingPhase> {
        self.events.get(event).map(|slot| slot.spec.phase)
    }

    /// DAG group assigned at finalization. Events registered later get the
    /// unconstrained group of their phase.
    pub fn event_group(&self, event: EventId) -> Option<u32> {
        self.events.get(event).map(|slot| slot.group)
    }

    /// Declares that `before` dispatches ahead of `after` within a tick.
    pub fn precedes(&mut self, before: EventId, after: EventId) -> SimResult<()> {
        if self.state != SchedulerState::Configuring {
            return Err(self.scheduler_phase_error(
                self.event_label(before),
                "precedence added after the scheduler was finalized",
            ));
        }
        for id in [before, after] {
            if !self.events.contains_key(id) {
                return Err(SimError::NotFound {
                    origin: "scheduler".into(),
                    path: format!("{id:?}"),
                });
            }
        }
        self.precedences.push((before, after));
        Ok(())
    }

    /// Orders every registered event and freezes the DAG.
    pub fn finalize(&mut self) -> SimResult<()> {
        if self.state != SchedulerState::Configuring {
            return Err(self.scheduler_phase_error("finalize", "scheduler is already finalized"));
        }
        let mut dag = Dag::new();
        let mut gates: Vec<usize> = Vec::with_capacity(SchedulingPhase::ALL.len() + 1);
        for phase in SchedulingPhase::ALL {
            gates.push(dag.add_vertex(format!("<{phase}>")));
        }
        gates.push(dag.add_vertex("<END>"));
        for pair in gates.windows(2) {
            dag.add_edge(pair[0], pair[1]);
        }
        for (_, slot) in self.events.iter_mut() {
            let v = dag.add_vertex(slot.spec.label.clone());
            let p = slot.spec.phase.index();
            dag.add_edge(gates[p], v);
            dag.add_edge(v, gates[p + 1]);
            slot.vertex = Some(v);
        }
        let port_edges = self.ports.constraint_edges();
        for (before, after) in self.precedences.iter().chain(port_edges.iter()) {
            let (Some(a), Some(b)) = (
                self.events.get(*before).and_then(|s| s.vertex),
                self.events.get(*after).and_then(|s| s.vertex),
            ) else {
                continue;
            };
            dag.add_edge(a, b);
        }
        let levels = dag.sort()?.to_vec();
        for (i, phase) in SchedulingPhase::ALL.iter().enumerate() {
            self.phase_base[phase.index()] = levels[gates[i]] + 1;
        }
        for (_, slot) in self.events.iter_mut() {
            if let Some(v) = slot.vertex {
                slot.group = levels[v];
            }
        }
        info!(
            events = self.events.len(),
            edges = dag.edge_count(),
            "scheduler finalized"
        );
        self.dag = dag;
        self.clocks.freeze();
        self.state = SchedulerState::Finalized;
        Ok(())
    }

    /// Graphviz rendering of the finalized DAG.
    pub fn dag_dot(&self) -> String {
        self.dag.to_dot()
    }

    /// Schedules `event` `delay` cycles (of its clock) or ticks from now.
    pub fn schedule(&mut self, event: EventId, delay: Cycle) -> SimResult<bool> {
        self.enqueue(event, delay, None, None, None)
    }

    /// Schedules `event` carrying `value`.
    pub fn schedule_with<T: 'static>(&mut self, event: EventId, value: T, delay: Cycle) -> SimResult<bool> {
        self.enqueue(event, delay, Some(Box::new(value)), None, None)
    }

    /// Queues one occurrence. Returns `false` when a unique event already has
    /// an occurrence at the target tick.
    pub(crate) fn enqueue(
        &mut self,
        event: EventId,
        delay: Cycle,
        payload: Payload,
        origin: Option<PortId>,
        target: Option<PortId>,
    ) -> SimResult<bool> {
        let Some(slot) = self.events.get(event) else {
            return Err(SimError::NotFound {
                origin: "scheduler".into(),
                path: format!("{event:?}"),
            });
        };
        let label = &slot.spec.label;
        match self.state {
            SchedulerState::Configuring => {
                return Err(SimError::SendAfterFinalize {
                    label: label.clone(),
                    reason: "the scheduler has not been finalized".into(),
                })
            }
            SchedulerState::TornDown => {
                return Err(SimError::SendAfterFinalize {
                    label: label.clone(),
                    reason: "the scheduler has been torn down".into(),
                })
            }
            _ => {}
        }
        if let Some((expected, name)) = slot.payload_type {
            let found = payload.as_deref().map(|p| p.type_id());
            if found != Some(expected) {
                return Err(SimError::TypeMismatch {
                    location: label.clone(),
                    expected: name.into(),
                    found: if found.is_some() { "another type".into() } else { "no payload".into() },
                });
            }
        }
        let tick = match slot.spec.clock {
            Some(clock) => self.clocks.get(clock)?.tick_after(self.current_tick, delay),
            None => self.current_tick + delay,
        };
        let phase = slot.spec.phase;
        let group = slot.group;
        if tick == self.current_tick {
            if let Some((running, running_group)) = self.dispatching {
                if phase < running || (phase == running && group < running_group) {
                    return Err(SimError::HandlerDuringWrongPhase {
                        label: label.clone(),
                        tick,
                        target: format!("{phase}[{group}]"),
                        current: format!("{running}[{running_group}]"),
                    });
                }
            }
        }
        if slot.spec.unique && !self.unique_pending.insert((event, tick)) {
            return Ok(false);
        }
        let continuing = slot.spec.continuing;
        let key = QueueKey {
            tick,
            phase: phase.index(),
            group,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let id = self.occurrences.insert(Occurrence {
            event,
            key,
            payload,
            origin,
            target,
        });
        self.queue.insert(key, id);
        if let Some(slot) = self.events.get_mut(event) {
            slot.pending += 1;
        }
        if continuing {
            self.pending_continuing += 1;
        }
        if let Some(port) = target {
            self.ports.note_pending(port, 1);
        }
        trace!(label = %self.event_label(event), tick, %phase, "scheduled");
        Ok(true)
    }

    fn retire(&mut self, id: OccurrenceId) -> Option<Occurrence> {
        let occ = self.occurrences.remove(id)?;
        self.queue.remove(&occ.key);
        if let Some(slot) = self.events.get_mut(occ.event) {
            slot.pending = slot.pending.saturating_sub(1);
            if slot.spec.continuing {
                self.pending_continuing = self.pending_continuing.saturating_sub(1);
            }
            if slot.spec.unique {
                self.unique_pending.remove(&(occ.event, occ.key.tick));
            }
        }
        if let Some(port) = occ.target {
            self.ports.note_pending(port, -1);
        }
        Some(occ)
    }

    /// Removes pending occurrences accepted by `keep_out`. Returns how many
    /// were removed.
    pub(crate) fn cancel_where(&mut self, mut remove: impl FnMut(&Occurrence) -> bool) -> usize {
        let doomed: Vec<OccurrenceId> = self
            .occurrences
            .iter()
            .filter(|(_, occ)| remove(occ))
            .map(|(id, _)| id)
            .collect();
        let count = doomed.len();
        for id in doomed {
            self.retire(id);
        }
        count
    }

    /// Cancels every pending occurrence of `event`.
    pub fn cancel(&mut self, event: EventId) -> usize {
        self.cancel_where(|occ| occ.event == event)
    }

    /// Cancels pending occurrences of `event` whose payload equals `value`.
    pub fn cancel_if<T: PartialEq + 'static>(&mut self, event: EventId, value: &T) -> usize {
        self.cancel_where(|occ| occ.event == event && payload_is(occ, |v: &T| v == value))
    }

    /// Cancels pending occurrences of `event` whose payload satisfies `pred`.
    pub fn cancel_if_pred<T: 'static>(&mut self, event: EventId, pred: impl Fn(&T) -> bool) -> usize {
        self.cancel_where(|occ| occ.event == event && payload_is(occ, &pred))
    }

    /// Cancels any pending occurrence accepted by `pred`.
    pub fn cancel_matching(&mut self, pred: impl Fn(&PendingOccurrence<'_>) -> bool) -> usize {
        let phases = SchedulingPhase::ALL;
        self.cancel_where(|occ| {
            pred(&PendingOccurrence {
                event: occ.event,
                tick: occ.key.tick,
                phase: phases[occ.key.phase],
                payload: occ.payload.as_deref(),
            })
        })
    }

    /// Number of registered events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn pending_count(&self, event: EventId) -> usize {
        self.events.get(event).map(|s| s.pending).unwrap_or(0)
    }

    pub fn is_scheduled(&self, event: EventId) -> bool {
        self.pending_count(event) > 0
    }

    /// Earliest tick at which `event` is pending.
    pub fn next_tick_of(&self, event: EventId) -> Option<Tick> {
        self.queue
            .iter()
            .find(|(_, id)| self.occurrences.get(**id).is_some_and(|o| o.event == event))
            .map(|(key, _)| key.tick)
    }

    pub fn has_continuing_work(&self) -> bool {
        self.pending_continuing > 0
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Ends the current run after the event being dispatched returns.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Advances simulated time by at most `ticks` ticks.
    ///
    /// Without `exacting`, the run also ends as soon as only non-continuing
    /// occurrences remain. With it, time always advances to exactly
    /// `start + ticks` unless a handler stops the run or fails.
    pub fn run(&mut self, ticks: u64, exacting: bool) -> SimResult<RunSummary> {
        match self.state {
            SchedulerState::Finalized => {}
            SchedulerState::Running => {
                return Err(self.scheduler_phase_error("run", "run() is not re-entrant"))
            }
            _ => {
                return Err(self.scheduler_phase_error(
                    "run",
                    "the scheduler must be finalized before running",
                ))
            }
        }
        let start_tick = self.current_tick;
        if ticks == 0 {
            return Ok(RunSummary {
                start_tick,
                end_tick: start_tick,
                events_dispatched: 0,
                reason: StopReason::TickLimit,
            });
        }
        self.state = SchedulerState::Running;
        self.stop_requested = false;
        self.sleeper.arm(self.busy_nanos.clone());
        let before = self.dispatched_total;
        let outcome = self.run_loop(start_tick.saturating_add(ticks), exacting);
        self.sleeper.disarm();
        self.dispatching = None;
        self.state = SchedulerState::Finalized;
        let reason = outcome?;
        let summary = RunSummary {
            start_tick,
            end_tick: self.current_tick,
            events_dispatched: self.dispatched_total - before,
            reason,
        };
        debug!(%summary, "run finished");
        Ok(summary)
    }

    fn run_loop(&mut self, end: Tick, exacting: bool) -> SimResult<StopReason> {
        loop {
            if self.stop_requested {
                return Ok(StopReason::Stopped);
            }
            if !exacting && self.pending_continuing == 0 {
                return Ok(StopReason::NoContinuingWork);
            }
            let Some((&key, &id)) = self.queue.iter().next() else {
                self.current_tick = end;
                return Ok(StopReason::TickLimit);
            };
            if key.tick >= end {
                self.current_tick = end;
                return Ok(StopReason::TickLimit);
            }
            if key.tick > self.current_tick {
                if let Some(expired) = self.sleeper.expired() {
                    if expired.clean_exit {
                        info!(tick = self.current_tick, "timeout reached, stopping cleanly");
                        return Ok(StopReason::Timeout);
                    }
                    return Err(SimError::Timeout {
                        seconds: expired.seconds,
                        clock: expired.clock,
                        tick: self.current_tick,
                    });
                }
                self.current_tick = key.tick;
            }
            self.dispatch(id)?;
        }
    }

    fn dispatch(&mut self, id: OccurrenceId) -> SimResult<()> {
        let Some(occ) = self.retire(id) else {
            return Ok(());
        };
        let phase = SchedulingPhase::ALL[occ.key.phase];
        self.dispatching = Some((phase, occ.key.group));
        let Some(mut handler) = self.events.get_mut(occ.event).and_then(|s| s.handler.take()) else {
            return Ok(());
        };
        trace!(tick = self.current_tick, %phase, label = %self.event_label(occ.event), "dispatch");
        let started = Instant::now();
        let result = handler(self, occ.payload);
        self.busy_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.dispatched_total += 1;
        if let Some(slot) = self.events.get_mut(occ.event) {
            slot.handler = Some(handler);
        }
        result.map_err(|err| SimError::from_callback(err, self.event_label(occ.event), self.current_tick))
    }

    /// Drops every pending occurrence and refuses further scheduling.
    pub(crate) fn teardown(&mut self) {
        let all: Vec<OccurrenceId> = self.occurrences.keys().collect();
        for id in all {
            self.retire(id);
        }
        self.sleeper.disarm();
        self.state = SchedulerState::TornDown;
    }
}

fn payload_is<T: 'static>(occ: &Occurrence, pred: impl Fn(&T) -> bool) -> bool {
    occ.payload
        .as_deref()
        .and_then(|p| p.downcast_ref::<T>())
        .is_some_and(pred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(Tick, &'static str)>>>;

    fn logger(log: &Log, name: &'static str) -> impl FnMut(&mut Scheduler) -> anyhow::Result<()> {
        let log = log.clone();
        move |sched| {
            log.borrow_mut().push((sched.current_tick(), name));
            Ok(())
        }
    }

    #[test]
    fn run_zero_does_nothing() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let ev = sched
            .register(EventSpec::new("ev", SchedulingPhase::Tick), logger(&log, "ev"))
            .unwrap();
        sched.finalize().unwrap();
        sched.schedule(ev, 0).unwrap();
        let summary = sched.run(0, false).unwrap();
        assert_eq!(summary.events_dispatched, 0);
        assert_eq!(sched.current_tick(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn phases_order_within_a_tick() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let tick = sched
            .register(EventSpec::new("tick", SchedulingPhase::Tick), logger(&log, "tick"))
            .unwrap();
        let update = sched
            .register(EventSpec::new("update", SchedulingPhase::Update), logger(&log, "update"))
            .unwrap();
        sched.finalize().unwrap();
        sched.schedule(tick, 1).unwrap();
        sched.schedule(update, 1).unwrap();
        let summary = sched.run(5, false).unwrap();
        assert_eq!(*log.borrow(), vec![(1, "update"), (1, "tick")]);
        assert_eq!(summary.reason, StopReason::NoContinuingWork);
        assert_eq!(summary.end_tick, 1);
    }

    #[test]
    fn precedence_orders_events_in_one_phase() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let a = sched
            .register(EventSpec::new("a", SchedulingPhase::Tick), logger(&log, "a"))
            .unwrap();
        let b = sched
            .register(EventSpec::new("b", SchedulingPhase::Tick), logger(&log, "b"))
            .unwrap();
        sched.precedes(b, a).unwrap();
        sched.finalize().unwrap();
        assert!(sched.event_group(b) < sched.event_group(a));
        sched.schedule(a, 0).unwrap();
        sched.schedule(b, 0).unwrap();
        sched.run(1, false).unwrap();
        assert_eq!(*log.borrow(), vec![(0, "b"), (0, "a")]);
        assert_eq!(sched.precedes(a, b).unwrap_err().kind(), ErrorKind::Phase);
    }

    #[test]
    fn cross_phase_precedence_against_phase_order_is_a_cycle() {
        let mut sched = Scheduler::new();
        let tick = sched.register(EventSpec::new("t", SchedulingPhase::Tick), |_| Ok(())).unwrap();
        let update = sched.register(EventSpec::new("u", SchedulingPhase::Update), |_| Ok(())).unwrap();
        sched.precedes(tick, update).unwrap();
        match sched.finalize().unwrap_err() {
            SimError::DagCycle { cycle } => {
                assert!(cycle.contains(&"t".to_string()));
                assert!(cycle.contains(&"u".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scheduling_before_finalize_is_rejected() {
        let mut sched = Scheduler::new();
        let ev = sched.register(EventSpec::new("ev", SchedulingPhase::Tick), |_| Ok(())).unwrap();
        assert_eq!(sched.schedule(ev, 1).unwrap_err().kind(), ErrorKind::SendAfterFinalize);
        assert_eq!(sched.run(1, false).unwrap_err().kind(), ErrorKind::Phase);
    }

    #[test]
    fn zero_delay_into_a_drained_phase_fails() {
        let mut sched = Scheduler::new();
        let early = sched.register(EventSpec::new("early", SchedulingPhase::Update), |_| Ok(())).unwrap();
        let late = sched
            .register(EventSpec::new("late", SchedulingPhase::Tick), move |s| {
                s.schedule(early, 0)?;
                Ok(())
            })
            .unwrap();
        sched.finalize().unwrap();
        sched.schedule(late, 0).unwrap();
        let err = sched.run(1, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerDuringWrongPhase);
    }

    #[test]
    fn non_continuing_work_stops_unless_exacting() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let ev = sched
            .register(
                EventSpec::new("bg", SchedulingPhase::Tick).non_continuing(),
                logger(&log, "bg"),
            )
            .unwrap();
        sched.finalize().unwrap();
        sched.schedule(ev, 3).unwrap();
        let summary = sched.run(10, false).unwrap();
        assert_eq!(summary.reason, StopReason::NoContinuingWork);
        assert_eq!(summary.events_dispatched, 0);

        let summary = sched.run(10, true).unwrap();
        assert_eq!(summary.reason, StopReason::TickLimit);
        assert_eq!(summary.end_tick, 10);
        assert_eq!(*log.borrow(), vec![(3, "bg")]);
    }

    #[test]
    fn unique_events_collapse_per_tick() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let ev = sched
            .register(EventSpec::new("u", SchedulingPhase::Tick).unique(), logger(&log, "u"))
            .unwrap();
        sched.finalize().unwrap();
        assert!(sched.schedule(ev, 1).unwrap());
        assert!(!sched.schedule(ev, 1).unwrap());
        assert!(sched.schedule(ev, 2).unwrap());
        sched.run(5, false).unwrap();
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn payload_cancellation_skips_matches() {
        let mut sched = Scheduler::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let ev = sched
            .register_payload(EventSpec::new("p", SchedulingPhase::Tick), move |s, v: u32| {
                sink.borrow_mut().push((s.current_tick(), v));
                Ok(())
            })
            .unwrap();
        sched.finalize().unwrap();
        for (v, d) in [(1u32, 0), (2, 1), (3, 2)] {
            sched.schedule_with(ev, v, d).unwrap();
        }
        assert_eq!(sched.cancel_if(ev, &2u32), 1);
        assert_eq!(sched.cancel_if_pred(ev, |v: &u32| *v > 100), 0);
        sched.run(3, false).unwrap();
        assert_eq!(*seen.borrow(), vec![(0, 1), (2, 3)]);
        let wrong = sched.schedule_with(ev, "text", 0).unwrap_err();
        assert_eq!(wrong.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn handler_errors_carry_tick_and_label() {
        let mut sched = Scheduler::new();
        let ev = sched
            .register(EventSpec::new("boom", SchedulingPhase::Tick), |_| {
                anyhow::bail!("exploded")
            })
            .unwrap();
        sched.finalize().unwrap();
        sched.schedule(ev, 4).unwrap();
        match sched.run(10, false).unwrap_err() {
            SimError::FatalRuntime { label, tick, .. } => {
                assert_eq!(label, "boom");
                assert_eq!(tick, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sched.state(), SchedulerState::Finalized);
    }

    #[test]
    fn stop_ends_the_run_after_the_current_event() {
        let mut sched = Scheduler::new();
        let ev = sched
            .register(EventSpec::new("again", SchedulingPhase::Tick), |s| {
                if s.current_tick() == 4 {
                    s.stop();
                }
                Ok(())
            })
            .unwrap();
        sched.finalize().unwrap();
        for d in 0..10 {
            sched.schedule(ev, d).unwrap();
        }
        let summary = sched.run(100, false).unwrap();
        assert_eq!(summary.reason, StopReason::Stopped);
        assert_eq!(summary.end_tick, 4);
        assert_eq!(summary.events_dispatched, 5);
    }

    #[test]
    fn expired_budget_stops_or_fails_the_run() {
        let mut sched = Scheduler::new();
        let ev = sched
            .register(EventSpec::new("busy", SchedulingPhase::Tick), |_| {
                std::thread::sleep(std::time::Duration::from_millis(1));
                Ok(())
            })
            .unwrap();
        sched.finalize().unwrap();
        for d in 0..2000 {
            sched.schedule(ev, d).unwrap();
        }

        sched.sleeper().set_timeout(std::time::Duration::from_millis(5), true, true);
        let summary = sched.run(5000, false).unwrap();
        assert_eq!(summary.reason, StopReason::Timeout);
        assert!(summary.end_tick < 2000);
        assert_eq!(summary.end_tick + 1, summary.events_dispatched);

        sched.sleeper().set_timeout(std::time::Duration::from_millis(5), false, true);
        let err = sched.run(5000, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        match err {
            SimError::Timeout { clock, tick, .. } => {
                assert_eq!(clock, "wall");
                assert!(tick > summary.end_tick);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sched.state(), SchedulerState::Finalized);
    }

    #[test]
    fn clocked_events_land_on_edges() {
        let mut sched = Scheduler::new();
        let root = sched.clocks_mut().create_root("root").unwrap();
        let slow = sched.clocks_mut().create("slow", root, 1, 4).unwrap();
        let log = Log::default();
        let ev = sched
            .register(EventSpec::new("slow", SchedulingPhase::Tick).clock(slow), logger(&log, "slow"))
            .unwrap();
        sched.finalize().unwrap();
        sched.schedule(ev, 2).unwrap();
        sched.run(20, false).unwrap();
        assert_eq!(*log.borrow(), vec![(8, "slow")]);
    }
}
