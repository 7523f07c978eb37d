//! Triggers: start, stop and repeat framework actions on cycles, counters or
//! expressions.
//!
//! A [`Trigger`] drives a list of [`Triggerable`] targets. Its events run in
//! the TRIGGER phase and are non-continuing, so an armed trigger never keeps
//! a run alive by itself.

mod counter;
mod expression;

pub use counter::CounterTrigger;
pub use expression::ExpressionTrigger;

use crate::common::{ClockId, Cycle, EventId, SchedulingPhase, Tick, TreePhase};
use crate::error::{SimError, SimResult};
use crate::sched::{EventSpec, Scheduler};
use crate::stats::{Counter, Expression};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// Something a trigger can switch on and off.
pub trait Triggerable {
    fn go(&mut self, sched: &mut Scheduler) -> anyhow::Result<()>;

    fn stop(&mut self, sched: &mut Scheduler) -> anyhow::Result<()>;

    /// Called on every recurring period after the first `go`.
    fn repeat(&mut self, sched: &mut Scheduler) -> anyhow::Result<()> {
        self.go(sched)
    }
}

/// When a start or stop fires.
#[derive(Clone)]
pub enum TriggerPoint {
    /// An absolute cycle of the trigger clock.
    Cycle(Cycle),
    /// Cycles after arming (start) or after the start fired (stop).
    RelativeCycle(Cycle),
    /// The first cycle on which `counter >= threshold`.
    Counter { counter: Counter, threshold: u64 },
    /// The first cycle on which the expression is non-zero.
    Expression(Expression),
}

impl fmt::Debug for TriggerPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerPoint::Cycle(c) => write!(f, "Cycle({c})"),
            TriggerPoint::RelativeCycle(c) => write!(f, "RelativeCycle({c})"),
            TriggerPoint::Counter { threshold, .. } => write!(f, "Counter(>= {threshold})"),
            TriggerPoint::Expression(e) => write!(f, "Expression({})", e.text()),
        }
    }
}

#[derive(Debug, Clone)]
enum Watch {
    Counter(CounterTrigger),
    Expression(ExpressionTrigger),
}

impl Watch {
    fn check(&mut self, tick: Tick) -> bool {
        match self {
            Watch::Counter(c) => c.check(),
            Watch::Expression(e) => e.check(tick),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    WaitingStart,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct Events {
    start: EventId,
    stop: EventId,
    repeat: EventId,
    poll: EventId,
}

type Target = Rc<RefCell<dyn Triggerable>>;

struct State {
    name: String,
    clock: Option<ClockId>,
    start: Option<TriggerPoint>,
    stop: Option<TriggerPoint>,
    period: Option<Cycle>,
    aligned: bool,
    recurring_stopped: bool,
    stage: Stage,
    /// Pending counter/expression watch and whether it gates start or stop.
    watch: Option<(Watch, bool)>,
    targets: Vec<Target>,
    events: Option<Events>,
    starts: u32,
    repeats: u32,
}

/// Start/stop/repeat controller for a set of [`Triggerable`]s.
#[derive(Clone)]
pub struct Trigger {
    state: Rc<RefCell<State>>,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.borrow();
        f.debug_struct("Trigger")
            .field("name", &s.name)
            .field("start", &s.start)
            .field("stop", &s.stop)
            .field("period", &s.period)
            .field("stage", &s.stage)
            .finish()
    }
}

impl Trigger {
    /// A trigger counting cycles of `clock`, or ticks when `clock` is `None`.
    pub fn new(name: &str, clock: Option<ClockId>) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                name: name.to_string(),
                clock,
                start: None,
                stop: None,
                period: None,
                aligned: false,
                recurring_stopped: false,
                stage: Stage::Idle,
                watch: None,
                targets: Vec::new(),
                events: None,
                starts: 0,
                repeats: 0,
            })),
        }
    }

    fn configure(&self, what: &str, apply: impl FnOnce(&mut State)) -> SimResult<()> {
        let mut s = self.state.borrow_mut();
        if s.events.is_some() {
            return Err(SimError::phase(
                format!("trigger.{}", s.name),
                TreePhase::Finalized,
                format!("cannot change {what} once the trigger is armed"),
            ));
        }
        apply(&mut s);
        Ok(())
    }

    pub fn add_target(&self, target: Rc<RefCell<dyn Triggerable>>) {
        self.state.borrow_mut().targets.push(target);
    }

    pub fn set_start(&self, point: TriggerPoint) -> SimResult<()> {
        self.configure("the start point", |s| s.start = Some(point))
    }

    pub fn set_stop(&self, point: TriggerPoint) -> SimResult<()> {
        self.configure("the stop point", |s| s.stop = Some(point))
    }

    /// Makes the trigger repeat every `period` cycles of `clock` after it
    /// starts, until it stops.
    pub fn set_recurring(&self, clock: Option<ClockId>, period: Cycle) -> SimResult<()> {
        if period == 0 {
            return Err(SimError::InvalidParameter {
                location: format!("trigger.{}", self.state.borrow().name),
                reason: "recurring period must be positive".into(),
            });
        }
        self.configure("the period", |s| {
            s.clock = clock;
            s.period = Some(period);
        })
    }

    /// Aligns repeats to multiples of the period instead of counting from
    /// the first fire.
    pub fn set_aligned(&self, aligned: bool) -> SimResult<()> {
        self.configure("alignment", |s| s.aligned = aligned)
    }

    /// Cancels future repeats. Calling it again has no further effect.
    pub fn force_stop_recurring(&self, sched: &mut Scheduler) {
        let mut s = self.state.borrow_mut();
        if s.recurring_stopped {
            return;
        }
        s.recurring_stopped = true;
        if let Some(ev) = s.events {
            sched.cancel(ev.repeat);
        }
        debug!(trigger = %s.name, "recurring stopped");
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().stage == Stage::Running
    }

    /// True once the start fired.
    pub fn has_fired(&self) -> bool {
        self.state.borrow().starts > 0
    }

    pub fn is_stopped(&self) -> bool {
        self.state.borrow().stage == Stage::Stopped
    }

    pub fn repeat_count(&self) -> u32 {
        self.state.borrow().repeats
    }

    /// Registers the trigger's events and schedules its start. The scheduler
    /// must be finalized.
    pub fn arm(&self, sched: &mut Scheduler) -> SimResult<()> {
        if self.state.borrow().events.is_some() {
            return Err(SimError::phase(
                format!("trigger.{}", self.state.borrow().name),
                TreePhase::Finalized,
                "trigger is already armed",
            ));
        }
        let (name, clock) = {
            let s = self.state.borrow();
            (s.name.clone(), s.clock)
        };
        let spec = |what: &str| {
            let spec = EventSpec::new(format!("trigger.{name}.{what}"), SchedulingPhase::Trigger)
                .non_continuing()
                .unique();
            match clock {
                Some(c) => spec.clock(c),
                None => spec,
            }
        };
        let handle = self.clone();
        let start = sched.register(spec("start"), move |s| handle.fire_start(s))?;
        let handle = self.clone();
        let stop = sched.register(spec("stop"), move |s| handle.fire_stop(s))?;
        let handle = self.clone();
        let repeat = sched.register(spec("repeat"), move |s| handle.fire_repeat(s))?;
        let handle = self.clone();
        let poll = sched.register(spec("poll"), move |s| handle.poll(s))?;
        let start_point = {
            let mut s = self.state.borrow_mut();
            s.events = Some(Events {
                start,
                stop,
                repeat,
                poll,
            });
            s.stage = Stage::WaitingStart;
            s.start.clone()
        };
        debug!(trigger = %name, start = ?start_point, "trigger armed");
        match start_point {
            Some(point) => self.schedule_point(sched, point, true)?,
            None => {
                let delay = first_delay(sched);
                sched.schedule(start, delay)?;
            }
        }
        Ok(())
    }

    fn events(&self) -> SimResult<Events> {
        let s = self.state.borrow();
        s.events.ok_or_else(|| {
            SimError::phase(format!("trigger.{}", s.name), TreePhase::Finalized, "trigger is not armed")
        })
    }

    fn cycle_now(&self, sched: &Scheduler) -> SimResult<Cycle> {
        match self.state.borrow().clock {
            Some(c) => Ok(sched.clocks().get(c)?.next_edge_cycle(sched.current_tick())),
            None => Ok(sched.current_tick()),
        }
    }

    fn schedule_point(&self, sched: &mut Scheduler, point: TriggerPoint, is_start: bool) -> SimResult<()> {
        let ev = self.events()?;
        let target = if is_start { ev.start } else { ev.stop };
        match point {
            TriggerPoint::Cycle(cycle) => {
                let delay = cycle.saturating_sub(self.cycle_now(sched)?);
                sched.schedule(target, delay.max(first_delay(sched)))?;
            }
            TriggerPoint::RelativeCycle(delay) => {
                sched.schedule(target, delay.max(first_delay(sched)))?;
            }
            TriggerPoint::Counter { counter, threshold } => {
                let name = self.state.borrow().name.clone();
                self.state.borrow_mut().watch =
                    Some((Watch::Counter(CounterTrigger::new(&name, counter, threshold)), is_start));
                sched.schedule(ev.poll, first_delay(sched))?;
            }
            TriggerPoint::Expression(expr) => {
                self.state.borrow_mut().watch =
                    Some((Watch::Expression(ExpressionTrigger::new(expr)), is_start));
                sched.schedule(ev.poll, first_delay(sched))?;
            }
        }
        Ok(())
    }

    fn targets(&self) -> Vec<Target> {
        self.state.borrow().targets.clone()
    }

    fn poll(&self, sched: &mut Scheduler) -> anyhow::Result<()> {
        let tick = sched.current_tick();
        let outcome = {
            let mut s = self.state.borrow_mut();
            match s.watch.as_mut() {
                Some((watch, is_start)) => Some((watch.check(tick), *is_start)),
                None => None,
            }
        };
        match outcome {
            Some((true, is_start)) => {
                self.state.borrow_mut().watch = None;
                if is_start {
                    self.fire_start(sched)
                } else {
                    self.fire_stop(sched)
                }
            }
            Some((false, _)) => {
                let ev = self.events()?;
                sched.schedule(ev.poll, 1)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn fire_start(&self, sched: &mut Scheduler) -> anyhow::Result<()> {
        let (name, stop_point, period) = {
            let mut s = self.state.borrow_mut();
            if s.stage != Stage::WaitingStart {
                return Ok(());
            }
            s.stage = Stage::Running;
            s.starts += 1;
            (s.name.clone(), s.stop.clone(), s.period)
        };
        debug!(trigger = %name, tick = sched.current_tick(), "trigger start");
        for target in self.targets() {
            target.borrow_mut().go(sched)?;
        }
        if let Some(period) = period {
            self.schedule_repeat(sched, period)?;
        }
        if let Some(point) = stop_point {
            self.schedule_point(sched, point, false)?;
        }
        Ok(())
    }

    fn schedule_repeat(&self, sched: &mut Scheduler, period: Cycle) -> SimResult<()> {
        let (aligned, stopped) = {
            let s = self.state.borrow();
            (s.aligned, s.recurring_stopped)
        };
        if stopped {
            return Ok(());
        }
        let delay = if aligned {
            let now = self.cycle_now(sched)?;
            period - now % period
        } else {
            period
        };
        sched.schedule(self.events()?.repeat, delay)?;
        Ok(())
    }

    fn fire_repeat(&self, sched: &mut Scheduler) -> anyhow::Result<()> {
        let ev = self.events()?;
        let (running, stopped, period) = {
            let s = self.state.borrow();
            (s.stage == Stage::Running, s.recurring_stopped, s.period)
        };
        // a stop landing on this tick wins
        if !running || stopped || sched.next_tick_of(ev.stop) == Some(sched.current_tick()) {
            return Ok(());
        }
        self.state.borrow_mut().repeats += 1;
        trace!(tick = sched.current_tick(), "trigger repeat");
        for target in self.targets() {
            target.borrow_mut().repeat(sched)?;
        }
        if let Some(period) = period {
            self.schedule_repeat(sched, period)?;
        }
        Ok(())
    }

    fn fire_stop(&self, sched: &mut Scheduler) -> anyhow::Result<()> {
        let ev = self.events()?;
        let name = {
            let mut s = self.state.borrow_mut();
            if s.stage != Stage::Running {
                return Ok(());
            }
            s.stage = Stage::Stopped;
            s.watch = None;
            s.name.clone()
        };
        sched.cancel(ev.repeat);
        sched.cancel(ev.poll);
        debug!(trigger = %name, tick = sched.current_tick(), "trigger stop");
        for target in self.targets() {
            target.borrow_mut().stop(sched)?;
        }
        Ok(())
    }
}

/// Smallest legal delay for a TRIGGER-phase event scheduled right now.
fn first_delay(sched: &Scheduler) -> Cycle {
    match sched.current_phase() {
        Some(phase) if phase > SchedulingPhase::Trigger => 1,
        _ => 0,
    }
}
