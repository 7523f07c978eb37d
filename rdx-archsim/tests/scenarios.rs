//! End-to-end runs through the public `Simulation` surface.

use archsim::demo::{build_pipeline, register_factories};
use archsim::notify::register_for_notification;
use archsim::prelude::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Deliveries = Rc<RefCell<Vec<(Tick, u32)>>>;

fn finalized(sim: &mut Simulation) {
    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    sim.finalize_scheduler().unwrap();
}

// --- a resource with one parameter -----------------------------------------

struct Holder {
    foo: u32,
    teardowns: Rc<Cell<u32>>,
}

impl Resource for Holder {
    fn on_starting_teardown(&mut self) {
        self.teardowns.set(self.teardowns.get() + 1);
    }
}

struct HolderFactory {
    teardowns: Rc<Cell<u32>>,
}

impl ResourceFactory for HolderFactory {
    fn name(&self) -> &str {
        "holder"
    }

    fn declare_params(&self, params: &mut ParameterSet) {
        params.param("foo", 0u32, "a stored value");
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        Ok(Box::new(Holder {
            foo: ctx.param("foo")?,
            teardowns: self.teardowns.clone(),
        }))
    }
}

#[test]
fn overlay_value_reaches_a_single_resource() {
    let teardowns = Rc::new(Cell::new(0));
    let mut sim = Simulation::new("top").unwrap();
    sim.register_factory(Rc::new(HolderFactory {
        teardowns: teardowns.clone(),
    }))
    .unwrap();
    let a = sim.add_resource(sim.top(), NodeSpec::new("a"), "holder").unwrap();
    sim.vpt_mut().set("top.a.params.foo", "7", true, "test");
    finalized(&mut sim);

    let foo = sim.tree().lookup("top.a.params.foo").unwrap();
    assert_eq!(sim.tree().parameter(foo).unwrap().get::<u32>().unwrap(), 7);
    assert_eq!(sim.resource::<Holder>(a).unwrap().foo, 7);
    let dump = archsim::params::serialize::serialize(sim.tree(), sim.top()).unwrap();
    assert!(dump.lines().any(|line| line.starts_with("top.a.params.foo = 7 # test")));

    sim.enter_teardown().unwrap();
    assert_eq!(sim.enter_teardown().unwrap_err().kind(), ErrorKind::Phase);
    drop(sim);
    assert_eq!(teardowns.get(), 1);
}

#[test]
fn wildcards_apply_to_every_core_and_literals_refine_them() {
    let mut sim = Simulation::new("top").unwrap();
    register_factories(&mut sim).unwrap();
    let pipeline = build_pipeline(&mut sim, 2).unwrap();
    sim.vpt_mut().set("top.core*.alu.params.latency", "3", true, "test");
    finalized(&mut sim);
    assert_eq!(pipeline.alu(&sim, 0).unwrap().latency(), 3);
    assert_eq!(pipeline.alu(&sim, 1).unwrap().latency(), 3);

    let mut sim = Simulation::new("top").unwrap();
    register_factories(&mut sim).unwrap();
    let pipeline = build_pipeline(&mut sim, 2).unwrap();
    sim.vpt_mut().set("top.core*.alu.params.latency", "3", true, "test");
    sim.vpt_mut().set("top.core0.alu.params.latency", "4", true, "test");
    finalized(&mut sim);
    assert_eq!(pipeline.alu(&sim, 0).unwrap().latency(), 4);
    assert_eq!(pipeline.alu(&sim, 1).unwrap().latency(), 3);
}

#[test]
fn config_files_feed_the_overlay() {
    let file = ConfigFile::from_toml(
        r#"
        [run]
        ticks = 50

        [parameters.top."core*".producer.params]
        count = 3

        [optional_parameters.top.nowhere.params]
        x = 1
        "#,
    )
    .unwrap();
    let mut sim = Simulation::with_config("top", file.settings.clone()).unwrap();
    register_factories(&mut sim).unwrap();
    let pipeline = build_pipeline(&mut sim, 1).unwrap();
    sim.apply_config(&file).unwrap();
    finalized(&mut sim);
    pipeline.arm(&mut sim).unwrap();

    let summary = sim.run_configured().unwrap();
    assert_eq!(summary.reason, StopReason::NoContinuingWork);
    assert_eq!(pipeline.consumer(&sim, 0).unwrap().received().len(), 3);
}

// --- a producer/consumer pair joined by one port --------------------------

struct Source {
    out: OutPort<u32>,
    drive: EventId,
}

impl Resource for Source {}

struct SourceFactory {
    presume_zero_delay: bool,
}

impl ResourceFactory for SourceFactory {
    fn name(&self) -> &str {
        "source"
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        let out = ctx.out_port::<u32>(
            "data_out",
            OutPortSpec {
                presume_zero_delay: self.presume_zero_delay,
            },
        )?;
        let drive = ctx.event("drive", SchedulingPhase::PortUpdate, move |sched| {
            out.send(sched, 1, 0)?;
            Ok(())
        })?;
        out.register_producing_event(ctx.scheduler(), drive)?;
        Ok(Box::new(Source { out, drive }))
    }
}

struct Sink {
    input: InPort<u32>,
}

impl Resource for Sink {
    fn on_bind_tree_early(&mut self, ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
        ctx.bind("..src.ports.data_out", "ports.data_in")?;
        Ok(())
    }
}

struct SinkFactory {
    phase: SchedulingPhase,
    seen: Deliveries,
}

impl ResourceFactory for SinkFactory {
    fn name(&self) -> &str {
        "sink"
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        let seen = self.seen.clone();
        let input = ctx.in_port::<u32, _>("data_in", InPortSpec::default().phase(self.phase), move |sched, v| {
            seen.borrow_mut().push((sched.current_tick(), v));
            Ok(())
        })?;
        Ok(Box::new(Sink { input }))
    }
}

struct Link {
    sim: Simulation,
    src: NodeId,
    dst: NodeId,
    seen: Deliveries,
}

impl Link {
    fn out(&self) -> OutPort<u32> {
        self.sim.resource::<Source>(self.src).unwrap().out
    }
}

fn link(phase: SchedulingPhase, presume_zero_delay: bool) -> Link {
    let seen = Deliveries::default();
    let mut sim = Simulation::new("top").unwrap();
    sim.register_factory(Rc::new(SourceFactory { presume_zero_delay })).unwrap();
    sim.register_factory(Rc::new(SinkFactory {
        phase,
        seen: seen.clone(),
    }))
    .unwrap();
    let top = sim.top();
    let src = sim.add_resource(top, NodeSpec::new("src"), "source").unwrap();
    let dst = sim.add_resource(top, NodeSpec::new("dst"), "sink").unwrap();
    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    Link { sim, src, dst, seen }
}

#[test]
fn delayed_send_is_delivered_one_tick_later() {
    let mut l = link(SchedulingPhase::PortUpdate, false);
    l.sim.finalize_scheduler().unwrap();
    let out = l.out();
    out.send(l.sim.scheduler_mut(), 42, 1).unwrap();
    l.sim.run(2).unwrap();
    assert_eq!(*l.seen.borrow(), vec![(1, 42)]);
}

#[test]
fn zero_delay_reaches_a_later_phase_in_the_same_tick() {
    let mut l = link(SchedulingPhase::Tick, true);
    l.sim.finalize_scheduler().unwrap();
    let drive = l.sim.resource::<Source>(l.src).unwrap().drive;
    l.sim.scheduler_mut().schedule(drive, 0).unwrap();
    l.sim.run(1).unwrap();
    assert_eq!(*l.seen.borrow(), vec![(0, 1)]);
}

#[test]
fn consumer_forced_ahead_of_its_producer_is_a_cycle() {
    let mut l = link(SchedulingPhase::Tick, true);
    let drive = l.sim.resource::<Source>(l.src).unwrap().drive;
    let delivery = {
        let input = l.sim.resource::<Sink>(l.dst).unwrap().input;
        input.delivery_event(l.sim.scheduler()).unwrap()
    };
    l.sim.scheduler_mut().precedes(delivery, drive).unwrap();
    assert_eq!(l.sim.finalize_scheduler().unwrap_err().kind(), ErrorKind::DagCycle);
}

#[test]
fn cancelled_payloads_are_never_delivered() {
    let mut l = link(SchedulingPhase::PortUpdate, false);
    l.sim.finalize_scheduler().unwrap();
    let out = l.out();
    let sched = l.sim.scheduler_mut();
    out.send(sched, 1, 0).unwrap();
    out.send(sched, 2, 1).unwrap();
    out.send(sched, 3, 2).unwrap();
    assert_eq!(out.cancel_if(sched, &2), 1);
    l.sim.run(3).unwrap();
    assert_eq!(*l.seen.borrow(), vec![(0, 1), (2, 3)]);
}

#[test]
fn binding_closes_with_the_scheduler() {
    let mut l = link(SchedulingPhase::PortUpdate, false);
    l.sim.finalize_scheduler().unwrap();
    let out = l.out();
    let input = l.sim.resource::<Sink>(l.dst).unwrap().input;
    let err = out.bind(l.sim.scheduler_mut(), input).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Phase);
}

// --- triggers ---------------------------------------------------------------

#[derive(Default)]
struct Probe {
    log: Vec<(Tick, &'static str)>,
}

impl Triggerable for Probe {
    fn go(&mut self, sched: &mut Scheduler) -> anyhow::Result<()> {
        self.log.push((sched.current_tick(), "go"));
        Ok(())
    }

    fn stop(&mut self, sched: &mut Scheduler) -> anyhow::Result<()> {
        self.log.push((sched.current_tick(), "stop"));
        Ok(())
    }
}

#[test]
fn recurring_trigger_stops_without_a_final_repeat() {
    let mut sim = Simulation::new("top").unwrap();
    finalized(&mut sim);
    let trigger = Trigger::new("sampler", Some(sim.root_clock()));
    trigger.set_start(TriggerPoint::Cycle(53)).unwrap();
    trigger.set_recurring(Some(sim.root_clock()), 10).unwrap();
    trigger.set_stop(TriggerPoint::Cycle(103)).unwrap();
    let probe = Rc::new(RefCell::new(Probe::default()));
    trigger.add_target(probe.clone());
    trigger.arm(sim.scheduler_mut()).unwrap();

    sim.run_with(110, true).unwrap();
    assert_eq!(
        probe.borrow().log,
        vec![
            (53, "go"),
            (63, "go"),
            (73, "go"),
            (83, "go"),
            (93, "go"),
            (103, "stop"),
        ]
    );
    assert_eq!(trigger.repeat_count(), 4);
    assert!(trigger.is_stopped());
}

#[test]
fn exacting_demo_run_stops_when_every_core_drains() {
    let mut sim = Simulation::new("top").unwrap();
    register_factories(&mut sim).unwrap();
    let pipeline = build_pipeline(&mut sim, 3).unwrap();
    sim.vpt_mut().set("top.core2.producer.params.count", "4", true, "test");
    finalized(&mut sim);
    let triggers = pipeline.arm(&mut sim).unwrap();
    assert_eq!(triggers.len(), 3);

    let summary = sim.run_with(1_000, true).unwrap();
    assert_eq!(summary.reason, StopReason::Stopped);
    assert!(triggers.iter().all(Trigger::has_fired));
    assert_eq!(pipeline.consumer(&sim, 2).unwrap().received().len(), 4);
    sim.validate_post_run().unwrap();
}

// --- boundaries -------------------------------------------------------------

#[test]
fn run_zero_is_a_no_op() {
    let mut sim = Simulation::new("top").unwrap();
    register_factories(&mut sim).unwrap();
    let pipeline = build_pipeline(&mut sim, 1).unwrap();
    finalized(&mut sim);
    pipeline.arm(&mut sim).unwrap();

    let summary = sim.run(0).unwrap();
    assert_eq!(summary.events_dispatched, 0);
    assert_eq!(summary.start_tick, summary.end_tick);
    assert_eq!(sim.scheduler().current_tick(), 0);
}

#[test]
fn lifecycle_steps_cannot_repeat() {
    let mut sim = Simulation::new("top").unwrap();
    let top = sim.top();
    sim.enter_configuring().unwrap();
    assert_eq!(sim.enter_configuring().unwrap_err().kind(), ErrorKind::Phase);
    sim.enter_finalized().unwrap();
    assert_eq!(sim.enter_finalized().unwrap_err().kind(), ErrorKind::Phase);
    assert_eq!(
        sim.tree_mut().create_node(top, NodeSpec::new("late")).unwrap_err().kind(),
        ErrorKind::Phase
    );
}

struct Emitter {
    emit: EventId,
}

impl Resource for Emitter {}

struct EmitterFactory;

impl ResourceFactory for EmitterFactory {
    fn name(&self) -> &str {
        "emitter"
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        let pulse = ctx.source::<u32>("pulse", "debug", "Pulses once per emit")?;
        let emit = ctx.event("emit", SchedulingPhase::Tick, move |sched| {
            pulse.post(sched, &5)?;
            Ok(())
        })?;
        Ok(Box::new(Emitter { emit }))
    }
}

#[test]
fn private_subtrees_are_invisible_to_outside_observers() {
    let mut sim = Simulation::new("top").unwrap();
    sim.register_factory(Rc::new(EmitterFactory)).unwrap();
    let top = sim.top();
    let vault = sim
        .tree_mut()
        .create_node(top, NodeSpec::new("vault").private())
        .unwrap();
    let emitter = sim.add_resource(vault, NodeSpec::new("emitter"), "emitter").unwrap();
    finalized(&mut sim);

    let outside = Rc::new(Cell::new(0));
    let inside = Rc::new(Cell::new(0));
    let (tree, sched) = sim.parts_mut();
    let seen = outside.clone();
    let subs = register_for_notification::<u32, _>(tree, sched, top, "pulse", move |_, _| {
        seen.set(seen.get() + 1);
        Ok(())
    })
    .unwrap();
    assert!(subs.is_empty());
    let seen = inside.clone();
    let subs = register_for_notification::<u32, _>(tree, sched, vault, "pulse", move |_, v| {
        seen.set(seen.get() + *v);
        Ok(())
    })
    .unwrap();
    assert_eq!(subs.len(), 1);

    let emit = sim.resource::<Emitter>(emitter).unwrap().emit;
    sim.scheduler_mut().schedule(emit, 0).unwrap();
    sim.run(1).unwrap();
    assert_eq!(outside.get(), 0);
    assert_eq!(inside.get(), 5);
}
