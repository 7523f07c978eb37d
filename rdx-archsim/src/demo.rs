//! A small producer -> ALU -> consumer pipeline.
//!
//! Each core `top.core<N>` holds three resources:
//!
//! - `producer` sends `count` values through `ports.data_out`, one per cycle,
//!   starting at cycle `start`;
//! - `alu` adds `operand` to every value on `ports.data_in` and forwards the
//!   result after `latency` cycles, posting it on its `result` source;
//! - `consumer` records what arrives and counts the `result` notifications it
//!   observes from its core.
//!
//! The binaries and the integration tests drive this model.

use crate::common::{ClockId, EventId, NodeId, SchedulingPhase, Tick};
use crate::error::{SimError, SimResult};
use crate::notify::NotificationSource;
use crate::params::{ParamValue, ParameterDef, ParameterSet};
use crate::ports::{InPortSpec, OutPort, OutPortSpec};
use crate::resource::{BindContext, Resource, ResourceContext, ResourceFactory};
use crate::sched::Scheduler;
use crate::sim::Simulation;
use crate::stats::{Counter, Statistic};
use crate::tree::{NodeSpec, Tree};
use crate::trigger::{Trigger, TriggerPoint, Triggerable};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, info};

pub const PRODUCER: &str = "producer";
pub const ALU: &str = "alu";
pub const CONSUMER: &str = "consumer";

/// Tag carried by every pipeline stage node.
pub const STAGE_TAG: &str = "stage";

pub struct Producer {
    issue: EventId,
    start: u64,
    count: u32,
    issued: Counter,
}

impl Producer {
    pub fn issue_event(&self) -> EventId {
        self.issue
    }

    pub fn start_cycle(&self) -> u64 {
        self.start
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn issued(&self) -> u64 {
        self.issued.get()
    }
}

impl Resource for Producer {
    fn simulation_terminating(&mut self, _sched: &mut Scheduler) {
        debug!(issued = self.issued.get(), count = self.count, "producer done");
    }
}

pub struct ProducerFactory;

impl ResourceFactory for ProducerFactory {
    fn name(&self) -> &str {
        PRODUCER
    }

    fn declare_params(&self, params: &mut ParameterSet) {
        params
            .param("count", 8u32, "Number of values to send")
            .param("start", 0u64, "Cycle of the first send");
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        let count: u32 = ctx.param("count")?;
        let start: u64 = ctx.param("start")?;
        let out = ctx.out_port::<u32>("data_out", OutPortSpec::default())?;
        let issued = ctx.counter("issued", "Values sent downstream")?;

        let me: Rc<Cell<Option<EventId>>> = Rc::default();
        let next = Rc::new(Cell::new(0u32));
        let issue = {
            let (me, issued) = (me.clone(), issued.clone());
            ctx.event("issue", SchedulingPhase::Tick, move |sched| {
                let value = next.get();
                if value >= count {
                    return Ok(());
                }
                out.send(sched, value, 1)?;
                issued.increment();
                next.set(value + 1);
                if value + 1 < count {
                    if let Some(id) = me.get() {
                        sched.schedule(id, 1)?;
                    }
                }
                Ok(())
            })?
        };
        me.set(Some(issue));
        out.register_producing_event(ctx.scheduler(), issue)?;
        Ok(Box::new(Producer {
            issue,
            start,
            count,
            issued,
        }))
    }
}

pub struct Alu {
    latency: u32,
    operand: u32,
    ops: Counter,
    rate: Statistic,
    result: NotificationSource<u32>,
}

impl Alu {
    pub fn latency(&self) -> u32 {
        self.latency
    }

    pub fn operand(&self) -> u32 {
        self.operand
    }

    pub fn ops(&self) -> u64 {
        self.ops.get()
    }

    pub fn ops_per_cycle(&self, tick: Tick) -> f64 {
        self.rate.value(tick)
    }

    pub fn result_source(&self) -> NotificationSource<u32> {
        self.result
    }
}

impl Resource for Alu {
    /// Binds the upstream producer and the downstream consumer of this core.
    fn on_bind_tree_early(&mut self, ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
        ctx.bind("..producer.ports.data_out", "ports.data_in")?;
        ctx.bind("ports.data_out", "..consumer.ports.data_in")?;
        Ok(())
    }
}

pub struct AluFactory;

impl ResourceFactory for AluFactory {
    fn name(&self) -> &str {
        ALU
    }

    fn declare_params(&self, params: &mut ParameterSet) {
        params.param("latency", 1u32, "Cycles from operand arrival to result");
        params.add(
            ParameterDef::new("operand", 1u32, "Constant added to every value").validate(|v| match v {
                ParamValue::UInt(n) if *n > 1_000_000 => Err(format!("operand {n} is out of range")),
                _ => Ok(()),
            }),
        );
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        let latency: u32 = ctx.param("latency")?;
        let operand: u32 = ctx.param("operand")?;
        let ops = ctx.counter("ops", "Operations executed")?;
        let rate = ctx.statistic("ops_per_cycle", "Average throughput", "stats.ops / (tick + 1)")?;
        let result = ctx.source::<u32>("result", "alu", "Every computed result")?;
        let out: OutPort<u32> = ctx.out_port(
            "data_out",
            OutPortSpec {
                presume_zero_delay: latency == 0,
            },
        )?;
        let input = {
            let ops = ops.clone();
            ctx.in_port::<u32, _>("data_in", InPortSpec::default(), move |sched, value| {
                let sum = value
                    .checked_add(operand)
                    .ok_or_else(|| anyhow::anyhow!("overflow adding {operand} to {value}"))?;
                ops.increment();
                result.post(sched, &sum)?;
                out.send(sched, sum, u64::from(latency))?;
                Ok(())
            })?
        };
        if let Some(delivery) = input.delivery_event(ctx.scheduler()) {
            out.register_producing_event(ctx.scheduler(), delivery)?;
        }
        Ok(Box::new(Alu {
            latency,
            operand,
            ops,
            rate,
            result,
        }))
    }
}

pub struct Consumer {
    received: Rc<RefCell<Vec<(Tick, u32)>>>,
    retired: Counter,
    observed: Counter,
    drained_at: Rc<Cell<Option<Tick>>>,
}

impl Consumer {
    /// Every `(tick, value)` delivered, in arrival order.
    pub fn received(&self) -> Vec<(Tick, u32)> {
        self.received.borrow().clone()
    }

    pub fn retired(&self) -> &Counter {
        &self.retired
    }

    pub fn observed(&self) -> u64 {
        self.observed.get()
    }

    /// Tick at which the drain trigger saw every value retired.
    pub fn drained_at(&self) -> Option<Tick> {
        self.drained_at.get()
    }
}

impl Resource for Consumer {
    fn on_bind_tree_late(&mut self, ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
        let observed = self.observed.clone();
        ctx.observe::<u32, _>("..", "result", move |_sched, _value| {
            observed.increment();
            Ok(())
        })?;
        Ok(())
    }

    fn validate_post_run(&self, _tree: &Tree, _sched: &Scheduler) -> anyhow::Result<()> {
        let received = self.received.borrow();
        if received.windows(2).any(|w| w[0].0 > w[1].0) {
            anyhow::bail!("deliveries arrived out of tick order");
        }
        if self.retired.get() != received.len() as u64 {
            anyhow::bail!("retired counter disagrees with {} deliveries", received.len());
        }
        Ok(())
    }
}

pub struct ConsumerFactory;

impl ResourceFactory for ConsumerFactory {
    fn name(&self) -> &str {
        CONSUMER
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
        let received: Rc<RefCell<Vec<(Tick, u32)>>> = Rc::default();
        let retired = ctx.counter("retired", "Values received")?;
        let observed = ctx.counter("observed", "ALU results observed by notification")?;
        {
            let (received, retired) = (received.clone(), retired.clone());
            ctx.in_port::<u32, _>("data_in", InPortSpec::default(), move |sched, value| {
                received.borrow_mut().push((sched.current_tick(), value));
                retired.increment();
                Ok(())
            })?;
        }
        Ok(Box::new(Consumer {
            received,
            retired,
            observed,
            drained_at: Rc::default(),
        }))
    }
}

/// Makes the three pipeline factories available to `sim`.
pub fn register_factories(sim: &mut Simulation) -> SimResult<()> {
    sim.register_factory(Rc::new(ProducerFactory))?;
    sim.register_factory(Rc::new(AluFactory))?;
    sim.register_factory(Rc::new(ConsumerFactory))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreNodes {
    pub core: NodeId,
    pub producer: NodeId,
    pub alu: NodeId,
    pub consumer: NodeId,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub cores: Vec<CoreNodes>,
}

/// Builds `cores` pipelines under the model root.
pub fn build_pipeline(sim: &mut Simulation, cores: u32) -> SimResult<Pipeline> {
    let top = sim.top();
    let mut out = Vec::new();
    for index in 0..cores {
        let name = format!("core{index}");
        let core = sim.tree_mut().create_node(
            top,
            NodeSpec::new(&name).group("core", index).tag("core").desc("Pipeline core"),
        )?;
        let stage = |name: &str, desc: &str| NodeSpec::new(name).tag(STAGE_TAG).desc(desc);
        out.push(CoreNodes {
            core,
            producer: sim.add_resource(core, stage("producer", "Value source"), PRODUCER)?,
            alu: sim.add_resource(core, stage("alu", "Adder"), ALU)?,
            consumer: sim.add_resource(core, stage("consumer", "Value sink"), CONSUMER)?,
        });
    }
    info!(cores, "pipeline built");
    Ok(Pipeline { cores: out })
}

/// Stops the run once every core has drained.
struct Drain {
    drained_at: Rc<Cell<Option<Tick>>>,
    remaining: Rc<Cell<usize>>,
}

impl Triggerable for Drain {
    fn go(&mut self, sched: &mut Scheduler) -> anyhow::Result<()> {
        self.drained_at.set(Some(sched.current_tick()));
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            info!(tick = sched.current_tick(), "all cores drained");
            sched.stop();
        }
        Ok(())
    }

    fn stop(&mut self, _sched: &mut Scheduler) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Pipeline {
    /// Schedules each producer's first send at its `start` cycle and arms
    /// one drain trigger per core. The scheduler must be finalized.
    ///
    /// Drain triggers poll with non-continuing events, so they only end a
    /// run that is exacting.
    pub fn arm(&self, sim: &mut Simulation) -> SimResult<Vec<Trigger>> {
        let remaining = Rc::new(Cell::new(self.cores.len()));
        let mut triggers = Vec::new();
        for nodes in &self.cores {
            let core_name = sim.tree().node(nodes.core)?.name().to_string();
            let clock: Option<ClockId> = sim.tree().effective_clock(nodes.producer);
            let (issue, start, count) = {
                let producer = sim
                    .resource::<Producer>(nodes.producer)
                    .ok_or_else(|| missing(sim, nodes.producer))?;
                (producer.issue_event(), producer.start_cycle(), producer.count())
            };
            let (retired, drained_at) = {
                let consumer = sim
                    .resource::<Consumer>(nodes.consumer)
                    .ok_or_else(|| missing(sim, nodes.consumer))?;
                (consumer.retired().clone(), consumer.drained_at.clone())
            };

            sim.scheduler_mut().schedule(issue, start)?;

            let drain = Trigger::new(&format!("{core_name}_drain"), clock);
            drain.set_start(TriggerPoint::Counter {
                counter: retired,
                threshold: u64::from(count),
            })?;
            drain.add_target(Rc::new(RefCell::new(Drain {
                drained_at,
                remaining: remaining.clone(),
            })));
            drain.arm(sim.scheduler_mut())?;
            triggers.push(drain);
        }
        Ok(triggers)
    }

    pub fn consumer<'a>(&self, sim: &'a Simulation, core: usize) -> Option<&'a Consumer> {
        sim.resource::<Consumer>(self.cores.get(core)?.consumer)
    }

    pub fn alu<'a>(&self, sim: &'a Simulation, core: usize) -> Option<&'a Alu> {
        sim.resource::<Alu>(self.cores.get(core)?.alu)
    }

    pub fn producer<'a>(&self, sim: &'a Simulation, core: usize) -> Option<&'a Producer> {
        sim.resource::<Producer>(self.cores.get(core)?.producer)
    }
}

fn missing(sim: &Simulation, node: NodeId) -> SimError {
    SimError::NotFound {
        origin: sim.tree().location(node),
        path: "<resource>".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalized(cores: u32) -> (Simulation, Pipeline) {
        let mut sim = Simulation::new("top").unwrap();
        register_factories(&mut sim).unwrap();
        let pipeline = build_pipeline(&mut sim, cores).unwrap();
        sim.enter_configuring().unwrap();
        sim.enter_finalized().unwrap();
        sim.finalize_scheduler().unwrap();
        (sim, pipeline)
    }

    #[test]
    fn values_flow_through_the_alu() {
        let (mut sim, pipeline) = finalized(1);
        pipeline.arm(&mut sim).unwrap();
        let summary = sim.run(100).unwrap();
        let consumer = pipeline.consumer(&sim, 0).unwrap();
        let expected: Vec<(Tick, u32)> = (0..8).map(|v| (u64::from(v) + 2, v + 1)).collect();
        assert_eq!(consumer.received(), expected);
        assert_eq!(consumer.observed(), 8);
        assert_eq!(pipeline.alu(&sim, 0).unwrap().ops(), 8);
        assert_eq!(pipeline.producer(&sim, 0).unwrap().issued(), 8);
        assert_eq!(summary.end_tick, 9);
        sim.validate_post_run().unwrap();
    }

    #[test]
    fn exacting_runs_stop_when_drained() {
        let (mut sim, pipeline) = finalized(2);
        pipeline.arm(&mut sim).unwrap();
        let summary = sim.run_with(1_000, true).unwrap();
        assert_eq!(summary.reason, crate::sched::StopReason::Stopped);
        assert_eq!(summary.end_tick, 10);
        assert_eq!(pipeline.consumer(&sim, 1).unwrap().drained_at(), Some(10));
    }

    #[test]
    fn stages_are_tagged() {
        let (sim, _pipeline) = finalized(2);
        let found = sim.tree().find_children_by_tag(sim.top(), STAGE_TAG, None);
        assert_eq!(found.len(), 6);
        let alus = sim.tree().find_children(sim.top(), "core*.alu", None).unwrap();
        assert_eq!(alus.len(), 2);
    }
}
