//! What a factory and a resource can reach while being built and bound.

use crate::common::{ClockId, EventId, NodeId, PortId, SchedulingPhase};
use crate::error::{SimError, SimResult};
use crate::notify::{
    create_mirror, create_source, register_for_notification, MirrorSource, NotificationSource, Subscription,
};
use crate::params::ParamConvert;
use crate::ports::{bind_ports, create_in_port, create_out_port, InPort, InPortSpec, OutPort, OutPortSpec};
use crate::sched::{EventSpec, Scheduler};
use crate::stats::{Counter, Statistic};
use crate::tree::{NodeKind, NodeSpec, Tree, PARAMS};

/// Construction context handed to [`ResourceFactory::create_resource`].
///
/// [`ResourceFactory::create_resource`]: super::ResourceFactory::create_resource
pub struct ResourceContext<'a> {
    tree: &'a mut Tree,
    sched: &'a mut Scheduler,
    node: NodeId,
}

impl<'a> ResourceContext<'a> {
    pub(crate) fn new(tree: &'a mut Tree, sched: &'a mut Scheduler, node: NodeId) -> Self {
        Self { tree, sched, node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn location(&self) -> String {
        self.tree.location(self.node)
    }

    pub fn tree(&self) -> &Tree {
        &*self.tree
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut *self.sched
    }

    /// Clock inherited by the resource node.
    pub fn clock(&self) -> Option<ClockId> {
        self.tree.effective_clock(self.node)
    }

    /// Reads the parameter `name` from this node's `params`.
    pub fn param<T: ParamConvert>(&self, name: &str) -> SimResult<T> {
        let missing = || SimError::NotFound {
            origin: self.location(),
            path: format!("{PARAMS}.{name}"),
        };
        let params = self.tree.child_named(self.node, PARAMS).ok_or_else(missing)?;
        let id = self.tree.child_named(params, name).ok_or_else(missing)?;
        self.tree.parameter(id)?.get::<T>()
    }

    /// An event labelled after this node, on this node's clock.
    pub fn event_spec(&self, name: &str, phase: SchedulingPhase) -> EventSpec {
        let spec = EventSpec::new(format!("{}.{name}", self.location()), phase);
        match self.clock() {
            Some(clock) => spec.clock(clock),
            None => spec,
        }
    }

    pub fn event<F>(&mut self, name: &str, phase: SchedulingPhase, handler: F) -> SimResult<EventId>
    where
        F: FnMut(&mut Scheduler) -> anyhow::Result<()> + 'static,
    {
        let spec = self.event_spec(name, phase);
        self.sched.register(spec, handler)
    }

    pub fn payload_event<T, F>(&mut self, spec: EventSpec, handler: F) -> SimResult<EventId>
    where
        T: 'static,
        F: FnMut(&mut Scheduler, T) -> anyhow::Result<()> + 'static,
    {
        self.sched.register_payload(spec, handler)
    }

    pub fn out_port<T: 'static>(&mut self, name: &str, spec: OutPortSpec) -> SimResult<OutPort<T>> {
        create_out_port(self.tree, self.sched, self.node, name, spec)
    }

    pub fn in_port<T, F>(&mut self, name: &str, spec: InPortSpec, handler: F) -> SimResult<InPort<T>>
    where
        T: 'static,
        F: FnMut(&mut Scheduler, T) -> anyhow::Result<()> + 'static,
    {
        create_in_port(self.tree, self.sched, self.node, name, spec, handler)
    }

    pub fn counter(&mut self, name: &str, desc: &str) -> SimResult<Counter> {
        self.tree.add_counter(self.node, name, desc)
    }

    /// Adds a statistic computed from `expression`, whose paths are relative
    /// to this node.
    pub fn statistic(&mut self, name: &str, desc: &str, expression: &str) -> SimResult<Statistic> {
        let expr = self.tree.compile_expression(self.node, expression)?;
        let statistic = Statistic::new(expr);
        self.tree.add_statistic(self.node, name, desc, statistic.clone())?;
        Ok(statistic)
    }

    pub fn source<T: 'static>(
        &mut self,
        name: &str,
        category: &str,
        desc: &str,
    ) -> SimResult<NotificationSource<T>> {
        create_source(self.tree, self.sched, self.node, name, category, desc)
    }

    pub fn mirror<T: 'static>(&mut self, name: &str, category: &str, desc: &str) -> SimResult<MirrorSource<T>> {
        create_mirror(self.tree, self.sched, self.node, name, category, desc)
    }

    /// Adds a plain child node for grouping.
    pub fn child(&mut self, spec: NodeSpec) -> SimResult<NodeId> {
        self.tree.create_framework_child(self.node, spec, NodeKind::Generic)
    }

    /// Adds a child resource built right after this one.
    pub fn dynamic_child(&mut self, spec: NodeSpec, factory: &str) -> SimResult<NodeId> {
        self.tree.create_dynamic_resource_node(self.node, spec, factory)
    }
}

/// Context of the bind hooks: the finished tree plus the scheduler.
pub struct BindContext<'a> {
    tree: &'a Tree,
    sched: &'a mut Scheduler,
    node: NodeId,
}

impl<'a> BindContext<'a> {
    pub(crate) fn new(tree: &'a Tree, sched: &'a mut Scheduler, node: NodeId) -> Self {
        Self { tree, sched, node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn tree(&self) -> &Tree {
        &*self.tree
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut *self.sched
    }

    /// Resolves a port by path relative to this node, e.g. `..alu.ports.data_in`.
    pub fn port(&self, path: &str) -> SimResult<PortId> {
        let id = self.tree.get_child(self.node, path)?;
        match self.tree.node(id)?.kind() {
            NodeKind::Port(port) => Ok(*port),
            other => Err(SimError::TypeMismatch {
                location: self.tree.location(id),
                expected: "port".into(),
                found: other.label().into(),
            }),
        }
    }

    /// Binds two ports given by relative paths.
    pub fn bind(&mut self, out: &str, input: &str) -> SimResult<()> {
        let (out, input) = (self.port(out)?, self.port(input)?);
        bind_ports(self.sched, out, input)
    }

    pub fn precedes(&mut self, before: EventId, after: EventId) -> SimResult<()> {
        self.sched.precedes(before, after)
    }

    /// Subscribes `handler` to the sources named `name` below the node at
    /// the relative path `from`.
    pub fn observe<T, F>(&mut self, from: &str, name: &str, handler: F) -> SimResult<Vec<Subscription>>
    where
        T: 'static,
        F: FnMut(&mut Scheduler, &T) -> anyhow::Result<()> + 'static,
    {
        let ancestor = self.tree.get_child(self.node, from)?;
        register_for_notification(self.tree, self.sched, ancestor, name, handler)
    }
}
