//! Typed data and signal ports routed through the scheduler.
//!
//! An [`OutPort`] is bound to one or more [`InPort`]s. Sending on an out-port
//! queues one delivery per bound in-port on that in-port's delivery event,
//! `send delay + in-port delay` cycles later, in the in-port's receive phase.
//! Port handles are small `Copy` keys; the port state lives in the
//! scheduler's [`PortFabric`].

use crate::common::{Cycle, EventId, NodeId, PortId, SchedulingPhase, TreePhase};
use crate::error::{SimError, SimResult};
use crate::sched::{EventSpec, Payload, Scheduler};
use crate::tree::{NodeKind, NodeSpec, Tree, PORTS};
use slotmap::SlotMap;
use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PortSlot {
    location: String,
    node: Option<NodeId>,
    direction: Direction,
    type_id: TypeId,
    type_name: &'static str,
    presume_zero_delay: bool,
    delay: Cycle,
    bound: Vec<PortId>,
    delivery: Option<EventId>,
    producers: Vec<EventId>,
    consumers: Vec<EventId>,
    precedes: Vec<PortId>,
    feeds: Vec<PortId>,
    pending: usize,
}

/// Read-only description of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub location: String,
    pub node: Option<NodeId>,
    pub direction: Direction,
    pub type_name: &'static str,
    pub delay: Cycle,
    pub bound_to: Vec<PortId>,
    pub pending: usize,
}

#[derive(Debug, Default)]
pub struct PortFabric {
    ports: SlotMap<PortId, PortSlot>,
}

impl PortFabric {
    fn slot(&self, id: PortId) -> SimResult<&PortSlot> {
        self.ports.get(id).ok_or_else(|| SimError::NotFound {
            origin: "<ports>".into(),
            path: format!("{id:?}"),
        })
    }

    fn slot_mut(&mut self, id: PortId) -> SimResult<&mut PortSlot> {
        self.ports.get_mut(id).ok_or_else(|| SimError::NotFound {
            origin: "<ports>".into(),
            path: format!("{id:?}"),
        })
    }

    pub fn info(&self, id: PortId) -> SimResult<PortInfo> {
        let slot = self.slot(id)?;
        Ok(PortInfo {
            location: slot.location.clone(),
            node: slot.node,
            direction: slot.direction,
            type_name: slot.type_name,
            delay: slot.delay,
            bound_to: slot.bound.clone(),
            pending: slot.pending,
        })
    }

    pub fn location(&self, id: PortId) -> &str {
        self.ports.get(id).map(|p| p.location.as_str()).unwrap_or("<unknown port>")
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub(crate) fn note_pending(&mut self, id: PortId, delta: isize) {
        if let Some(slot) = self.ports.get_mut(id) {
            slot.pending = slot.pending.saturating_add_signed(delta);
        }
    }

    /// Ordering constraints implied by bindings and port registrations.
    pub(crate) fn constraint_edges(&self) -> Vec<(EventId, EventId)> {
        let mut edges = Vec::new();
        for (_, slot) in self.ports.iter() {
            match slot.direction {
                Direction::In => {
                    let Some(delivery) = slot.delivery else {
                        continue;
                    };
                    edges.extend(slot.consumers.iter().map(|c| (delivery, *c)));
                    for other in &slot.precedes {
                        if let Some(target) = self.ports.get(*other).and_then(|p| p.delivery) {
                            edges.push((delivery, target));
                        }
                    }
                    for out in &slot.feeds {
                        if let Some(out) = self.ports.get(*out) {
                            edges.extend(out.producers.iter().map(|p| (delivery, *p)));
                        }
                    }
                }
                Direction::Out if slot.presume_zero_delay => {
                    for input in &slot.bound {
                        if let Some(delivery) = self.ports.get(*input).and_then(|p| p.delivery) {
                            edges.extend(slot.producers.iter().map(|p| (*p, delivery)));
                        }
                    }
                }
                Direction::Out => {}
            }
        }
        edges
    }
}

/// Options for a new out-port.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutPortSpec {
    /// Zero-delay sends are expected; producers are ordered before the
    /// consumers of every bound in-port.
    pub presume_zero_delay: bool,
}

/// Options for a new in-port.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPortSpec {
    /// Receive phase. Defaults to PORT_UPDATE for data and TICK for signals.
    pub phase: Option<SchedulingPhase>,
    /// Extra cycles added to every delivery.
    pub delay: Cycle,
}

impl InPortSpec {
    pub fn phase(mut self, phase: SchedulingPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn delay(mut self, delay: Cycle) -> Self {
        self.delay = delay;
        self
    }
}

/// Producing side of a port. Signals are `OutPort<()>`.
pub struct OutPort<T> {
    id: PortId,
    _marker: PhantomData<fn(T)>,
}

/// Receiving side of a port. Signals are `InPort<()>`.
pub struct InPort<T> {
    id: PortId,
    _marker: PhantomData<fn(T)>,
}

macro_rules! port_handle_impls {
    ($name:ident) => {
        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.id)
            }
        }

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl<T> $name<T> {
            pub fn id(&self) -> PortId {
                self.id
            }
        }
    };
}

port_handle_impls!(OutPort);
port_handle_impls!(InPort);

fn port_node(tree: &mut Tree, owner: NodeId, name: &str, id: PortId) -> SimResult<NodeId> {
    let set = tree.ensure_builtin(owner, PORTS, NodeKind::PortSet, "Ports")?;
    tree.create_framework_child(set, NodeSpec::new(name), NodeKind::Port(id))
}

fn new_slot<T: 'static>(direction: Direction, presume_zero_delay: bool, delay: Cycle) -> PortSlot {
    PortSlot {
        location: String::new(),
        node: None,
        direction,
        type_id: TypeId::of::<T>(),
        type_name: std::any::type_name::<T>(),
        presume_zero_delay,
        delay,
        bound: Vec::new(),
        delivery: None,
        producers: Vec::new(),
        consumers: Vec::new(),
        precedes: Vec::new(),
        feeds: Vec::new(),
        pending: 0,
    }
}

/// Creates an out-port named `name` under `owner`'s `ports` set.
pub fn create_out_port<T: 'static>(
    tree: &mut Tree,
    sched: &mut Scheduler,
    owner: NodeId,
    name: &str,
    spec: OutPortSpec,
) -> SimResult<OutPort<T>> {
    let id = sched
        .ports
        .ports
        .insert(new_slot::<T>(Direction::Out, spec.presume_zero_delay, 0));
    let node = match port_node(tree, owner, name, id) {
        Ok(node) => node,
        Err(err) => {
            sched.ports.ports.remove(id);
            return Err(err);
        }
    };
    let slot = sched.ports.slot_mut(id)?;
    slot.location = tree.location(node);
    slot.node = Some(node);
    Ok(OutPort {
        id,
        _marker: PhantomData,
    })
}

/// Creates an in-port whose deliveries are handed to `handler`.
pub fn create_in_port<T, F>(
    tree: &mut Tree,
    sched: &mut Scheduler,
    owner: NodeId,
    name: &str,
    spec: InPortSpec,
    handler: F,
) -> SimResult<InPort<T>>
where
    T: 'static,
    F: FnMut(&mut Scheduler, T) -> anyhow::Result<()> + 'static,
{
    let default_phase = if TypeId::of::<T>() == TypeId::of::<()>() {
        SchedulingPhase::Tick
    } else {
        SchedulingPhase::PortUpdate
    };
    let phase = spec.phase.unwrap_or(default_phase);
    let id = sched
        .ports
        .ports
        .insert(new_slot::<T>(Direction::In, false, spec.delay));
    let node = match port_node(tree, owner, name, id) {
        Ok(node) => node,
        Err(err) => {
            sched.ports.ports.remove(id);
            return Err(err);
        }
    };
    let location = tree.location(node);
    let mut event = EventSpec::new(format!("{location}.deliver"), phase);
    if let Some(clock) = tree.effective_clock(owner) {
        event = event.clock(clock);
    }
    let delivery = sched.register_payload(event, handler)?;
    let slot = sched.ports.slot_mut(id)?;
    slot.location = location;
    slot.node = Some(node);
    slot.delivery = Some(delivery);
    Ok(InPort {
        id,
        _marker: PhantomData,
    })
}

/// Binds two ports by id, checking direction and payload type.
pub fn bind_ports(sched: &mut Scheduler, out: PortId, input: PortId) -> SimResult<()> {
    let fabric = &sched.ports;
    let (o, i) = (fabric.slot(out)?, fabric.slot(input)?);
    let refuse = |reason: String| SimError::Binding {
        from: o.location.clone(),
        to: i.location.clone(),
        reason,
    };
    if !sched.binding_allowed() {
        let phase = if sched.is_finalized() {
            TreePhase::Finalized
        } else {
            TreePhase::Building
        };
        return Err(SimError::phase(
            format!("{} -> {}", o.location, i.location),
            phase,
            "binding is only allowed from configuration until the scheduler is finalized",
        ));
    }
    if o.direction != Direction::Out || i.direction != Direction::In {
        return Err(refuse(format!(
            "expected out -> in, got {} -> {}",
            o.direction, i.direction
        )));
    }
    if o.type_id != i.type_id {
        return Err(SimError::TypeMismatch {
            location: i.location.clone(),
            expected: o.type_name.into(),
            found: i.type_name.into(),
        });
    }
    if let Some(existing) = i.bound.first() {
        return Err(refuse(format!(
            "in-port is already bound to '{}'",
            fabric.location(*existing)
        )));
    }
    debug!(from = %o.location, to = %i.location, "ports bound");
    sched.ports.slot_mut(out)?.bound.push(input);
    sched.ports.slot_mut(input)?.bound.push(out);
    Ok(())
}

fn queue_deliveries(
    sched: &mut Scheduler,
    out: PortId,
    delay: Cycle,
    mut payload: impl FnMut() -> Payload,
) -> SimResult<()> {
    let slot = sched.ports.slot(out)?;
    if slot.bound.is_empty() {
        return Err(SimError::PortUnbound {
            location: slot.location.clone(),
        });
    }
    let targets: Vec<(PortId, Option<EventId>, Cycle)> = slot
        .bound
        .iter()
        .filter_map(|i| sched.ports.ports.get(*i).map(|s| (*i, s.delivery, s.delay)))
        .collect();
    for (input, delivery, extra) in targets {
        let Some(delivery) = delivery else {
            continue;
        };
        sched.enqueue(delivery, delay + extra, payload(), Some(out), Some(input))?;
    }
    Ok(())
}

impl<T: Clone + 'static> OutPort<T> {
    /// Delivers `value` to every bound in-port after `delay` cycles.
    pub fn send(&self, sched: &mut Scheduler, value: T, delay: Cycle) -> SimResult<()> {
        queue_deliveries(sched, self.id, delay, || Some(Box::new(value.clone())))
    }

    pub fn bind(&self, sched: &mut Scheduler, input: InPort<T>) -> SimResult<()> {
        bind_ports(sched, self.id, input.id)
    }
}

impl OutPort<()> {
    /// Sends a signal.
    pub fn signal(&self, sched: &mut Scheduler, delay: Cycle) -> SimResult<()> {
        self.send(sched, (), delay)
    }
}

impl<T: 'static> OutPort<T> {
    pub fn is_bound(&self, sched: &Scheduler) -> bool {
        sched.ports.slot(self.id).is_ok_and(|s| !s.bound.is_empty())
    }

    /// Declares `event` as a producer of this port for DAG ordering.
    pub fn register_producing_event(&self, sched: &mut Scheduler, event: EventId) -> SimResult<()> {
        ensure_configurable(sched, self.id)?;
        sched.ports.slot_mut(self.id)?.producers.push(event);
        Ok(())
    }

    /// Removes every pending delivery sent through this port.
    pub fn cancel(&self, sched: &mut Scheduler) -> usize {
        let id = self.id;
        sched.cancel_where(|occ| occ.origin == Some(id))
    }

    pub fn cancel_if(&self, sched: &mut Scheduler, value: &T) -> usize
    where
        T: PartialEq,
    {
        self.cancel_if_pred(sched, |v| v == value)
    }

    pub fn cancel_if_pred(&self, sched: &mut Scheduler, pred: impl Fn(&T) -> bool) -> usize {
        let id = self.id;
        sched.cancel_where(|occ| {
            occ.origin == Some(id)
                && occ
                    .payload
                    .as_deref()
                    .and_then(|p| p.downcast_ref::<T>())
                    .is_some_and(&pred)
        })
    }
}

impl<T: 'static> InPort<T> {
    pub fn delivery_event(&self, sched: &Scheduler) -> Option<EventId> {
        sched.ports.slot(self.id).ok().and_then(|s| s.delivery)
    }

    pub fn is_bound(&self, sched: &Scheduler) -> bool {
        sched.ports.slot(self.id).is_ok_and(|s| !s.bound.is_empty())
    }

    /// True while at least one delivery is pending.
    pub fn is_driven(&self, sched: &Scheduler) -> bool {
        sched.ports.slot(self.id).is_ok_and(|s| s.pending > 0)
    }

    /// Deliveries on this port dispatch before those on `other` in a tick.
    pub fn precedes<U: 'static>(&self, sched: &mut Scheduler, other: InPort<U>) -> SimResult<()> {
        ensure_configurable(sched, self.id)?;
        sched.ports.slot_mut(self.id)?.precedes.push(other.id);
        Ok(())
    }

    /// `event` runs after this port's deliveries in the same tick.
    pub fn register_consumer_event(&self, sched: &mut Scheduler, event: EventId) -> SimResult<()> {
        ensure_configurable(sched, self.id)?;
        sched.ports.slot_mut(self.id)?.consumers.push(event);
        Ok(())
    }

    /// Deliveries here run before the producers of `out`.
    pub fn register_producing_port<U: 'static>(&self, sched: &mut Scheduler, out: OutPort<U>) -> SimResult<()> {
        ensure_configurable(sched, self.id)?;
        sched.ports.slot_mut(self.id)?.feeds.push(out.id);
        Ok(())
    }

    /// Removes every pending delivery addressed to this port.
    pub fn cancel(&self, sched: &mut Scheduler) -> usize {
        let id = self.id;
        sched.cancel_where(|occ| occ.target == Some(id))
    }

    pub fn cancel_if(&self, sched: &mut Scheduler, value: &T) -> usize
    where
        T: PartialEq,
    {
        self.cancel_if_pred(sched, |v| v == value)
    }

    pub fn cancel_if_pred(&self, sched: &mut Scheduler, pred: impl Fn(&T) -> bool) -> usize {
        let id = self.id;
        sched.cancel_where(|occ| {
            occ.target == Some(id)
                && occ
                    .payload
                    .as_deref()
                    .and_then(|p| p.downcast_ref::<T>())
                    .is_some_and(&pred)
        })
    }
}

fn ensure_configurable(sched: &Scheduler, id: PortId) -> SimResult<()> {
    if sched.is_finalized() {
        return Err(SimError::phase(
            sched.ports.location(id),
            TreePhase::Finalized,
            "port ordering is frozen once the scheduler is finalized",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Rig {
        tree: Tree,
        sched: Scheduler,
        top: NodeId,
    }

    fn rig() -> Rig {
        let mut tree = Tree::new();
        let top = tree.add_root("top", "").unwrap();
        let mut sched = Scheduler::new();
        sched.open_binding();
        Rig { tree, sched, top }
    }

    #[test]
    fn ports_appear_in_the_tree() {
        let mut r = rig();
        let out: OutPort<u32> =
            create_out_port(&mut r.tree, &mut r.sched, r.top, "data_out", OutPortSpec::default()).unwrap();
        let node = r.tree.lookup("top.ports.data_out").unwrap();
        assert!(matches!(r.tree.node(node).unwrap().kind(), NodeKind::Port(id) if *id == out.id()));
        assert_eq!(r.sched.ports.location(out.id()), "top.ports.data_out");
        let dup = create_out_port::<u32>(&mut r.tree, &mut r.sched, r.top, "data_out", OutPortSpec::default());
        assert_eq!(dup.unwrap_err().kind(), ErrorKind::NameCollision);
        assert_eq!(r.sched.ports.len(), 1);
    }

    #[test]
    fn binding_checks_direction_type_and_fan_in() {
        let mut r = rig();
        let out: OutPort<u32> =
            create_out_port(&mut r.tree, &mut r.sched, r.top, "o", OutPortSpec::default()).unwrap();
        let other: OutPort<u32> =
            create_out_port(&mut r.tree, &mut r.sched, r.top, "o2", OutPortSpec::default()).unwrap();
        let input: InPort<u32> =
            create_in_port(&mut r.tree, &mut r.sched, r.top, "i", InPortSpec::default(), |_, _| Ok(()))
                .unwrap();
        let wrong: InPort<bool> =
            create_in_port(&mut r.tree, &mut r.sched, r.top, "w", InPortSpec::default(), |_, _| Ok(()))
                .unwrap();

        let reversed = bind_ports(&mut r.sched, input.id(), out.id()).unwrap_err();
        assert_eq!(reversed.kind(), ErrorKind::Binding);
        let typed = bind_ports(&mut r.sched, out.id(), wrong.id()).unwrap_err();
        assert_eq!(typed.kind(), ErrorKind::TypeMismatch);

        out.bind(&mut r.sched, input).unwrap();
        assert!(out.is_bound(&r.sched) && input.is_bound(&r.sched));
        let again = other.bind(&mut r.sched, input).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::Binding);

        r.sched.finalize().unwrap();
        let late: InPort<u32> =
            create_in_port(&mut r.tree, &mut r.sched, r.top, "late", InPortSpec::default(), |_, _| Ok(()))
                .unwrap();
        assert_eq!(other.bind(&mut r.sched, late).unwrap_err().kind(), ErrorKind::Phase);
    }

    #[test]
    fn unbound_send_fails() {
        let mut r = rig();
        let out: OutPort<u8> =
            create_out_port(&mut r.tree, &mut r.sched, r.top, "o", OutPortSpec::default()).unwrap();
        r.sched.finalize().unwrap();
        assert_eq!(out.send(&mut r.sched, 1, 0).unwrap_err().kind(), ErrorKind::PortUnbound);
    }

    #[test]
    fn in_port_delay_adds_to_send_delay() {
        let mut r = rig();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let out: OutPort<u32> =
            create_out_port(&mut r.tree, &mut r.sched, r.top, "o", OutPortSpec::default()).unwrap();
        let input: InPort<u32> = create_in_port(
            &mut r.tree,
            &mut r.sched,
            r.top,
            "i",
            InPortSpec::default().delay(2),
            move |s, v| {
                sink.borrow_mut().push((s.current_tick(), v));
                Ok(())
            },
        )
        .unwrap();
        out.bind(&mut r.sched, input).unwrap();
        r.sched.finalize().unwrap();
        out.send(&mut r.sched, 5, 1).unwrap();
        assert!(input.is_driven(&r.sched));
        r.sched.run(10, false).unwrap();
        assert_eq!(*seen.borrow(), vec![(3, 5)]);
        assert!(!input.is_driven(&r.sched));
    }

    #[test]
    fn in_port_cancellation_is_symmetric() {
        let mut r = rig();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let out: OutPort<u32> =
            create_out_port(&mut r.tree, &mut r.sched, r.top, "o", OutPortSpec::default()).unwrap();
        let input: InPort<u32> = create_in_port(
            &mut r.tree,
            &mut r.sched,
            r.top,
            "i",
            InPortSpec::default(),
            move |_, v| {
                sink.borrow_mut().push(v);
                Ok(())
            },
        )
        .unwrap();
        out.bind(&mut r.sched, input).unwrap();
        r.sched.finalize().unwrap();
        for v in 0..6u32 {
            out.send(&mut r.sched, v, 1).unwrap();
        }
        assert_eq!(input.cancel_if_pred(&mut r.sched, |v| v % 2 == 1), 3);
        assert_eq!(input.cancel_if(&mut r.sched, &4), 1);
        r.sched.run(5, false).unwrap();
        assert_eq!(*seen.borrow(), vec![0, 2]);
        out.send(&mut r.sched, 9, 1).unwrap();
        assert_eq!(input.cancel(&mut r.sched), 1);
        assert!(!input.is_driven(&r.sched));
    }

    #[test]
    fn signal_ports_default_to_tick_phase() {
        let mut r = rig();
        let input: InPort<()> =
            create_in_port(&mut r.tree, &mut r.sched, r.top, "sig", InPortSpec::default(), |_, _| Ok(()))
                .unwrap();
        let data: InPort<u64> =
            create_in_port(&mut r.tree, &mut r.sched, r.top, "data", InPortSpec::default(), |_, _| Ok(()))
                .unwrap();
        let sig_ev = input.delivery_event(&r.sched).unwrap();
        let data_ev = data.delivery_event(&r.sched).unwrap();
        assert_eq!(r.sched.event_phase(sig_ev), Some(SchedulingPhase::Tick));
        assert_eq!(r.sched.event_phase(data_ev), Some(SchedulingPhase::PortUpdate));
    }
}
