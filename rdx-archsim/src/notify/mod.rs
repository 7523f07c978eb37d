//! Typed notification sources, mirrors and observation-state callbacks.
//!
//! A [`NotificationSource`] posts values synchronously to every attached
//! observer. Observers attach through [`register_for_notification`], which
//! walks the visible subtree below an ancestor node and subscribes to every
//! source whose name matches. A [`MirrorSource`] publishes nothing itself; it
//! relays what its linked concrete sources post, and only listens to them
//! while it has observers of its own.

use crate::common::{CallbackId, NodeId, ObserverId, SourceId, TreePhase};
use crate::error::{SimError, SimResult};
use crate::pattern::matches;
use crate::sched::{Scheduler, SchedulerState};
use crate::tree::{NodeKind, NodeSpec, Tree};
use slotmap::SlotMap;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use tracing::{debug, trace};

type ObserverFn = Rc<RefCell<dyn FnMut(&mut Scheduler, &dyn Any) -> anyhow::Result<()>>>;
type StateFn = Rc<RefCell<dyn FnMut(&StateChange)>>;
type RelayFilter = Rc<dyn Fn(&dyn Any) -> bool>;

/// Observer membership changes reported to observation-state callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationState {
    /// The first observer is attaching.
    SoleObserverRegistering,
    ObserverRegistering,
    ObserverDeregistering,
    /// The last observer is detaching.
    SoleObserverDeregistering,
}

/// Argument handed to observation-state callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: ObservationState,
    pub source: SourceId,
    pub location: String,
    /// Observer count after the change.
    pub observers: usize,
}

/// One attachment made by [`register_for_notification`] or
/// [`NotificationSource::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub source: SourceId,
    pub observer: ObserverId,
}

struct Link {
    concrete: SourceId,
    filter: Option<RelayFilter>,
}

struct SourceSlot {
    location: String,
    category: String,
    type_id: TypeId,
    type_name: &'static str,
    observers: Vec<ObserverId>,
    /// Mirrors currently listening to this source.
    relays: Vec<(SourceId, Option<RelayFilter>)>,
    /// Present for mirrors only.
    links: Option<Vec<Link>>,
    posted: u64,
}

impl SourceSlot {
    fn observer_count(&self) -> usize {
        self.observers.len() + self.relays.len()
    }

    fn is_mirror(&self) -> bool {
        self.links.is_some()
    }
}

struct ObserverSlot {
    source: SourceId,
    handler: ObserverFn,
}

struct StateSlot {
    source: SourceId,
    callback: StateFn,
}

/// Registry of every notification source. Owned by the [`Scheduler`].
#[derive(Default)]
pub struct NotificationHub {
    sources: SlotMap<SourceId, SourceSlot>,
    observers: SlotMap<ObserverId, ObserverSlot>,
    callbacks: SlotMap<CallbackId, StateSlot>,
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("sources", &self.sources.len())
            .field("observers", &self.observers.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl NotificationHub {
    fn slot(&self, id: SourceId) -> SimResult<&SourceSlot> {
        self.sources.get(id).ok_or_else(|| SimError::NotFound {
            origin: "<notifications>".into(),
            path: format!("{id:?}"),
        })
    }

    fn slot_mut(&mut self, id: SourceId) -> SimResult<&mut SourceSlot> {
        self.sources.get_mut(id).ok_or_else(|| SimError::NotFound {
            origin: "<notifications>".into(),
            path: format!("{id:?}"),
        })
    }

    pub fn location(&self, id: SourceId) -> &str {
        self.sources.get(id).map(|s| s.location.as_str()).unwrap_or("<unknown source>")
    }

    pub fn category(&self, id: SourceId) -> Option<&str> {
        self.sources.get(id).map(|s| s.category.as_str())
    }

    /// Attached observers, counting every listening mirror as one.
    pub fn observer_count(&self, id: SourceId) -> usize {
        self.sources.get(id).map(SourceSlot::observer_count).unwrap_or(0)
    }

    /// Values posted on `id` so far.
    pub fn posted(&self, id: SourceId) -> u64 {
        self.sources.get(id).map(|s| s.posted).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Registers `callback` for membership changes on `source`.
    pub fn add_state_callback(
        &mut self,
        source: SourceId,
        callback: impl FnMut(&StateChange) + 'static,
    ) -> SimResult<CallbackId> {
        self.slot(source)?;
        Ok(self.callbacks.insert(StateSlot {
            source,
            callback: Rc::new(RefCell::new(callback)),
        }))
    }

    /// Disables a callback. Returns `false` if it was already gone.
    pub fn remove_state_callback(&mut self, id: CallbackId) -> bool {
        self.callbacks.remove(id).is_some()
    }

    /// Every mirror must have at least one link before a run starts.
    pub fn validate_mirrors(&self) -> SimResult<()> {
        for (_, slot) in self.sources.iter() {
            if slot.links.as_ref().is_some_and(Vec::is_empty) {
                return Err(SimError::Binding {
                    from: slot.location.clone(),
                    to: "<none>".into(),
                    reason: "mirror notification source has no links".into(),
                });
            }
        }
        Ok(())
    }

    fn insert_source<T: 'static>(&mut self, category: &str, mirror: bool) -> SourceId {
        self.sources.insert(SourceSlot {
            location: String::new(),
            category: category.to_string(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            observers: Vec::new(),
            relays: Vec::new(),
            links: mirror.then(Vec::new),
            posted: 0,
        })
    }

    fn notify(&self, source: SourceId, states: &[ObservationState]) {
        let Some(slot) = self.sources.get(source) else {
            return;
        };
        let callbacks: Vec<StateFn> = self
            .callbacks
            .values()
            .filter(|c| c.source == source)
            .map(|c| c.callback.clone())
            .collect();
        for state in states {
            let change = StateChange {
                state: *state,
                source,
                location: slot.location.clone(),
                observers: slot.observer_count(),
            };
            for cb in &callbacks {
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    (&mut *cb)(&change);
                }
            }
        }
    }

    fn attached(&mut self, source: SourceId) {
        let count = self.observer_count(source);
        if count == 1 {
            self.notify(
                source,
                &[ObservationState::SoleObserverRegistering, ObservationState::ObserverRegistering],
            );
            self.start_relaying(source);
        } else {
            self.notify(source, &[ObservationState::ObserverRegistering]);
        }
    }

    fn detached(&mut self, source: SourceId) {
        let count = self.observer_count(source);
        if count == 0 {
            self.notify(
                source,
                &[ObservationState::ObserverDeregistering, ObservationState::SoleObserverDeregistering],
            );
            self.stop_relaying(source);
        } else {
            self.notify(source, &[ObservationState::ObserverDeregistering]);
        }
    }

    /// A mirror gained its first observer: listen to every linked source.
    fn start_relaying(&mut self, mirror: SourceId) {
        let links: Vec<(SourceId, Option<RelayFilter>)> = match self.sources.get(mirror) {
            Some(SourceSlot { links: Some(links), .. }) => {
                links.iter().map(|l| (l.concrete, l.filter.clone())).collect()
            }
            _ => return,
        };
        for (concrete, filter) in links {
            if let Some(slot) = self.sources.get_mut(concrete) {
                slot.relays.push((mirror, filter));
                self.attached(concrete);
            }
        }
    }

    fn stop_relaying(&mut self, mirror: SourceId) {
        let concretes: Vec<SourceId> = match self.sources.get(mirror) {
            Some(SourceSlot { links: Some(links), .. }) => links.iter().map(|l| l.concrete).collect(),
            _ => return,
        };
        for concrete in concretes {
            if let Some(slot) = self.sources.get_mut(concrete) {
                if let Some(pos) = slot.relays.iter().position(|(m, _)| *m == mirror) {
                    slot.relays.remove(pos);
                    self.detached(concrete);
                }
            }
        }
    }

    fn attach(&mut self, source: SourceId, handler: ObserverFn) -> SimResult<Subscription> {
        self.slot(source)?;
        let observer = self.observers.insert(ObserverSlot { source, handler });
        self.slot_mut(source)?.observers.push(observer);
        trace!(source = %self.location(source), "observer attached");
        self.attached(source);
        Ok(Subscription { source, observer })
    }

    /// Detaches one subscription. Returns `false` if it was already removed.
    pub fn deregister(&mut self, sub: Subscription) -> bool {
        if self.observers.remove(sub.observer).is_none() {
            return false;
        }
        if let Some(slot) = self.sources.get_mut(sub.source) {
            slot.observers.retain(|o| *o != sub.observer);
        }
        self.detached(sub.source);
        true
    }

    fn link(&mut self, mirror: SourceId, concrete: SourceId, filter: Option<RelayFilter>) -> SimResult<()> {
        let m = self.slot(mirror)?;
        let c = self.slot(concrete)?;
        if c.is_mirror() {
            return Err(SimError::Binding {
                from: m.location.clone(),
                to: c.location.clone(),
                reason: "mirrors can only link to concrete sources".into(),
            });
        }
        if m.type_id != c.type_id {
            return Err(SimError::TypeMismatch {
                location: c.location.clone(),
                expected: m.type_name.into(),
                found: c.type_name.into(),
            });
        }
        let active = m.observer_count() > 0;
        debug!(mirror = %m.location, concrete = %c.location, "mirror linked");
        if let Some(links) = self.slot_mut(mirror)?.links.as_mut() {
            links.push(Link {
                concrete,
                filter: filter.clone(),
            });
        }
        if active {
            self.slot_mut(concrete)?.relays.push((mirror, filter));
            self.attached(concrete);
        }
        Ok(())
    }

    /// Observers that should see a value posted on `source`, mirrors included.
    fn audience(&self, source: SourceId, value: &dyn Any) -> Vec<ObserverFn> {
        let Some(slot) = self.sources.get(source) else {
            return Vec::new();
        };
        let mut out: Vec<ObserverFn> = slot
            .observers
            .iter()
            .filter_map(|o| self.observers.get(*o).map(|s| s.handler.clone()))
            .collect();
        for (mirror, filter) in &slot.relays {
            if filter.as_ref().is_some_and(|f| !f(value)) {
                continue;
            }
            if let Some(m) = self.sources.get(*mirror) {
                out.extend(
                    m.observers
                        .iter()
                        .filter_map(|o| self.observers.get(*o).map(|s| s.handler.clone())),
                );
            }
        }
        out
    }
}

/// Concrete publisher of `T` values.
pub struct NotificationSource<T> {
    id: SourceId,
    _marker: PhantomData<fn(T)>,
}

/// Relay that re-publishes the values of its linked sources.
pub struct MirrorSource<T> {
    id: SourceId,
    _marker: PhantomData<fn(T)>,
}

macro_rules! source_handle_impls {
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

        impl<T: 'static> $name<T> {
            pub fn id(&self) -> SourceId {
                self.id
            }

            /// Attaches `handler` directly to this source.
            pub fn observe<F>(&self, sched: &mut Scheduler, handler: F) -> SimResult<Subscription>
            where
                F: FnMut(&mut Scheduler, &T) -> anyhow::Result<()> + 'static,
            {
                sched.notifications.attach(self.id, erase(handler))
            }

            pub fn observer_count(&self, sched: &Scheduler) -> usize {
                sched.notifications.observer_count(self.id)
            }
        }
    };
}

source_handle_impls!(NotificationSource);
source_handle_impls!(MirrorSource);

fn erase<T: 'static, F>(mut handler: F) -> ObserverFn
where
    F: FnMut(&mut Scheduler, &T) -> anyhow::Result<()> + 'static,
{
    Rc::new(RefCell::new(move |sched: &mut Scheduler, value: &dyn Any| {
        match value.downcast_ref::<T>() {
            Some(v) => handler(sched, v),
            None => Ok(()),
        }
    }))
}

impl<T: 'static> NotificationSource<T> {
    /// Delivers `value` to every observer, synchronously and in attachment
    /// order, then to the observers of listening mirrors.
    pub fn post(&self, sched: &mut Scheduler, value: &T) -> SimResult<()> {
        let location = sched.notifications.location(self.id).to_string();
        match sched.state() {
            SchedulerState::Configuring => {
                return Err(SimError::SendAfterFinalize {
                    label: location,
                    reason: "the scheduler has not been finalized".into(),
                })
            }
            SchedulerState::TornDown => {
                return Err(SimError::SendAfterFinalize {
                    label: location,
                    reason: "the scheduler has been torn down".into(),
                })
            }
            _ => {}
        }
        let audience = sched.notifications.audience(self.id, value);
        if let Ok(slot) = sched.notifications.slot_mut(self.id) {
            slot.posted += 1;
        }
        for observer in audience {
            let Ok(mut handler) = observer.try_borrow_mut() else {
                return Err(SimError::FatalRuntime {
                    label: location,
                    tick: sched.current_tick(),
                    source: anyhow::anyhow!("observer posted to a source it is observing"),
                });
            };
            (&mut *handler)(sched, value)
                .map_err(|err| SimError::from_callback(err, &location, sched.current_tick()))?;
        }
        Ok(())
    }
}

impl<T: 'static> MirrorSource<T> {
    /// Relays every value posted on `concrete`.
    pub fn add_link(&self, sched: &mut Scheduler, concrete: NotificationSource<T>) -> SimResult<()> {
        sched.notifications.link(self.id, concrete.id, None)
    }

    /// Relays only values accepted by `filter`.
    pub fn add_filtered_link(
        &self,
        sched: &mut Scheduler,
        concrete: NotificationSource<T>,
        filter: impl Fn(&T) -> bool + 'static,
    ) -> SimResult<()> {
        let filter: RelayFilter = Rc::new(move |v: &dyn Any| v.downcast_ref::<T>().is_some_and(&filter));
        sched.notifications.link(self.id, concrete.id, Some(filter))
    }

    /// Links to a source found by id, checking the payload type.
    pub fn add_link_by_id(&self, sched: &mut Scheduler, concrete: SourceId) -> SimResult<()> {
        sched.notifications.link(self.id, concrete, None)
    }

    pub fn link_count(&self, sched: &Scheduler) -> usize {
        sched
            .notifications
            .sources
            .get(self.id)
            .and_then(|s| s.links.as_ref())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn source_node<T: 'static>(
    tree: &mut Tree,
    sched: &mut Scheduler,
    owner: NodeId,
    name: &str,
    category: &str,
    desc: &str,
    mirror: bool,
) -> SimResult<SourceId> {
    let id = sched.notifications.insert_source::<T>(category, mirror);
    let spec = NodeSpec::new(name).desc(desc);
    let node = match tree.create_framework_child(owner, spec, NodeKind::NotificationSource(id)) {
        Ok(node) => node,
        Err(err) => {
            sched.notifications.sources.remove(id);
            return Err(err);
        }
    };
    sched.notifications.slot_mut(id)?.location = tree.location(node);
    Ok(id)
}

/// Creates a notification source node named `name` under `owner`.
pub fn create_source<T: 'static>(
    tree: &mut Tree,
    sched: &mut Scheduler,
    owner: NodeId,
    name: &str,
    category: &str,
    desc: &str,
) -> SimResult<NotificationSource<T>> {
    let id = source_node::<T>(tree, sched, owner, name, category, desc, false)?;
    Ok(NotificationSource {
        id,
        _marker: PhantomData,
    })
}

/// Creates a mirror node named `name` under `owner`.
pub fn create_mirror<T: 'static>(
    tree: &mut Tree,
    sched: &mut Scheduler,
    owner: NodeId,
    name: &str,
    category: &str,
    desc: &str,
) -> SimResult<MirrorSource<T>> {
    let id = source_node::<T>(tree, sched, owner, name, category, desc, true)?;
    Ok(MirrorSource {
        id,
        _marker: PhantomData,
    })
}

/// Subscribes `handler` to every visible source below `ancestor` whose name
/// matches `name` (wildcards allowed) and whose payload is `T`.
///
/// Sources inside a finalized private subtree that does not contain
/// `ancestor` are never reached. A matching source with another payload type
/// is a [`SimError::TypeMismatch`].
pub fn register_for_notification<T, F>(
    tree: &Tree,
    sched: &mut Scheduler,
    ancestor: NodeId,
    name: &str,
    handler: F,
) -> SimResult<Vec<Subscription>>
where
    T: 'static,
    F: FnMut(&mut Scheduler, &T) -> anyhow::Result<()> + 'static,
{
    if tree.phase(ancestor) >= TreePhase::Teardown {
        return Err(SimError::phase(
            tree.location(ancestor),
            TreePhase::Teardown,
            "cannot observe during teardown",
        ));
    }
    let mut targets = Vec::new();
    for id in tree.visible_preorder(ancestor) {
        let node = tree.node(id)?;
        let NodeKind::NotificationSource(source) = node.kind() else {
            continue;
        };
        if !matches(name, node.name()) {
            continue;
        }
        let slot = sched.notifications.slot(*source)?;
        if slot.type_id != TypeId::of::<T>() {
            return Err(SimError::TypeMismatch {
                location: slot.location.clone(),
                expected: std::any::type_name::<T>().into(),
                found: slot.type_name.into(),
            });
        }
        targets.push(*source);
    }
    let handler = erase(handler);
    let mut subs = Vec::with_capacity(targets.len());
    for source in targets {
        subs.push(sched.notifications.attach(source, handler.clone())?);
    }
    debug!(from = %tree.location(ancestor), name, count = subs.len(), "registered for notification");
    Ok(subs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Rig {
        tree: Tree,
        sched: Scheduler,
        top: NodeId,
    }

    fn rig() -> Rig {
        let mut tree = Tree::new();
        let top = tree.add_root("top", "").unwrap();
        Rig {
            tree,
            sched: Scheduler::new(),
            top,
        }
    }

    fn recorder<T: Clone + 'static>(
        log: &Rc<RefCell<Vec<T>>>,
    ) -> impl FnMut(&mut Scheduler, &T) -> anyhow::Result<()> {
        let log = log.clone();
        move |_, v| {
            log.borrow_mut().push(v.clone());
            Ok(())
        }
    }

    #[test]
    fn posts_reach_every_observer_once_finalized() {
        let mut r = rig();
        let src: NotificationSource<u32> =
            create_source(&mut r.tree, &mut r.sched, r.top, "retired", "core", "").unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        src.observe(&mut r.sched, recorder(&log)).unwrap();
        src.observe(&mut r.sched, recorder(&log)).unwrap();
        assert_eq!(src.post(&mut r.sched, &1).unwrap_err().kind(), ErrorKind::SendAfterFinalize);
        r.sched.finalize().unwrap();
        src.post(&mut r.sched, &7).unwrap();
        assert_eq!(*log.borrow(), vec![7, 7]);
        assert_eq!(r.sched.notifications.posted(src.id()), 1);
    }

    #[test]
    fn observation_state_reports_sole_transitions() {
        let mut r = rig();
        let src: NotificationSource<u8> =
            create_source(&mut r.tree, &mut r.sched, r.top, "s", "", "").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let cb = r
            .sched
            .notifications
            .add_state_callback(src.id(), move |c| sink.borrow_mut().push((c.state, c.observers)))
            .unwrap();
        let a = src.observe(&mut r.sched, |_, _| Ok(())).unwrap();
        let b = src.observe(&mut r.sched, |_, _| Ok(())).unwrap();
        assert!(r.sched.notifications.deregister(b));
        assert!(r.sched.notifications.deregister(a));
        assert!(!r.sched.notifications.deregister(a));
        use ObservationState::*;
        assert_eq!(
            *seen.borrow(),
            vec![
                (SoleObserverRegistering, 1),
                (ObserverRegistering, 1),
                (ObserverRegistering, 2),
                (ObserverDeregistering, 1),
                (ObserverDeregistering, 0),
                (SoleObserverDeregistering, 0),
            ]
        );
        assert!(r.sched.notifications.remove_state_callback(cb));
        src.observe(&mut r.sched, |_, _| Ok(())).unwrap();
        assert_eq!(seen.borrow().len(), 6);
    }

    #[test]
    fn registration_walks_the_subtree_and_respects_privacy() {
        let mut r = rig();
        let open = r.tree.create_node(r.top, NodeSpec::new("open")).unwrap();
        let hidden = r.tree.create_node(r.top, NodeSpec::new("sealed").private()).unwrap();
        let a: NotificationSource<u32> =
            create_source(&mut r.tree, &mut r.sched, open, "event", "", "").unwrap();
        let b: NotificationSource<u32> =
            create_source(&mut r.tree, &mut r.sched, hidden, "event", "", "").unwrap();
        r.tree.advance_phase(r.top, TreePhase::Configuring).unwrap();
        r.tree.advance_phase(r.top, TreePhase::Finalizing).unwrap();
        r.tree.advance_phase(r.top, TreePhase::Finalized).unwrap();
        r.sched.finalize().unwrap();

        let log = Rc::new(RefCell::new(Vec::<u32>::new()));
        let subs = register_for_notification(&r.tree, &mut r.sched, r.top, "event", recorder(&log)).unwrap();
        assert_eq!(subs.len(), 1);
        a.post(&mut r.sched, &1).unwrap();
        b.post(&mut r.sched, &2).unwrap();
        assert_eq!(*log.borrow(), vec![1]);

        let inner = register_for_notification(&r.tree, &mut r.sched, hidden, "ev*", recorder(&log)).unwrap();
        assert_eq!(inner.len(), 1);
        b.post(&mut r.sched, &3).unwrap();
        assert_eq!(*log.borrow(), vec![1, 3]);

        let wrong = register_for_notification(&r.tree, &mut r.sched, open, "event", |_, _: &bool| Ok(()));
        assert_eq!(wrong.unwrap_err().kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn mirrors_relay_only_while_observed() {
        let mut r = rig();
        let c0: NotificationSource<u32> =
            create_source(&mut r.tree, &mut r.sched, r.top, "c0", "", "").unwrap();
        let c1: NotificationSource<u32> =
            create_source(&mut r.tree, &mut r.sched, r.top, "c1", "", "").unwrap();
        let odd: NotificationSource<bool> =
            create_source(&mut r.tree, &mut r.sched, r.top, "flag", "", "").unwrap();
        let mirror: MirrorSource<u32> =
            create_mirror(&mut r.tree, &mut r.sched, r.top, "all", "", "").unwrap();
        assert_eq!(r.sched.notifications.validate_mirrors().unwrap_err().kind(), ErrorKind::Binding);

        mirror.add_link(&mut r.sched, c0).unwrap();
        mirror
            .add_filtered_link(&mut r.sched, c1, |v| *v >= 10)
            .unwrap();
        let mismatch = mirror.add_link_by_id(&mut r.sched, odd.id()).unwrap_err();
        assert_eq!(mismatch.kind(), ErrorKind::TypeMismatch);
        r.sched.notifications.validate_mirrors().unwrap();
        assert_eq!(mirror.link_count(&r.sched), 2);
        assert_eq!(c0.observer_count(&r.sched), 0);

        let log = Rc::new(RefCell::new(Vec::new()));
        let sub = mirror.observe(&mut r.sched, recorder(&log)).unwrap();
        assert_eq!(c0.observer_count(&r.sched), 1);
        r.sched.finalize().unwrap();
        c0.post(&mut r.sched, &1).unwrap();
        c1.post(&mut r.sched, &2).unwrap();
        c1.post(&mut r.sched, &12).unwrap();
        assert_eq!(*log.borrow(), vec![1, 12]);

        r.sched.notifications.deregister(sub);
        assert_eq!(c0.observer_count(&r.sched), 0);
        c0.post(&mut r.sched, &5).unwrap();
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn observer_errors_propagate_with_the_source_location() {
        let mut r = rig();
        let src: NotificationSource<u32> =
            create_source(&mut r.tree, &mut r.sched, r.top, "s", "", "").unwrap();
        src.observe(&mut r.sched, |_, _| anyhow::bail!("observer failed")).unwrap();
        r.sched.finalize().unwrap();
        match src.post(&mut r.sched, &1).unwrap_err() {
            SimError::FatalRuntime { label, .. } => assert_eq!(label, "top.s"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
