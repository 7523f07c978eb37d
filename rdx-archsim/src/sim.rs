//! The driver surface: one model tree, its scheduler and its resources.
//!
//! A [`Simulation`] owns everything a model needs and walks it through the
//! lifecycle in a fixed order:
//!
//! 1. build the tree (`tree_mut`, `add_resource`, `create_clock`),
//! 2. [`enter_configuring`](Simulation::enter_configuring),
//! 3. [`enter_finalized`](Simulation::enter_finalized), which constructs and binds every resource,
//! 4. [`finalize_scheduler`](Simulation::finalize_scheduler),
//! 5. [`run`](Simulation::run) as often as needed,
//! 6. [`enter_teardown`](Simulation::enter_teardown).
//!
//! Calling a step out of order fails with a phase error. Dropping a
//! simulation that was never torn down runs the teardown callbacks anyway.

use crate::common::{ClockId, NodeId, Tick, TreePhase};
use crate::config::{ConfigFile, Policy, SimConfig};
use crate::error::{SimError, SimResult};
use crate::events::{SystemEvent, SYSTEM_CHANNEL_CAPACITY};
use crate::params::ParameterSet;
use crate::resource::{BindContext, FactoryRegistry, Resource, ResourceContext, ResourceFactory};
use crate::sched::{RunSummary, Scheduler};
use crate::tree::{ContainerState, NodeKind, NodeSpec, Tree};
use crate::vpt::VirtualParameterTree;
use std::collections::HashSet;
use std::rc::Rc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Name of the root that mirrors the clock tree.
pub const CLOCKS_ROOT: &str = "clocks";
/// Name of the clock every model runs on unless told otherwise.
pub const ROOT_CLOCK: &str = "root";

struct Built {
    node: NodeId,
    resource: Box<dyn Resource>,
}

#[derive(Clone, Copy)]
enum BindStage {
    Early,
    Late,
}

pub struct Simulation {
    tree: Tree,
    sched: Scheduler,
    vpt: VirtualParameterTree,
    factories: FactoryRegistry,
    resources: Vec<Built>,
    /// Resource nodes whose factory already ran `on_building`.
    expanded: HashSet<NodeId>,
    top: NodeId,
    clocks_root: NodeId,
    root_clock: ClockId,
    config: SimConfig,
    system_tx: broadcast::Sender<SystemEvent>,
    ran: bool,
    torn_down: bool,
}

impl Simulation {
    /// Creates a simulation whose model root is named `top`.
    pub fn new(top: &str) -> SimResult<Self> {
        Self::with_config(top, SimConfig::default())
    }

    pub fn with_config(top: &str, config: SimConfig) -> SimResult<Self> {
        let mut tree = Tree::new();
        let top = tree.add_root(top, "Model root")?;
        let clocks_root = tree.add_root(CLOCKS_ROOT, "Clock tree")?;
        let mut sched = Scheduler::new();
        if let Some(timeout) = config.timeout {
            sched.sleeper().apply(timeout);
        }
        let root_clock = sched.clocks_mut().create_root(ROOT_CLOCK)?;
        let clock_node = tree.create_child(
            clocks_root,
            NodeSpec::new(ROOT_CLOCK).desc("Root clock, one cycle per tick"),
            NodeKind::Clock(root_clock),
        )?;
        sched.clocks_mut().set_node(root_clock, clock_node);
        tree.set_clock(top, root_clock)?;
        let (system_tx, _) = broadcast::channel(SYSTEM_CHANNEL_CAPACITY);
        Ok(Self {
            tree,
            sched,
            vpt: VirtualParameterTree::new(),
            factories: FactoryRegistry::new(),
            resources: Vec::new(),
            expanded: HashSet::new(),
            top,
            clocks_root,
            root_clock,
            config,
            system_tx,
            ran: false,
            torn_down: false,
        })
    }

    pub fn top(&self) -> NodeId {
        self.top
    }

    pub fn clocks_root(&self) -> NodeId {
        self.clocks_root
    }

    pub fn root_clock(&self) -> ClockId {
        self.root_clock
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.sched
    }

    pub fn vpt(&self) -> &VirtualParameterTree {
        &self.vpt
    }

    pub fn vpt_mut(&mut self) -> &mut VirtualParameterTree {
        &mut self.vpt
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn phase(&self) -> TreePhase {
        self.tree.phase(self.top)
    }

    pub fn has_run(&self) -> bool {
        self.ran
    }

    /// Borrow both the tree and the scheduler, e.g. to create ports on
    /// plain nodes.
    pub fn parts_mut(&mut self) -> (&mut Tree, &mut Scheduler) {
        (&mut self.tree, &mut self.sched)
    }

    pub fn subscribe_system_events(&self) -> broadcast::Receiver<SystemEvent> {
        self.system_tx.subscribe()
    }

    fn emit(&self, event: SystemEvent) {
        self.system_tx.send(event).ok();
    }

    pub fn register_factory(&mut self, factory: Rc<dyn ResourceFactory>) -> SimResult<()> {
        self.factories.register(factory)
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    /// Adds a node whose resource is built by `factory` when the tree finalizes.
    pub fn add_resource(&mut self, parent: NodeId, spec: NodeSpec, factory: &str) -> SimResult<NodeId> {
        self.tree.create_resource_node(parent, spec, factory)
    }

    /// Adds a clock running at `num / den` of `parent`, mirrored as a node
    /// below the parent's clock node.
    pub fn create_clock(&mut self, name: &str, parent: ClockId, num: u64, den: u64) -> SimResult<ClockId> {
        let phase = self.tree.phase(self.clocks_root);
        if !phase.allows_structure() {
            return Err(SimError::phase(
                format!("{CLOCKS_ROOT}.{name}"),
                phase,
                "clocks are added while building or configuring",
            ));
        }
        let parent_node = self.sched.clocks().get(parent)?.node().unwrap_or(self.clocks_root);
        let id = self.sched.clocks_mut().create(name, parent, num, den)?;
        let desc = format!("Clock at {num}/{den} of its parent");
        let node = self
            .tree
            .create_child(parent_node, NodeSpec::new(name).desc(&desc), NodeKind::Clock(id))?;
        self.sched.clocks_mut().set_node(id, node);
        debug!(clock = name, num, den, "clock created");
        Ok(id)
    }

    /// Loads run settings and overlay entries. Only legal before finalize.
    pub fn apply_config(&mut self, file: &ConfigFile) -> SimResult<usize> {
        let phase = self.phase();
        if phase > TreePhase::Configuring {
            return Err(SimError::phase(
                self.tree.location(self.top),
                phase,
                "configuration must be applied before finalize",
            ));
        }
        if let Some(timeout) = file.settings.timeout {
            self.sched.sleeper().apply(timeout);
        }
        self.config = file.settings.clone();
        let applied = file.apply_to(&mut self.vpt);
        info!(entries = applied, "configuration applied");
        Ok(applied)
    }

    fn expect_phase(&self, expected: TreePhase, what: &str) -> SimResult<()> {
        let current = self.phase();
        if self.torn_down || current != expected {
            return Err(SimError::phase(
                self.tree.location(self.top),
                current,
                format!("{what} requires phase {expected}"),
            ));
        }
        Ok(())
    }

    fn advance(&mut self, phase: TreePhase) -> SimResult<()> {
        self.tree.advance_phase(self.top, phase)?;
        self.tree.advance_phase(self.clocks_root, phase)?;
        info!(%phase, "model entered phase");
        self.emit(SystemEvent::phase_entered(phase));
        Ok(())
    }

    pub fn enter_configuring(&mut self) -> SimResult<()> {
        self.expect_phase(TreePhase::Building, "enter_configuring")?;
        self.advance(TreePhase::Configuring)?;
        self.sched.open_binding();
        Ok(())
    }

    /// Applies the overlay, builds every resource in pre-order, runs the
    /// bind hooks and freezes the tree.
    pub fn enter_finalized(&mut self) -> SimResult<()> {
        self.expect_phase(TreePhase::Configuring, "enter_finalized")?;
        self.expand_subtree(self.top)?;
        self.advance(TreePhase::Finalizing)?;

        let existing = self.tree.parameters(self.top);
        self.tree.apply_overlay(&self.vpt, &existing)?;
        self.build_subtree(self.top)?;
        self.check_overlay_consumed()?;
        self.bind_from(0, BindStage::Early)?;
        self.bind_from(0, BindStage::Late)?;

        self.advance(TreePhase::Finalized)?;
        self.lock_from(0)?;
        self.tree.freeze_clocks(self.top);
        self.check_unread(self.top)
    }

    /// Adds a resource node that may live below an already finalized parent.
    /// Build it with [`finalize_dynamic`](Self::finalize_dynamic).
    pub fn add_dynamic_resource(&mut self, parent: NodeId, spec: NodeSpec, factory: &str) -> SimResult<NodeId> {
        if self.torn_down {
            return Err(SimError::phase(self.tree.location(parent), TreePhase::Teardown, "simulation is torn down"));
        }
        self.tree.create_dynamic_resource_node(parent, spec, factory)
    }

    /// Runs a dynamic resource node through its whole lifecycle at once.
    pub fn finalize_dynamic(&mut self, node: NodeId) -> SimResult<()> {
        let vacant = matches!(
            self.tree.node(node)?.kind(),
            NodeKind::DynamicResource(slot) if slot.container == ContainerState::Vacant
        );
        let phase = self.tree.phase(node);
        if !vacant || phase != TreePhase::Building || self.torn_down {
            return Err(SimError::phase(
                self.tree.location(node),
                phase,
                "only an unbuilt dynamic resource node can be finalized on its own",
            ));
        }
        self.tree.advance_phase(node, TreePhase::Configuring)?;
        self.expand_subtree(node)?;
        self.tree.advance_phase(node, TreePhase::Finalizing)?;
        let first = self.resources.len();
        self.build_subtree(node)?;
        self.bind_from(first, BindStage::Early)?;
        self.bind_from(first, BindStage::Late)?;
        self.tree.advance_phase(node, TreePhase::Finalized)?;
        self.lock_from(first)?;
        self.tree.freeze_clocks(node);
        self.check_unread(node)
    }

    /// Runs the factories' `on_building` hooks below `root` in pre-order,
    /// while children may still be added. Children a hook adds are expanded
    /// in turn.
    fn expand_subtree(&mut self, root: NodeId) -> SimResult<()> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            self.expand_resource(id)?;
            let children = self.tree.node(id)?.children().to_vec();
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    fn expand_resource(&mut self, id: NodeId) -> SimResult<()> {
        let factory_name = match self.tree.node(id)?.kind().resource_slot() {
            Some(slot) if slot.container == ContainerState::Vacant => slot.factory.clone(),
            _ => return Ok(()),
        };
        if !self.expanded.insert(id) {
            return Ok(());
        }
        let factory = self.factories.get(&factory_name)?;
        factory.on_building(&mut self.tree, id)?;
        debug!(location = %self.tree.location(id), "resource expanded");
        Ok(())
    }

    /// Constructs every unbuilt resource below `root`, parents first.
    /// Children added while a resource is built are visited afterwards.
    fn build_subtree(&mut self, root: NodeId) -> SimResult<()> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            self.build_resource(id)?;
            let children = self.tree.node(id)?.children().to_vec();
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    fn build_resource(&mut self, id: NodeId) -> SimResult<()> {
        let factory_name = match self.tree.node(id)?.kind().resource_slot() {
            Some(slot) if slot.container == ContainerState::Vacant => slot.factory.clone(),
            _ => return Ok(()),
        };
        let factory = self.factories.get(&factory_name)?;
        // dynamic children created by a constructor are still building here
        if self.tree.phase(id) < TreePhase::Finalizing {
            self.expand_resource(id)?;
            self.tree.advance_phase(id, TreePhase::Finalizing)?;
        }

        let mut set = ParameterSet::new();
        factory.declare_params(&mut set);
        let params = self.tree.create_parameters(id, set)?;
        let declared = self.tree.parameters(params);
        self.tree.apply_overlay(&self.vpt, &declared)?;

        let location = self.tree.location(id);
        let tick = self.sched.current_tick();
        let built = {
            let mut ctx = ResourceContext::new(&mut self.tree, &mut self.sched, id);
            factory.create_resource(&mut ctx)
        };
        let resource = built.map_err(|e| SimError::from_callback(e, &location, tick))?;
        self.tree.set_container(id, ContainerState::Assigned(self.resources.len()))?;
        self.resources.push(Built { node: id, resource });
        debug!(%location, factory = %factory_name, "resource constructed");
        self.emit(SystemEvent::ResourceConstructed {
            location,
            factory: factory_name,
        });
        Ok(())
    }

    fn bind_from(&mut self, first: usize, stage: BindStage) -> SimResult<()> {
        let tick = self.sched.current_tick();
        for built in self.resources.iter_mut().skip(first) {
            let mut ctx = BindContext::new(&self.tree, &mut self.sched, built.node);
            let outcome = match stage {
                BindStage::Early => built.resource.on_bind_tree_early(&mut ctx),
                BindStage::Late => built.resource.on_bind_tree_late(&mut ctx),
            };
            outcome.map_err(|e| SimError::from_callback(e, &self.tree.location(built.node), tick))?;
        }
        Ok(())
    }

    fn lock_from(&mut self, first: usize) -> SimResult<()> {
        for (index, built) in self.resources.iter().enumerate().skip(first) {
            self.tree.set_container(built.node, ContainerState::Locked(index))?;
        }
        Ok(())
    }

    /// Fails on required overlay entries nothing consumed; optional ones
    /// follow the configured policy.
    fn check_overlay_consumed(&self) -> SimResult<()> {
        let (mut required, mut optional) = (Vec::new(), Vec::new());
        for id in self.vpt.unread_value_nodes() {
            let path = self.vpt.path_of(id);
            if self.vpt.node(id).is_required() {
                required.push(path);
            } else {
                optional.push(path);
            }
        }
        if !required.is_empty() {
            return Err(SimError::UnmatchedRequired { paths: required });
        }
        if optional.is_empty() {
            return Ok(());
        }
        match self.config.optional_unmatched {
            Policy::Error => Err(SimError::UnmatchedRequired { paths: optional }),
            Policy::Warn => {
                let message = format!("optional entries matched no parameter: {}", optional.join(", "));
                warn!("{message}");
                self.emit(SystemEvent::Warning { message });
                Ok(())
            }
            Policy::Ignore => Ok(()),
        }
    }

    fn check_unread(&self, root: NodeId) -> SimResult<()> {
        let unread = self.tree.unread_parameters(root);
        if unread.is_empty() {
            return Ok(());
        }
        match self.config.unread_parameters {
            Policy::Error => Err(SimError::UnreadParameter { locations: unread }),
            Policy::Warn => {
                let message = format!("parameters set but never read: {}", unread.join(", "));
                warn!("{message}");
                self.emit(SystemEvent::Warning { message });
                Ok(())
            }
            Policy::Ignore => Ok(()),
        }
    }

    /// Checks mirrors and freezes the scheduler DAG.
    pub fn finalize_scheduler(&mut self) -> SimResult<()> {
        self.expect_phase(TreePhase::Finalized, "finalize_scheduler")?;
        self.sched.notifications.validate_mirrors()?;
        self.sched.finalize()?;
        self.emit(SystemEvent::SchedulerFinalized {
            events: self.sched.event_count(),
        });
        Ok(())
    }

    /// Runs for at most `ticks` ticks using the configured `exacting` flag.
    pub fn run(&mut self, ticks: u64) -> SimResult<RunSummary> {
        let exacting = self.config.run.exacting;
        self.run_with(ticks, exacting)
    }

    /// Runs for the configured number of ticks.
    pub fn run_configured(&mut self) -> SimResult<RunSummary> {
        let run = self.config.run;
        self.run_with(run.ticks, run.exacting)
    }

    pub fn run_with(&mut self, ticks: u64, exacting: bool) -> SimResult<RunSummary> {
        self.expect_phase(TreePhase::Finalized, "run")?;
        self.ran = true;
        let start: Tick = self.sched.current_tick();
        info!(start, ticks, exacting, "run starting");
        self.emit(SystemEvent::run_started(start));
        let summary = self.sched.run(ticks, exacting)?;
        info!(%summary, "run finished");
        self.emit(SystemEvent::run_finished(summary));
        Ok(summary)
    }

    /// Lets every resource check its end-of-run invariants.
    pub fn validate_post_run(&self) -> SimResult<()> {
        for built in &self.resources {
            built
                .resource
                .validate_post_run(&self.tree, &self.sched)
                .map_err(|e| SimError::from_callback(e, &self.tree.location(built.node), self.sched.current_tick()))?;
        }
        Ok(())
    }

    /// Notifies resources, drops pending work and moves the tree to teardown.
    /// Legal from any phase, but only once.
    pub fn enter_teardown(&mut self) -> SimResult<()> {
        if self.torn_down {
            return Err(SimError::phase(
                self.tree.location(self.top),
                TreePhase::Teardown,
                "teardown was already entered",
            ));
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        self.torn_down = true;
        info!(resources = self.resources.len(), "teardown starting");
        self.emit(SystemEvent::TeardownStarted);
        if self.ran {
            for built in self.resources.iter_mut() {
                built.resource.simulation_terminating(&mut self.sched);
            }
        }
        for built in self.resources.iter_mut().rev() {
            built.resource.on_starting_teardown();
        }
        self.sched.teardown();
        for root in [self.top, self.clocks_root] {
            if self.tree.phase(root) < TreePhase::Teardown {
                if let Err(err) = self.tree.advance_phase(root, TreePhase::Teardown) {
                    warn!(%err, "could not move tree to teardown");
                }
            }
        }
        for built in self.resources.drain(..).rev() {
            if let Err(err) = self.tree.set_container(built.node, ContainerState::Released) {
                warn!(%err, "resource container vanished before release");
            }
        }
        self.emit(SystemEvent::phase_entered(TreePhase::Teardown));
    }

    /// Destroys the model subtree. Only legal after teardown.
    pub fn destroy_model(&mut self) -> SimResult<usize> {
        self.tree.remove_subtree(self.top)
    }

    /// The resource of `node`, if it was built and is of type `R`.
    pub fn resource<R: Resource>(&self, node: NodeId) -> Option<&R> {
        let index = self.container_index(node)?;
        let built = self.resources.get(index)?;
        (*built.resource).as_any().downcast_ref::<R>()
    }

    pub fn resource_mut<R: Resource>(&mut self, node: NodeId) -> Option<&mut R> {
        let index = self.container_index(node)?;
        let built = self.resources.get_mut(index)?;
        (*built.resource).as_any_mut().downcast_mut::<R>()
    }

    fn container_index(&self, node: NodeId) -> Option<usize> {
        self.tree.node(node).ok()?.kind().resource_slot()?.container.index()
    }

    /// Current value of every counter and statistic below `root`.
    pub fn statistics(&self, root: NodeId) -> Vec<(String, f64)> {
        let tick = self.sched.current_tick();
        self.tree
            .preorder(root)
            .into_iter()
            .filter_map(|id| {
                let value = match self.tree.node(id).ok()?.kind() {
                    NodeKind::Counter(counter) => counter.get() as f64,
                    NodeKind::Statistic(stat) => stat.value(tick),
                    _ => return None,
                };
                Some((self.tree.location(id), value))
            })
            .collect()
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if !self.torn_down {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::params::ParameterDef;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Journal(RefCell<Vec<String>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.borrow_mut().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.borrow().clone()
        }
    }

    struct Leaf {
        name: String,
        journal: Rc<Journal>,
        width: u32,
    }

    impl Resource for Leaf {
        fn on_bind_tree_early(&mut self, _ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
            self.journal.push(format!("early {}", self.name));
            Ok(())
        }

        fn on_bind_tree_late(&mut self, _ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
            self.journal.push(format!("late {}", self.name));
            Ok(())
        }

        fn simulation_terminating(&mut self, _sched: &mut Scheduler) {
            self.journal.push(format!("terminating {}", self.name));
        }

        fn on_starting_teardown(&mut self) {
            self.journal.push(format!("teardown {}", self.name));
        }
    }

    struct LeafFactory {
        journal: Rc<Journal>,
        spawn: bool,
    }

    impl ResourceFactory for LeafFactory {
        fn name(&self) -> &str {
            if self.spawn {
                "spawner"
            } else {
                "leaf"
            }
        }

        fn declare_params(&self, params: &mut ParameterSet) {
            params.param("width", 4u32, "datapath width");
        }

        fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
            let name = ctx.location();
            self.journal.push(format!("build {name}"));
            if self.spawn {
                ctx.dynamic_child(NodeSpec::new("helper"), "leaf")?;
            }
            Ok(Box::new(Leaf {
                name,
                journal: self.journal.clone(),
                width: ctx.param("width")?,
            }))
        }
    }

    fn sim_with(journal: &Rc<Journal>) -> Simulation {
        let mut sim = Simulation::new("top").unwrap();
        for spawn in [false, true] {
            sim.register_factory(Rc::new(LeafFactory {
                journal: journal.clone(),
                spawn,
            }))
            .unwrap();
        }
        sim
    }

    #[test]
    fn lifecycle_builds_parents_first_and_tears_down_in_reverse() {
        let journal = Rc::new(Journal::default());
        let mut sim = sim_with(&journal);
        let top = sim.top();
        let a = sim.add_resource(top, NodeSpec::new("a"), "spawner").unwrap();
        sim.add_resource(a, NodeSpec::new("b"), "leaf").unwrap();
        sim.enter_configuring().unwrap();
        sim.enter_finalized().unwrap();
        sim.finalize_scheduler().unwrap();
        sim.run(5).unwrap();
        sim.enter_teardown().unwrap();
        assert_eq!(
            journal.entries(),
            vec![
                "build top.a",
                "build top.a.b",
                "build top.a.helper",
                "early top.a",
                "early top.a.b",
                "early top.a.helper",
                "late top.a",
                "late top.a.b",
                "late top.a.helper",
                "terminating top.a",
                "terminating top.a.b",
                "terminating top.a.helper",
                "teardown top.a.helper",
                "teardown top.a.b",
                "teardown top.a",
            ]
        );
    }

    #[test]
    fn out_of_order_calls_are_phase_errors() {
        let journal = Rc::new(Journal::default());
        let mut sim = sim_with(&journal);
        assert_eq!(sim.enter_finalized().unwrap_err().kind(), ErrorKind::Phase);
        assert_eq!(sim.finalize_scheduler().unwrap_err().kind(), ErrorKind::Phase);
        assert_eq!(sim.run(1).unwrap_err().kind(), ErrorKind::Phase);
        sim.enter_configuring().unwrap();
        assert_eq!(sim.enter_configuring().unwrap_err().kind(), ErrorKind::Phase);
        sim.enter_teardown().unwrap();
        assert_eq!(sim.enter_teardown().unwrap_err().kind(), ErrorKind::Phase);
    }

    #[test]
    fn overlay_reaches_resources_and_terminating_needs_a_run() {
        let journal = Rc::new(Journal::default());
        let mut sim = sim_with(&journal);
        let top = sim.top();
        let a = sim.add_resource(top, NodeSpec::new("a"), "leaf").unwrap();
        sim.vpt_mut().set("top.a.params.width", "16", true, "test");
        sim.enter_configuring().unwrap();
        sim.enter_finalized().unwrap();
        assert_eq!(sim.resource::<Leaf>(a).unwrap().width, 16);
        drop(sim);
        assert_eq!(journal.entries(), vec!["build top.a", "early top.a", "late top.a", "teardown top.a"]);
    }

    #[test]
    fn unmatched_required_entries_fail_finalize() {
        let journal = Rc::new(Journal::default());
        let mut sim = sim_with(&journal);
        let top = sim.top();
        sim.add_resource(top, NodeSpec::new("a"), "leaf").unwrap();
        sim.vpt_mut().set("top.a.params.depth", "3", true, "test");
        sim.vpt_mut().set("top.a.params.colour", "red", false, "test");
        sim.enter_configuring().unwrap();
        match sim.enter_finalized().unwrap_err() {
            SimError::UnmatchedRequired { paths } => assert_eq!(paths, vec!["top.a.params.depth"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_factories_are_reported() {
        let mut sim = Simulation::new("top").unwrap();
        let top = sim.top();
        sim.add_resource(top, NodeSpec::new("a"), "missing").unwrap();
        sim.enter_configuring().unwrap();
        assert_eq!(sim.enter_finalized().unwrap_err().kind(), ErrorKind::NotFound);
    }

    struct ParentFactory {
        journal: Rc<Journal>,
    }

    impl ResourceFactory for ParentFactory {
        fn name(&self) -> &str {
            "parent"
        }

        fn on_building(&self, tree: &mut Tree, node: NodeId) -> SimResult<()> {
            tree.create_resource_node(node, NodeSpec::new("child"), "leaf")?;
            Ok(())
        }

        fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
            let name = ctx.location();
            self.journal.push(format!("build {name}"));
            Ok(Box::new(Leaf {
                name,
                journal: self.journal.clone(),
                width: 0,
            }))
        }
    }

    #[test]
    fn building_hooks_add_children_that_are_built_and_bound() {
        let journal = Rc::new(Journal::default());
        let mut sim = sim_with(&journal);
        sim.register_factory(Rc::new(ParentFactory { journal: journal.clone() }))
            .unwrap();
        let top = sim.top();
        sim.add_resource(top, NodeSpec::new("p"), "parent").unwrap();
        sim.enter_configuring().unwrap();
        sim.enter_finalized().unwrap();

        let child = sim.tree().lookup("top.p.child").unwrap();
        assert_eq!(sim.tree().phase(child), TreePhase::Finalized);
        assert_eq!(sim.resource::<Leaf>(child).unwrap().width, 4);
        assert_eq!(
            journal.entries(),
            vec![
                "build top.p",
                "build top.p.child",
                "early top.p",
                "early top.p.child",
                "late top.p",
                "late top.p.child",
            ]
        );
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Depth {
        Untouched,
        Ignored,
        Volatile,
    }

    struct Inert;

    impl Resource for Inert {}

    /// Declares `depth` and never reads it.
    struct DepthFactory(Depth);

    impl ResourceFactory for DepthFactory {
        fn name(&self) -> &str {
            "depth"
        }

        fn declare_params(&self, params: &mut ParameterSet) {
            let def = ParameterDef::new("depth", 8u32, "queue depth");
            params.add(if self.0 == Depth::Volatile { def.volatile() } else { def });
        }

        fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>> {
            if self.0 == Depth::Ignored {
                let id = ctx.tree().get_child(ctx.node(), "params.depth")?;
                ctx.tree().parameter(id)?.ignore();
            }
            Ok(Box::new(Inert))
        }
    }

    fn finalize_with_depth(mode: Depth, policy: Policy) -> SimResult<()> {
        let config = SimConfig {
            unread_parameters: policy,
            ..SimConfig::default()
        };
        let mut sim = Simulation::with_config("top", config)?;
        sim.register_factory(Rc::new(DepthFactory(mode)))?;
        let top = sim.top();
        sim.add_resource(top, NodeSpec::new("q"), "depth")?;
        sim.vpt_mut().set("top.q.params.depth", "16", true, "test");
        sim.enter_configuring()?;
        sim.enter_finalized()
    }

    #[test]
    fn user_set_parameters_nobody_reads_fail_finalize() {
        let err = finalize_with_depth(Depth::Untouched, Policy::Error).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnreadParameter);
        match err {
            SimError::UnreadParameter { locations } => assert_eq!(locations, vec!["top.q.params.depth"]),
            other => panic!("unexpected {other:?}"),
        }
        finalize_with_depth(Depth::Untouched, Policy::Warn).unwrap();
        finalize_with_depth(Depth::Ignored, Policy::Error).unwrap();
        finalize_with_depth(Depth::Volatile, Policy::Error).unwrap();
    }

    #[test]
    fn clocks_are_mirrored_as_nodes() {
        let mut sim = Simulation::new("top").unwrap();
        let root = sim.root_clock();
        let core = sim.create_clock("core", root, 1, 2).unwrap();
        sim.create_clock("bus", core, 1, 2).unwrap();
        let bus = sim.tree().lookup("clocks.root.core.bus").unwrap();
        assert!(matches!(sim.tree().node(bus).unwrap().kind(), NodeKind::Clock(_)));
        assert_eq!(sim.scheduler().clocks().get(core).unwrap().ticks_for_cycles(3), 6);
    }

    #[test]
    fn dynamic_resources_build_after_finalize() {
        let journal = Rc::new(Journal::default());
        let mut sim = sim_with(&journal);
        let top = sim.top();
        sim.enter_configuring().unwrap();
        sim.enter_finalized().unwrap();
        let late = sim.add_dynamic_resource(top, NodeSpec::new("late"), "leaf").unwrap();
        sim.finalize_dynamic(late).unwrap();
        assert_eq!(sim.tree().phase(late), TreePhase::Finalized);
        assert_eq!(sim.resource::<Leaf>(late).unwrap().width, 4);
        assert_eq!(sim.finalize_dynamic(late).unwrap_err().kind(), ErrorKind::Phase);
    }

    #[test]
    fn system_events_follow_the_lifecycle() {
        let mut sim = Simulation::new("top").unwrap();
        let mut rx = sim.subscribe_system_events();
        sim.enter_configuring().unwrap();
        sim.enter_finalized().unwrap();
        sim.finalize_scheduler().unwrap();
        sim.run(3).unwrap();
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(match event {
                SystemEvent::PhaseEntered { phase, .. } => format!("phase {phase}"),
                SystemEvent::SchedulerFinalized { .. } => "scheduler".to_string(),
                SystemEvent::RunStarted { .. } => "start".to_string(),
                SystemEvent::RunFinished { .. } => "finish".to_string(),
                other => format!("{other:?}"),
            });
        }
        assert_eq!(
            seen,
            vec![
                format!("phase {}", TreePhase::Configuring),
                format!("phase {}", TreePhase::Finalizing),
                format!("phase {}", TreePhase::Finalized),
                "scheduler".to_string(),
                "start".to_string(),
                "finish".to_string(),
            ]
        );
    }
}
