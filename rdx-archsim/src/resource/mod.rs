//! User behavior attached to tree nodes.
//!
//! A [`ResourceFactory`] is registered by name in a [`FactoryRegistry`]. Each
//! resource node names its factory; when the tree finalizes the factory
//! declares parameters, may grow the subtree, and finally constructs the
//! [`Resource`] through a [`ResourceContext`].

mod context;

pub use context::{BindContext, ResourceContext};

use crate::common::NodeId;
use crate::error::{SimError, SimResult};
use crate::params::ParameterSet;
use crate::sched::Scheduler;
use crate::tree::Tree;
use std::any::Any;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Upcast helper so resources can be downcast to their concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behavior owned by one resource node. Every hook has an empty default.
pub trait Resource: AsAny {
    /// Runs after every resource is constructed. Ports may still be bound.
    fn on_bind_tree_early(&mut self, _ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after every early bind hook.
    fn on_bind_tree_late(&mut self, _ctx: &mut BindContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once at teardown if the simulation ran.
    fn simulation_terminating(&mut self, _sched: &mut Scheduler) {}

    fn validate_post_run(&self, _tree: &Tree, _sched: &Scheduler) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called in reverse construction order when teardown starts.
    fn on_starting_teardown(&mut self) {}
}

pub trait ResourceFactory {
    /// Registry key referenced by resource nodes.
    fn name(&self) -> &str;

    /// Declares the parameters instantiated under the node's `params`.
    fn declare_params(&self, _params: &mut ParameterSet) {}

    /// Runs once per node, parents first, while the tree is still
    /// configuring (or, for a dynamic node, still building). Child resource
    /// nodes added here with [`Tree::create_resource_node`] are expanded and
    /// built like any other.
    fn on_building(&self, _tree: &mut Tree, _node: NodeId) -> SimResult<()> {
        Ok(())
    }

    fn create_resource(&self, ctx: &mut ResourceContext<'_>) -> anyhow::Result<Box<dyn Resource>>;
}

/// Factories keyed by name.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: BTreeMap<String, Rc<dyn ResourceFactory>>,
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Rc<dyn ResourceFactory>) -> SimResult<()> {
        let name = factory.name().to_string();
        if self.factories.contains_key(&name) {
            return Err(SimError::NameCollision {
                parent: "<factories>".into(),
                name,
                reason: "is already registered".into(),
            });
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> SimResult<Rc<dyn ResourceFactory>> {
        self.factories.get(name).cloned().ok_or_else(|| SimError::NotFound {
            origin: "<factories>".into(),
            path: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
