//! The hierarchical component tree.
//!
//! Nodes live in a [`SlotMap`] arena and reference each other by [`NodeId`];
//! parents own their children through the `children` list and children point
//! back through a plain `parent` id, so there are no reference cycles. A tree
//! may hold several roots (the model root `top` and the `clocks` root).

mod node;
mod render;
mod search;

pub use node::{ContainerState, Node, NodeKind, NodeSpec, ResourceSlot};
pub use render::RenderOptions;

use crate::common::{ClockId, NodeId, TreePhase};
use crate::error::{SimError, SimResult};
use crate::params::{Parameter, ParameterSet};
use crate::pattern::{validate_group, validate_name};
use crate::stats::{Counter, Expression, Statistic, Variable};
use crate::vpt::VirtualParameterTree;
use slotmap::SlotMap;
use tracing::{debug, trace};

/// Name of the built-in parameter set child.
pub const PARAMS: &str = "params";
/// Name of the built-in port set child.
pub const PORTS: &str = "ports";
/// Name of the built-in statistics child.
pub const STATS: &str = "stats";

#[derive(Debug, Default)]
pub struct Tree {
    nodes: SlotMap<NodeId, Node>,
    roots: Vec<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new root node.
    pub fn add_root(&mut self, name: &str, desc: &str) -> SimResult<NodeId> {
        validate_name(name).map_err(|e| SimError::InvalidPath {
            path: name.to_string(),
            reason: format!("root name {e}"),
        })?;
        if self.roots.iter().any(|r| self.nodes[*r].name == name) {
            return Err(SimError::NameCollision {
                parent: "<roots>".into(),
                name: name.to_string(),
                reason: "already names a root".into(),
            });
        }
        let node = Node::new(NodeSpec::new(name).desc(desc), NodeKind::Root, TreePhase::Building);
        let id = self.nodes.insert(node);
        self.roots.push(id);
        Ok(id)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: NodeId) -> SimResult<&Node> {
        self.nodes.get(id).ok_or_else(|| SimError::NotFound {
            origin: "<tree>".into(),
            path: format!("{id:?}"),
        })
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> SimResult<&mut Node> {
        self.nodes.get_mut(id).ok_or_else(|| SimError::NotFound {
            origin: "<tree>".into(),
            path: format!("{id:?}"),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dotted path from the owning root to `id`.
    pub fn location(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.nodes.get(current) {
                Some(node) => {
                    parts.push(node.name.as_str());
                    cursor = node.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        parts.join(".")
    }

    pub fn phase(&self, id: NodeId) -> TreePhase {
        self.nodes
            .get(id)
            .map(|n| n.phase)
            .unwrap_or(TreePhase::Teardown)
    }

    /// True if `id` is `ancestor` or lies below it.
    pub fn is_in_subtree(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.nodes.get(current).and_then(|n| n.parent);
        }
        false
    }

    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.nodes.get(current).and_then(|n| n.parent) {
            current = parent;
        }
        current
    }

    /// Creates a generic child node.
    pub fn create_node(&mut self, parent: NodeId, spec: NodeSpec) -> SimResult<NodeId> {
        self.create_child(parent, spec, NodeKind::Generic)
    }

    /// Creates a node that belongs to no parent yet. See [`attach`](Self::attach).
    pub fn create_orphan(&mut self, spec: NodeSpec) -> SimResult<NodeId> {
        self.validate_spec(&spec)?;
        Ok(self
            .nodes
            .insert(Node::new(spec, NodeKind::Generic, TreePhase::Building)))
    }

    /// Attaches a detached node (and its subtree) under `parent`.
    pub fn attach(&mut self, parent: NodeId, orphan: NodeId) -> SimResult<()> {
        if self.node(orphan)?.parent.is_some() || self.roots.contains(&orphan) {
            return Err(SimError::phase(
                self.location(orphan),
                self.phase(orphan),
                "node is already attached",
            ));
        }
        let parent_phase = self.check_structural(parent)?;
        self.check_collisions(parent, orphan)?;
        self.node_mut(orphan)?.parent = Some(parent);
        self.node_mut(parent)?.children.push(orphan);
        for id in self.preorder(orphan) {
            self.nodes[id].phase = parent_phase;
        }
        Ok(())
    }

    pub(crate) fn create_child(
        &mut self,
        parent: NodeId,
        spec: NodeSpec,
        kind: NodeKind,
    ) -> SimResult<NodeId> {
        let phase = self.check_structural(parent)?;
        self.insert_child(parent, spec, kind, phase)
    }

    /// Creates a node whose resource is built by the factory named `factory`
    /// when the tree finalizes.
    pub fn create_resource_node(&mut self, parent: NodeId, spec: NodeSpec, factory: &str) -> SimResult<NodeId> {
        self.create_child(parent, spec, NodeKind::Resource(ResourceSlot::new(factory)))
    }

    /// Creates a resource node that runs its own lifecycle, even below an
    /// already finalized parent.
    pub(crate) fn create_dynamic_resource_node(
        &mut self,
        parent: NodeId,
        spec: NodeSpec,
        factory: &str,
    ) -> SimResult<NodeId> {
        let phase = self.phase(parent);
        if phase >= TreePhase::Teardown {
            return Err(SimError::phase(self.location(parent), phase, "the tree is being torn down"));
        }
        self.insert_child(
            parent,
            spec,
            NodeKind::DynamicResource(ResourceSlot::new(factory)),
            TreePhase::Building,
        )
    }

    pub(crate) fn set_container(&mut self, id: NodeId, state: ContainerState) -> SimResult<()> {
        let location = self.location(id);
        match self.node_mut(id)?.kind.resource_slot_mut() {
            Some(slot) => {
                slot.container = state;
                Ok(())
            }
            None => Err(SimError::TypeMismatch {
                location,
                expected: "resource node".into(),
                found: "plain node".into(),
            }),
        }
    }

    /// Inserts a child regardless of the structural phase gate. Used by the
    /// framework while finalizing resources.
    pub(crate) fn insert_child(
        &mut self,
        parent: NodeId,
        spec: NodeSpec,
        kind: NodeKind,
        phase: TreePhase,
    ) -> SimResult<NodeId> {
        self.validate_spec(&spec)?;
        let tags_ok = spec.tags.len()
            == spec
                .tags
                .iter()
                .collect::<std::collections::BTreeSet<_>>()
                .len();
        if !tags_ok {
            return Err(SimError::NameCollision {
                parent: self.location(parent),
                name: spec.name.clone(),
                reason: "declares a duplicate tag".into(),
            });
        }
        let mut node = Node::new(spec, kind, phase);
        node.parent = Some(parent);
        let id = self.nodes.insert(node);
        if let Err(err) = self.check_collisions(parent, id) {
            self.nodes.remove(id);
            return Err(err);
        }
        self.node_mut(parent)?.children.push(id);
        trace!(location = %self.location(id), "node created");
        Ok(id)
    }

    fn validate_spec(&self, spec: &NodeSpec) -> SimResult<()> {
        let invalid = |what: &str, value: &str, e: crate::pattern::IdentifierError| {
            SimError::InvalidPath {
                path: value.to_string(),
                reason: format!("{what} {e}"),
            }
        };
        validate_name(&spec.name).map_err(|e| invalid("name", &spec.name, e))?;
        if let Some((group, _)) = &spec.group {
            validate_group(group).map_err(|e| invalid("group", group, e))?;
        }
        for alias in &spec.aliases {
            validate_name(alias).map_err(|e| invalid("alias", alias, e))?;
        }
        Ok(())
    }

    fn structural_phase(&self, parent: NodeId) -> SimResult<TreePhase> {
        Ok(self.node(parent)?.phase)
    }

    fn check_structural(&self, parent: NodeId) -> SimResult<TreePhase> {
        let phase = self.structural_phase(parent)?;
        if !phase.allows_structure() {
            return Err(SimError::phase(
                self.location(parent),
                phase,
                "children can only be added while building or configuring",
            ));
        }
        Ok(phase)
    }

    /// Verifies `candidate` (already allocated, not yet listed) against the
    /// existing children of `parent`.
    fn check_collisions(&self, parent: NodeId, candidate: NodeId) -> SimResult<()> {
        let new = &self.nodes[candidate];
        let mut new_names: Vec<&str> = vec![new.name.as_str()];
        new_names.extend(new.aliases.iter().map(String::as_str));
        let collide = |reason: String| SimError::NameCollision {
            parent: self.location(parent),
            name: new.name.clone(),
            reason,
        };
        for &sibling_id in &self.node(parent)?.children {
            if sibling_id == candidate {
                continue;
            }
            let sibling = &self.nodes[sibling_id];
            for name in &new_names {
                if sibling.answers_to(name) {
                    return Err(collide(format!("'{name}' is already used by '{}'", sibling.name)));
                }
                if sibling.group() == Some(*name) {
                    return Err(collide(format!("'{name}' is already a group name")));
                }
            }
            if let Some((group, idx)) = &new.group {
                if sibling.answers_to(group) {
                    return Err(collide(format!("group '{group}' clashes with a sibling name")));
                }
                if sibling.group.as_ref() == Some(&(group.clone(), *idx)) {
                    return Err(collide(format!("group '{group}' index {idx} is taken")));
                }
            }
        }
        Ok(())
    }

    pub fn add_tag(&mut self, id: NodeId, tag: &str) -> SimResult<()> {
        let location = self.location(id);
        let node = self.node_mut(id)?;
        if !node.phase.allows_structure() {
            return Err(SimError::phase(location, node.phase, "tags are frozen"));
        }
        if !node.tags.insert(tag.to_string()) {
            return Err(SimError::NameCollision {
                parent: location,
                name: tag.to_string(),
                reason: "tag already present".into(),
            });
        }
        Ok(())
    }

    pub fn add_alias(&mut self, id: NodeId, alias: &str) -> SimResult<()> {
        validate_name(alias).map_err(|e| SimError::InvalidPath {
            path: alias.to_string(),
            reason: format!("alias {e}"),
        })?;
        let phase = self.phase(id);
        if !phase.allows_structure() {
            return Err(SimError::phase(self.location(id), phase, "aliases are frozen"));
        }
        self.node_mut(id)?.aliases.push(alias.to_string());
        if let Some(parent) = self.node(id)?.parent {
            if let Err(err) = self.check_collisions(parent, id) {
                self.node_mut(id)?.aliases.pop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Marks `id` private. Takes effect once the tree is finalized.
    pub fn make_private(&mut self, id: NodeId) -> SimResult<()> {
        let phase = self.phase(id);
        if !phase.allows_structure() {
            return Err(SimError::phase(self.location(id), phase, "privacy is frozen"));
        }
        self.node_mut(id)?.private = true;
        Ok(())
    }

    pub(crate) fn mark_builtin(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.builtin = true;
        }
    }

    /// Siblings of a group ordered by group index.
    pub fn group_members(&self, parent: NodeId, group: &str) -> Vec<NodeId> {
        let Ok(node) = self.node(parent) else {
            return Vec::new();
        };
        let mut members: Vec<(u32, NodeId)> = node
            .children
            .iter()
            .filter_map(|c| {
                let child = &self.nodes[*c];
                match &child.group {
                    Some((g, idx)) if g == group => Some((*idx, *c)),
                    _ => None,
                }
            })
            .collect();
        members.sort_by_key(|(idx, _)| *idx);
        members.into_iter().map(|(_, id)| id).collect()
    }

    pub fn group_size(&self, parent: NodeId, group: &str) -> usize {
        self.group_members(parent, group).len()
    }

    /// `id` followed by all its descendants, parents before children.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Moves the subtree rooted at `root` to `phase`. Phases only advance.
    pub fn advance_phase(&mut self, root: NodeId, phase: TreePhase) -> SimResult<Vec<NodeId>> {
        let current = self.phase(root);
        if phase <= current {
            return Err(SimError::phase(
                self.location(root),
                current,
                format!("cannot enter {phase}"),
            ));
        }
        let order = self.preorder(root);
        for &id in &order {
            let node = &mut self.nodes[id];
            if node.phase < phase {
                node.phase = phase;
            }
        }
        debug!(root = %self.location(root), %phase, nodes = order.len(), "tree phase advanced");
        Ok(order)
    }

    /// Assigns a clock to a node; descendants inherit it unless they set their own.
    pub fn set_clock(&mut self, id: NodeId, clock: ClockId) -> SimResult<()> {
        let phase = self.phase(id);
        if phase >= TreePhase::Finalizing {
            return Err(SimError::phase(self.location(id), phase, "clocks are frozen"));
        }
        self.node_mut(id)?.clock = Some(clock);
        Ok(())
    }

    /// The node's own clock or the nearest ancestor's.
    pub fn effective_clock(&self, id: NodeId) -> Option<ClockId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.nodes.get(current)?;
            if node.clock.is_some() {
                return node.clock;
            }
            cursor = node.parent;
        }
        None
    }

    /// Copies inherited clocks onto every node so they no longer change.
    pub(crate) fn freeze_clocks(&mut self, root: NodeId) {
        for id in self.preorder(root) {
            let clock = self.effective_clock(id);
            self.nodes[id].clock = clock;
        }
    }

    /// Finds the child of `parent` named `name` (aliases ignored).
    pub fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(parent)?
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[*c].name == name)
    }

    /// Returns the built-in container `name` under `parent`, creating it with
    /// `kind` if needed.
    pub(crate) fn ensure_builtin(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        desc: &str,
    ) -> SimResult<NodeId> {
        if let Some(existing) = self.child_named(parent, name) {
            return Ok(existing);
        }
        let phase = self.framework_phase(parent)?;
        let id = self.insert_child(parent, NodeSpec::new(name).desc(desc), kind, phase)?;
        self.mark_builtin(id);
        Ok(id)
    }

    /// Phase for nodes the framework adds under `parent`. Such nodes may
    /// still appear while resources are being constructed.
    fn framework_phase(&self, parent: NodeId) -> SimResult<TreePhase> {
        let phase = self.structural_phase(parent)?;
        if phase > TreePhase::Finalizing {
            return Err(SimError::phase(
                self.location(parent),
                phase,
                "the subtree is already finalized",
            ));
        }
        Ok(phase)
    }

    /// Adds a framework-owned child (port, counter, notification source).
    pub(crate) fn create_framework_child(
        &mut self,
        parent: NodeId,
        spec: NodeSpec,
        kind: NodeKind,
    ) -> SimResult<NodeId> {
        let phase = self.framework_phase(parent)?;
        self.insert_child(parent, spec, kind, phase)
    }

    /// Instantiates `set` as the `params` child of `owner`.
    pub fn create_parameters(&mut self, owner: NodeId, set: ParameterSet) -> SimResult<NodeId> {
        let phase = self.phase(owner);
        if phase > TreePhase::Finalizing {
            return Err(SimError::phase(
                self.location(owner),
                phase,
                "parameters must be declared before finalization",
            ));
        }
        let params = self.ensure_builtin(owner, PARAMS, NodeKind::ParameterSet, "Parameters")?;
        let child_phase = self.phase(params);
        for def in set.into_defs() {
            let spec = NodeSpec::new(def.name());
            let parameter = Parameter::from_def(def);
            let spec = spec.desc(parameter.doc());
            self.insert_child(params, spec, NodeKind::Parameter(parameter), child_phase)?;
        }
        Ok(params)
    }

    pub fn parameter(&self, id: NodeId) -> SimResult<&Parameter> {
        match &self.node(id)?.kind {
            NodeKind::Parameter(p) => Ok(p),
            other => Err(SimError::TypeMismatch {
                location: self.location(id),
                expected: "parameter".into(),
                found: other.label().into(),
            }),
        }
    }

    /// Mutable parameter access. Writes are refused once finalizing began.
    pub fn parameter_mut(&mut self, id: NodeId) -> SimResult<&mut Parameter> {
        let location = self.location(id);
        let node = self.node_mut(id)?;
        if node.phase >= TreePhase::Finalizing {
            return Err(SimError::phase(location, node.phase, "parameters are frozen"));
        }
        match &mut node.kind {
            NodeKind::Parameter(p) => Ok(p),
            other => Err(SimError::TypeMismatch {
                location,
                expected: "parameter".into(),
                found: other.label().into(),
            }),
        }
    }

    /// Every parameter node below `root`, in pre-order.
    pub fn parameters(&self, root: NodeId) -> Vec<NodeId> {
        self.preorder(root)
            .into_iter()
            .filter(|id| matches!(self.nodes[*id].kind, NodeKind::Parameter(_)))
            .collect()
    }

    /// Applies the newest overlay value to every parameter in `nodes`.
    pub fn apply_overlay(&mut self, vpt: &VirtualParameterTree, nodes: &[NodeId]) -> SimResult<usize> {
        let mut applied = 0;
        for &id in nodes {
            let location = self.location(id);
            let Some(entry) = vpt.try_get(&location, true)? else {
                continue;
            };
            let (value, origin) = match entry.value() {
                Some(v) => (v.to_string(), entry.origin().to_string()),
                None => continue,
            };
            if let NodeKind::Parameter(p) = &mut self.node_mut(id)?.kind {
                p.set_from_string(&value, &origin)
                    .map_err(|e| relocate(e, &location))?;
                applied += 1;
                trace!(%location, %value, %origin, "parameter set from overlay");
            }
        }
        Ok(applied)
    }

    /// Parameters below `root` that were set but never read.
    pub fn unread_parameters(&self, root: NodeId) -> Vec<String> {
        self.parameters(root)
            .into_iter()
            .filter(|id| matches!(&self.nodes[*id].kind, NodeKind::Parameter(p) if p.is_unread()))
            .map(|id| self.location(id))
            .collect()
    }

    pub(crate) fn add_counter(&mut self, owner: NodeId, name: &str, desc: &str) -> SimResult<Counter> {
        let stats = self.ensure_builtin(owner, STATS, NodeKind::Generic, "Statistics")?;
        let counter = Counter::new();
        self.create_framework_child(
            stats,
            NodeSpec::new(name).desc(desc),
            NodeKind::Counter(counter.clone()),
        )?;
        Ok(counter)
    }

    pub(crate) fn add_statistic(
        &mut self,
        owner: NodeId,
        name: &str,
        desc: &str,
        statistic: Statistic,
    ) -> SimResult<NodeId> {
        let stats = self.ensure_builtin(owner, STATS, NodeKind::Generic, "Statistics")?;
        self.create_framework_child(stats, NodeSpec::new(name).desc(desc), NodeKind::Statistic(statistic))
    }

    pub fn counter(&self, id: NodeId) -> SimResult<&Counter> {
        match &self.node(id)?.kind {
            NodeKind::Counter(c) => Ok(c),
            other => Err(SimError::TypeMismatch {
                location: self.location(id),
                expected: "counter".into(),
                found: other.label().into(),
            }),
        }
    }

    pub fn statistic(&self, id: NodeId) -> SimResult<&Statistic> {
        match &self.node(id)?.kind {
            NodeKind::Statistic(s) => Ok(s),
            other => Err(SimError::TypeMismatch {
                location: self.location(id),
                expected: "statistic".into(),
                found: other.label().into(),
            }),
        }
    }

    /// Compiles `text`, resolving dotted paths relative to `owner` to
    /// counter or statistic nodes.
    pub fn compile_expression(&self, owner: NodeId, text: &str) -> SimResult<Expression> {
        let mut resolve = |path: &str| -> SimResult<Variable> {
            let id = self.get_child(owner, path)?;
            match &self.node(id)?.kind {
                NodeKind::Counter(c) => Ok(Variable::Counter(c.clone())),
                NodeKind::Statistic(s) => Ok(Variable::Statistic(s.clone())),
                other => Err(SimError::TypeMismatch {
                    location: self.location(id),
                    expected: "counter or statistic".into(),
                    found: other.label().into(),
                }),
            }
        };
        Expression::compile(text, &mut resolve)
    }

    /// Destroys `root` and its descendants. Only legal during teardown.
    pub fn remove_subtree(&mut self, root: NodeId) -> SimResult<usize> {
        let phase = self.phase(root);
        if phase != TreePhase::Teardown {
            return Err(SimError::phase(self.location(root), phase, "nodes are destroyed only in teardown"));
        }
        let order = self.preorder(root);
        let removed = order.len();
        if let Some(parent) = self.nodes.get(root).and_then(|n| n.parent) {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|c| *c != root);
            }
        }
        self.roots.retain(|r| *r != root);
        for id in order.into_iter().rev() {
            self.nodes.remove(id);
        }
        Ok(removed)
    }
}

fn relocate(err: SimError, location: &str) -> SimError {
    match err {
        SimError::TypeMismatch { expected, found, .. } => SimError::TypeMismatch {
            location: location.to_string(),
            expected,
            found,
        },
        SimError::InvalidParameter { reason, .. } => SimError::InvalidParameter {
            location: location.to_string(),
            reason,
        },
        other => other,
    }
}
