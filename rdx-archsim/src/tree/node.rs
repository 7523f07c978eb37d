//! Node data carried by the component tree.

use crate::common::{ClockId, NodeId, PortId, SourceId, TreePhase};
use crate::params::Parameter;
use crate::stats::{Counter, Statistic};
use std::collections::BTreeSet;

/// Lifecycle of the resource slot held by a resource tree node.
///
/// The slot is assigned exactly once while finalizing, locked when the tree
/// reaches FINALIZED and released only during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Vacant,
    Assigned(usize),
    Locked(usize),
    Released,
}

impl ContainerState {
    pub fn index(self) -> Option<usize> {
        match self {
            ContainerState::Assigned(i) | ContainerState::Locked(i) => Some(i),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceSlot {
    pub factory: String,
    pub container: ContainerState,
}

impl ResourceSlot {
    pub fn new(factory: &str) -> Self {
        Self {
            factory: factory.to_string(),
            container: ContainerState::Vacant,
        }
    }
}

/// The variant a node takes in the tree.
#[derive(Debug)]
pub enum NodeKind {
    Generic,
    Root,
    Parameter(Parameter),
    ParameterSet,
    PortSet,
    Port(PortId),
    NotificationSource(SourceId),
    Statistic(Statistic),
    Counter(Counter),
    Clock(ClockId),
    Resource(ResourceSlot),
    DynamicResource(ResourceSlot),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Generic => "node",
            NodeKind::Root => "root",
            NodeKind::Parameter(_) => "parameter",
            NodeKind::ParameterSet => "parameter-set",
            NodeKind::PortSet => "port-set",
            NodeKind::Port(_) => "port",
            NodeKind::NotificationSource(_) => "notification-source",
            NodeKind::Statistic(_) => "statistic",
            NodeKind::Counter(_) => "counter",
            NodeKind::Clock(_) => "clock",
            NodeKind::Resource(_) => "resource",
            NodeKind::DynamicResource(_) => "dynamic-resource",
        }
    }

    pub fn resource_slot(&self) -> Option<&ResourceSlot> {
        match self {
            NodeKind::Resource(slot) | NodeKind::DynamicResource(slot) => Some(slot),
            _ => None,
        }
    }

    pub(crate) fn resource_slot_mut(&mut self) -> Option<&mut ResourceSlot> {
        match self {
            NodeKind::Resource(slot) | NodeKind::DynamicResource(slot) => Some(slot),
            _ => None,
        }
    }
}

/// Construction arguments for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub(crate) name: String,
    pub(crate) group: Option<(String, u32)>,
    pub(crate) desc: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) private: bool,
    pub(crate) hidden: bool,
}

impl NodeSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn group(mut self, group: &str, index: u32) -> Self {
        self.group = Some((group.to_string(), index));
        self
    }

    pub fn desc(mut self, desc: &str) -> Self {
        self.desc = desc.to_string();
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Hides descendants from lookups that start outside this node once the
    /// tree is finalized.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

#[derive(Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) group: Option<(String, u32)>,
    pub(crate) desc: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) phase: TreePhase,
    pub(crate) private: bool,
    pub(crate) hidden: bool,
    pub(crate) builtin: bool,
    pub(crate) clock: Option<ClockId>,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn new(spec: NodeSpec, kind: NodeKind, phase: TreePhase) -> Self {
        Self {
            name: spec.name,
            group: spec.group,
            desc: spec.desc,
            aliases: spec.aliases,
            tags: spec.tags.into_iter().collect(),
            parent: None,
            children: Vec::new(),
            phase,
            private: spec.private,
            hidden: spec.hidden,
            builtin: false,
            clock: None,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_ref().map(|(g, _)| g.as_str())
    }

    pub fn group_index(&self) -> Option<u32> {
        self.group.as_ref().map(|(_, i)| *i)
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn phase(&self) -> TreePhase {
        self.phase
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Framework-created containers such as `params`, `ports` and `stats`.
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The clock assigned directly to this node (not inherited).
    pub fn own_clock(&self) -> Option<ClockId> {
        self.clock
    }

    /// True if `name` is this node's name or one of its aliases.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }
}
