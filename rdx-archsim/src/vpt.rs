//! The virtual parameter tree: an ordered overlay of string-valued settings.
//!
//! The tree is independent of the component tree. Each node carries a path
//! component that may contain wildcards, and children are kept in creation
//! order. Lookups walk children newest-first, so a later setting always wins
//! over an earlier one without the earlier node ever being rewritten.

use crate::error::{SimError, SimResult};
use crate::pattern::{component_matches, has_wildcards, matches, split_path};
use std::cell::Cell;

/// Index of a node inside a [`VirtualParameterTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VptNodeId(usize);

#[derive(Debug, Clone)]
pub struct VptNode {
    name: String,
    parent: Option<VptNodeId>,
    children: Vec<VptNodeId>,
    value: Option<String>,
    origin: String,
    write_count: u32,
    read_count: Cell<u32>,
    required_count: u32,
}

impl VptNode {
    fn new(name: &str, parent: Option<VptNodeId>) -> Self {
        Self {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            value: None,
            origin: String::new(),
            write_count: 0,
            read_count: Cell::new(0),
            required_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.get()
    }

    pub fn required_count(&self) -> u32 {
        self.required_count
    }

    pub fn is_required(&self) -> bool {
        self.required_count > 0
    }

    fn mark_read(&self) {
        self.read_count.set(self.read_count.get().saturating_add(1));
    }
}

/// Outcome of resolving one path component against existing children.
enum Resolution {
    Existing(VptNodeId),
    Append,
}

#[derive(Debug, Clone)]
pub struct VirtualParameterTree {
    nodes: Vec<VptNode>,
}

impl Default for VirtualParameterTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualParameterTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![VptNode::new("", None)],
        }
    }

    fn root(&self) -> VptNodeId {
        VptNodeId(0)
    }

    pub fn node(&self, id: VptNodeId) -> &VptNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: VptNodeId) -> &mut VptNode {
        &mut self.nodes[id.0]
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Full dotted path of a node, wildcards included.
    pub fn path_of(&self, id: VptNodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current);
            if node.parent.is_some() {
                parts.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Chooses the child a new setting for `name` should reuse, walking the
    /// children newest-first. Any overlap between wildcards and literals forces
    /// a fresh append so earlier settings are refined rather than rewritten.
    fn priority_match(&self, parent: VptNodeId, name: &str) -> Resolution {
        let name_wild = has_wildcards(name);
        for &child in self.node(parent).children.iter().rev() {
            let child_name = self.node(child).name.as_str();
            if child_name == name {
                return Resolution::Existing(child);
            }
            let child_wild = has_wildcards(child_name);
            if name_wild {
                if child_wild || matches(name, child_name) {
                    return Resolution::Append;
                }
            } else if child_wild && matches(child_name, name) {
                return Resolution::Append;
            }
        }
        Resolution::Append
    }

    fn append_child(&mut self, parent: VptNodeId, name: &str) -> VptNodeId {
        let id = VptNodeId(self.nodes.len());
        self.nodes.push(VptNode::new(name, Some(parent)));
        self.node_mut(parent).children.push(id);
        id
    }

    fn walk_create(&mut self, path: &str) -> Option<VptNodeId> {
        let components = split_path(path)?;
        let mut cursor = self.root();
        for component in components {
            cursor = match self.priority_match(cursor, component) {
                Resolution::Existing(child) => child,
                Resolution::Append => self.append_child(cursor, component),
            };
        }
        Some(cursor)
    }

    /// Records `value` at `path`. Returns false only when the path contains an
    /// empty component.
    pub fn set(&mut self, path: &str, value: &str, required: bool, origin: &str) -> bool {
        let Some(id) = self.walk_create(path) else {
            return false;
        };
        let node = self.node_mut(id);
        node.value = Some(value.to_string());
        node.origin = origin.to_string();
        node.write_count = node.write_count.saturating_add(1);
        if required {
            node.required_count = node.required_count.saturating_add(1);
        }
        true
    }

    /// Creates the nodes for `path` without assigning a value.
    pub fn create(&mut self, path: &str, required: bool) -> Option<VptNodeId> {
        let id = self.walk_create(path)?;
        if required {
            let node = self.node_mut(id);
            node.required_count = node.required_count.saturating_add(1);
        }
        Some(id)
    }

    fn validated_components<'p>(&self, path: &'p str) -> SimResult<Vec<&'p str>> {
        split_path(path).ok_or_else(|| SimError::InvalidPath {
            path: path.to_string(),
            reason: "empty component or parent reference".into(),
        })
    }

    /// Every node whose full pattern matches `components`, newest-first.
    fn collect_matches(&self, components: &[&str]) -> Vec<VptNodeId> {
        let mut out = Vec::new();
        self.collect_from(self.root(), components, &mut out);
        out
    }

    fn collect_from(&self, at: VptNodeId, components: &[&str], out: &mut Vec<VptNodeId>) {
        let Some((head, rest)) = components.split_first() else {
            out.push(at);
            return;
        };
        for &child in self.node(at).children.iter().rev() {
            let child_name = self.node(child).name.as_str();
            let hit = component_matches(child_name, head)
                || (has_wildcards(head) && child_name == *head);
            if hit {
                self.collect_from(child, rest, out);
            }
        }
    }

    /// Looks up the newest value for `path`, marking every matching node read.
    pub fn get(&self, path: &str) -> SimResult<&VptNode> {
        self.try_get(path, true)?.ok_or_else(|| SimError::NotFound {
            origin: "<vpt>".into(),
            path: path.to_string(),
        })
    }

    /// Like [`get`](Self::get) but returns `Ok(None)` when nothing matches.
    /// With `must_be_leaf == false` any matching node is returned, valued or not.
    pub fn try_get(&self, path: &str, must_be_leaf: bool) -> SimResult<Option<&VptNode>> {
        let components = self.validated_components(path)?;
        let found = self.collect_matches(&components);
        let mut result = None;
        for &id in &found {
            let node = self.node(id);
            if node.has_value() {
                node.mark_read();
            }
            if result.is_none() && (node.has_value() || !must_be_leaf) {
                result = Some(node);
            }
        }
        Ok(result)
    }

    /// Like [`try_get`](Self::try_get), returning the node id.
    pub fn try_get_id(&self, path: &str) -> SimResult<Option<VptNodeId>> {
        let components = self.validated_components(path)?;
        let found = self.collect_matches(&components);
        let mut result = None;
        for &id in &found {
            let node = self.node(id);
            if node.has_value() {
                node.mark_read();
                result.get_or_insert(id);
            }
        }
        Ok(result)
    }

    /// True if any node matching `path` carries a value. Does not count as a read.
    pub fn has_value(&self, path: &str) -> SimResult<bool> {
        let components = self.validated_components(path)?;
        Ok(self
            .collect_matches(&components)
            .into_iter()
            .any(|id| self.node(id).has_value()))
    }

    /// True if the newest value for `path` has been read at least once.
    pub fn is_read(&self, path: &str) -> SimResult<bool> {
        let components = self.validated_components(path)?;
        Ok(self
            .collect_matches(&components)
            .into_iter()
            .find(|id| self.node(*id).has_value())
            .map(|id| self.node(id).read_count() > 0)
            .unwrap_or(false))
    }

    pub fn is_required(&self, path: &str) -> SimResult<bool> {
        let components = self.validated_components(path)?;
        let found = self.collect_matches(&components);
        let chosen = found
            .iter()
            .find(|id| self.node(**id).has_value())
            .or_else(|| found.first());
        Ok(chosen.map(|id| self.node(*id).is_required()).unwrap_or(false))
    }

    /// Clears the required count of every node matching `path` and of all
    /// their descendants.
    pub fn unrequire(&mut self, path: &str) -> SimResult<()> {
        let components = self.validated_components(path)?;
        let found = self.collect_matches(&components);
        let mut stack = found;
        while let Some(id) = stack.pop() {
            let node = self.node_mut(id);
            node.required_count = 0;
            stack.extend(node.children.iter().copied());
        }
        Ok(())
    }

    /// Replays every node of `other` into this tree as the latest settings.
    pub fn merge(&mut self, other: &VirtualParameterTree) {
        for id in other.preorder() {
            if id == other.root() {
                continue;
            }
            let node = other.node(id);
            let path = other.path_of(id);
            match &node.value {
                Some(value) => {
                    if let Some(target) = self.walk_create(&path) {
                        let dst = self.node_mut(target);
                        dst.value = Some(value.clone());
                        dst.origin = node.origin.clone();
                        dst.write_count += node.write_count.max(1);
                        dst.required_count += node.required_count;
                    }
                }
                None if node.required_count > 0 => {
                    if let Some(target) = self.walk_create(&path) {
                        self.node_mut(target).required_count += node.required_count;
                    }
                }
                None => {}
            }
        }
    }

    fn preorder(&self) -> Vec<VptNodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.node(id).children.iter().rev().copied());
        }
        out
    }

    /// Valued nodes that were never read, in pre-order.
    pub fn unread_value_nodes(&self) -> Vec<VptNodeId> {
        self.preorder()
            .into_iter()
            .filter(|id| {
                let node = self.node(*id);
                node.has_value() && node.read_count() == 0
            })
            .collect()
    }

    /// Every valued node in pre-order, for reporting.
    pub fn value_nodes(&self) -> Vec<VptNodeId> {
        self.preorder()
            .into_iter()
            .filter(|id| self.node(*id).has_value())
            .collect()
    }
}
