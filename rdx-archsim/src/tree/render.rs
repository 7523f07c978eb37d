//! Human-readable rendering of a subtree.

use super::{Node, NodeKind, Tree};
use crate::common::NodeId;
use std::fmt::Write;

/// Controls [`Tree::render_subtree`].
#[derive(Default)]
pub struct RenderOptions<'a> {
    /// Include framework containers such as `params`, `ports` and `stats`.
    pub show_builtin_groups: bool,
    pub hide_descriptions: bool,
    pub show_hidden: bool,
    /// Nodes rejected by the filter are omitted with their subtrees.
    pub filter: Option<&'a dyn Fn(&Node) -> bool>,
}

impl Tree {
    /// Renders `from` and up to `depth` levels below it, one node per line.
    pub fn render_subtree(&self, from: NodeId, depth: Option<usize>, opts: &RenderOptions<'_>) -> String {
        let mut out = String::new();
        self.render_into(from, from, 0, depth, opts, &mut out);
        out
    }

    fn render_into(
        &self,
        origin: NodeId,
        id: NodeId,
        level: usize,
        depth: Option<usize>,
        opts: &RenderOptions<'_>,
        out: &mut String,
    ) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        if id != origin {
            if node.builtin && !opts.show_builtin_groups {
                return;
            }
            if node.hidden && !opts.show_hidden {
                return;
            }
            if let Some(filter) = opts.filter {
                if !filter(node) {
                    return;
                }
            }
        }
        let indent = if level == 0 { String::new() } else { format!("{}+-", "| ".repeat(level - 1)) };
        let _ = write!(out, "{indent}{}", node.name);
        if let (Some(group), Some(idx)) = (node.group(), node.group_index()) {
            let _ = write!(out, "[{group}:{idx}]");
        }
        if !node.aliases.is_empty() {
            let _ = write!(out, " (aka {})", node.aliases.join(", "));
        }
        match &node.kind {
            NodeKind::Parameter(p) => {
                let _ = write!(out, " = {} <{}>", p.value_as_string(), p.param_type().name());
            }
            NodeKind::Counter(c) => {
                let _ = write!(out, " = {}", c.get());
            }
            NodeKind::Statistic(s) => {
                let _ = write!(out, " := {}", s.expression().text());
            }
            NodeKind::Resource(slot) | NodeKind::DynamicResource(slot) => {
                let _ = write!(out, " <{}>", slot.factory);
            }
            _ => {}
        }
        if !node.tags.is_empty() {
            let tags: Vec<&str> = node.tags().collect();
            let _ = write!(out, " #{}", tags.join(" #"));
        }
        if !opts.hide_descriptions && !node.desc.is_empty() {
            let _ = write!(out, " : {}", node.desc);
        }
        out.push('\n');
        if depth.is_some_and(|d| level >= d) || self.hides_descendants(id, origin) {
            return;
        }
        for &child in &node.children {
            self.render_into(origin, child, level + 1, depth, opts, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterSet;
    use crate::tree::NodeSpec;

    #[test]
    fn builtin_and_hidden_nodes_are_opt_in() {
        let mut tree = Tree::new();
        let top = tree.add_root("top", "model").unwrap();
        let a = tree.create_node(top, NodeSpec::new("a").desc("unit a").tag("cpu")).unwrap();
        tree.create_node(top, NodeSpec::new("secret").hidden()).unwrap();
        let mut set = ParameterSet::new();
        set.param("width", 4u32, "");
        tree.create_parameters(a, set).unwrap();

        let plain = tree.render_subtree(top, None, &RenderOptions::default());
        assert_eq!(plain, "top : model\n+-a #cpu : unit a\n");

        let full = tree.render_subtree(
            top,
            None,
            &RenderOptions {
                show_builtin_groups: true,
                show_hidden: true,
                hide_descriptions: true,
                filter: None,
            },
        );
        assert!(full.contains("| +-params"));
        assert!(full.contains("| | +-width = 4 <u32>"));
        assert!(full.contains("+-secret"));
        assert!(!full.contains("unit a"));
    }

    #[test]
    fn depth_and_filter_prune() {
        let mut tree = Tree::new();
        let top = tree.add_root("top", "").unwrap();
        let a = tree.create_node(top, NodeSpec::new("a")).unwrap();
        tree.create_node(a, NodeSpec::new("deep")).unwrap();
        tree.create_node(top, NodeSpec::new("b")).unwrap();

        assert_eq!(tree.render_subtree(top, Some(1), &RenderOptions::default()), "top\n+-a\n+-b\n");
        let only_a = |n: &Node| n.name() != "b";
        let opts = RenderOptions {
            filter: Some(&only_a),
            ..Default::default()
        };
        assert_eq!(tree.render_subtree(top, None, &opts), "top\n+-a\n| +-deep\n");
    }
}
