//! Path lookup and pattern search over the component tree.

use super::Tree;
use crate::common::{NodeId, TreePhase};
use crate::error::{SimError, SimResult};
use crate::pattern::{component_matches, has_wildcards};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step<'p> {
    Child(&'p str),
    Up,
}

/// Splits a search path into steps. A run of `k` dots between two names
/// means `k - 1` moves to the parent.
fn tokenize(path: &str) -> SimResult<Vec<Step<'_>>> {
    if path.is_empty() {
        return Err(SimError::InvalidPath {
            path: String::new(),
            reason: "empty path".into(),
        });
    }
    let mut steps = Vec::new();
    let mut dots = 0usize;
    let mut start = 0usize;
    let bytes = path.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            if dots == 0 && i > start {
                steps.push(Step::Child(&path[start..i]));
            }
            dots += 1;
            i += 1;
            start = i;
            continue;
        }
        if dots > 0 {
            steps.extend(std::iter::repeat(Step::Up).take(dots - 1));
            dots = 0;
        }
        i += 1;
    }
    if dots > 0 {
        steps.extend(std::iter::repeat(Step::Up).take(dots - 1));
    } else if start < bytes.len() {
        steps.push(Step::Child(&path[start..]));
    }
    Ok(steps)
}

impl Tree {
    /// True if searches started at `origin` may not look below `id`.
    pub(crate) fn hides_descendants(&self, id: NodeId, origin: NodeId) -> bool {
        match self.nodes.get(id) {
            Some(node) => {
                node.private
                    && node.phase >= TreePhase::Finalized
                    && !self.is_in_subtree(origin, id)
            }
            None => true,
        }
    }

    /// Resolves a concrete path relative to `from`. Wildcards are rejected.
    pub fn get_child(&self, from: NodeId, path: &str) -> SimResult<NodeId> {
        let steps = tokenize(path)?;
        let mut current = from;
        for step in steps {
            current = match step {
                Step::Up => self.node(current)?.parent.ok_or_else(|| SimError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("'{}' has no parent", self.location(current)),
                })?,
                Step::Child(name) => {
                    if has_wildcards(name) {
                        return Err(SimError::InvalidPath {
                            path: path.to_string(),
                            reason: "wildcards are not allowed here".into(),
                        });
                    }
                    if self.hides_descendants(current, from) {
                        return Err(SimError::PrivacyViolation {
                            origin: self.location(from),
                            path: path.to_string(),
                        });
                    }
                    self.node(current)?
                        .children
                        .iter()
                        .rev()
                        .copied()
                        .find(|c| self.nodes[*c].answers_to(name))
                        .ok_or_else(|| SimError::NotFound {
                            origin: self.location(from),
                            path: path.to_string(),
                        })?
                }
            };
        }
        Ok(current)
    }

    /// Resolves a path relative to the first root whose name starts it.
    pub fn lookup(&self, path: &str) -> SimResult<NodeId> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let root = self
            .roots
            .iter()
            .copied()
            .find(|r| self.nodes[*r].name == head)
            .ok_or_else(|| SimError::NotFound {
                origin: "<roots>".into(),
                path: path.to_string(),
            })?;
        match rest {
            Some(rest) => self.get_child(root, rest),
            None => Ok(root),
        }
    }

    /// Every node matching `pattern` below `from`, newest child first. A node
    /// reachable through both its name and an alias appears twice. Private
    /// subtrees are skipped silently. `max_depth` bounds how far below `from`
    /// a match may sit.
    pub fn find_children(
        &self,
        from: NodeId,
        pattern: &str,
        max_depth: Option<usize>,
    ) -> SimResult<Vec<NodeId>> {
        let steps = tokenize(pattern)?;
        let mut out = Vec::new();
        self.find_from(from, from, &steps, 0, max_depth, &mut out);
        Ok(out)
    }

    fn find_from(
        &self,
        origin: NodeId,
        at: NodeId,
        steps: &[Step<'_>],
        depth: isize,
        max_depth: Option<usize>,
        out: &mut Vec<NodeId>,
    ) {
        let Some((head, rest)) = steps.split_first() else {
            out.push(at);
            return;
        };
        match head {
            Step::Up => {
                if let Some(parent) = self.nodes.get(at).and_then(|n| n.parent) {
                    self.find_from(origin, parent, rest, depth - 1, max_depth, out);
                }
            }
            Step::Child(pattern) => {
                if max_depth.is_some_and(|max| depth + 1 > max as isize) {
                    return;
                }
                if self.hides_descendants(at, origin) {
                    return;
                }
                let Some(node) = self.nodes.get(at) else {
                    return;
                };
                for &child_id in node.children.iter().rev() {
                    let child = &self.nodes[child_id];
                    let names = std::iter::once(child.name.as_str())
                        .chain(child.aliases.iter().map(String::as_str));
                    for name in names {
                        if component_matches(pattern, name) {
                            self.find_from(origin, child_id, rest, depth + 1, max_depth, out);
                        }
                    }
                }
            }
        }
    }

    /// `from` and every descendant a search started at `from` may see.
    pub fn visible_preorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            out.push(id);
            if !self.hides_descendants(id, from) {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Descendants of `from` carrying `tag`, in pre-order, respecting privacy.
    pub fn find_children_by_tag(
        &self,
        from: NodeId,
        tag: &str,
        max_depth: Option<usize>,
    ) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(from, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if id != from && node.tags.contains(tag) {
                out.push(id);
            }
            if max_depth.is_some_and(|max| depth >= max) || self.hides_descendants(id, from) {
                continue;
            }
            stack.extend(node.children.iter().rev().map(|c| (*c, depth + 1)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tree::NodeSpec;

    fn sample() -> (Tree, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new();
        let top = tree.add_root("top", "").unwrap();
        let core0 = tree
            .create_node(top, NodeSpec::new("core0").group("core", 0).alias("boot_core"))
            .unwrap();
        let core1 = tree.create_node(top, NodeSpec::new("core1").group("core", 1)).unwrap();
        for core in [core0, core1] {
            let alu = tree.create_node(core, NodeSpec::new("alu").tag("exec")).unwrap();
            tree.create_node(alu, NodeSpec::new("adder")).unwrap();
        }
        (tree, top, core0, core1)
    }

    #[test]
    fn tokenizer_counts_parent_moves() {
        assert_eq!(tokenize("a.b").unwrap(), vec![Step::Child("a"), Step::Child("b")]);
        assert_eq!(
            tokenize("a..b").unwrap(),
            vec![Step::Child("a"), Step::Up, Step::Child("b")]
        );
        assert_eq!(tokenize("..x").unwrap(), vec![Step::Up, Step::Child("x")]);
        assert_eq!(tokenize("a...").unwrap(), vec![Step::Child("a"), Step::Up, Step::Up]);
    }

    #[test]
    fn get_child_follows_names_aliases_and_parents() {
        let (tree, top, core0, core1) = sample();
        assert_eq!(tree.get_child(top, "core0").unwrap(), core0);
        assert_eq!(tree.get_child(top, "boot_core").unwrap(), core0);
        let alu1 = tree.get_child(top, "core1.alu").unwrap();
        assert_eq!(tree.get_child(core0, "..core1.alu").unwrap(), alu1);
        assert_eq!(tree.get_child(alu1, ".").unwrap(), alu1);
        assert_eq!(tree.node(alu1).unwrap().parent(), Some(core1));
        assert_eq!(tree.lookup("top.core1.alu").unwrap(), alu1);
        let err = tree.get_child(top, "core*").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        let err = tree.get_child(top, "nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn find_children_is_newest_first_with_alias_duplicates() {
        let (tree, top, core0, core1) = sample();
        let found = tree.find_children(top, "*", None).unwrap();
        assert_eq!(found, vec![core1, core0, core0]);
        let alus = tree.find_children(top, "core+.alu", None).unwrap();
        assert_eq!(alus.len(), 2);
        assert!(tree.find_children(top, "core?.alu.adder", Some(2)).unwrap().is_empty());
        assert_eq!(tree.find_children(top, "core?.alu.adder", Some(3)).unwrap().len(), 2);
    }

    #[test]
    fn private_subtrees_hide_descendants_once_finalized() {
        let (mut tree, top, core0, _) = sample();
        tree.make_private(core0).unwrap();
        // not finalized yet
        assert!(tree.get_child(top, "core0.alu").is_ok());
        tree.advance_phase(top, TreePhase::Finalizing).unwrap();
        tree.advance_phase(top, TreePhase::Finalized).unwrap();

        let err = tree.get_child(top, "core0.alu").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrivacyViolation);
        assert!(tree.get_child(top, "core0").is_ok());
        assert!(tree.get_child(core0, "alu.adder").is_ok());
        assert_eq!(tree.find_children(top, "core*.alu", None).unwrap().len(), 1);
        assert_eq!(tree.find_children_by_tag(top, "exec", None).len(), 1);
        assert_eq!(tree.find_children_by_tag(core0, "exec", None).len(), 1);
    }

    #[test]
    fn tag_search_honours_depth() {
        let (tree, top, _, _) = sample();
        assert_eq!(tree.find_children_by_tag(top, "exec", None).len(), 2);
        assert!(tree.find_children_by_tag(top, "exec", Some(1)).is_empty());
        assert_eq!(tree.find_children_by_tag(top, "exec", Some(2)).len(), 2);
    }
}
