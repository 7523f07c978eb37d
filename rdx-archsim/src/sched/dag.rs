//! Precedence graph over scheduler vertices, ordered with Kahn's algorithm.

use crate::error::SimError;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Index of a vertex inside a [`Dag`].
pub type VertexId = usize;

#[derive(Debug, Clone, Default)]
pub struct Dag {
    labels: Vec<String>,
    edges: Vec<BTreeSet<VertexId>>,
    levels: Vec<u32>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, label: impl Into<String>) -> VertexId {
        self.labels.push(label.into());
        self.edges.push(BTreeSet::new());
        self.labels.len() - 1
    }

    /// Declares that `from` must be dispatched before `to`. Duplicate edges
    /// are collapsed.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId) {
        self.edges[from].insert(to);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(BTreeSet::len).sum()
    }

    pub fn label(&self, v: VertexId) -> &str {
        &self.labels[v]
    }

    /// Level assigned by the last successful [`sort`](Self::sort).
    pub fn level(&self, v: VertexId) -> Option<u32> {
        self.levels.get(v).copied()
    }

    /// Assigns every vertex a level so each edge goes from a lower level to a
    /// higher one. Vertices with no predecessors sit at level 0.
    pub fn sort(&mut self) -> Result<&[u32], SimError> {
        let n = self.labels.len();
        let mut in_degree = vec![0usize; n];
        for targets in &self.edges {
            for &t in targets {
                in_degree[t] += 1;
            }
        }
        let mut levels = vec![0u32; n];
        let mut current: Vec<VertexId> = (0..n).filter(|v| in_degree[*v] == 0).collect();
        let mut processed = 0;
        let mut level = 0;
        while !current.is_empty() {
            let mut next = Vec::new();
            for &v in &current {
                levels[v] = level;
                processed += 1;
                for &t in &self.edges[v] {
                    in_degree[t] -= 1;
                    if in_degree[t] == 0 {
                        next.push(t);
                    }
                }
            }
            next.sort_unstable();
            current = next;
            level += 1;
        }
        if processed != n {
            let stuck: BTreeSet<VertexId> = (0..n).filter(|v| in_degree[*v] > 0).collect();
            return Err(SimError::DagCycle {
                cycle: self.find_cycle(&stuck),
            });
        }
        self.levels = levels;
        Ok(&self.levels)
    }

    /// Walks the unsorted remainder until a vertex repeats and returns that
    /// loop, closed with its first label.
    fn find_cycle(&self, stuck: &BTreeSet<VertexId>) -> Vec<String> {
        let Some(&start) = stuck.iter().next() else {
            return Vec::new();
        };
        // every stuck vertex has a stuck predecessor, so walk edges backwards
        let mut preds: Vec<Vec<VertexId>> = vec![Vec::new(); self.labels.len()];
        for (from, targets) in self.edges.iter().enumerate() {
            for &to in targets {
                if stuck.contains(&from) && stuck.contains(&to) {
                    preds[to].push(from);
                }
            }
        }
        let mut path = vec![start];
        let mut seen = vec![usize::MAX; self.labels.len()];
        seen[start] = 0;
        let mut cursor = start;
        loop {
            let Some(&prev) = preds[cursor].first() else {
                break;
            };
            if seen[prev] != usize::MAX {
                let mut cycle: Vec<String> = path[seen[prev]..]
                    .iter()
                    .rev()
                    .map(|v| self.labels[*v].clone())
                    .collect();
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                return cycle;
            }
            seen[prev] = path.len();
            path.push(prev);
            cursor = prev;
        }
        stuck.iter().map(|v| self.labels[*v].clone()).collect()
    }

    /// Graphviz rendering. Vertices carry their level once sorted.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph scheduler {\n  rankdir=LR;\n");
        for (v, label) in self.labels.iter().enumerate() {
            match self.level(v) {
                Some(level) => {
                    let _ = writeln!(out, "  n{v} [label=\"{label}\\n[{level}]\"];");
                }
                None => {
                    let _ = writeln!(out, "  n{v} [label=\"{label}\"];");
                }
            }
        }
        for (from, targets) in self.edges.iter().enumerate() {
            for to in targets {
                let _ = writeln!(out, "  n{from} -> n{to};");
            }
        }
        out.push_str("}\n");
        out
    }
}
