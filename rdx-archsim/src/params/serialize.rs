//! Line-oriented parameter dump and its reader.
//!
//! Each parameter becomes one line, in tree pre-order:
//!
//! ```text
//! top.alu.params.latency = 3 # config.toml, u32
//! top.alu.params.width = 4 # default, u32, default
//! ```
//!
//! The trailing `default` marker is present when the value equals the
//! declared default. Reading a dump back feeds every line into a
//! [`VirtualParameterTree`], so dumping a tree configured from a dump yields
//! the same text.

use crate::common::NodeId;
use crate::error::{SimError, SimResult};
use crate::tree::Tree;
use crate::vpt::VirtualParameterTree;
use std::fmt::Write;

/// Dumps every parameter below `root`. Values are peeked, not read.
pub fn serialize(tree: &Tree, root: NodeId) -> SimResult<String> {
    let mut out = String::new();
    for id in tree.parameters(root) {
        let param = tree.parameter(id)?;
        let _ = write!(
            out,
            "{} = {} # {}, {}",
            tree.location(id),
            param.value_as_string(),
            param.origin(),
            param.param_type().name()
        );
        if param.is_default() {
            out.push_str(", default");
        }
        out.push('\n');
    }
    Ok(out)
}

/// One parsed line of a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    pub path: String,
    pub value: String,
    pub origin: Option<String>,
    pub type_name: Option<String>,
    pub is_default: bool,
}

/// Finds the first `#` outside a double-quoted string.
fn comment_start(line: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

pub fn parse_line(line: &str) -> SimResult<Option<DumpEntry>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let (body, comment) = match comment_start(trimmed) {
        Some(at) => (&trimmed[..at], Some(trimmed[at + 1..].trim())),
        None => (trimmed, None),
    };
    let (path, value) = body.split_once('=').ok_or_else(|| SimError::InvalidPath {
        path: trimmed.to_string(),
        reason: "expected 'path = value'".into(),
    })?;
    let path = path.trim();
    if path.is_empty() {
        return Err(SimError::InvalidPath {
            path: trimmed.to_string(),
            reason: "missing parameter path".into(),
        });
    }
    let mut entry = DumpEntry {
        path: path.to_string(),
        value: value.trim().to_string(),
        origin: None,
        type_name: None,
        is_default: false,
    };
    if let Some(mut comment) = comment {
        if let Some(rest) = comment.strip_suffix(", default") {
            entry.is_default = true;
            comment = rest;
        }
        match comment.rsplit_once(", ") {
            Some((origin, type_name)) => {
                entry.origin = Some(origin.to_string());
                entry.type_name = Some(type_name.to_string());
            }
            None if !comment.is_empty() => entry.origin = Some(comment.to_string()),
            None => {}
        }
    }
    Ok(Some(entry))
}

/// Feeds a dump into `vpt`. Lines without an origin get `fallback_origin`.
/// Returns the number of entries applied.
pub fn deserialize(
    text: &str,
    vpt: &mut VirtualParameterTree,
    required: bool,
    fallback_origin: &str,
) -> SimResult<usize> {
    let mut applied = 0;
    for line in text.lines() {
        let Some(entry) = parse_line(line)? else {
            continue;
        };
        let origin = entry.origin.as_deref().unwrap_or(fallback_origin);
        if !vpt.set(&entry.path, &entry.value, required, origin) {
            return Err(SimError::InvalidPath {
                path: entry.path,
                reason: "empty path component".into(),
            });
        }
        applied += 1;
    }
    Ok(applied)
}
