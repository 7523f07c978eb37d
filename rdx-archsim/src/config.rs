//! Run settings and parameter overlays loaded from configuration files.
//!
//! A file carries two kinds of content. Plain tables (`[run]`, `[timeout]`,
//! the policies) deserialize into [`SimConfig`]. The `[parameters]` and
//! `[optional_parameters]` tables are flattened into dotted paths and written
//! into the virtual parameter tree, as required and optional entries.
//!
//! ```toml
//! unread_parameters = "warn"
//!
//! [run]
//! ticks = 200
//!
//! [parameters.top."core*".alu.params]
//! latency = 3
//! ```
//!
//! Environment variables prefixed with `ARCHSIM_` override plain settings,
//! with `__` separating nested keys (`ARCHSIM_RUN__TICKS=50`).

use crate::error::{SimError, SimResult};
use crate::sched::TimeoutSettings;
use crate::vpt::VirtualParameterTree;
use config::{Config, Environment, File, FileFormat, Value, ValueKind};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Origin recorded for overlay entries whose source has no name.
pub const DEFAULT_ORIGIN: &str = "config";

const PARAMETERS: &str = "parameters";
const OPTIONAL_PARAMETERS: &str = "optional_parameters";

/// What to do about a condition that can be an error or just a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Error,
    Warn,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub ticks: u64,
    /// Advance exactly `ticks` ticks even when only non-continuing work remains.
    pub exacting: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            ticks: 1_000,
            exacting: false,
        }
    }
}

/// Settings of one simulation run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub run: RunSettings,
    pub timeout: Option<TimeoutSettings>,
    /// Parameters that were set by the overlay but never read by their owner.
    pub unread_parameters: Policy,
    /// Optional overlay entries that matched no parameter.
    pub optional_unmatched: Policy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            run: RunSettings::default(),
            timeout: None,
            unread_parameters: default_unread_policy(),
            optional_unmatched: default_optional_policy(),
        }
    }
}

fn default_unread_policy() -> Policy {
    Policy::Error
}

fn default_optional_policy() -> Policy {
    Policy::Warn
}

/// One flattened `path = value` entry destined for the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub path: String,
    pub value: String,
    pub origin: String,
    pub required: bool,
}

/// A parsed configuration: run settings plus overlay entries.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub settings: SimConfig,
    pub overlay: Vec<OverlayEntry>,
}

impl ConfigFile {
    /// Loads a TOML file, then applies `ARCHSIM_` environment overrides.
    pub fn load(path: &Path) -> SimResult<Self> {
        let built = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("ARCHSIM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| config_error(&path.display().to_string(), e))?;
        Self::from_config(built)
    }

    /// Parses TOML text. Environment variables are not consulted.
    pub fn from_toml(text: &str) -> SimResult<Self> {
        let built = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .map_err(|e| config_error(DEFAULT_ORIGIN, e))?;
        Self::from_config(built)
    }

    fn from_config(built: Config) -> SimResult<Self> {
        let mut overlay = Vec::new();
        for (table, required) in [(PARAMETERS, true), (OPTIONAL_PARAMETERS, false)] {
            if let Ok(entries) = built.get_table(table) {
                for (key, value) in entries {
                    flatten(&key, &value, required, &mut overlay);
                }
            }
        }
        let settings: SimConfig = built
            .try_deserialize()
            .map_err(|e| config_error(DEFAULT_ORIGIN, e))?;
        debug!(entries = overlay.len(), ?settings, "configuration loaded");
        Ok(Self { settings, overlay })
    }

    /// Writes every overlay entry into `vpt`, in file order.
    pub fn apply_to(&self, vpt: &mut VirtualParameterTree) -> usize {
        self.overlay
            .iter()
            .filter(|e| vpt.set(&e.path, &e.value, e.required, &e.origin))
            .count()
    }
}

fn config_error(location: &str, err: config::ConfigError) -> SimError {
    SimError::InvalidParameter {
        location: location.to_string(),
        reason: err.to_string(),
    }
}

fn flatten(prefix: &str, value: &Value, required: bool, out: &mut Vec<OverlayEntry>) {
    if let ValueKind::Table(table) = &value.kind {
        for (key, child) in table {
            flatten(&format!("{prefix}.{key}"), child, required, out);
        }
        return;
    }
    out.push(OverlayEntry {
        path: prefix.to_string(),
        value: render(value),
        origin: value.origin().unwrap_or(DEFAULT_ORIGIN).to_string(),
        required,
    });
}

/// Renders a leaf value in the parameter string grammar.
fn render(value: &Value) -> String {
    match &value.kind {
        ValueKind::Nil => String::new(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::I64(n) => n.to_string(),
        ValueKind::I128(n) => n.to_string(),
        ValueKind::U64(n) => n.to_string(),
        ValueKind::U128(n) => n.to_string(),
        ValueKind::Float(f) => f.to_string(),
        ValueKind::String(s) => s.clone(),
        ValueKind::Array(items) => {
            let inner: Vec<String> = items.iter().map(render).collect();
            format!("[{}]", inner.join(", "))
        }
        ValueKind::Table(table) => {
            let inner: Vec<String> = table.iter().map(|(k, v)| format!("{k}: {}", render(v))).collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}
