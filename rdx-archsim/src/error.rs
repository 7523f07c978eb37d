//! The crate-wide error type.
//!
//! Every fallible framework operation returns [`SimResult`]. User callbacks
//! (event handlers, observers, triggerables) return `anyhow::Result<()>`; the
//! scheduler recovers a [`SimError`] from them when one is inside, and wraps
//! anything else as [`SimError::FatalRuntime`].

use crate::common::{Tick, TreePhase};
use thiserror::Error;

pub type SimResult<T> = Result<T, SimError>;

/// Flat classification of [`SimError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Phase,
    NameCollision,
    InvalidPath,
    NotFound,
    TypeMismatch,
    InvalidParameter,
    UnreadParameter,
    UnmatchedRequired,
    DagCycle,
    PortUnbound,
    Binding,
    SendAfterFinalize,
    HandlerDuringWrongPhase,
    PrivacyViolation,
    Timeout,
    FatalRuntime,
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("phase error at '{location}': {message} (phase {phase})")]
    Phase {
        location: String,
        phase: TreePhase,
        message: String,
    },

    #[error("name collision under '{parent}': {name} {reason}")]
    NameCollision {
        parent: String,
        name: String,
        reason: String,
    },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("'{path}' not found from '{origin}'")]
    NotFound { origin: String, path: String },

    #[error("type mismatch at '{location}': expected {expected}, found {found}")]
    TypeMismatch {
        location: String,
        expected: String,
        found: String,
    },

    #[error("invalid value for parameter '{location}': {reason}")]
    InvalidParameter { location: String, reason: String },

    #[error("parameters set but never read: {}", .locations.join(", "))]
    UnreadParameter { locations: Vec<String> },

    #[error("required configuration entries matched no parameter: {}", .paths.join(", "))]
    UnmatchedRequired { paths: Vec<String> },

    #[error("scheduling cycle detected: {}", .cycle.join(" -> "))]
    DagCycle { cycle: Vec<String> },

    #[error("port '{location}' is not bound")]
    PortUnbound { location: String },

    #[error("cannot bind '{from}' to '{to}': {reason}")]
    Binding {
        from: String,
        to: String,
        reason: String,
    },

    #[error("cannot schedule '{label}': {reason}")]
    SendAfterFinalize { label: String, reason: String },

    #[error("'{label}' scheduled for {target} at tick {tick} while dispatching {current}")]
    HandlerDuringWrongPhase {
        label: String,
        tick: Tick,
        target: String,
        current: String,
    },

    #[error("'{path}' is inside a private subtree not visible from '{origin}'")]
    PrivacyViolation { origin: String, path: String },

    #[error("simulation timed out after {seconds:.3}s ({clock} clock) at tick {tick}")]
    Timeout {
        seconds: f64,
        clock: &'static str,
        tick: Tick,
    },

    #[error("runtime failure in '{label}' at tick {tick}: {source}")]
    FatalRuntime {
        label: String,
        tick: Tick,
        #[source]
        source: anyhow::Error,
    },
}

impl SimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::Phase { .. } => ErrorKind::Phase,
            SimError::NameCollision { .. } => ErrorKind::NameCollision,
            SimError::InvalidPath { .. } => ErrorKind::InvalidPath,
            SimError::NotFound { .. } => ErrorKind::NotFound,
            SimError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            SimError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            SimError::UnreadParameter { .. } => ErrorKind::UnreadParameter,
            SimError::UnmatchedRequired { .. } => ErrorKind::UnmatchedRequired,
            SimError::DagCycle { .. } => ErrorKind::DagCycle,
            SimError::PortUnbound { .. } => ErrorKind::PortUnbound,
            SimError::Binding { .. } => ErrorKind::Binding,
            SimError::SendAfterFinalize { .. } => ErrorKind::SendAfterFinalize,
            SimError::HandlerDuringWrongPhase { .. } => ErrorKind::HandlerDuringWrongPhase,
            SimError::PrivacyViolation { .. } => ErrorKind::PrivacyViolation,
            SimError::Timeout { .. } => ErrorKind::Timeout,
            SimError::FatalRuntime { .. } => ErrorKind::FatalRuntime,
        }
    }

    /// Errors that can only be raised while a model is being assembled.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Phase
                | ErrorKind::NameCollision
                | ErrorKind::InvalidPath
                | ErrorKind::NotFound
                | ErrorKind::TypeMismatch
                | ErrorKind::InvalidParameter
                | ErrorKind::UnreadParameter
                | ErrorKind::UnmatchedRequired
                | ErrorKind::DagCycle
                | ErrorKind::Binding
                | ErrorKind::PrivacyViolation
        )
    }

    /// Process exit code an embedder should report for this error.
    pub fn exit_code(&self) -> i32 {
        if self.is_configuration_error() {
            1
        } else {
            2
        }
    }

    pub(crate) fn phase(location: impl Into<String>, phase: TreePhase, message: impl Into<String>) -> Self {
        SimError::Phase {
            location: location.into(),
            phase,
            message: message.into(),
        }
    }

    /// Recovers a framework error carried inside a user callback failure, or
    /// wraps the failure as a fatal runtime error.
    pub(crate) fn from_callback(err: anyhow::Error, label: &str, tick: Tick) -> Self {
        match err.downcast::<SimError>() {
            Ok(sim) => sim,
            Err(source) => SimError::FatalRuntime {
                label: label.to_string(),
                tick,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_errors_keep_their_framework_kind() {
        let inner = SimError::PortUnbound {
            location: "top.a.ports.out".into(),
        };
        let wrapped = anyhow::Error::from(inner);
        let recovered = SimError::from_callback(wrapped, "top.a.ev", 4);
        assert_eq!(recovered.kind(), ErrorKind::PortUnbound);
    }

    #[test]
    fn foreign_callback_errors_become_fatal() {
        let recovered = SimError::from_callback(anyhow::anyhow!("boom"), "top.a.ev", 9);
        match recovered {
            SimError::FatalRuntime { label, tick, .. } => {
                assert_eq!(label, "top.a.ev");
                assert_eq!(tick, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_codes_split_configuration_from_runtime() {
        let cfg = SimError::UnmatchedRequired {
            paths: vec!["top.x".into()],
        };
        assert_eq!(cfg.exit_code(), 1);
        let run = SimError::Timeout {
            seconds: 1.0,
            clock: "wall",
            tick: 3,
        };
        assert_eq!(run.exit_code(), 2);
    }
}
