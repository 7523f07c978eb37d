//! # Archsim
//!
//! A phased, tick-accurate discrete-event framework for hardware models.
//!
//! Archsim provides the scaffolding cycle-accurate simulators are built on:
//! a hierarchical component tree with a strict lifecycle, typed parameters
//! fed from a wildcard overlay, a phase-ordered event scheduler, and a port
//! and notification fabric that routes values between components.
//!
//! ## Core Concepts
//!
//! - **Tree**: named nodes under a `top` root, moving through
//!   building, configuring, finalizing, finalized and teardown.
//! - **Parameters**: typed cells under each resource's `params` node, set from
//!   the [`vpt::VirtualParameterTree`] overlay when the tree finalizes.
//! - **Resources**: user behavior attached to nodes and built by named
//!   factories.
//! - **Scheduler**: time advances in ticks; each tick runs the phases
//!   TRIGGER, UPDATE, PORT_UPDATE, FLUSH, COLLECTION, TICK and POST_TICK,
//!   ordered inside a phase by a dependency DAG.
//! - **Ports and notifications**: typed, delayed point-to-point delivery and
//!   synchronous multi-observer publication.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use archsim::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut sim = Simulation::new("top")?;
//!     archsim::demo::register_factories(&mut sim)?;
//!     let pipeline = archsim::demo::build_pipeline(&mut sim, 2)?;
//!     sim.vpt_mut().set("top.core*.alu.params.latency", "3", true, "example");
//!
//!     sim.enter_configuring()?;
//!     sim.enter_finalized()?;
//!     sim.finalize_scheduler()?;
//!     pipeline.arm(&mut sim)?;
//!
//!     let summary = sim.run(1_000)?;
//!     println!("{summary}");
//!     sim.enter_teardown()?;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Archsim";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod common;
pub mod config;
pub mod demo;
pub mod error;
pub mod events;
pub mod notify;
pub mod params;
pub mod pattern;
pub mod ports;
pub mod resource;
pub mod sched;
pub mod sim;
pub mod stats;
pub mod tree;
pub mod trigger;
pub mod vpt;

/// A prelude module for easy importing of the most common Archsim types.
pub mod prelude {
    pub use crate::common::{ClockId, Cycle, EventId, NodeId, SchedulingPhase, Tick, TreePhase};
    pub use crate::config::{ConfigFile, Policy, SimConfig};
    pub use crate::error::{ErrorKind, SimError, SimResult};
    pub use crate::events::SystemEvent;
    pub use crate::notify::{MirrorSource, NotificationSource, ObservationState};
    pub use crate::params::{ParameterDef, ParameterSet};
    pub use crate::ports::{InPort, InPortSpec, OutPort, OutPortSpec};
    pub use crate::resource::{BindContext, Resource, ResourceContext, ResourceFactory};
    pub use crate::sched::{EventSpec, RunSummary, Scheduler, StopReason};
    pub use crate::sim::Simulation;
    pub use crate::stats::{Counter, Statistic};
    pub use crate::tree::{NodeKind, NodeSpec, Tree};
    pub use crate::trigger::{Trigger, TriggerPoint, Triggerable};
    pub use crate::vpt::VirtualParameterTree;
}
