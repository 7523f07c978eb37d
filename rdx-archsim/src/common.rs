//! Contains common, primitive types shared by every subsystem.
//!
//! This module defines the arena keys used to identify nodes, events, clocks,
//! ports and notification sources, as well as the two phase enumerations that
//! drive the framework: the tree lifecycle phase and the per-tick scheduling
//! phase. Using distinct key types keeps the subsystems from accidentally
//! mixing handles.

use serde::Deserialize;
use slotmap::new_key_type;
use std::fmt;

/// The atomic unit of simulated time.
pub type Tick = u64;

/// A count of cycles on a particular clock.
pub type Cycle = u64;

new_key_type! {
    /// Identifies a node in the component tree.
    pub struct NodeId;

    /// Identifies an event registered with the scheduler.
    pub struct EventId;

    /// Identifies a clock in the clock tree.
    pub struct ClockId;

    /// Identifies a data or signal port.
    pub struct PortId;

    /// Identifies a notification source (concrete or mirror).
    pub struct SourceId;

    /// Identifies one observer attachment on a notification source.
    pub struct ObserverId;

    /// Identifies a registered observation-state callback.
    pub struct CallbackId;

    /// Identifies a single pending occurrence in the event queue.
    pub struct OccurrenceId;
}

/// Lifecycle phase of a node in the component tree.
///
/// Phases only move forward. Transitions are initiated at a root and applied
/// to every descendant in pre-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TreePhase {
    Building,
    Configuring,
    Finalizing,
    Finalized,
    Teardown,
}

impl TreePhase {
    pub fn label(self) -> &'static str {
        match self {
            TreePhase::Building => "TREE_BUILDING",
            TreePhase::Configuring => "TREE_CONFIGURING",
            TreePhase::Finalizing => "TREE_FINALIZING",
            TreePhase::Finalized => "TREE_FINALIZED",
            TreePhase::Teardown => "TREE_TEARDOWN",
        }
    }

    /// Structural changes (children, tags, aliases) are accepted up to and
    /// including this phase.
    pub fn allows_structure(self) -> bool {
        self <= TreePhase::Configuring
    }
}

impl fmt::Display for TreePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A named sub-slot within a tick. Phases are dispatched in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPhase {
    Trigger,
    Update,
    PortUpdate,
    Flush,
    Collection,
    Tick,
    PostTick,
}

impl SchedulingPhase {
    /// Every phase in dispatch order.
    pub const ALL: [SchedulingPhase; 7] = [
        SchedulingPhase::Trigger,
        SchedulingPhase::Update,
        SchedulingPhase::PortUpdate,
        SchedulingPhase::Flush,
        SchedulingPhase::Collection,
        SchedulingPhase::Tick,
        SchedulingPhase::PostTick,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            SchedulingPhase::Trigger => "TRIGGER",
            SchedulingPhase::Update => "UPDATE",
            SchedulingPhase::PortUpdate => "PORT_UPDATE",
            SchedulingPhase::Flush => "FLUSH",
            SchedulingPhase::Collection => "COLLECTION",
            SchedulingPhase::Tick => "TICK",
            SchedulingPhase::PostTick => "POST_TICK",
        }
    }
}

impl fmt::Display for SchedulingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduling_phases_are_ordered_by_index() {
        for pair in SchedulingPhase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].index() + 1, pair[1].index());
        }
    }

    #[test]
    fn structure_is_frozen_after_configuring() {
        assert!(TreePhase::Building.allows_structure());
        assert!(TreePhase::Configuring.allows_structure());
        assert!(!TreePhase::Finalizing.allows_structure());
    }
}
