//! Multi-rate clocks expressed as rational multiples of the global tick.

use crate::common::{ClockId, Cycle, NodeId, Tick, TreePhase};
use crate::error::{SimError, SimResult};
use slotmap::SlotMap;

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Narrows a widened result, saturating at the end of time.
fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// A clock with a rate of `num / den` relative to its parent.
///
/// The effective rate is the product of all rates from the root down. One
/// cycle lasts `eff_den / eff_num` ticks; cycle `c` begins on tick
/// `ceil(c * eff_den / eff_num)`.
#[derive(Debug, Clone)]
pub struct Clock {
    name: String,
    parent: Option<ClockId>,
    num: u64,
    den: u64,
    eff_num: u64,
    eff_den: u64,
    node: Option<NodeId>,
}

impl Clock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ClockId> {
        self.parent
    }

    /// Rate relative to the parent clock.
    pub fn ratio(&self) -> (u64, u64) {
        (self.num, self.den)
    }

    /// Rate relative to the tick, reduced.
    pub fn effective_ratio(&self) -> (u64, u64) {
        (self.eff_num, self.eff_den)
    }

    /// The `clocks` tree node mirroring this clock, if one was created.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn current_cycle(&self, tick: Tick) -> Cycle {
        saturate((tick as u128 * self.eff_num as u128) / self.eff_den as u128)
    }

    /// First tick of `cycle`.
    pub fn tick_of_cycle(&self, cycle: Cycle) -> Tick {
        let scaled = cycle as u128 * self.eff_den as u128;
        saturate(scaled.div_ceil(self.eff_num as u128))
    }

    pub fn ticks_for_cycles(&self, cycles: Cycle) -> Tick {
        saturate((cycles as u128 * self.eff_den as u128) / self.eff_num as u128)
    }

    /// The first cycle whose edge falls at or after `tick`.
    pub fn next_edge_cycle(&self, tick: Tick) -> Cycle {
        let cycle = self.current_cycle(tick);
        if self.tick_of_cycle(cycle) < tick {
            cycle.saturating_add(1)
        } else {
            cycle
        }
    }

    /// Tick of the edge `delay` cycles after the next edge at or after `now`.
    pub fn tick_after(&self, now: Tick, delay: Cycle) -> Tick {
        self.tick_of_cycle(self.next_edge_cycle(now).saturating_add(delay))
    }
}

#[derive(Debug, Default)]
pub struct ClockTree {
    clocks: SlotMap<ClockId, Clock>,
    frozen: bool,
}

impl ClockTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a root clock running at one cycle per tick.
    pub fn create_root(&mut self, name: &str) -> SimResult<ClockId> {
        self.insert(name, None, 1, 1)
    }

    /// Creates a clock whose rate is `num / den` of `parent`.
    pub fn create(&mut self, name: &str, parent: ClockId, num: u64, den: u64) -> SimResult<ClockId> {
        if !self.clocks.contains_key(parent) {
            return Err(SimError::NotFound {
                origin: "<clocks>".into(),
                path: format!("parent of '{name}'"),
            });
        }
        self.insert(name, Some(parent), num, den)
    }

    fn insert(&mut self, name: &str, parent: Option<ClockId>, num: u64, den: u64) -> SimResult<ClockId> {
        if self.frozen {
            return Err(SimError::phase(
                format!("clocks.{name}"),
                TreePhase::Finalized,
                "clocks cannot be added after the tree is finalized",
            ));
        }
        if num == 0 || den == 0 {
            return Err(SimError::InvalidParameter {
                location: format!("clocks.{name}"),
                reason: format!("rate {num}/{den} must be non-zero"),
            });
        }
        if self.clocks.values().any(|c| c.name == name) {
            return Err(SimError::NameCollision {
                parent: "clocks".into(),
                name: name.to_string(),
                reason: "clock name already in use".into(),
            });
        }
        let (pn, pd) = parent
            .and_then(|p| self.clocks.get(p))
            .map(|p| (p.eff_num, p.eff_den))
            .unwrap_or((1, 1));
        let (en, ed) = (pn as u128 * num as u128, pd as u128 * den as u128);
        let g = gcd(en, ed);
        let (Ok(en), Ok(ed)) = (u64::try_from(en / g), u64::try_from(ed / g)) else {
            return Err(SimError::InvalidParameter {
                location: format!("clocks.{name}"),
                reason: format!("effective rate of {num}/{den} under its parent does not fit in 64 bits"),
            });
        };
        Ok(self.clocks.insert(Clock {
            name: name.to_string(),
            parent,
            num,
            den,
            eff_num: en,
            eff_den: ed,
            node: None,
        }))
    }

    pub fn get(&self, id: ClockId) -> SimResult<&Clock> {
        self.clocks.get(id).ok_or_else(|| SimError::NotFound {
            origin: "<clocks>".into(),
            path: format!("{id:?}"),
        })
    }

    pub fn find(&self, name: &str) -> Option<ClockId> {
        self.clocks
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClockId, &Clock)> {
        self.clocks.iter()
    }

    pub(crate) fn set_node(&mut self, id: ClockId, node: NodeId) {
        if let Some(clock) = self.clocks.get_mut(id) {
            clock.node = Some(node);
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_compose_down_the_tree() {
        let mut tree = ClockTree::new();
        let root = tree.create_root("root").unwrap();
        let half = tree.create("half", root, 1, 2).unwrap();
        let third_of_half = tree.create("slow", half, 2, 3).unwrap();
        let slow = tree.get(third_of_half).unwrap();
        assert_eq!(slow.effective_ratio(), (1, 3));
        assert_eq!(slow.ticks_for_cycles(4), 12);
        assert_eq!(tree.get(half).unwrap().ticks_for_cycles(5), 10);
    }

    #[test]
    fn cycles_are_monotonic_and_edges_align() {
        let mut tree = ClockTree::new();
        let root = tree.create_root("root").unwrap();
        let id = tree.create("odd", root, 2, 3).unwrap();
        let clk = tree.get(id).unwrap();
        let mut last = 0;
        for tick in 0..100 {
            let cycle = clk.current_cycle(tick);
            assert!(cycle >= last);
            last = cycle;
        }
        // edges at 0, 2, 3, 5, 6 for a 2/3 clock
        let edges: Vec<Tick> = (0..5).map(|c| clk.tick_of_cycle(c)).collect();
        assert_eq!(edges, vec![0, 2, 3, 5, 6]);
        assert_eq!(clk.tick_after(1, 0), 2);
        assert_eq!(clk.tick_after(2, 1), 3);
    }

    #[test]
    fn root_rate_is_identity() {
        let mut tree = ClockTree::new();
        let root = tree.create_root("root").unwrap();
        let clk = tree.get(root).unwrap();
        assert_eq!(clk.tick_after(53, 10), 63);
        assert_eq!(clk.current_cycle(17), 17);
    }

    #[test]
    fn frozen_trees_refuse_new_clocks() {
        let mut tree = ClockTree::new();
        let root = tree.create_root("root").unwrap();
        tree.freeze();
        assert!(tree.create("late", root, 1, 1).is_err());
        assert!(tree.create_root("other").is_err());
        assert_eq!(tree.find("root"), Some(root));
    }

    #[test]
    fn nested_fast_rates_are_rejected_when_they_overflow() {
        let mut tree = ClockTree::new();
        let root = tree.create_root("root").unwrap();
        let fast = tree.create("fast", root, 1 << 40, 1).unwrap();
        let err = tree.create("faster", fast, 1 << 40, 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
        // a large ratio that reduces back into range is fine
        let back = tree.create("back", fast, 1, 1 << 40).unwrap();
        assert_eq!(tree.get(back).unwrap().effective_ratio(), (1, 1));
    }

    #[test]
    fn conversions_saturate_instead_of_wrapping() {
        let mut tree = ClockTree::new();
        let root = tree.create_root("root").unwrap();
        let fast = tree.create("fast", root, 1 << 40, 1).unwrap();
        let slow = tree.create("slow", root, 1, 1 << 40).unwrap();
        assert_eq!(tree.get(fast).unwrap().current_cycle(Tick::MAX), Cycle::MAX);
        assert_eq!(tree.get(slow).unwrap().tick_of_cycle(Cycle::MAX), Tick::MAX);
        assert_eq!(tree.get(slow).unwrap().ticks_for_cycles(1 << 30), Tick::MAX);
        assert_eq!(tree.get(root).unwrap().tick_after(Tick::MAX, 5), Tick::MAX);
    }
}
