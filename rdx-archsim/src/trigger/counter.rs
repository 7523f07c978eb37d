//! One-shot threshold watch over a [`Counter`].

use crate::stats::Counter;

/// Fires once when the watched counter reaches a threshold.
///
/// Cloning copies the fired/active state, so a clone of a spent trigger is
/// spent too.
#[derive(Debug, Clone)]
pub struct CounterTrigger {
    name: String,
    counter: Counter,
    threshold: u64,
    fired: bool,
    active: bool,
}

impl CounterTrigger {
    pub fn new(name: &str, counter: Counter, threshold: u64) -> Self {
        Self {
            name: name.to_string(),
            counter,
            threshold,
            fired: false,
            active: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Returns `true` exactly once: on the first check with the counter at
    /// or above the threshold.
    pub fn check(&mut self) -> bool {
        if !self.active || self.counter.get() < self.threshold {
            return false;
        }
        self.fired = true;
        self.active = false;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stops watching without firing.
    pub fn deactivate(&mut self) {
        self.active = false;
    }
}
