//! One-shot watch over a compiled [`Expression`].

use crate::common::Tick;
use crate::stats::Expression;

#[derive(Debug, Clone)]
pub struct ExpressionTrigger {
    expr: Expression,
    fired: bool,
    active: bool,
}

impl ExpressionTrigger {
    pub fn new(expr: Expression) -> Self {
        Self {
            expr,
            fired: false,
            active: true,
        }
    }

    pub fn text(&self) -> &str {
        self.expr.text()
    }

    /// Returns `true` the first time the expression holds at `tick`.
    pub fn check(&mut self, tick: Tick) -> bool {
        if !self.active || !self.expr.is_true(tick) {
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

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}
