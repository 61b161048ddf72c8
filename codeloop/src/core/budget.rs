//! Retry budget for model-assisted repairs.

use serde::Serialize;

/// Bounded count of generation attempts allowed per requirement.
///
/// Every failed attempt consumes one unit. The budget is exhausted when the
/// failure that used the last unit is recorded; no further generation call is
/// made after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryBudget {
    initial: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            remaining: initial,
        }
    }

    pub fn initial(&self) -> u32 {
        self.initial
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Failed attempts recorded since the last reset.
    pub fn used(&self) -> u32 {
        self.initial - self.remaining
    }

    /// Record one failed attempt. Returns `true` while another attempt is allowed.
    pub fn consume(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        !self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn reset(&mut self) {
        self.remaining = self.initial;
    }
}
