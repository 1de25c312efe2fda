//! Permit-based flow control.
//!
//! A channel advertises a permit budget to the server when it opens a
//! flow-controlled stream. The event tracking and tabular query streams
//! replenish by re-sending their request frame every time half the budget has
//! been consumed; the command and query provider streams declare their budget
//! once and never replenish.

/// Tracks a permit budget and decides when a replenishment is due.
#[derive(Debug)]
pub struct FlowController {
    permits: u64,
    refresh_every: u64,
    until_refresh: u64,
}

impl FlowController {
    /// Controller for the given budget. Budgets below 2 never replenish.
    pub fn new(permits: u64) -> Self {
        let refresh_every = permits / 2;
        Self {
            permits,
            refresh_every,
            until_refresh: refresh_every,
        }
    }

    /// The declared budget.
    pub fn permits(&self) -> u64 {
        self.permits
    }

    /// Record one delivered frame. Returns true when a replenishment signal
    /// should be emitted.
    pub fn record_delivery(&mut self) -> bool {
        if self.refresh_every == 0 {
            return false;
        }
        self.until_refresh -= 1;
        if self.until_refresh == 0 {
            self.until_refresh = self.refresh_every;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenishes_every_half_budget() {
        let mut flow = FlowController::new(10);

        // Every 5th delivery out of 20.
        let due = (0..20).filter(|_| flow.record_delivery()).count();
        assert_eq!(due, 4);
    }

    #[test]
    fn replenishes_after_fifth_and_tenth_delivery() {
        let mut flow = FlowController::new(10);

        for i in 1..=10 {
            let due = flow.record_delivery();
            assert_eq!(due, i == 5 || i == 10, "delivery {i}");
        }
    }

    #[test]
    fn tiny_budget_never_replenishes() {
        let mut flow = FlowController::new(1);
        for _ in 0..100 {
            assert!(!flow.record_delivery());
        }
    }

    #[test]
    fn odd_budget_rounds_down() {
        let mut flow = FlowController::new(7);
        let due = (0..6).filter(|_| flow.record_delivery()).count();
        assert_eq!(due, 2); // after the 3rd and 6th
    }
}
