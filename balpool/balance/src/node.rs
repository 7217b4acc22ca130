use std::sync::atomic::{AtomicU64, Ordering};

/// A node payload with a base cost and a transiently penalized cost.
#[derive(Debug)]
pub struct BalanceNode<T> {
    value: T,
    cost: u64,
    effective_cost: AtomicU64,
}

impl<T> BalanceNode<T> {
    /// Costs below 1 are clamped to 1.
    pub fn new(value: T, cost: u64) -> Self {
        let cost = cost.max(1);
        Self {
            value,
            cost,
            effective_cost: AtomicU64::new(cost),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn effective_cost(&self) -> u64 {
        self.effective_cost.load(Ordering::Relaxed)
    }

    pub(crate) fn weight(&self) -> f64 {
        1.0 / self.effective_cost().max(1) as f64
    }

    pub(crate) fn penalize(&self, cost: u64) {
        self.effective_cost.store(cost.max(1), Ordering::Relaxed);
    }

    pub(crate) fn reset_cost(&self) {
        self.effective_cost.store(self.cost, Ordering::Relaxed);
    }
}
