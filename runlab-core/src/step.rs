//! Global step counter.
//!
//! Monotonic within an uninterrupted run by convention only: restoring a
//! checkpoint may legitimately move it backwards.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStepCounter {
    current: u64,
}

impl GlobalStepCounter {
    pub fn new(start: u64) -> Self {
        Self { current: start }
    }

    pub fn get(&self) -> u64 {
        self.current
    }

    pub fn set(&mut self, step: u64) {
        if step < self.current {
            tracing::debug!(from = self.current, to = step, "Global step moved backwards");
        }
        self.current = step;
    }

    /// Move by `delta`, saturating at zero and `u64::MAX`.
    pub fn add(&mut self, delta: i64) {
        self.current = self.current.saturating_add_signed(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_allows_backward_moves() {
        let mut counter = GlobalStepCounter::new(100);
        counter.set(40);
        assert_eq!(counter.get(), 40);
    }

    #[test]
    fn test_add_saturates() {
        let mut counter = GlobalStepCounter::default();
        counter.add(5);
        counter.add(-2);
        assert_eq!(counter.get(), 3);
        counter.add(-10);
        assert_eq!(counter.get(), 0);
    }
}
