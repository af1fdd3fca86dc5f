//! Adaptive scheduling of pending-list sweeps.
//!
//! Sweeping the pending list is O(n) and mostly unproductive when called
//! on every collection, so it runs on a decaying ticker whose period
//! adapts to the fraction each sweep reclaims:
//!
//! ```text
//! fraction < threshold          → rate *= 2       (back off)
//! fraction > 1.5 × threshold    → rate = max(1, rate / 2)
//! ```

use super::Allocator;
use crate::config::INITIAL_DEALLOC_RATE;

/// Decaying ticker deciding when to call [`Allocator::sweep_pending`].
#[derive(Debug, Clone)]
pub struct AdaptiveSweeper {
    threshold: f64,
    rate: u32,
    ticker: u32,
    calls: u64,
    fraction_sum: f64,
}

impl AdaptiveSweeper {
    /// Creates a sweeper with the given reclaimed-fraction threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            rate: INITIAL_DEALLOC_RATE,
            ticker: INITIAL_DEALLOC_RATE,
            calls: 0,
            fraction_sum: 0.0,
        }
    }

    /// Current period, in collections, between sweeps.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Sweeps performed so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Average fraction reclaimed per sweep.
    pub fn average_fraction(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.fraction_sum / self.calls as f64
        }
    }

    /// Counts one collection and sweeps `allocator` if the ticker expired.
    ///
    /// Returns the sweep result when a sweep ran.
    pub fn tick<A: Allocator + ?Sized>(&mut self, allocator: &mut A) -> Option<Option<f64>> {
        self.ticker = self.ticker.saturating_sub(1);
        if self.ticker > 0 {
            return None;
        }
        let swept = allocator.sweep_pending();
        self.record(swept);
        Some(swept)
    }

    /// Adapts the rate to one sweep's result and rearms the ticker.
    pub fn record(&mut self, swept: Option<f64>) {
        let fraction = swept.unwrap_or(0.0);
        self.calls += 1;
        self.fraction_sum += fraction;

        let previous = self.rate;
        if fraction < self.threshold {
            self.rate = self.rate.saturating_mul(2);
        } else if fraction > self.threshold * 1.5 {
            self.rate = (self.rate / 2).max(1);
        }
        if self.rate != previous {
            tracing::debug!(fraction, rate = self.rate, "pending sweep rate changed");
        }
        self.ticker = self.rate;
    }
}
