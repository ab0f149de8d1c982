//! An implementation of the "decorrelated jitter" algorithm for scheduling retries.
//!
//! See [`RetryDelay`] for more information.

use crate::RngExt as _;
use rand::Rng;
use std::time::Duration;

/// An implementation for retrying a remote operation based on a
/// decorrelated-jitter schedule.
///
/// The algorithm used here has several desirable properties:
///    * It is randomized, so that multiple timeouts don't have a danger of
///      getting synchronized with each other and hammering the same
///      relays all at once.
///    * It tends on average to wait longer and longer over time, so that
///      if the relay is down, it won't get pummeled by a zillion failing
///      clients when it comes back up.
///    * It has a chance of retrying promptly, which results in better
///      client performance on average.
#[derive(Clone, Debug)]
pub struct RetryDelay {
    /// The last delay that this retry delay returned (in msec), or 0
    /// if this never returned a delay.
    last_delay_ms: u32,
    /// The lowest allowable delay (in msec).
    low_bound_ms: u32,
}

/// Lowest possible lower bound, in milliseconds.
const MIN_LOW_BOUND: u32 = 1000;

/// Largest possible lower bound, in milliseconds.
const MAX_LOW_BOUND: u32 = u32::MAX - 1;

/// Maximum amount to multiply the previous delay by.
const MAX_DELAY_MULT: u32 = 3;

impl RetryDelay {
    /// Construct a new RetryDelay from a given base delay in
    /// milliseconds.
    ///
    /// The base delay defines the lowest possible interval that can
    /// be returned.
    ///
    /// If the base delay is less than 1000 msec, a base delay of 1000
    /// msec is used instead.
    pub fn from_msec(base_delay_msec: u32) -> Self {
        let low_bound_ms = base_delay_msec.clamp(MIN_LOW_BOUND, MAX_LOW_BOUND);
        RetryDelay {
            last_delay_ms: 0,
            low_bound_ms,
        }
    }

    /// Construct a new RetryDelay from a given base delay.
    ///
    /// See [`RetryDelay::from_msec`] for more information.
    pub fn from_duration(d: Duration) -> Self {
        let msec = d.as_millis();
        let msec = std::cmp::min(msec, u128::from(MAX_LOW_BOUND)) as u32;
        RetryDelay::from_msec(msec)
    }

    /// Helper: return a lower and upper bound for the next delay to
    /// be yielded, in milliseconds.
    fn delay_bounds(&self) -> (u32, u32) {
        let low = self.low_bound_ms;
        let high = std::cmp::max(
            low.saturating_add(1),
            self.last_delay_ms.saturating_mul(MAX_DELAY_MULT),
        );
        (low, high)
    }

    /// Return the next delay to be used (in milliseconds), according
    /// to a given random number generator.
    fn next_delay_msec<R: Rng>(&mut self, rng: &mut R) -> u32 {
        let (low, high) = self.delay_bounds();
        debug_assert!(low < high);

        let val = rng
            .gen_range_checked(low..high)
            .expect("delay_bounds logic error");
        self.last_delay_ms = val;
        val
    }

    /// Return the next delay to be used, according to a given random
    /// number generator.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        Duration::from_millis(u64::from(self.next_delay_msec(rng)))
    }

    /// Return this `RetryDelay` to its original state.
    pub fn reset(&mut self) {
        self.last_delay_ms = 0;
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::from_msec(0)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_rng::testing_rng;

    #[test]
    fn bounds() {
        let mut rd = RetryDelay::from_msec(2000);
        assert_eq!(rd.delay_bounds(), (2000, 2001));
        rd.last_delay_ms = 4000;
        assert_eq!(rd.delay_bounds(), (2000, 12000));

        // The lower bound is clamped.
        let rd = RetryDelay::from_msec(0);
        assert_eq!(rd.delay_bounds(), (1000, 1001));
        let rd = RetryDelay::from_duration(Duration::from_millis(50));
        assert_eq!(rd.delay_bounds(), (1000, 1001));
    }

    #[test]
    fn rounds() {
        let mut rng = testing_rng();
        let mut rd = RetryDelay::from_msec(1000);

        let mut last = 0;
        for _ in 0..100 {
            let (low, high) = rd.delay_bounds();
            assert!(low >= 1000);
            assert!(high > low);
            if last > 0 {
                assert_eq!(high, std::cmp::max(low + 1, last * 3));
            }
            last = rd.next_delay_msec(&mut rng);
            assert!(last >= low);
            assert!(last < high);
        }

        rd.reset();
        assert_eq!(rd.delay_bounds(), (1000, 1001));
    }
}
