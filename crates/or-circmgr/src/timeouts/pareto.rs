//! Implement a sort-of-Pareto estimator for circuit build timeouts.
//!
//! Our build times don't truly follow a Pareto distribution, but
//! they seem to be closer to one than to anything else tractable,
//! and we only care about the right tail, so Pareto it is.
//!
//! The overall approach: keep a history of how long circuits took to
//! reach their "significant" hop (the third), fit a Pareto
//! distribution to that history, and declare the timeout to be a
//! configured quantile of the fitted distribution.  If too many
//! circuits start timing out in a row, assume the network changed
//! underneath us and start over.

use super::TimeoutEstimator;
use or_netdir::NetParameters;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// How many circuit build time observations do we record?
const TIME_HISTORY_LEN: usize = 1000;

/// How many circuit success-versus-timeout observations do we record?
const SUCCESS_HISTORY_LEN: usize = 20;

/// How many timeouts out of SUCCESS_HISTORY_LEN make us discard our
/// history as stale?
const MAX_RECENT_TIMEOUTS: usize = 18;

/// How many milliseconds wide is each bucket in our histogram?
const BUCKET_WIDTH_MSEC: u32 = 10;

/// How many of the most common histogram buckets do we average to
/// find the distribution's base value Xm?
const N_MODES: usize = 3;

/// A circuit build time, measured in milliseconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct MsecDuration(u32);

impl MsecDuration {
    /// Convert a Duration into a MsecDuration, saturating extra-high
    /// values.
    fn new_saturating(d: &Duration) -> Self {
        let msec = std::cmp::min(d.as_millis(), u128::from(u32::MAX)) as u32;
        MsecDuration(msec)
    }

    /// Return the center of the histogram bucket this value falls
    /// into.
    fn bucket_center(&self) -> MsecDuration {
        let idx = self.0 / BUCKET_WIDTH_MSEC;
        MsecDuration(idx * BUCKET_WIDTH_MSEC + BUCKET_WIDTH_MSEC / 2)
    }
}

/// Configuration for the estimator, as derived from the consensus.
#[derive(Clone, Debug)]
pub(crate) struct Params {
    /// Minimum number of observations before our timeouts adapt.
    min_observations: u16,
    /// Which hop (zero-based) is the "significant" one whose
    /// completion time we measure?
    significant_hop: u8,
    /// Quantile of the fitted distribution to use as the timeout.
    timeout_quantile: f64,
    /// Quantile of the fitted distribution past which we abandon a
    /// circuit entirely.
    abandon_quantile: f64,
    /// Timeout to use before we have enough data.
    default_timeout: Duration,
    /// Lowest permissible timeout value.
    min_timeout: Duration,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            min_observations: 100,
            significant_hop: 2,
            timeout_quantile: 0.80,
            abandon_quantile: 0.99,
            default_timeout: Duration::from_secs(60),
            min_timeout: Duration::from_millis(1500),
        }
    }
}

impl From<&NetParameters> for Params {
    fn from(p: &NetParameters) -> Params {
        Params {
            min_observations: p.cbt_min_circs_for_estimate,
            significant_hop: 2,
            timeout_quantile: f64::from(p.cbt_timeout_quantile) / 100.0,
            abandon_quantile: f64::from(p.cbt_abandon_quantile) / 100.0,
            default_timeout: p.cbt_initial_timeout,
            min_timeout: p.cbt_min_timeout,
        }
    }
}

/// A Pareto distribution, as fitted to our observations.
#[derive(Debug, Clone, Copy)]
struct ParetoDist {
    /// The lower bound of the distribution.
    x_m: f64,
    /// The shape parameter.
    alpha: f64,
}

impl ParetoDist {
    /// Compute an inverse CDF for this distribution: the value `v`
    /// such that a fraction `q` of the distribution is expected to
    /// fall below `v`.
    fn quantile(&self, q: f64) -> f64 {
        let q = q.clamp(0.0, 0.999_999);
        self.x_m / ((1.0 - q).powf(1.0 / self.alpha))
    }
}

/// A sort-of-Pareto estimator for circuit build timeouts.
pub(crate) struct ParetoTimeoutEstimator {
    /// Our most recent observed circuit construction times.
    time_history: VecDeque<MsecDuration>,
    /// Our most recent circuit timeout statuses: true for a success,
    /// false for a timeout.
    success_history: VecDeque<bool>,
    /// Cached computed timeouts, invalidated whenever an observation
    /// arrives.
    timeout_cache: Option<(Duration, Duration)>,
    /// Configuration values.
    params: Params,
}

impl Default for ParetoTimeoutEstimator {
    fn default() -> Self {
        ParetoTimeoutEstimator {
            time_history: VecDeque::new(),
            success_history: VecDeque::new(),
            timeout_cache: None,
            params: Params::default(),
        }
    }
}

impl ParetoTimeoutEstimator {
    /// Add a build-time observation.
    fn add_time(&mut self, time: MsecDuration) {
        while self.time_history.len() >= TIME_HISTORY_LEN {
            self.time_history.pop_front();
        }
        self.time_history.push_back(time);
        self.timeout_cache = None;
    }

    /// Add a success-or-timeout observation, clearing our state if
    /// the network seems to have changed under us.
    fn add_success(&mut self, success: bool) {
        while self.success_history.len() >= SUCCESS_HISTORY_LEN {
            self.success_history.pop_front();
        }
        self.success_history.push_back(success);

        let n_timeouts = self.success_history.iter().filter(|b| !**b).count();
        if n_timeouts >= MAX_RECENT_TIMEOUTS {
            debug!("Too many circuit timeouts in a row; resetting timeout history");
            self.time_history.clear();
            self.success_history.clear();
            self.timeout_cache = None;
        }
    }

    /// Try to fit a Pareto distribution to our history.
    ///
    /// Returns None if we do not have enough data.
    fn pareto_estimate(&self) -> Option<ParetoDist> {
        if self.time_history.len() < usize::from(self.params.min_observations) {
            return None;
        }

        // Find Xm: the average of the N_MODES most common bucket
        // centers.
        let mut counts: std::collections::BTreeMap<MsecDuration, u32> = Default::default();
        for t in &self.time_history {
            *counts.entry(t.bucket_center()).or_insert(0) += 1;
        }
        let mut buckets: Vec<(u32, MsecDuration)> =
            counts.into_iter().map(|(d, n)| (n, d)).collect();
        buckets.sort_by(|a, b| b.cmp(a)); // most common first.
        let n_modes = std::cmp::min(N_MODES, buckets.len());
        let x_m =
            f64::from(buckets[..n_modes].iter().map(|(_, d)| d.0).sum::<u32>()) / n_modes as f64;
        if x_m <= 0.0 {
            return None;
        }

        // Estimate alpha over the tail above Xm; observations below
        // Xm are counted as if they were at Xm, as in the reference
        // implementation.
        let n = self.time_history.len() as f64;
        let log_sum: f64 = self
            .time_history
            .iter()
            .map(|t| f64::from(t.0).max(x_m).ln())
            .sum();
        let denominator = log_sum - n * x_m.ln();
        if denominator <= 0.0 {
            return None;
        }
        let alpha = n / denominator;

        Some(ParetoDist { x_m, alpha })
    }
}

impl TimeoutEstimator for ParetoTimeoutEstimator {
    fn note_hop_completed(&mut self, hop: u8, delay: Duration, is_last: bool) {
        if hop == self.params.significant_hop {
            let time = MsecDuration::new_saturating(&delay);
            self.add_time(time);
        }
        if is_last {
            self.add_success(true);
        }
    }

    fn note_circ_timeout(&mut self, hop: u8, _delay: Duration) {
        if hop > 0 {
            self.add_success(false);
        }
    }

    fn timeouts(&mut self) -> (Duration, Duration) {
        if let Some(cached) = self.timeout_cache {
            return cached;
        }
        let thresholds = match self.pareto_estimate() {
            Some(dist) => {
                let timeout = Duration::from_millis(
                    dist.quantile(self.params.timeout_quantile).ceil() as u64,
                )
                .max(self.params.min_timeout);
                let abandon = Duration::from_millis(
                    dist.quantile(self.params.abandon_quantile).ceil() as u64,
                )
                .max(timeout);
                (timeout, abandon)
            }
            None => (self.params.default_timeout, self.params.default_timeout),
        };
        self.timeout_cache = Some(thresholds);
        thresholds
    }

    fn learning_timeouts(&self) -> bool {
        self.time_history.len() < usize::from(self.params.min_observations)
    }

    fn update_params(&mut self, params: &NetParameters) {
        self.params = params.into();
        self.timeout_cache = None;
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// Feed the estimator `n` third-hop observations of `msec`
    /// milliseconds each, plus jitter.
    fn feed(est: &mut ParetoTimeoutEstimator, n: usize, msec: u64) {
        for i in 0..n {
            let jitter = (i % 10) as u64;
            est.note_hop_completed(2, Duration::from_millis(msec + jitter), true);
        }
    }

    #[test]
    fn uses_default_until_trained() {
        let mut est = ParetoTimeoutEstimator::default();
        assert!(est.learning_timeouts());
        assert_eq!(est.timeouts().0, Duration::from_secs(60));

        feed(&mut est, 99, 300);
        assert!(est.learning_timeouts());
        feed(&mut est, 1, 300);
        assert!(!est.learning_timeouts());
        assert_ne!(est.timeouts().0, Duration::from_secs(60));
    }

    #[test]
    fn estimates_are_plausible() {
        let mut est = ParetoTimeoutEstimator::default();
        feed(&mut est, 500, 300);
        let (timeout, abandon) = est.timeouts();
        // The timeout should be at least our minimum, above the
        // typical build time, and the abandon threshold can't be
        // below the timeout.
        assert!(timeout >= Duration::from_millis(1500));
        assert!(abandon >= timeout);
        // And it shouldn't be wildly larger than the observed times.
        assert!(timeout < Duration::from_secs(60));
    }

    #[test]
    fn faster_network_lowers_timeout() {
        let mut slow = ParetoTimeoutEstimator::default();
        feed(&mut slow, 500, 2000);
        let mut fast = ParetoTimeoutEstimator::default();
        feed(&mut fast, 500, 200);
        assert!(fast.timeouts().0 < slow.timeouts().0);
    }

    #[test]
    fn resets_after_too_many_timeouts() {
        let mut est = ParetoTimeoutEstimator::default();
        feed(&mut est, 500, 300);
        assert!(!est.learning_timeouts());

        for _ in 0..MAX_RECENT_TIMEOUTS {
            est.note_circ_timeout(2, Duration::from_secs(60));
        }
        // History was discarded: back to learning.
        assert!(est.learning_timeouts());
        assert_eq!(est.timeouts().0, Duration::from_secs(60));
    }

    #[test]
    fn quantiles_are_ordered() {
        let dist = ParetoDist {
            x_m: 100.0,
            alpha: 2.0,
        };
        let q50 = dist.quantile(0.5);
        let q80 = dist.quantile(0.8);
        let q99 = dist.quantile(0.99);
        assert!(q50 >= 100.0);
        assert!(q50 < q80);
        assert!(q80 < q99);
    }
}
