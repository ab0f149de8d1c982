//! Network parameters from the consensus.
//!
//! The consensus can tune various client behaviors without a software
//! update.  We represent the ones we obey here, each clamped to a
//! sane range.

use std::time::Duration;

/// Parameters applied to the whole network, as voted in the
/// consensus.
///
/// Unknown parameters are ignored; known ones are clamped into their
/// permitted ranges.
#[derive(Clone, Debug)]
pub struct NetParameters {
    /// Initial circuit-level flow-control window, in cells
    /// ("circwindow").
    pub circuit_window: u16,
    /// Halflife for the per-circuit cell-count decay used in
    /// channel write scheduling ("CircuitPriorityHalflifeMsec").
    pub circuit_priority_halflife: Duration,
    /// Initial circuit build timeout, before we have enough data to
    /// adapt ("cbtinitialtimeout", msec).
    pub cbt_initial_timeout: Duration,
    /// Lowest permitted adaptive circuit build timeout
    /// ("cbtmintimeout", msec).
    pub cbt_min_timeout: Duration,
    /// Quantile of past build times used as the new timeout,
    /// in percent ("cbtquantile").
    pub cbt_timeout_quantile: u8,
    /// Quantile of past build times after which we stop even
    /// measuring a circuit, in percent ("cbtclosequantile").
    pub cbt_abandon_quantile: u8,
    /// Number of circuit build times to observe before adapting
    /// ("cbtmincircs").
    pub cbt_min_circs_for_estimate: u16,
}

impl Default for NetParameters {
    fn default() -> Self {
        NetParameters {
            circuit_window: 1000,
            circuit_priority_halflife: Duration::from_secs(30),
            cbt_initial_timeout: Duration::from_secs(60),
            cbt_min_timeout: Duration::from_millis(1500),
            cbt_timeout_quantile: 80,
            cbt_abandon_quantile: 99,
            cbt_min_circs_for_estimate: 100,
        }
    }
}

/// Helper: clamp `v` into `lo..=hi`.
fn clamp(v: i64, lo: i64, hi: i64) -> i64 {
    v.clamp(lo, hi)
}

impl NetParameters {
    /// Update this set of parameters from an iterator of raw
    /// `(keyword, value)` pairs as they appear in the consensus.
    ///
    /// Unrecognized keywords are ignored, so that old clients keep
    /// working when new parameters appear.
    pub fn saturating_update<'a, I>(&mut self, iter: I)
    where
        I: Iterator<Item = (&'a str, i64)>,
    {
        for (k, v) in iter {
            match k {
                "circwindow" => {
                    self.circuit_window = clamp(v, 100, 1000) as u16;
                }
                "CircuitPriorityHalflifeMsec" => {
                    self.circuit_priority_halflife =
                        Duration::from_millis(clamp(v, 1, 86_400_000) as u64);
                }
                "cbtinitialtimeout" => {
                    self.cbt_initial_timeout =
                        Duration::from_millis(clamp(v, 10_000, 2_147_483) as u64);
                }
                "cbtmintimeout" => {
                    self.cbt_min_timeout = Duration::from_millis(clamp(v, 500, 2_147_483) as u64);
                }
                "cbtquantile" => {
                    self.cbt_timeout_quantile = clamp(v, 10, 99) as u8;
                }
                "cbtclosequantile" => {
                    self.cbt_abandon_quantile =
                        clamp(v, i64::from(self.cbt_timeout_quantile), 99) as u8;
                }
                "cbtmincircs" => {
                    self.cbt_min_circs_for_estimate = clamp(v, 1, 10_000) as u16;
                }
                _ => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let p = NetParameters::default();
        assert_eq!(p.circuit_window, 1000);
        assert_eq!(p.cbt_timeout_quantile, 80);
    }

    #[test]
    fn update_and_clamp() {
        let mut p = NetParameters::default();
        p.saturating_update(
            vec![
                ("circwindow", 500_i64),
                ("cbtquantile", 70),
                ("cbtmincircs", 1_000_000), // clamped
                ("brand_new_parameter", 77), // ignored
            ]
            .into_iter(),
        );
        assert_eq!(p.circuit_window, 500);
        assert_eq!(p.cbt_timeout_quantile, 70);
        assert_eq!(p.cbt_min_circs_for_estimate, 10_000);
    }

    #[test]
    fn close_quantile_not_below_timeout_quantile() {
        let mut p = NetParameters::default();
        p.saturating_update(vec![("cbtclosequantile", 50_i64)].into_iter());
        assert_eq!(p.cbt_abandon_quantile, 80);
    }
}
