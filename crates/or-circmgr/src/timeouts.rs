//! Code for estimating good values for circuit timeouts.
//!
//! We need good circuit timeouts for two reasons: first, they help
//! user experience.  If user wait too long for their circuits, or if
//! they use exceptionally slow circuits, then the network will seem
//! bad.  Second, these timeouts are actually a security
//! property.

pub(crate) mod pareto;

use or_netdir::NetParameters;
use std::sync::Mutex;
use std::time::Duration;

/// An object that calculates circuit timeout thresholds from the
/// history of circuit build times.
pub(crate) trait TimeoutEstimator {
    /// Record that a given hop of a circuit completed, `delay` after
    /// the circuit's build began.
    ///
    /// The `hop` number is zero-based; `is_last` is true when this
    /// hop completed the circuit.
    fn note_hop_completed(&mut self, hop: u8, delay: Duration, is_last: bool);

    /// Record that a circuit failed to complete before its timeout
    /// expired, `delay` after its build began.
    fn note_circ_timeout(&mut self, hop: u8, delay: Duration);

    /// Return the current timeout and abandon thresholds.
    ///
    /// A circuit that takes longer than the timeout threshold is no
    /// longer handed to its requester; one that takes longer than the
    /// abandon threshold is closed and not even measured.
    fn timeouts(&mut self) -> (Duration, Duration);

    /// Return true if we are still collecting enough observations to
    /// adapt our timeouts.
    fn learning_timeouts(&self) -> bool;

    /// Replace the consensus parameters that this estimator takes its
    /// settings from.
    fn update_params(&mut self, params: &NetParameters);
}

/// A thread-safe wrapper around the timeout estimator that the rest
/// of the circuit manager uses.
pub(crate) struct Estimator {
    /// The underlying estimator.
    inner: Mutex<pareto::ParetoTimeoutEstimator>,
}

impl Estimator {
    /// Construct a new Estimator with default settings.
    pub(crate) fn new() -> Self {
        Estimator {
            inner: Mutex::new(pareto::ParetoTimeoutEstimator::default()),
        }
    }

    /// See [`TimeoutEstimator::note_hop_completed`].
    pub(crate) fn note_hop_completed(&self, hop: u8, delay: Duration, is_last: bool) {
        self.inner
            .lock()
            .expect("estimator poisoned")
            .note_hop_completed(hop, delay, is_last);
    }

    /// See [`TimeoutEstimator::note_circ_timeout`].
    pub(crate) fn note_circ_timeout(&self, hop: u8, delay: Duration) {
        self.inner
            .lock()
            .expect("estimator poisoned")
            .note_circ_timeout(hop, delay);
    }

    /// See [`TimeoutEstimator::timeouts`].
    pub(crate) fn timeouts(&self) -> (Duration, Duration) {
        self.inner.lock().expect("estimator poisoned").timeouts()
    }

    /// See [`TimeoutEstimator::learning_timeouts`].
    pub(crate) fn learning_timeouts(&self) -> bool {
        self.inner
            .lock()
            .expect("estimator poisoned")
            .learning_timeouts()
    }

    /// See [`TimeoutEstimator::update_params`].
    pub(crate) fn update_params(&self, params: &NetParameters) {
        self.inner
            .lock()
            .expect("estimator poisoned")
            .update_params(params);
    }
}
