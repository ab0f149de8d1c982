//! Configuration logic for the circuit manager.

use or_llcrypto::pk::rsa::RsaIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rules for building paths over the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Relays that must never appear in a path ("ExcludeNodes").
    pub exclude_nodes: Vec<RsaIdentity>,
    /// If nonempty, relays to prefer as exits ("ExitNodes").
    pub exit_nodes: Vec<RsaIdentity>,
    /// If true, treat the exclude/exit lists as absolute requirements
    /// rather than preferences ("StrictNodes").
    pub strict_nodes: bool,
    /// Target ports that call for a need-uptime circuit
    /// ("LongLivedPorts").
    pub long_lived_ports: Vec<u16>,
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            exclude_nodes: Vec::new(),
            exit_nodes: Vec::new(),
            strict_nodes: false,
            // The reference implementation's default set.
            long_lived_ports: vec![
                21, 22, 706, 1863, 5050, 5190, 5222, 5223, 6523, 6667, 6697, 8300,
            ],
        }
    }
}

impl PathConfig {
    /// Return true if `port` is one that calls for a long-lived
    /// circuit.
    pub fn port_needs_uptime(&self, port: u16) -> bool {
        self.long_lived_ports.contains(&port)
    }
}

/// Configuration for circuit lifetimes and request timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitTiming {
    /// Once a circuit has first carried traffic, it is not handed to
    /// new streams after this interval ("MaxCircuitDirtiness").
    #[serde(with = "humantime_serde")]
    pub max_dirtiness: Duration,

    /// When a circuit is requested, keep trying to build it for up
    /// to this long.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// When a circuit is requested, retry at most this many times.
    pub request_max_retries: u32,

    /// A fresh circuit that never carries traffic is retired after
    /// this interval.
    #[serde(with = "humantime_serde")]
    pub max_circuit_age_unused: Duration,
}

impl Default for CircuitTiming {
    fn default() -> Self {
        CircuitTiming {
            max_dirtiness: Duration::from_secs(60 * 10),
            request_timeout: Duration::from_secs(60),
            request_max_retries: 3,
            max_circuit_age_unused: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for the preemptive circuit pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptiveCircuitConfig {
    /// How many clean general-purpose circuits should we try to keep
    /// open, ready to accept streams?
    pub min_clean_circs: usize,
    /// The ports that a preemptively-built circuit's exit must
    /// support.
    pub preferred_ports: Vec<u16>,
}

impl Default for PreemptiveCircuitConfig {
    fn default() -> Self {
        PreemptiveCircuitConfig {
            min_clean_circs: 3,
            preferred_ports: vec![80, 443],
        }
    }
}

/// Overall configuration for a circuit manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircMgrConfig {
    /// Path-selection rules.
    pub path_rules: PathConfig,
    /// Circuit lifetime and request timing rules.
    pub circuit_timing: CircuitTiming,
    /// Preemptive pool rules.
    pub preemptive_circuits: PreemptiveCircuitConfig,
    /// How many entry guards to use ("NumEntryGuards").
    pub n_guards: usize,
}

impl CircMgrConfig {
    /// Return this configuration's guard-set size, applying the
    /// default when unset.
    pub fn n_guards_or_default(&self) -> usize {
        if self.n_guards == 0 {
            3
        } else {
            self.n_guards
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let cfg = CircMgrConfig::default();
        assert_eq!(cfg.circuit_timing.max_dirtiness, Duration::from_secs(600));
        assert_eq!(cfg.circuit_timing.request_max_retries, 3);
        assert_eq!(cfg.preemptive_circuits.min_clean_circs, 3);
        assert_eq!(cfg.n_guards_or_default(), 3);
        assert!(cfg.path_rules.port_needs_uptime(6667));
        assert!(!cfg.path_rules.port_needs_uptime(80));
    }
}
