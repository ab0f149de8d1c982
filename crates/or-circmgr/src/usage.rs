//! Code related to tracking what activities a circuit can be used
//! for.

use or_netdir::PortPolicy;
use std::fmt;

/// An exit policy, as supported by the last hop of a circuit.
#[derive(Clone, Debug)]
pub(crate) struct ExitPolicy {
    /// The exit's policy over target ports.
    policy: PortPolicy,
}

impl ExitPolicy {
    /// Construct a new ExitPolicy wrapping the given port policy.
    pub(crate) fn new(policy: PortPolicy) -> Self {
        ExitPolicy { policy }
    }

    /// Return true if a port is contained in this ExitPolicy.
    fn allows_port(&self, p: TargetPort) -> bool {
        self.policy.allows_port(p.port)
    }
}

/// A port that we want to connect to as a client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetPort {
    /// The port number that we want to connect to.
    pub port: u16,
}

impl TargetPort {
    /// Create a request to make sure that a circuit supports a given
    /// port.
    pub fn new(port: u16) -> Self {
        TargetPort { port }
    }
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)
    }
}

/// The purpose for which a circuit is being created.
///
/// This type should stay internal to the circmgr crate for now: we'll
/// want to refactor it a lot, and it isn't safe to expose.
#[derive(Clone, Debug)]
pub(crate) enum TargetCircUsage {
    /// Use for BEGINDIR-based non-anonymous directory connections.
    Dir,
    /// Use to establish a stream connected to one of the given ports.
    Exit {
        /// The ports we want to connect to.
        ports: Vec<TargetPort>,
        /// Whether the circuit must use relays suitable for
        /// long-lived connections.
        need_uptime: bool,
    },
}

/// The purposes for which a circuit is usable.
#[derive(Clone, Debug)]
pub(crate) enum SupportedCircUsage {
    /// Usable for BEGINDIR-based directory connections.
    Dir,
    /// Usable to exit to a set of ports.
    Exit {
        /// The exit policy of the circuit's last hop.
        policy: ExitPolicy,
        /// Whether the circuit was built with relays suitable for
        /// long-lived connections.
        need_uptime: bool,
    },
}

impl SupportedCircUsage {
    /// Return true if this usage supports the given target usage.
    pub(crate) fn supports(&self, target: &TargetCircUsage) -> bool {
        use SupportedCircUsage::*;
        match (self, target) {
            (Dir, TargetCircUsage::Dir) => true,
            (
                Exit {
                    policy,
                    need_uptime,
                },
                TargetCircUsage::Exit {
                    ports,
                    need_uptime: target_uptime,
                },
            ) => {
                (!target_uptime || *need_uptime)
                    && ports.iter().all(|p| policy.allows_port(*p))
            }
            (_, _) => false,
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn exit_usage(policy: &str, need_uptime: bool) -> SupportedCircUsage {
        SupportedCircUsage::Exit {
            policy: ExitPolicy::new(policy.parse().unwrap()),
            need_uptime,
        }
    }

    #[test]
    fn supports() {
        let dir = SupportedCircUsage::Dir;
        let web = exit_usage("accept 80,443", false);
        let web_stable = exit_usage("accept 80,443,6667", true);

        let want_dir = TargetCircUsage::Dir;
        let want_web = TargetCircUsage::Exit {
            ports: vec![TargetPort::new(443)],
            need_uptime: false,
        };
        let want_irc = TargetCircUsage::Exit {
            ports: vec![TargetPort::new(6667)],
            need_uptime: true,
        };

        assert!(dir.supports(&want_dir));
        assert!(!dir.supports(&want_web));
        assert!(!web.supports(&want_dir));

        assert!(web.supports(&want_web));
        assert!(!web.supports(&want_irc)); // port and uptime both missing
        assert!(web_stable.supports(&want_web)); // uptime is a bonus
        assert!(web_stable.supports(&want_irc));
    }
}
