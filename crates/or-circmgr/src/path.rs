//! Code to construct paths through the network.

use crate::config::PathConfig;
use crate::usage::TargetPort;
use crate::{Error, Result};
use or_llcrypto::pk::rsa::RsaIdentity;
use or_netdir::{NetDir, RelayDesc, RelayFlags};
use or_proto::circuit::OwnedCircTarget;
use rand::Rng;

/// A path through the network: an ordered list of relays, ready to
/// be turned into a circuit.
#[derive(Clone, Debug)]
pub(crate) struct TorPath {
    /// The relays in the path, from the guard to the final hop.
    hops: Vec<OwnedCircTarget>,
}

impl TorPath {
    /// Return the hops of this path, in order.
    pub(crate) fn hops(&self) -> &[OwnedCircTarget] {
        &self.hops
    }

    /// Return the number of hops in this path.
    pub(crate) fn len(&self) -> usize {
        self.hops.len()
    }
}

/// Helper: convert a relay descriptor into a circuit target.
fn circ_target(r: &RelayDesc) -> OwnedCircTarget {
    OwnedCircTarget::new(r.addr(), r.or_port(), *r.id(), r.onion_key_der().to_vec())
}

/// Helper: return true if `r` may share a circuit with every relay in
/// `chosen`.
fn relays_can_share_circuit(r: &RelayDesc, chosen: &[&RelayDesc]) -> bool {
    chosen
        .iter()
        .all(|c| !r.in_same_family(c) && !r.in_same_subnet(c))
}

/// Pick an exit relay for the given target ports.
pub(crate) fn pick_exit<'a, R: Rng>(
    rng: &mut R,
    netdir: &'a NetDir,
    ports: &[TargetPort],
    need_uptime: bool,
    config: &PathConfig,
) -> Result<&'a RelayDesc> {
    let acceptable = |r: &RelayDesc| -> bool {
        if config.exclude_nodes.contains(r.id()) {
            return false;
        }
        if need_uptime && !r.has_flags(RelayFlags::STABLE) {
            return false;
        }
        r.has_flags(RelayFlags::FAST) && ports.iter().all(|p| r.supports_exit_port(p.port))
    };

    // Honor "ExitNodes" as a restriction if set; with "StrictNodes"
    // an empty intersection is a hard failure rather than a fallback.
    if !config.exit_nodes.is_empty() {
        let restricted =
            netdir.pick_relay(rng, |r| config.exit_nodes.contains(r.id()) && acceptable(r));
        match restricted {
            Some(r) => return Ok(r),
            None if config.strict_nodes => {
                return Err(Error::NoExit(
                    "No configured exit node supports this request".into(),
                ))
            }
            None => (),
        }
    }

    netdir
        .pick_relay(rng, acceptable)
        .ok_or_else(|| Error::NoExit("No exit relay supports this request".into()))
}

/// Pick a middle relay, subject to the family and subnet rules.
fn pick_middle<'a, R: Rng>(
    rng: &mut R,
    netdir: &'a NetDir,
    chosen: &[&RelayDesc],
    need_uptime: bool,
    config: &PathConfig,
) -> Result<&'a RelayDesc> {
    netdir
        .pick_relay(rng, |r| {
            !config.exclude_nodes.contains(r.id())
                && r.has_flags(RelayFlags::FAST)
                && (!need_uptime || r.has_flags(RelayFlags::STABLE))
                && relays_can_share_circuit(r, chosen)
        })
        .ok_or_else(|| Error::NoPath("No middle relay available".into()))
}

/// Construct a three-hop exit path from a chosen guard to a chosen
/// exit.
pub(crate) fn exit_path<R: Rng>(
    rng: &mut R,
    netdir: &NetDir,
    guard_id: &RsaIdentity,
    exit: &RelayDesc,
    need_uptime: bool,
    config: &PathConfig,
) -> Result<TorPath> {
    let guard = netdir
        .by_id(guard_id)
        .ok_or_else(|| Error::NoPath("Guard not in consensus".into()))?;
    if !relays_can_share_circuit(exit, &[guard]) {
        return Err(Error::NoPath("Guard and exit too close together".into()));
    }
    let middle = pick_middle(rng, netdir, &[guard, exit], need_uptime, config)?;
    Ok(TorPath {
        hops: vec![circ_target(guard), circ_target(middle), circ_target(exit)],
    })
}

/// Construct a three-hop path from a chosen guard to a caller-chosen
/// final relay (a rendezvous point, introduction point, or hidden
/// service directory).
pub(crate) fn path_to_target<R: Rng>(
    rng: &mut R,
    netdir: &NetDir,
    guard_id: &RsaIdentity,
    target: &OwnedCircTarget,
    config: &PathConfig,
) -> Result<TorPath> {
    let guard = netdir
        .by_id(guard_id)
        .ok_or_else(|| Error::NoPath("Guard not in consensus".into()))?;
    // The target may not be in the consensus at all (e.g. an intro
    // point from a descriptor); apply the sharing rules when we can.
    let target_desc = netdir.by_id(target.rsa_identity());
    let chosen: Vec<&RelayDesc> = std::iter::once(guard).chain(target_desc).collect();
    let middle = pick_middle(rng, netdir, &chosen[..], false, config)?;
    Ok(TorPath {
        hops: vec![circ_target(guard), circ_target(middle), target.clone()],
    })
}

/// Construct a single-hop path for a directory request.
///
/// (One-hop circuits are permitted only for directory traffic; the
/// circuit manager enforces that by tagging them `Dir`.)
pub(crate) fn dir_path<R: Rng>(
    rng: &mut R,
    netdir: &NetDir,
    config: &PathConfig,
) -> Result<TorPath> {
    let relay = netdir
        .pick_relay(rng, |r| {
            !config.exclude_nodes.contains(r.id()) && r.has_flags(RelayFlags::V2DIR)
        })
        .ok_or_else(|| Error::NoPath("No directory cache available".into()))?;
    Ok(TorPath {
        hops: vec![circ_target(relay)],
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;
    use or_netdir::NetParameters;
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    fn base_flags() -> RelayFlags {
        RelayFlags::RUNNING | RelayFlags::VALID | RelayFlags::FAST | RelayFlags::STABLE
    }

    /// A directory with relays 1..=20; relay 1 is a guard; relays
    /// 18..=20 are exits for port 80; relay 20 is also a V2Dir.
    fn netdir() -> NetDir {
        let mut relays: Vec<RelayDesc> = (1..=20_u8)
            .map(|i| {
                let mut flags = base_flags();
                if i == 1 {
                    flags |= RelayFlags::GUARD;
                }
                if i >= 18 {
                    flags |= RelayFlags::EXIT;
                }
                if i == 20 {
                    flags |= RelayFlags::V2DIR;
                }
                let mut r = RelayDesc::new(
                    RsaIdentity::from([i; 20]),
                    &format!("r{}", i),
                    Ipv4Addr::new(10, i, 0, 1),
                    9001,
                    vec![i; 4],
                )
                .with_flags(flags)
                .with_bandwidth(1000);
                if i >= 18 {
                    r = r.with_policy("accept 80,443".parse().unwrap());
                }
                r
            })
            .collect();
        // Relay 2 is in relay 1's family.
        relays[1] = relays[1].clone().with_family(vec![RsaIdentity::from([1; 20])]);
        NetDir::new(
            relays,
            NetParameters::default(),
            SystemTime::now() + Duration::from_secs(3600),
        )
    }

    #[test]
    fn exit_selection() {
        let mut rng = testing_rng();
        let nd = netdir();
        let cfg = PathConfig::default();

        let exit = pick_exit(&mut rng, &nd, &[TargetPort::new(80)], false, &cfg).unwrap();
        assert!(exit.supports_exit_port(80));

        // No exit allows port 25.
        assert!(matches!(
            pick_exit(&mut rng, &nd, &[TargetPort::new(25)], false, &cfg),
            Err(Error::NoExit(_))
        ));

        // ExitNodes restricts the choice.
        let mut cfg2 = PathConfig::default();
        cfg2.exit_nodes = vec![RsaIdentity::from([19; 20])];
        let exit = pick_exit(&mut rng, &nd, &[TargetPort::new(80)], false, &cfg2).unwrap();
        assert_eq!(exit.id(), &RsaIdentity::from([19; 20]));

        // StrictNodes turns an unusable restriction into an error.
        cfg2.exit_nodes = vec![RsaIdentity::from([5; 20])]; // not an exit
        cfg2.strict_nodes = true;
        assert!(matches!(
            pick_exit(&mut rng, &nd, &[TargetPort::new(80)], false, &cfg2),
            Err(Error::NoExit(_))
        ));
    }

    #[test]
    fn paths_obey_constraints() {
        let mut rng = testing_rng();
        let nd = netdir();
        let cfg = PathConfig::default();
        let guard_id = RsaIdentity::from([1; 20]);

        for _ in 0..50 {
            let exit = pick_exit(&mut rng, &nd, &[TargetPort::new(80)], false, &cfg).unwrap();
            let path = exit_path(&mut rng, &nd, &guard_id, exit, false, &cfg).unwrap();
            assert_eq!(path.len(), 3);
            let ids: Vec<_> = path.hops().iter().map(|h| *h.rsa_identity()).collect();
            // All distinct.
            assert_ne!(ids[0], ids[1]);
            assert_ne!(ids[1], ids[2]);
            assert_ne!(ids[0], ids[2]);
            // The middle is never relay 2 (same family as the guard).
            assert_ne!(ids[1], RsaIdentity::from([2; 20]));
            // The guard is the configured one.
            assert_eq!(ids[0], guard_id);
        }
    }

    #[test]
    fn excluded_nodes_are_excluded() {
        let mut rng = testing_rng();
        let nd = netdir();
        let mut cfg = PathConfig::default();
        // Exclude every exit but relay 18.
        cfg.exclude_nodes = vec![RsaIdentity::from([19; 20]), RsaIdentity::from([20; 20])];

        for _ in 0..10 {
            let exit = pick_exit(&mut rng, &nd, &[TargetPort::new(80)], false, &cfg).unwrap();
            assert_eq!(exit.id(), &RsaIdentity::from([18; 20]));
        }
    }

    #[test]
    fn dir_paths_are_one_hop() {
        let mut rng = testing_rng();
        let nd = netdir();
        let cfg = PathConfig::default();
        let path = dir_path(&mut rng, &nd, &cfg).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path.hops()[0].rsa_identity(), &RsaIdentity::from([20; 20]));
    }

    #[test]
    fn target_paths() {
        let mut rng = testing_rng();
        let nd = netdir();
        let cfg = PathConfig::default();
        let guard_id = RsaIdentity::from([1; 20]);
        // A rendezvous point that isn't in the consensus.
        let target = OwnedCircTarget::new(
            "192.0.2.7".parse().unwrap(),
            443,
            RsaIdentity::from([77; 20]),
            vec![1, 2, 3],
        );
        let path = path_to_target(&mut rng, &nd, &guard_id, &target, &cfg).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.hops()[2].rsa_identity(), &RsaIdentity::from([77; 20]));
    }
}
