#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)]
#![allow(clippy::uninlined_format_args)]

use bitflags::bitflags;
use or_llcrypto::pk::rsa::RsaIdentity;
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::SystemTime;

pub mod params;
pub mod policy;

pub use params::NetParameters;
pub use policy::PortPolicy;

bitflags! {
    /// The flags that the directory authorities have voted for a
    /// relay.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RelayFlags: u16 {
        /// Suitable for use as an exit.
        const EXIT = 1 << 0;
        /// Relay has above-median performance.
        const FAST = 1 << 1;
        /// Suitable for use as an entry guard.
        const GUARD = 1 << 2;
        /// Stores and serves hidden-service descriptors.
        const HSDIR = 1 << 3;
        /// Currently usable, as far as the authorities can tell.
        const RUNNING = 1 << 4;
        /// Suitable for long-lived connections.
        const STABLE = 1 << 5;
        /// Serves directory documents over its OR port.
        const V2DIR = 1 << 6;
        /// Not known to be broken or misconfigured.
        const VALID = 1 << 7;
    }
}

/// The largest bandwidth we are willing to believe a relay's
/// self-declared value, in bytes per second.
///
/// Values above this are clamped, so that a single lying relay can't
/// capture most of the traffic.
const MAX_BELIEVABLE_BANDWIDTH: u32 = 10_000_000;

/// A single relay, as described by the directory.
///
/// Instances are immutable after construction; the whole set is
/// replaced when the directory provider delivers a fresh consensus.
#[derive(Clone, Debug)]
pub struct RelayDesc {
    /// Identity fingerprint: the SHA-1 hash of the relay's long-term
    /// signing key.
    identity: RsaIdentity,
    /// Nickname, for logs only.
    nickname: String,
    /// IPv4 address of the relay's OR port.
    addr: Ipv4Addr,
    /// The relay's OR port.
    or_port: u16,
    /// The relay's onion key (DER-encoded RSA public key), used for
    /// TAP handshakes.
    onion_key: Vec<u8>,
    /// Declared bandwidth, in bytes per second.
    bandwidth: u32,
    /// Flags voted for this relay.
    flags: RelayFlags,
    /// Declared family: relays that should not appear together in one
    /// circuit.
    family: Vec<RsaIdentity>,
    /// Exit port policy.
    policy: PortPolicy,
}

impl RelayDesc {
    /// Construct a new relay descriptor with the mandatory fields.
    ///
    /// Optional attributes (flags, bandwidth, family, policy) start
    /// out empty/zero; use the `with_*` methods to fill them in.
    pub fn new(
        identity: RsaIdentity,
        nickname: &str,
        addr: Ipv4Addr,
        or_port: u16,
        onion_key: Vec<u8>,
    ) -> Self {
        RelayDesc {
            identity,
            nickname: nickname.to_string(),
            addr,
            or_port,
            onion_key,
            bandwidth: 0,
            flags: RelayFlags::empty(),
            family: Vec::new(),
            policy: PortPolicy::new_reject_all(),
        }
    }

    /// Set the flags on this descriptor.
    pub fn with_flags(mut self, flags: RelayFlags) -> Self {
        self.flags = flags;
        self
    }
    /// Set the declared bandwidth on this descriptor.
    pub fn with_bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }
    /// Set the declared family on this descriptor.
    pub fn with_family(mut self, family: Vec<RsaIdentity>) -> Self {
        self.family = family;
        self
    }
    /// Set the exit policy on this descriptor.
    pub fn with_policy(mut self, policy: PortPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Return the identity fingerprint of this relay.
    pub fn id(&self) -> &RsaIdentity {
        &self.identity
    }
    /// Return the nickname of this relay.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
    /// Return the IPv4 address of this relay's OR port.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
    /// Return this relay's OR port.
    pub fn or_port(&self) -> u16 {
        self.or_port
    }
    /// Return this relay's onion key, DER encoded.
    pub fn onion_key_der(&self) -> &[u8] {
        &self.onion_key[..]
    }
    /// Return this relay's exit port policy.
    pub fn policy(&self) -> &PortPolicy {
        &self.policy
    }
    /// Return the weight to use for this relay when picking relays at
    /// random.
    fn weight(&self) -> u64 {
        u64::from(std::cmp::min(self.bandwidth, MAX_BELIEVABLE_BANDWIDTH))
    }
    /// Return true if this relay has all the flags in `flags`.
    pub fn has_flags(&self, flags: RelayFlags) -> bool {
        self.flags.contains(flags)
    }
    /// Return true if this relay is marked both Running and Valid,
    /// and is therefore eligible for use in circuits at all.
    pub fn is_usable(&self) -> bool {
        self.has_flags(RelayFlags::RUNNING | RelayFlags::VALID)
    }
    /// Return true if this relay's exit policy permits connections to
    /// `port`.
    pub fn supports_exit_port(&self, port: u16) -> bool {
        self.policy.allows_port(port)
    }
    /// Return true if this relay and `other` declare each other (or
    /// anything) in a shared family.
    ///
    /// As in the reference implementation, we believe a family claim
    /// if either side makes it.
    pub fn in_same_family(&self, other: &RelayDesc) -> bool {
        if self.identity == other.identity {
            return true;
        }
        self.family.contains(&other.identity) || other.family.contains(&self.identity)
    }
    /// Return true if this relay and `other` are in the same /16
    /// network.
    pub fn in_same_subnet(&self, other: &RelayDesc) -> bool {
        self.addr.octets()[0..2] == other.addr.octets()[0..2]
    }
}

/// A network directory: everything a client knows about the relays
/// that make up the network.
///
/// A `NetDir` is valid during a given time window, and is replaced
/// wholesale when the directory provider delivers a fresh consensus.
#[derive(Clone, Debug)]
pub struct NetDir {
    /// The relays in this directory.
    relays: Vec<RelayDesc>,
    /// Map from identity to index in `relays`.
    by_id: HashMap<RsaIdentity, usize>,
    /// The network parameters from this consensus.
    params: NetParameters,
    /// When this directory stops being the freshest one.
    valid_until: SystemTime,
}

impl NetDir {
    /// Construct a new NetDir from a set of relays and parameters.
    pub fn new(relays: Vec<RelayDesc>, params: NetParameters, valid_until: SystemTime) -> Self {
        let by_id = relays
            .iter()
            .enumerate()
            .map(|(i, r)| (*r.id(), i))
            .collect();
        NetDir {
            relays,
            by_id,
            params,
            valid_until,
        }
    }

    /// Return the network parameters from this directory.
    pub fn params(&self) -> &NetParameters {
        &self.params
    }

    /// Return the time after which this directory should be replaced.
    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }

    /// Return true if this directory is out of date at time `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now > self.valid_until
    }

    /// Return an iterator over all the relays in this directory.
    pub fn relays(&self) -> impl Iterator<Item = &RelayDesc> {
        self.relays.iter()
    }

    /// Return the number of relays in this directory.
    pub fn n_relays(&self) -> usize {
        self.relays.len()
    }

    /// Return the relay with a given identity, if we know of one.
    pub fn by_id(&self, id: &RsaIdentity) -> Option<&RelayDesc> {
        self.by_id.get(id).map(|idx| &self.relays[*idx])
    }

    /// Pick a random usable relay matching `usable` (a predicate over
    /// relays), weighted by bandwidth.
    ///
    /// Returns None if no relay matches.
    pub fn pick_relay<'a, R, P>(&'a self, rng: &mut R, usable: P) -> Option<&'a RelayDesc>
    where
        R: Rng,
        P: Fn(&RelayDesc) -> bool,
    {
        let candidates: Vec<_> = self
            .relays
            .iter()
            .filter(|r| r.is_usable() && usable(r))
            .collect();
        candidates
            .choose_weighted(rng, |r| r.weight().max(1))
            .ok()
            .copied()
    }

    /// Return the `n_replicas` hidden-service directories responsible
    /// for a given descriptor ID.
    ///
    /// The HSDir-flagged relays form a ring ordered by identity
    /// fingerprint; the responsible directories are the first
    /// `per_replica` relays whose fingerprints follow the descriptor
    /// ID on the ring.
    pub fn hsdirs_for(&self, desc_id: &[u8; 20], per_replica: usize) -> Vec<&RelayDesc> {
        let mut ring: Vec<_> = self
            .relays
            .iter()
            .filter(|r| r.is_usable() && r.has_flags(RelayFlags::HSDIR))
            .collect();
        ring.sort_by_key(|r| *r.id());
        if ring.is_empty() {
            return Vec::new();
        }
        let start = ring
            .iter()
            .position(|r| r.id().as_bytes() > &desc_id[..])
            .unwrap_or(0);
        ring.iter()
            .cycle()
            .skip(start)
            .take(std::cmp::min(per_replica, ring.len()))
            .copied()
            .collect()
    }
}

/// An object that can provide the latest network directory.
///
/// Directory download, parsing, and validation are deliberately
/// outside this library; the embedding application (or a separate
/// crate) implements this trait and keeps the directory fresh.
pub trait DirProvider: Send + Sync + 'static {
    /// Return the latest network directory, if one is known.
    fn netdir(&self) -> Option<Arc<NetDir>>;
}

impl<T: DirProvider + ?Sized> DirProvider for Arc<T> {
    fn netdir(&self) -> Option<Arc<NetDir>> {
        (**self).netdir()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;
    use std::time::Duration;

    /// Build a test relay with a given index and flags.
    fn relay(idx: u8, flags: RelayFlags, bw: u32) -> RelayDesc {
        RelayDesc::new(
            RsaIdentity::from([idx; 20]),
            &format!("relay{}", idx),
            Ipv4Addr::new(10, idx, 0, 1),
            9001,
            vec![idx; 8],
        )
        .with_flags(flags)
        .with_bandwidth(bw)
    }

    /// Flags for a plain usable relay.
    fn usable() -> RelayFlags {
        RelayFlags::RUNNING | RelayFlags::VALID | RelayFlags::FAST
    }

    fn dir(relays: Vec<RelayDesc>) -> NetDir {
        NetDir::new(
            relays,
            NetParameters::default(),
            SystemTime::now() + Duration::from_secs(3600),
        )
    }

    #[test]
    fn lookup_and_filter() {
        let nd = dir(vec![
            relay(1, usable(), 1000),
            relay(2, RelayFlags::RUNNING, 1000), // not valid.
            relay(3, usable() | RelayFlags::EXIT, 1000),
        ]);
        assert_eq!(nd.n_relays(), 3);
        assert_eq!(nd.by_id(&RsaIdentity::from([2; 20])).unwrap().nickname(), "relay2");
        assert!(nd.by_id(&RsaIdentity::from([9; 20])).is_none());

        let mut rng = testing_rng();
        // Only relay 3 is usable and has the EXIT flag.
        for _ in 0..10 {
            let r = nd
                .pick_relay(&mut rng, |r| r.has_flags(RelayFlags::EXIT))
                .unwrap();
            assert_eq!(r.id(), &RsaIdentity::from([3; 20]));
        }
        // Relay 2 is excluded even though it matches the predicate.
        assert!(nd
            .pick_relay(&mut rng, |r| r.id() == &RsaIdentity::from([2; 20]))
            .is_none());
    }

    #[test]
    fn weighting_prefers_fast_relays() {
        let nd = dir(vec![
            relay(1, usable(), 99_000),
            relay(2, usable(), 1_000),
        ]);
        let mut rng = testing_rng();
        let mut counts = [0_u32; 2];
        for _ in 0..1000 {
            let r = nd.pick_relay(&mut rng, |_| true).unwrap();
            counts[(r.id().as_bytes()[0] - 1) as usize] += 1;
        }
        // Expected ratio is 99:1; give it lots of slack.
        assert!(counts[0] > 900);
        assert!(counts[1] < 100);
    }

    #[test]
    fn bandwidth_clamped() {
        let r = relay(1, usable(), u32::MAX);
        assert_eq!(r.weight(), u64::from(MAX_BELIEVABLE_BANDWIDTH));
    }

    #[test]
    fn families_and_subnets() {
        let mut r1 = relay(1, usable(), 100);
        let r2 = relay(2, usable(), 100);
        r1 = r1.with_family(vec![*r2.id()]);
        assert!(r1.in_same_family(&r2));
        assert!(r2.in_same_family(&r1)); // believed from either side.
        assert!(r1.in_same_family(&r1));

        let r3 = relay(3, usable(), 100);
        assert!(!r1.in_same_family(&r3));

        // 10.1.x.x vs 10.2.x.x: different /16s.
        assert!(!r1.in_same_subnet(&r2));
        let r1b = RelayDesc::new(
            RsaIdentity::from([9; 20]),
            "r1b",
            Ipv4Addr::new(10, 1, 77, 2),
            9001,
            vec![],
        );
        assert!(r1.in_same_subnet(&r1b));
    }

    #[test]
    fn hsdir_ring() {
        let hsflags = usable() | RelayFlags::HSDIR;
        let nd = dir(vec![
            relay(10, hsflags, 100),
            relay(20, hsflags, 100),
            relay(30, hsflags, 100),
            relay(40, usable(), 100), // not an HSDir
        ]);

        // A descriptor ID between relay 10 and 20 gets 20 and 30.
        let desc_id = [15; 20];
        let dirs = nd.hsdirs_for(&desc_id, 2);
        let ids: Vec<u8> = dirs.iter().map(|r| r.id().as_bytes()[0]).collect();
        assert_eq!(ids, vec![20, 30]);

        // A descriptor ID after the last relay wraps around.
        let desc_id = [35; 20];
        let dirs = nd.hsdirs_for(&desc_id, 2);
        let ids: Vec<u8> = dirs.iter().map(|r| r.id().as_bytes()[0]).collect();
        assert_eq!(ids, vec![10, 20]);
    }
}
