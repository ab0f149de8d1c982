//! Entry-guard selection.
//!
//! To resist profiling attacks, a client does not pick a random entry
//! relay for every circuit: it commits to a small, stable set of
//! "guards", chosen once and reused for a long time, and enters the
//! network only through them.  Guards are replaced only when they
//! become unusable for a sustained period, or when the configuration
//! excludes them.

use crate::config::PathConfig;
use or_basic_utils::retry::RetryDelay;
use or_llcrypto::pk::rsa::RsaIdentity;
use or_netdir::{NetDir, RelayFlags};
use rand::Rng;
use std::time::Instant;
use tracing::{debug, info};

/// How long must a guard be unreachable before we treat it as down
/// for selection purposes, in milliseconds of base retry interval?
const GUARD_RETRY_BASE_MSEC: u32 = 30_000;

/// A single entry guard.
#[derive(Debug, Clone)]
pub(crate) struct Guard {
    /// The guard's identity.
    id: RsaIdentity,
    /// If the guard has been failing, when did that start?
    unreachable_since: Option<Instant>,
    /// If the guard has been failing, when may we next try it?
    retry_at: Option<Instant>,
    /// Schedule for retrying an unreachable guard.
    retry_schedule: RetryDelay,
}

impl Guard {
    /// Construct a new Guard with a given identity.
    fn new(id: RsaIdentity) -> Self {
        Guard {
            id,
            unreachable_since: None,
            retry_at: None,
            retry_schedule: RetryDelay::from_msec(GUARD_RETRY_BASE_MSEC),
        }
    }

    /// Return true if this guard may be tried at `now`.
    fn usable_at(&self, now: Instant) -> bool {
        match self.retry_at {
            Some(t) => now >= t,
            None => true,
        }
    }
}

/// A set of entry guards.
///
/// The set is created on first use; persistence (so that the same
/// guards are reused across runs) is the embedding application's
/// business, via [`GuardSet::snapshot`] and [`GuardSet::restore`].
#[derive(Debug, Default)]
pub(crate) struct GuardSet {
    /// The guards themselves, in order of preference.
    guards: Vec<Guard>,
}

impl GuardSet {
    /// Construct a new, empty guard set.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the identities of the current guards, for persistence.
    pub(crate) fn snapshot(&self) -> Vec<RsaIdentity> {
        self.guards.iter().map(|g| g.id).collect()
    }

    /// Reinstall a previously persisted guard set.
    pub(crate) fn restore(&mut self, ids: Vec<RsaIdentity>) {
        self.guards = ids.into_iter().map(Guard::new).collect();
    }

    /// Ensure that the set contains `n_guards` usable guards, picking
    /// new ones from `netdir` as needed.
    ///
    /// Guards that have disappeared from the consensus, or that the
    /// configuration now excludes, are rotated out.
    fn update<R: Rng>(
        &mut self,
        rng: &mut R,
        netdir: &NetDir,
        config: &PathConfig,
        n_guards: usize,
    ) {
        // Drop guards that are excluded or gone from the consensus.
        self.guards.retain(|g| {
            let keep = netdir.by_id(&g.id).is_some() && !config.exclude_nodes.contains(&g.id);
            if !keep {
                info!("Rotating out guard {}: no longer usable", g.id);
            }
            keep
        });

        while self.guards.len() < n_guards {
            let existing = self.snapshot();
            let new_guard = netdir.pick_relay(rng, |r| {
                r.has_flags(RelayFlags::GUARD | RelayFlags::FAST | RelayFlags::STABLE)
                    && !existing.contains(r.id())
                    && !config.exclude_nodes.contains(r.id())
            });
            match new_guard {
                Some(r) => {
                    debug!("Chose new entry guard {}", r.id());
                    self.guards.push(Guard::new(*r.id()));
                }
                None => break, // nothing suitable left to pick.
            }
        }
    }

    /// Pick a guard to use for a new circuit.
    ///
    /// Returns None if no guard is currently usable.
    pub(crate) fn pick_guard<R: Rng>(
        &mut self,
        rng: &mut R,
        netdir: &NetDir,
        config: &PathConfig,
        n_guards: usize,
        exclude: &[RsaIdentity],
        now: Instant,
    ) -> Option<RsaIdentity> {
        self.update(rng, netdir, config, n_guards);
        self.guards
            .iter()
            .find(|g| g.usable_at(now) && !exclude.contains(&g.id))
            .map(|g| g.id)
    }

    /// Note that we successfully used the guard with the given
    /// identity.
    pub(crate) fn note_success(&mut self, id: &RsaIdentity) {
        if let Some(g) = self.guards.iter_mut().find(|g| g.id == *id) {
            g.unreachable_since = None;
            g.retry_at = None;
            g.retry_schedule.reset();
        }
    }

    /// Note that we failed to reach the guard with the given
    /// identity.
    pub(crate) fn note_failure(&mut self, id: &RsaIdentity, now: Instant) {
        let mut rng = rand::rng();
        if let Some(g) = self.guards.iter_mut().find(|g| g.id == *id) {
            g.unreachable_since.get_or_insert(now);
            g.retry_at = Some(now + g.retry_schedule.next_delay(&mut rng));
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;
    use or_netdir::{NetParameters, RelayDesc};
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    fn guard_flags() -> RelayFlags {
        RelayFlags::GUARD
            | RelayFlags::FAST
            | RelayFlags::STABLE
            | RelayFlags::RUNNING
            | RelayFlags::VALID
    }

    fn netdir(n: u8) -> NetDir {
        let relays = (1..=n)
            .map(|i| {
                RelayDesc::new(
                    RsaIdentity::from([i; 20]),
                    &format!("g{}", i),
                    Ipv4Addr::new(10, i, 0, 1),
                    9001,
                    vec![],
                )
                .with_flags(guard_flags())
                .with_bandwidth(1000)
            })
            .collect();
        NetDir::new(
            relays,
            NetParameters::default(),
            SystemTime::now() + Duration::from_secs(3600),
        )
    }

    #[test]
    fn picks_and_sticks() {
        let mut rng = testing_rng();
        let nd = netdir(10);
        let cfg = PathConfig::default();
        let mut guards = GuardSet::new();
        let now = Instant::now();

        let g1 = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
        assert_eq!(guards.snapshot().len(), 3);

        // The same guard comes back while it works.
        for _ in 0..10 {
            let g = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
            assert_eq!(g, g1);
        }

        // Excluding it for one circuit gives us the second guard.
        let g2 = guards
            .pick_guard(&mut rng, &nd, &cfg, 3, &[g1], now)
            .unwrap();
        assert_ne!(g1, g2);
    }

    #[test]
    fn failure_rotates_temporarily() {
        let mut rng = testing_rng();
        let nd = netdir(10);
        let cfg = PathConfig::default();
        let mut guards = GuardSet::new();
        let now = Instant::now();

        let g1 = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
        guards.note_failure(&g1, now);

        // Right after a failure, we move on to the next guard...
        let g2 = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
        assert_ne!(g1, g2);

        // ...but after the retry interval has passed, the first guard
        // is preferred again.
        let much_later = now + Duration::from_secs(3600);
        let g = guards
            .pick_guard(&mut rng, &nd, &cfg, 3, &[], much_later)
            .unwrap();
        assert_eq!(g, g1);

        // A success resets its schedule.
        guards.note_success(&g1);
        let g = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
        assert_eq!(g, g1);
    }

    #[test]
    fn excluded_guards_rotate_out() {
        let mut rng = testing_rng();
        let nd = netdir(10);
        let mut cfg = PathConfig::default();
        let mut guards = GuardSet::new();
        let now = Instant::now();

        let g1 = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
        cfg.exclude_nodes.push(g1);
        let g2 = guards.pick_guard(&mut rng, &nd, &cfg, 3, &[], now).unwrap();
        assert_ne!(g1, g2);
        assert!(!guards.snapshot().contains(&g1));
        assert_eq!(guards.snapshot().len(), 3);
    }

    #[test]
    fn restore_snapshot() {
        let mut guards = GuardSet::new();
        guards.restore(vec![RsaIdentity::from([7; 20])]);
        assert_eq!(guards.snapshot(), vec![RsaIdentity::from([7; 20])]);
    }
}
