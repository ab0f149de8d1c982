//! Per-service client state: joined circuits, failing introduction
//! points, and authorization cookies.

use crate::hsid::HsId;
use or_llcrypto::pk::rsa::RsaIdentity;
use or_proto::circuit::ClientCirc;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long we remember that an introduction point failed, before the
/// first retry.
const INTRO_BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Cap on the backoff interval for a failing introduction point.
const INTRO_BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);

/// What we remember about one introduction point.
#[derive(Debug, Clone, Default)]
struct IntroPointState {
    /// How many times in a row has this introduction point failed?
    n_failures: u32,
    /// When may we try it again?
    retry_at: Option<Instant>,
}

/// What we remember about one service.
#[derive(Default)]
struct ServiceState {
    /// A rendezvous circuit already joined to the service, if any.
    joined: Option<ClientCirc>,
    /// The descriptor cookie for client authorization, if any.
    auth_cookie: Option<Vec<u8>>,
    /// Records of per-introduction-point failures.
    intro_points: HashMap<RsaIdentity, IntroPointState>,
}

/// The collected state for every service this client has dealt with.
#[derive(Default)]
pub(crate) struct Services {
    /// Map from service ID to its state.
    services: HashMap<HsId, ServiceState>,
}

impl Services {
    /// Return a live joined circuit for `hsid`, if we have one.
    pub(crate) fn joined_circuit(&mut self, hsid: &HsId) -> Option<ClientCirc> {
        let state = self.services.get_mut(hsid)?;
        match &state.joined {
            Some(c) if !c.is_closing() => Some(c.clone()),
            _ => {
                state.joined = None;
                None
            }
        }
    }

    /// Remember a newly joined circuit for `hsid`.
    pub(crate) fn note_joined_circuit(&mut self, hsid: HsId, circ: ClientCirc) {
        self.services.entry(hsid).or_default().joined = Some(circ);
    }

    /// Forget every joined circuit (the "new identity" signal).
    pub(crate) fn clear_circuits(&mut self) {
        for state in self.services.values_mut() {
            state.joined = None;
        }
    }

    /// Set the client-authorization cookie for `hsid`.
    pub(crate) fn set_auth_cookie(&mut self, hsid: HsId, cookie: Vec<u8>) {
        self.services.entry(hsid).or_default().auth_cookie = Some(cookie);
    }

    /// Return the client-authorization cookie for `hsid`, if any.
    pub(crate) fn auth_cookie(&mut self, hsid: &HsId) -> Option<Vec<u8>> {
        self.services.get(hsid)?.auth_cookie.clone()
    }

    /// Return true if the introduction point `intro` for `hsid` may
    /// be tried at `now`.
    pub(crate) fn intro_point_usable(&self, hsid: &HsId, intro: &RsaIdentity, now: Instant) -> bool {
        self.services
            .get(hsid)
            .and_then(|s| s.intro_points.get(intro))
            .and_then(|ip| ip.retry_at)
            .map(|t| now >= t)
            .unwrap_or(true)
    }

    /// Record that the introduction point `intro` for `hsid` failed
    /// at `now`, backing off its next retry exponentially.
    pub(crate) fn note_intro_point_failure(
        &mut self,
        hsid: HsId,
        intro: RsaIdentity,
        now: Instant,
    ) {
        let ip = self
            .services
            .entry(hsid)
            .or_default()
            .intro_points
            .entry(intro)
            .or_default();
        ip.n_failures = ip.n_failures.saturating_add(1);
        let backoff = INTRO_BACKOFF_BASE
            .saturating_mul(1_u32 << ip.n_failures.min(10))
            .min(INTRO_BACKOFF_MAX);
        ip.retry_at = Some(now + backoff);
    }

    /// Record that the introduction point `intro` for `hsid` worked.
    pub(crate) fn note_intro_point_success(&mut self, hsid: &HsId, intro: &RsaIdentity) {
        if let Some(state) = self.services.get_mut(hsid) {
            state.intro_points.remove(intro);
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn hsid() -> HsId {
        HsId::from_bytes([9; 10])
    }

    #[test]
    fn intro_backoff() {
        let mut services = Services::default();
        let intro = RsaIdentity::from([1; 20]);
        let now = Instant::now();

        assert!(services.intro_point_usable(&hsid(), &intro, now));
        services.note_intro_point_failure(hsid(), intro, now);
        assert!(!services.intro_point_usable(&hsid(), &intro, now));
        // After the backoff, it's usable again...
        assert!(services.intro_point_usable(&hsid(), &intro, now + Duration::from_secs(121)));

        // ...and failures back off exponentially.
        services.note_intro_point_failure(hsid(), intro, now);
        assert!(!services.intro_point_usable(&hsid(), &intro, now + Duration::from_secs(121)));

        // A success clears the record.
        services.note_intro_point_success(&hsid(), &intro);
        assert!(services.intro_point_usable(&hsid(), &intro, now));
    }

    #[test]
    fn auth_cookies() {
        let mut services = Services::default();
        assert_eq!(services.auth_cookie(&hsid()), None);
        services.set_auth_cookie(hsid(), vec![1, 2, 3]);
        assert_eq!(services.auth_cookie(&hsid()), Some(vec![1, 2, 3]));
    }
}
