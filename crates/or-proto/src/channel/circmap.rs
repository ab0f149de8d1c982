//! Types and code to map circuit IDs to circuits.

use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::halfcirc::HalfCirc;
use crate::{Error, Result};
use or_basic_utils::RngExt;
use or_cell::chancell::CircId;
use or_llcrypto::pk::rsa::RsaIdentity;

use futures::channel::{mpsc, oneshot};
use rand::Rng;
use std::collections::{hash_map::Entry, HashMap};

/// Type of the sender that delivers a circuit's inbound cells from
/// the channel reactor to the circuit reactor.
pub(crate) type CircuitRxSender = mpsc::Sender<ClientCircChanMsg>;
/// Receiving end of [`CircuitRxSender`].
pub(crate) type CircuitRxReceiver = mpsc::Receiver<ClientCircChanMsg>;

/// Which group of circuit IDs are we allowed to allocate in this map?
///
/// The initiator of a link and its responder must not collide when
/// they both pick new circuit IDs.  The tie is broken by comparing
/// identity fingerprints: the side with the lexicographically larger
/// identity uses the upper half of the 16-bit ID space, the other
/// side the lower half.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum CircIdRange {
    /// Only use circuit IDs with the MSB cleared.
    Low,
    /// Only use circuit IDs with the MSB set.
    High,
}

impl CircIdRange {
    /// Decide which range an initiator with identity `ours` should
    /// use on a link to a peer with identity `theirs`.
    ///
    /// (A client has no identity, and so compares as all-zero, taking
    /// the low range.)
    pub(super) fn for_identities(ours: &RsaIdentity, theirs: &RsaIdentity) -> Self {
        if ours > theirs {
            CircIdRange::High
        } else {
            CircIdRange::Low
        }
    }

    /// Return a random circuit ID in the appropriate range.
    fn sample<R: Rng>(&self, rng: &mut R) -> CircId {
        let midpoint = 0x8000_u16;
        let v = match self {
            // 0 is an invalid value
            CircIdRange::Low => rng.gen_range_checked(1..midpoint),
            CircIdRange::High => rng.gen_range_checked(midpoint..=u16::MAX),
        };
        let v = v.expect("Unexpected empty range");
        CircId::new(v).expect("Unexpected zero value")
    }
}

/// An entry in the circuit map.
pub(super) enum CircEnt {
    /// A circuit that has not yet received a CREATED cell.
    ///
    /// For this circuit, the CREATED* cell or DESTROY cell gets sent
    /// to the oneshot sender to tell the corresponding
    /// PendingClientCirc that the handshake is done.
    ///
    /// Once that's done, the mpsc sender will be used to send
    /// subsequent cells to the circuit.
    Opening(oneshot::Sender<CreateResponse>, CircuitRxSender),

    /// A circuit that is open and can be given relay cells.
    Open(CircuitRxSender),

    /// A circuit where we have sent a DESTROY, but the other end
    /// might not have gotten a DESTROY yet.
    DestroySent(HalfCirc),
}

impl std::fmt::Debug for CircEnt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircEnt::Opening(_, _) => write!(f, "Opening"),
            CircEnt::Open(_) => write!(f, "Open"),
            CircEnt::DestroySent(_) => write!(f, "DestroySent"),
        }
    }
}

/// A map from circuit IDs to circuit entries. Each channel has one.
pub(super) struct CircMap {
    /// Map from circuit IDs to entries
    m: HashMap<CircId, CircEnt>,
    /// Rule for allocating new circuit IDs.
    range: CircIdRange,
}

impl CircMap {
    /// Make a new empty CircMap.
    pub(super) fn new(idrange: CircIdRange) -> Self {
        CircMap {
            m: HashMap::new(),
            range: idrange,
        }
    }

    /// Add a new set of elements (corresponding to a
    /// PendingClientCirc) to this map.
    ///
    /// On success return the allocated circuit ID.
    pub(super) fn add_ent<R: Rng>(
        &mut self,
        rng: &mut R,
        createdsink: oneshot::Sender<CreateResponse>,
        sink: CircuitRxSender,
    ) -> Result<CircId> {
        /// How many times do we probe for a random circuit ID before
        /// we assume that the range is fully populated?
        ///
        /// (The reference implementation probes 64 times; with a mere
        /// 15 bits of space per side, a failure after 64 tries is a
        /// fine approximation of "actually full".)
        const N_ATTEMPTS: usize = 64;
        for _ in 0..N_ATTEMPTS {
            let id = self.range.sample(rng);
            if let Entry::Vacant(v) = self.m.entry(id) {
                v.insert(CircEnt::Opening(createdsink, sink));
                return Ok(id);
            }
        }
        Err(Error::IdRangeFull)
    }

    /// Testing only: install an entry in this circuit map without
    /// regard for consistency.
    #[cfg(test)]
    pub(super) fn put_unchecked(&mut self, id: CircId, ent: CircEnt) {
        self.m.insert(id, ent);
    }

    /// Return the entry for `id` in this map, if any.
    pub(super) fn get_mut(&mut self, id: CircId) -> Option<&mut CircEnt> {
        self.m.get_mut(&id)
    }

    /// See whether 'id' is an opening circuit.  If so, mark it "open"
    /// and return a oneshot::Sender that is waiting for its create
    /// cell.
    pub(super) fn advance_from_opening(
        &mut self,
        id: CircId,
    ) -> Result<oneshot::Sender<CreateResponse>> {
        let ok = matches!(self.m.get(&id), Some(CircEnt::Opening(_, _)));
        if ok {
            if let Some(CircEnt::Opening(oneshot, sink)) = self.m.remove(&id) {
                self.m.insert(id, CircEnt::Open(sink));
                Ok(oneshot)
            } else {
                panic!("internal error: inconsistent circuit state");
            }
        } else {
            Err(Error::ChanProto(
                "Unexpected CREATED* cell not on opening circuit".into(),
            ))
        }
    }

    /// Called when we have sent a DESTROY on a circuit.  Configures a
    /// "HalfCirc" object to track how many cells we get on this
    /// circuit, and to prevent us from reusing it immediately.
    pub(super) fn destroy_sent(&mut self, id: CircId, hs: HalfCirc) {
        self.m.insert(id, CircEnt::DestroySent(hs));
    }

    /// Extract the value from this map with 'id' if any.
    pub(super) fn remove(&mut self, id: CircId) -> Option<CircEnt> {
        self.m.remove(&id)
    }

    /// Return the number of open or opening entries in this map.
    pub(super) fn open_ent_count(&self) -> usize {
        self.m
            .values()
            .filter(|v| !matches!(v, CircEnt::DestroySent(_)))
            .count()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn id_ranges() {
        let client = RsaIdentity::from([0; 20]);
        let relay = RsaIdentity::from([1; 20]);
        assert_eq!(
            CircIdRange::for_identities(&client, &relay),
            CircIdRange::Low
        );
        assert_eq!(
            CircIdRange::for_identities(&relay, &client),
            CircIdRange::High
        );
    }

    #[test]
    fn circmap_basics() {
        let mut map_low = CircMap::new(CircIdRange::Low);
        let mut map_high = CircMap::new(CircIdRange::High);
        let mut ids_low: Vec<CircId> = Vec::new();
        let mut ids_high: Vec<CircId> = Vec::new();
        let mut rng = testing_rng();

        assert!(map_low.get_mut(CircId::new(77).unwrap()).is_none());

        for _ in 0..128 {
            let (csnd, _) = oneshot::channel();
            let (snd, _rcv) = mpsc::channel(8);
            let id_low = map_low.add_ent(&mut rng, csnd, snd).unwrap();
            assert!(u16::from(id_low) > 0);
            assert!(u16::from(id_low) < 0x8000);
            assert!(!ids_low.contains(&id_low));
            ids_low.push(id_low);

            assert!(matches!(
                map_low.get_mut(id_low),
                Some(CircEnt::Opening(_, _))
            ));

            let (csnd, _) = oneshot::channel();
            let (snd, _rcv) = mpsc::channel(8);
            let id_high = map_high.add_ent(&mut rng, csnd, snd).unwrap();
            assert!(u16::from(id_high) >= 0x8000);
            assert!(!ids_high.contains(&id_high));
            ids_high.push(id_high);
        }

        assert_eq!(256, map_low.open_ent_count() + map_high.open_ent_count());

        // Test remove.
        assert!(map_low.get_mut(ids_low[0]).is_some());
        map_low.remove(ids_low[0]);
        assert!(map_low.get_mut(ids_low[0]).is_none());

        // Test DestroySent doesn't count as open.
        map_low.destroy_sent(CircId::new(256).unwrap(), HalfCirc::new(1));
        assert_eq!(127, map_low.open_ent_count());

        // Test advance_from_opening.
        let adv = map_high.advance_from_opening(ids_high[0]);
        assert!(adv.is_ok());
        assert!(matches!(
            map_high.get_mut(ids_high[0]),
            Some(CircEnt::Open(_))
        ));

        // Can't double-advance.
        let adv = map_high.advance_from_opening(ids_high[0]);
        assert!(adv.is_err());

        // Can't advance an entry that is not there.  We know "77"
        // can't be in map_high, since we only added high circids to
        // it.
        let adv = map_high.advance_from_opening(CircId::new(77).unwrap());
        assert!(adv.is_err());
    }

    #[test]
    fn id_exhaustion() {
        // When the ID space is (effectively) full, we get IdRangeFull
        // rather than a collision.
        let mut map = CircMap::new(CircIdRange::Low);
        let mut rng = testing_rng();
        // Fill in every possible low-range ID.
        for id in 1..0x8000_u16 {
            map.put_unchecked(
                CircId::new(id).unwrap(),
                CircEnt::DestroySent(HalfCirc::new(1)),
            );
        }
        let (csnd, _) = oneshot::channel();
        let (snd, _rcv) = mpsc::channel(8);
        let r = map.add_ent(&mut rng, csnd, snd);
        assert!(matches!(r, Err(Error::IdRangeFull)));
    }
}
