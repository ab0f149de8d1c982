//! Relay cell cryptography
//!
//! The protocol centers around "RELAY cells", which are transmitted
//! through the network along circuits.  The client that creates a
//! circuit shares two different sets of keys and state with each of
//! the relays on the circuit: one for "outbound" traffic, and one for
//! "inbound" traffic.  In this module we call each of these state
//! objects a "layer" of the circuit's encryption.
//!
//! Each layer contains:
//!    * A keyed AES-128-CTR state. (This cipher uses a key called
//!      `Kf` or `Kb` in the spec, where `Kf` is a "forward" key used
//!      in the outbound direction, and `Kb` is a "backward" key used
//!      in the inbound direction.)
//!    * A running SHA-1 digest, seeded with a value called `Df` or
//!      `Db`.
//!
//! The [`tor1`] module implements these layers; this module provides
//! the traits and the whole-circuit "stack" objects built from them.

pub(crate) mod tor1;

use crate::{Error, Result};
use or_cell::chancell::BoxedCellBody;

/// Type for the body of a relay cell.
#[derive(Clone)]
pub(crate) struct RelayCellBody(BoxedCellBody);

impl From<BoxedCellBody> for RelayCellBody {
    fn from(body: BoxedCellBody) -> Self {
        RelayCellBody(body)
    }
}
impl From<RelayCellBody> for BoxedCellBody {
    fn from(cell: RelayCellBody) -> Self {
        cell.0
    }
}
impl AsRef<[u8]> for RelayCellBody {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl AsMut<[u8]> for RelayCellBody {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

/// Represents the ability for one hop of a circuit's cryptographic
/// state to be initialized from a given seed.
pub(crate) trait CryptInit: Sized {
    /// Return the number of bytes that this state will require.
    fn seed_len() -> usize;
    /// Construct this state from a seed of the appropriate length.
    fn initialize(seed: &[u8]) -> Result<Self>;
    /// Initialize this object from a key generator.
    fn construct<K: super::handshake::KeyGenerator>(keygen: K) -> Result<Self> {
        let seed = keygen.expand(Self::seed_len())?;
        Self::initialize(&seed[..])
    }
}

/// A paired object containing the inbound and outbound cryptographic
/// layers used by a client to communicate with a single hop on one of
/// its circuits.
pub(crate) trait ClientLayer<F, B>
where
    F: OutboundClientLayer,
    B: InboundClientLayer,
{
    /// Consume this ClientLayer and return a paired forward and
    /// reverse crypto layer.
    fn split_client_layer(self) -> (F, B);
}

/// A paired object containing the inbound and outbound cryptographic
/// layers used by a relay to implement a client's circuits.
///
/// (We do not act as a relay, but the relay side of the crypto is
/// what lets us exercise the client side end-to-end in tests.)
pub(crate) trait RelayLayer<F, B>
where
    F: OutboundRelayLayer,
    B: InboundRelayLayer,
{
    /// Consume this RelayLayer and return a paired forward and
    /// reverse crypto layer.
    fn split_relay_layer(self) -> (F, B);
}

/// A client's view of the cryptographic state shared with a single
/// relay on a circuit, as used for outbound cells.
pub(crate) trait OutboundClientLayer {
    /// Prepare a RelayCellBody to be sent to the relay at this layer,
    /// and encrypt it.
    fn originate_for(&mut self, cell: &mut RelayCellBody);
    /// Encrypt a RelayCellBody to be decrypted by this layer.
    fn encrypt_outbound(&mut self, cell: &mut RelayCellBody);
}

/// A client's view of the crypto state shared with a single relay on
/// a circuit, as used for inbound cells.
pub(crate) trait InboundClientLayer {
    /// Decrypt a CellBody that passed through this layer.
    ///
    /// Return true if this layer is the originator.
    fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> bool;
}

/// A relay's view of the inbound crypto state on a given circuit.
pub(crate) trait InboundRelayLayer {
    /// Prepare a RelayCellBody to be sent towards the client, and
    /// encrypt it.
    fn originate(&mut self, cell: &mut RelayCellBody);
    /// Encrypt a RelayCellBody that is moving towards the client.
    fn encrypt_inbound(&mut self, cell: &mut RelayCellBody);
}

/// A relay's view of the outbound crypto state on a given circuit.
pub(crate) trait OutboundRelayLayer {
    /// Decrypt a RelayCellBody that is coming from the client.
    ///
    /// Return true if it is addressed to us.
    fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> bool;
}

/// Type to store hop indices on a circuit.
///
/// Hop indices are zero-based: "0" denotes the first hop on the
/// circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct HopNum(u8);

impl HopNum {
    /// Return true if this is the first hop of a circuit.
    pub fn is_first_hop(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for HopNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display 1-indexed, for consistency with how people talk
        // about circuits.
        write!(f, "#{}", self.0 + 1)
    }
}

impl From<HopNum> for u8 {
    fn from(hop: HopNum) -> u8 {
        hop.0
    }
}

impl From<u8> for HopNum {
    fn from(v: u8) -> HopNum {
        HopNum(v)
    }
}

impl From<HopNum> for usize {
    fn from(hop: HopNum) -> usize {
        hop.0 as usize
    }
}

/// A client's view of the cryptographic state for an entire
/// constructed circuit, as used for sending cells.
pub(crate) struct OutboundClientCrypt {
    /// Vector of layers, one for each hop on the circuit, ordered
    /// from the closest hop to the farthest.
    layers: Vec<Box<dyn OutboundClientLayer + Send>>,
}

/// A client's view of the cryptographic state for an entire
/// constructed circuit, as used for receiving cells.
pub(crate) struct InboundClientCrypt {
    /// Vector of layers, one for each hop on the circuit, ordered
    /// from the closest hop to the farthest.
    layers: Vec<Box<dyn InboundClientLayer + Send>>,
}

impl OutboundClientCrypt {
    /// Return a new (empty) OutboundClientCrypt.
    pub(crate) fn new() -> Self {
        OutboundClientCrypt { layers: Vec::new() }
    }
    /// Prepare a cell body to be sent away from the client.
    ///
    /// The cell is prepared for the `hop`th hop, and then encrypted
    /// with the appropriate keys.
    pub(crate) fn encrypt(&mut self, cell: &mut RelayCellBody, hop: HopNum) -> Result<()> {
        let hop: usize = hop.into();
        if hop >= self.layers.len() {
            return Err(Error::NoSuchHop);
        }

        let mut layers = self.layers.iter_mut().take(hop + 1).rev();
        let first_layer = layers.next().ok_or(Error::NoSuchHop)?;
        first_layer.originate_for(cell);
        for layer in layers {
            layer.encrypt_outbound(cell);
        }
        Ok(())
    }

    /// Add a new layer to this OutboundClientCrypt.
    pub(crate) fn add_layer(&mut self, layer: Box<dyn OutboundClientLayer + Send>) {
        assert!(self.layers.len() < u8::MAX as usize);
        self.layers.push(layer);
    }

    /// Remove every layer after the first `n`.
    ///
    /// (Used when the circuit has been truncated.)
    pub(crate) fn truncate(&mut self, n: usize) {
        self.layers.truncate(n);
    }

    /// Return the number of layers configured on this
    /// OutboundClientCrypt.
    pub(crate) fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

impl InboundClientCrypt {
    /// Return a new (empty) InboundClientCrypt.
    pub(crate) fn new() -> Self {
        InboundClientCrypt { layers: Vec::new() }
    }
    /// Decrypt an incoming cell that is coming to the client.
    ///
    /// On success, return which hop was the originator of the cell.
    pub(crate) fn decrypt(&mut self, cell: &mut RelayCellBody) -> Result<HopNum> {
        for (hopnum, layer) in self.layers.iter_mut().enumerate() {
            if layer.decrypt_inbound(cell) {
                let hopnum = HopNum(u8::try_from(hopnum).expect("Somehow > 255 hops"));
                return Ok(hopnum);
            }
        }
        Err(Error::BadCellAuth)
    }
    /// Add a new layer to this InboundClientCrypt.
    pub(crate) fn add_layer(&mut self, layer: Box<dyn InboundClientLayer + Send>) {
        assert!(self.layers.len() < u8::MAX as usize);
        self.layers.push(layer);
    }

    /// Remove every layer after the first `n`.
    ///
    /// (Used when the circuit has been truncated.)
    pub(crate) fn truncate(&mut self, n: usize) {
        self.layers.truncate(n);
    }

    /// Return the number of layers configured on this
    /// InboundClientCrypt.
    #[allow(dead_code)]
    pub(crate) fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Standard relay crypto, as instantiated for RELAY cells.
pub(crate) type Tor1RelayCrypto =
    tor1::CryptStatePair<or_llcrypto::cipher::aes::Aes128Ctr, or_llcrypto::d::Sha1>;

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::RngCore;
    use or_basic_utils::test_rng::testing_rng;

    pub(crate) fn add_layers(
        cc_out: &mut OutboundClientCrypt,
        cc_in: &mut InboundClientCrypt,
        pair: Tor1RelayCrypto,
    ) {
        let (outbound, inbound) = pair.split_client_layer();
        cc_out.add_layer(Box::new(outbound));
        cc_in.add_layer(Box::new(inbound));
    }

    #[test]
    fn roundtrip() {
        // Take canned keys and make sure we can do crypto correctly.
        use crate::crypto::handshake::TapKeyGenerator;
        fn s(seed: &[u8]) -> or_bytes::SecretBuf {
            seed.to_vec().into()
        }

        let seed1 = s(b"hidden we are free");
        let seed2 = s(b"free to speak, to free ourselves");
        let seed3 = s(b"free to hide no more");

        let mut cc_out = OutboundClientCrypt::new();
        let mut cc_in = InboundClientCrypt::new();
        let pair = Tor1RelayCrypto::construct(TapKeyGenerator::new(seed1.clone())).unwrap();
        add_layers(&mut cc_out, &mut cc_in, pair);
        let pair = Tor1RelayCrypto::construct(TapKeyGenerator::new(seed2.clone())).unwrap();
        add_layers(&mut cc_out, &mut cc_in, pair);
        let pair = Tor1RelayCrypto::construct(TapKeyGenerator::new(seed3.clone())).unwrap();
        add_layers(&mut cc_out, &mut cc_in, pair);

        assert_eq!(cc_in.n_layers(), 3);
        assert_eq!(cc_out.n_layers(), 3);

        let (mut r1f, mut r1b) = Tor1RelayCrypto::construct(TapKeyGenerator::new(seed1))
            .unwrap()
            .split_relay_layer();
        let (mut r2f, mut r2b) = Tor1RelayCrypto::construct(TapKeyGenerator::new(seed2))
            .unwrap()
            .split_relay_layer();
        let (mut r3f, mut r3b) = Tor1RelayCrypto::construct(TapKeyGenerator::new(seed3))
            .unwrap()
            .split_relay_layer();

        let mut rng = testing_rng();
        for _ in 1..300 {
            // outbound cell
            let mut cell = Box::new([0_u8; 509]);
            let mut cell_orig = [0_u8; 509];
            rng.fill_bytes(&mut cell_orig);
            cell.copy_from_slice(&cell_orig);
            let mut cell = cell.into();
            cc_out.encrypt(&mut cell, 2.into()).unwrap();
            assert_ne!(&cell.as_ref()[9..], &cell_orig.as_ref()[9..]);
            assert!(!r1f.decrypt_outbound(&mut cell));
            assert!(!r2f.decrypt_outbound(&mut cell));
            assert!(r3f.decrypt_outbound(&mut cell));

            assert_eq!(&cell.as_ref()[9..], &cell_orig.as_ref()[9..]);

            // inbound cell
            let mut cell = Box::new([0_u8; 509]);
            let mut cell_orig = [0_u8; 509];
            rng.fill_bytes(&mut cell_orig);
            cell.copy_from_slice(&cell_orig);
            let mut cell = cell.into();

            r3b.originate(&mut cell);
            r2b.encrypt_inbound(&mut cell);
            r1b.encrypt_inbound(&mut cell);
            let layer = cc_in.decrypt(&mut cell).unwrap();
            assert_eq!(layer, 2.into());
            assert_eq!(&cell.as_ref()[9..], &cell_orig.as_ref()[9..]);
        }

        // Try a failure: sending a cell to a nonexistent hop.
        {
            let mut cell = Box::new([0_u8; 509]).into();
            let err = cc_out.encrypt(&mut cell, 10.into());
            assert!(matches!(err, Err(Error::NoSuchHop)));
        }

        // Try a failure: A junk cell with no correct auth from any
        // layer.
        {
            let mut cell = Box::new([0_u8; 509]).into();
            let err = cc_in.decrypt(&mut cell);
            assert!(matches!(err, Err(Error::BadCellAuth)));
        }
    }

    #[test]
    fn hop_num_display() {
        for i in 0..10 {
            let hop_num = HopNum::from(i);
            let expect = format!("#{}", i + 1);
            assert_eq!(expect, hop_num.to_string());
        }
        assert!(HopNum::from(0).is_first_hop());
        assert!(!HopNum::from(1).is_first_hop());
    }
}
