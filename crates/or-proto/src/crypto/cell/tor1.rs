//! An implementation of the era's relay cell cryptography.
//!
//! These are not very good algorithms; they were the best anyone
//! could come up with in ~2002.  They are somewhat inefficient, and
//! vulnerable to tagging attacks.  Each layer is an AES-CTR stream
//! cipher plus a running SHA-1 digest over every cell that the layer
//! has originated or recognized.

use cipher::{KeyIvInit, StreamCipher};
use digest::{generic_array::GenericArray, Digest};
use or_cell::relaycell::crypt::{DIGEST_RANGE, EMPTY_DIGEST, RECOGNIZED_RANGE};
use or_error::internal;
use or_llcrypto::util::ct;

use crate::{Error, Result};

use super::{
    ClientLayer, CryptInit, InboundClientLayer, InboundRelayLayer, OutboundClientLayer,
    OutboundRelayLayer, RelayCellBody, RelayLayer,
};

/// A CryptState represents one layer of shared cryptographic state
/// between a relay and a client for a single hop, in a single
/// direction.
///
/// For example, if a client makes a 3-hop circuit, then it will have
/// 6 `CryptState`s, one for each relay, for each direction of
/// communication.
///
/// Note that although `CryptState` implements [`OutboundClientLayer`],
/// [`InboundClientLayer`], [`OutboundRelayLayer`], and
/// [`InboundRelayLayer`], a given instance will only be used for one
/// of these roles.
pub(crate) struct CryptState<SC: StreamCipher, D: Digest + Clone> {
    /// Stream cipher for en/decrypting cell bodies.
    ///
    /// This cipher is the one keyed with Kf or Kb in the spec.
    cipher: SC,
    /// Digest for authenticating cells to/from this hop.
    ///
    /// This digest is the one seeded with Df or Db in the spec.
    digest: D,
    /// Most recent digest value computed by this layer.
    last_digest_val: GenericArray<u8, D::OutputSize>,
}

/// A pair of CryptStates shared between a client and a relay, one for
/// the outbound (away from the client) direction, and one for the
/// inbound (towards the client) direction.
pub(crate) struct CryptStatePair<SC: StreamCipher, D: Digest + Clone> {
    /// State for en/decrypting cells sent away from the client.
    fwd: CryptState<SC, D>,
    /// State for en/decrypting cells sent towards the client.
    back: CryptState<SC, D>,
}

impl<SC: StreamCipher + KeyIvInit, D: Digest + Clone> CryptInit for CryptStatePair<SC, D> {
    fn seed_len() -> usize {
        use cipher::KeySizeUser;
        use digest::OutputSizeUser;
        SC::key_size() * 2 + <D as OutputSizeUser>::output_size() * 2
    }
    fn initialize(seed: &[u8]) -> Result<Self> {
        // This corresponds to the expansion of the KDF output into
        // [Df | Db | Kf | Kb].
        if seed.len() != Self::seed_len() {
            return Err(Error::from(internal!(
                "seed length {} was invalid",
                seed.len()
            )));
        }

        use cipher::KeySizeUser;
        use digest::OutputSizeUser;
        let dlen = <D as OutputSizeUser>::output_size();
        let keylen = SC::key_size();

        let df = &seed[0..dlen];
        let db = &seed[dlen..dlen * 2];
        let kf = &seed[dlen * 2..dlen * 2 + keylen];
        let kb = &seed[dlen * 2 + keylen..dlen * 2 + keylen * 2];

        let fwd = CryptState {
            cipher: SC::new(kf.into(), &Default::default()),
            digest: D::new().chain_update(df),
            last_digest_val: GenericArray::default(),
        };
        let back = CryptState {
            cipher: SC::new(kb.into(), &Default::default()),
            digest: D::new().chain_update(db),
            last_digest_val: GenericArray::default(),
        };

        Ok(CryptStatePair { fwd, back })
    }
}

impl<SC, D> ClientLayer<CryptState<SC, D>, CryptState<SC, D>> for CryptStatePair<SC, D>
where
    SC: StreamCipher,
    D: Digest + Clone,
{
    fn split_client_layer(self) -> (CryptState<SC, D>, CryptState<SC, D>) {
        (self.fwd, self.back)
    }
}

impl<SC, D> RelayLayer<CryptState<SC, D>, CryptState<SC, D>> for CryptStatePair<SC, D>
where
    SC: StreamCipher,
    D: Digest + Clone,
{
    fn split_relay_layer(self) -> (CryptState<SC, D>, CryptState<SC, D>) {
        let CryptStatePair { fwd, back } = self;
        (fwd, back)
    }
}

impl<SC: StreamCipher, D: Digest + Clone> OutboundClientLayer for CryptState<SC, D> {
    fn originate_for(&mut self, cell: &mut RelayCellBody) {
        cell.set_digest(&mut self.digest, &mut self.last_digest_val);
        self.encrypt_outbound(cell);
    }
    fn encrypt_outbound(&mut self, cell: &mut RelayCellBody) {
        // One layer of the onion, applied in the outbound direction.
        self.cipher.apply_keystream(cell.as_mut());
    }
}

impl<SC: StreamCipher, D: Digest + Clone> InboundClientLayer for CryptState<SC, D> {
    fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> bool {
        self.cipher.apply_keystream(cell.as_mut());
        cell.is_recognized(&mut self.digest, &mut self.last_digest_val)
    }
}

impl<SC: StreamCipher, D: Digest + Clone> InboundRelayLayer for CryptState<SC, D> {
    fn originate(&mut self, cell: &mut RelayCellBody) {
        cell.set_digest(&mut self.digest, &mut self.last_digest_val);
        self.encrypt_inbound(cell);
    }
    fn encrypt_inbound(&mut self, cell: &mut RelayCellBody) {
        self.cipher.apply_keystream(cell.as_mut());
    }
}

impl<SC: StreamCipher, D: Digest + Clone> OutboundRelayLayer for CryptState<SC, D> {
    fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> bool {
        self.cipher.apply_keystream(cell.as_mut());
        cell.is_recognized(&mut self.digest, &mut self.last_digest_val)
    }
}

/// Functions on RelayCellBody that implement the digest/recognized
/// algorithm.
///
/// The relay crypto protocol uses two wholly inadequate fields to see
/// whether a cell is intended for its current recipient: a two-byte
/// "recognized" field that needs to be all-zero, and a four-byte
/// "digest" field containing a running digest of all the cells (for
/// this recipient) up to and including this one, seeded with Df or
/// Db.
impl RelayCellBody {
    /// Prepare a cell body by setting its digest and recognized
    /// fields.
    fn set_digest<D: Digest + Clone>(
        &mut self,
        d: &mut D,
        used_digest: &mut GenericArray<u8, D::OutputSize>,
    ) {
        self.as_mut()[RECOGNIZED_RANGE].fill(0);
        self.as_mut()[DIGEST_RANGE].fill(0);

        d.update(self.as_ref());
        // TODO(nickm) can we avoid this clone?  Probably not.
        *used_digest = d.clone().finalize();
        let used_digest_prefix = &used_digest[0..DIGEST_RANGE.len()];
        self.as_mut()[DIGEST_RANGE].copy_from_slice(used_digest_prefix);
    }

    /// Check whether this just-decrypted cell is now an authenticated
    /// plaintext.
    ///
    /// This method returns true if the `recognized` field is all
    /// zeros, and if the `digest` field is a digest of the correct
    /// material.
    ///
    /// If this method returns false, then either further decryption
    /// is required, or the cell is corrupt.
    fn is_recognized<D: Digest + Clone>(
        &self,
        d: &mut D,
        rcvd: &mut GenericArray<u8, D::OutputSize>,
    ) -> bool {
        // Validate 'Recognized' field.
        if !ct::is_zero(&self.as_ref()[RECOGNIZED_RANGE]) {
            return false;
        }

        // Now also validate the 'Digest' field:
        let mut dtmp = d.clone();
        // Add bytes up to the 'Digest' field.
        dtmp.update(&self.as_ref()[..DIGEST_RANGE.start]);
        // Add zeroes where the 'Digest' field is.
        dtmp.update(EMPTY_DIGEST);
        // Add the rest of the bytes.
        dtmp.update(&self.as_ref()[DIGEST_RANGE.end..]);
        // Clone the digest before finalize destroys it, because we
        // will need it as the running state for the next cell.
        let dtmp_clone = dtmp.clone();
        let result = dtmp.finalize();

        if ct::bytes_eq(&self.as_ref()[DIGEST_RANGE], &result[0..DIGEST_RANGE.len()]) {
            // Keep the running digest and the digest of this cell.
            *d = dtmp_clone;
            *rcvd = result;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::crypto::cell::{
        test::add_layers, InboundClientCrypt, OutboundClientCrypt, Tor1RelayCrypto,
    };
    use rand::RngCore;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn one_hop_roundtrip() {
        let mut rng = testing_rng();
        let mut seed = vec![0; Tor1RelayCrypto::seed_len()];
        rng.fill_bytes(&mut seed[..]);

        let (mut client_fwd, mut client_back) = Tor1RelayCrypto::initialize(&seed)
            .unwrap()
            .split_client_layer();
        let (mut relay_fwd, mut relay_back) = Tor1RelayCrypto::initialize(&seed)
            .unwrap()
            .split_relay_layer();

        for _ in 0..5 {
            // Outbound.
            let mut cell = RelayCellBody(Box::new([0_u8; 509]));
            rng.fill_bytes(cell.as_mut());
            let orig = cell.clone();
            client_fwd.originate_for(&mut cell);
            assert_ne!(cell.as_ref()[11..], orig.as_ref()[11..]);
            assert!(relay_fwd.decrypt_outbound(&mut cell));
            assert_eq!(cell.as_ref()[11..], orig.as_ref()[11..]);

            // Inbound.
            let mut cell = RelayCellBody(Box::new([0_u8; 509]));
            rng.fill_bytes(cell.as_mut());
            let orig = cell.clone();
            relay_back.originate(&mut cell);
            assert!(client_back.decrypt_inbound(&mut cell));
            assert_eq!(cell.as_ref()[11..], orig.as_ref()[11..]);
        }
    }

    #[test]
    fn tampered_digest_is_unrecognized() {
        let mut rng = testing_rng();
        let mut seed = vec![0; Tor1RelayCrypto::seed_len()];
        rng.fill_bytes(&mut seed[..]);

        let mut cc_out = OutboundClientCrypt::new();
        let mut cc_in = InboundClientCrypt::new();
        add_layers(
            &mut cc_out,
            &mut cc_in,
            Tor1RelayCrypto::initialize(&seed).unwrap(),
        );
        let (_, mut relay_back) = Tor1RelayCrypto::initialize(&seed)
            .unwrap()
            .split_relay_layer();

        // Derived from the same seed, an inbound cell is recognized...
        let mut cell = RelayCellBody(Box::new([0_u8; 509]));
        relay_back.originate(&mut cell);
        // ...unless we flip a bit in the digest field of the
        // ciphertext.
        cell.as_mut()[DIGEST_RANGE.start] ^= 1;
        assert!(cc_in.decrypt(&mut cell).is_err());
    }

    #[test]
    fn rolling_digest_requires_order() {
        // If cells are decrypted out of order, the rolling digest
        // won't match.
        let mut rng = testing_rng();
        let mut seed = vec![0; Tor1RelayCrypto::seed_len()];
        rng.fill_bytes(&mut seed[..]);

        let (_, mut client_back) = Tor1RelayCrypto::initialize(&seed)
            .unwrap()
            .split_client_layer();
        let (_, mut relay_back) = Tor1RelayCrypto::initialize(&seed)
            .unwrap()
            .split_relay_layer();

        let mut c1 = RelayCellBody(Box::new([1_u8; 509]));
        let mut c2 = RelayCellBody(Box::new([2_u8; 509]));
        relay_back.originate(&mut c1);
        relay_back.originate(&mut c2);

        // Delivering the second cell first fails; the cipher stream
        // and digest are both out of sync.
        assert!(!client_back.decrypt_inbound(&mut c2));
    }
}
