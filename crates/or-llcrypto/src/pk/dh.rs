//! Diffie-Hellman over the fixed 1024-bit TAP group.
//!
//! The TAP circuit-extension handshake and the hidden-service
//! rendezvous handshake both do a classic Diffie-Hellman exchange in
//! the 1024-bit "Second Oakley Group" (RFC 2409, section 6.2), with
//! generator 2.  Private exponents are 320 bits long, as in the
//! reference implementation.

use num_bigint_dig::BigUint;
use rand::{CryptoRng, RngCore};
use std::sync::OnceLock;
use zeroize::Zeroizing;

/// Length of a DH public key, in bytes: the size of the group modulus.
pub const DH_LEN: usize = 128;
/// Length of a DH private exponent, in bytes.
pub const DH_SEC_LEN: usize = 40;
/// The generator for our group.
const DH_GENERATOR: u32 = 2;

/// The hex representation of the 1024-bit safe prime from RFC 2409,
/// section 6.2.
const OAKLEY2_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

/// Return the group modulus.
fn modulus() -> &'static BigUint {
    /// Lazily-decoded modulus.
    static P: OnceLock<BigUint> = OnceLock::new();
    P.get_or_init(|| {
        let bytes = hex::decode(OAKLEY2_PRIME_HEX).expect("invalid modulus constant");
        BigUint::from_bytes_be(&bytes)
    })
}

/// An error from a DH operation.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum DhError {
    /// The peer's alleged public key was not a valid group element.
    ///
    /// (We reject y <= 1 and y >= p-1, as the reference
    /// implementation does: those values leak the shared secret.)
    #[error("invalid DH public key from peer")]
    InvalidPublicKey,
}

/// A Diffie-Hellman private key, with its corresponding public key.
pub struct KeyPair {
    /// The private exponent x.
    x: BigUint,
    /// The public value g^x, encoded big-endian and zero-padded to
    /// [`DH_LEN`] bytes.
    public: [u8; DH_LEN],
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret = Zeroizing::new([0_u8; DH_SEC_LEN]);
        rng.fill_bytes(&mut secret[..]);
        let x = BigUint::from_bytes_be(&secret[..]);
        let gx = BigUint::from(DH_GENERATOR).modpow(&x, modulus());
        KeyPair {
            public: encode_padded(&gx),
            x,
        }
    }

    /// Return our public key, encoded for the wire.
    pub fn public_key(&self) -> &[u8; DH_LEN] {
        &self.public
    }

    /// Complete the key exchange with the peer's public value, and
    /// return the shared secret.
    ///
    /// Note that, as in the reference implementation, the shared
    /// secret is the big-endian representation of g^xy with leading
    /// zero octets stripped; both sides compute the same value.
    pub fn compute_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, DhError> {
        let y = BigUint::from_bytes_be(peer_public);
        let p = modulus();
        // Reject degenerate keys.
        let one = BigUint::from(1_u32);
        if y <= one || y >= p - &one {
            return Err(DhError::InvalidPublicKey);
        }
        let secret = y.modpow(&self.x, p);
        Ok(Zeroizing::new(secret.to_bytes_be()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Deliberately not showing the private exponent.
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

/// Encode `n` big-endian, padded with leading zeros to exactly
/// [`DH_LEN`] bytes.
///
/// Panics if `n` does not fit, which cannot happen for a reduced
/// group element.
fn encode_padded(n: &BigUint) -> [u8; DH_LEN] {
    let bytes = n.to_bytes_be();
    assert!(bytes.len() <= DH_LEN);
    let mut out = [0_u8; DH_LEN];
    out[DH_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn exchange() {
        let mut rng = testing_rng();
        let kp1 = KeyPair::generate(&mut rng);
        let kp2 = KeyPair::generate(&mut rng);

        let s1 = kp1.compute_secret(&kp2.public_key()[..]).unwrap();
        let s2 = kp2.compute_secret(&kp1.public_key()[..]).unwrap();
        assert_eq!(&s1[..], &s2[..]);
        assert!(!s1.is_empty());
        assert!(s1.len() <= DH_LEN);
    }

    #[test]
    fn reject_degenerate() {
        let mut rng = testing_rng();
        let kp = KeyPair::generate(&mut rng);

        // y = 0 and y = 1 are rejected.
        assert!(matches!(
            kp.compute_secret(&[0_u8; DH_LEN]),
            Err(DhError::InvalidPublicKey)
        ));
        let mut one = [0_u8; DH_LEN];
        one[DH_LEN - 1] = 1;
        assert!(matches!(
            kp.compute_secret(&one),
            Err(DhError::InvalidPublicKey)
        ));

        // y = p-1 is rejected.
        let p_minus_1 = modulus() - BigUint::from(1_u32);
        assert!(matches!(
            kp.compute_secret(&encode_padded(&p_minus_1)),
            Err(DhError::InvalidPublicKey)
        ));
    }

    #[test]
    fn public_key_is_padded() {
        let mut rng = testing_rng();
        let kp = KeyPair::generate(&mut rng);
        assert_eq!(kp.public_key().len(), DH_LEN);
    }
}
