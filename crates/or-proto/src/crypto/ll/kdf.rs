//! Key derivation functions
//!
//! The protocol era we implement has a single key derivation
//! function, "KDF-TOR", used to generate the session keys for its
//! handshakes: concatenate H(K | [00]), H(K | [01]), and so on, until
//! enough material has been generated.
//!
//! It is ugly and limited, but since the first 20 bytes of its output
//! (the "KH" check value) are used on the wire, we can't replace it.

use crate::{Error, Result};
use digest::Digest;
use or_bytes::SecretBuf;
use or_error::internal;
use or_llcrypto::d::Sha1;

/// A trait for a key derivation function.
pub(crate) trait Kdf {
    /// Derive `n_bytes` of key data from some secret `seed`.
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBuf>;
}

/// A legacy KDF, for use with TAP and CREATE_FAST.
///
/// This KDF is based on SHA-1.
pub(crate) struct LegacyKdf {
    /// The number to use as the first suffix byte.
    ///
    /// The key-derivation stream starts with H(seed | [idx]).
    /// Setting `idx` to 1 skips the first hash block of the stream,
    /// which is exactly the "KH" value that the handshakes check
    /// separately.
    idx: u8,
}

impl LegacyKdf {
    /// Instantiate a LegacyKdf, with a given starting index.
    pub(crate) fn new(idx: u8) -> Self {
        LegacyKdf { idx }
    }
}
impl Kdf for LegacyKdf {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBuf> {
        let mut result = SecretBuf::with_capacity(n_bytes + Sha1::output_size());
        let mut k = self.idx;
        if n_bytes > Sha1::output_size() * ((255 - k as usize) + 1) {
            return Err(Error::from(internal!("Tried to extract too many bytes")));
        }

        let mut digest_output = Default::default();
        while result.len() < n_bytes {
            let mut d = Sha1::new();
            d.update(seed);
            d.update([k]);
            d.finalize_into(&mut digest_output);
            result.extend_from_slice(&digest_output);
            k += 1;
        }

        result.truncate(n_bytes);
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn clearbox_testcase() {
        // Calculated by hand, with a python implementation of
        // SHA1(b"x" * 30 + bytes([i])) for i in 0, 1, ...
        let input = b"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxx";
        let result = LegacyKdf::new(0).derive(input, 40).unwrap();
        let mut expect = Vec::new();
        {
            use digest::Digest;
            let mut d = Sha1::new();
            d.update(input);
            d.update([0_u8]);
            expect.extend_from_slice(&d.finalize()[..]);
            let mut d = Sha1::new();
            d.update(input);
            d.update([1_u8]);
            expect.extend_from_slice(&d.finalize()[..]);
        }
        assert_eq!(&result[..], &expect[..]);

        // Starting at index 1 skips the first block.
        let result2 = LegacyKdf::new(1).derive(input, 20).unwrap();
        assert_eq!(&result2[..], &expect[20..40]);
    }

    #[test]
    fn kdf_tor_vector() {
        // With an empty seed, the stream is SHA1([0]) | SHA1([1]) | ...;
        // these are well-known digest values.
        let result = LegacyKdf::new(0).derive(b"", 40).unwrap();
        assert_eq!(
            &result[..20],
            &hex!("5ba93c9db0cff93f52b521d7420e43f6eda2784f")[..]
        );
        assert_eq!(
            &result[20..40],
            &hex!("bf8b4530d8d246dd74ac53a13471bba17941dff7")[..]
        );

        // Deriving a shorter prefix gives a prefix of the longer
        // result.
        let shorter = LegacyKdf::new(0).derive(b"", 30).unwrap();
        assert_eq!(&shorter[..], &result[..30]);
    }

    #[test]
    fn too_much() {
        // Ask for more bytes than the KDF can ever produce.
        let r = LegacyKdf::new(200).derive(b"seed", 20 * 100);
        assert!(r.is_err());
    }
}
