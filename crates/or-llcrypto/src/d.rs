//! Digests used to implement the onion-routing protocol.
//!
//! For legacy reasons, the protocol era we implement uses SHA-1
//! everywhere: for relay identities, for the rolling relay-cell
//! digests, and for the KDF.  We re-export it here in a form
//! implementing the [`digest::Digest`] traits.
//!
//! Other code should access this digest via the traits in the
//! [`digest`] crate.  The rolling-digest code additionally relies on
//! the hasher state being `Clone`.

pub use sha1::Sha1;

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use digest::Digest;
    use hex_literal::hex;

    #[test]
    fn sha1_testvec() {
        let d = Sha1::digest(b"abc");
        assert_eq!(d.as_slice(), hex!("a9993e364706816aba3e25717850c26c9cd0d89d"));
    }

    #[test]
    fn sha1_clonable_state() {
        // The relay crypto depends on being able to fork a running
        // digest and keep both copies.
        let mut d1 = Sha1::new();
        d1.update(b"hello ");
        let mut d2 = d1.clone();
        d1.update(b"world");
        d2.update(b"world");
        assert_eq!(d1.finalize(), d2.finalize());
    }
}
