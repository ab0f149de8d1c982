//! Ciphers used to implement the onion-routing protocols.
//!
//! Fortunately, the protocol era we implement managed not to
//! proliferate ciphers.  It only uses AES, and only in counter mode.

/// Re-exports implementations of counter-mode AES.
///
/// These ciphers implement the `cipher::StreamCipher` trait, so use
/// the [`cipher`](https://docs.rs/cipher) crate to access them.
pub mod aes {
    // These implement StreamCipher.
    /// AES128 in counter mode as used by the relay-cell crypto and the
    /// TAP handshake.
    pub type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::aes::Aes128Ctr;
    use cipher::{KeyIvInit, StreamCipher};
    use hex_literal::hex;

    #[test]
    fn aes128_ctr_testvec() {
        // From NIST SP 800-38A, F.5.1 (CTR-AES128.Encrypt), first block.
        let key = hex!("2b7e151628aed2a6abf7158809cf4f3c");
        let iv = hex!("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let mut plain = hex!("6bc1bee22e409f96e93d7e117393172a");

        let mut cipher = Aes128Ctr::new(&key.into(), &iv.into());
        cipher.apply_keystream(&mut plain);
        assert_eq!(plain, hex!("874d6191b620e3261bef6864990db6ce"));
    }

    #[test]
    fn aes128_ctr_zero_iv() {
        // The relay crypto always starts its counter at zero.
        let key = [7_u8; 16];
        let mut a = *b"an unexceptional test vector....";
        let mut c1 = Aes128Ctr::new(&key.into(), &[0_u8; 16].into());
        let mut c2 = Aes128Ctr::new(&key.into(), &Default::default());
        let mut b = a;
        c1.apply_keystream(&mut a);
        c2.apply_keystream(&mut b);
        assert_eq!(a, b);
    }
}
