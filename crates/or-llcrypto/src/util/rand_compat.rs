//! Compatibility utilities for working with libraries that consume
//! older versions of rand_core.
//!
//! The [`rsa`] crate is currently stuck on [`rand_core`] 0.6, but
//! everywhere else in this workspace we use the latest [`rand_core`].
//! The extension trait in this module lets us hand a modern RNG to the
//! older APIs.
//!
//! # Example
//!
//! ```
//! use or_llcrypto::util::rand_compat::RngCompatExt;
//!
//! let mut rng = rand::rng();
//! let mut old_style_rng = rng.rng_compat();
//! // old_style_rng implements the rand_core 0.6 RngCore + CryptoRng
//! ```

use rand_core::{CryptoRng, RngCore};
use rand_core_06::{CryptoRng as OldCryptoRng, Error as OldError, RngCore as OldRngCore};

/// Extension trait for the _current_ versions of [`RngCore`]; adds a
/// compatibility-wrapper function.
pub trait RngCompatExt: RngCore + Sized {
    /// Return a version of this Rng that can be used with older
    /// versions of the rand_core and rand libraries.
    fn rng_compat(&mut self) -> RngWrapper<'_, Self>;
}

impl<T: RngCore + Sized> RngCompatExt for T {
    fn rng_compat(&mut self) -> RngWrapper<'_, Self> {
        RngWrapper(self)
    }
}

/// A new-style Rng, wrapped for backward compatibility.
///
/// This object implements the version of [`RngCore`] from rand_core
/// 0.6 that older cryptography crates expect.
pub struct RngWrapper<'a, T>(&'a mut T);

impl<'a, T: RngCore> OldRngCore for RngWrapper<'a, T> {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), OldError> {
        self.0.fill_bytes(dest);
        Ok(())
    }
}

impl<'a, T: CryptoRng> OldCryptoRng for RngWrapper<'a, T> {}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn wrapper_as_old() {
        let mut rng = testing_rng();
        let mut rng2 = testing_rng();
        // Same seed can't be guaranteed here, so just check that all
        // the entry points work and produce *some* randomness.
        let mut wrapped = rng.rng_compat();

        let mut ones = 0_u64;
        for _ in 0..64 {
            ones |= OldRngCore::next_u64(&mut wrapped);
        }
        assert_ne!(ones, 0);

        let mut bytes = [0_u8; 32];
        OldRngCore::fill_bytes(&mut wrapped, &mut bytes);
        let mut bytes2 = [0_u8; 32];
        OldRngCore::try_fill_bytes(&mut rng2.rng_compat(), &mut bytes2).unwrap();
        // (These are independent RNGs; equal output would be absurd.)
        assert_ne!(bytes, [0_u8; 32]);
        assert_ne!(bytes2, [0_u8; 32]);
    }
}
