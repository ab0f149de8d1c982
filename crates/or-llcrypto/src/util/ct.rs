//! Define helpers for working with types in constant time.

use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};
use zeroize::Zeroize;

/// A byte array of length N for which comparisons are performed in
/// constant time.
///
/// # Limitations
///
/// It is possible to avoid constant time comparisons here, just by
/// using the `as_ref()` and `as_mut()` methods.  They should therefore
/// be approached with some caution.
#[allow(clippy::derived_hash_with_manual_eq)]
#[derive(Clone, Copy, Debug, Hash, Zeroize)]
pub struct CtByteArray<const N: usize>([u8; N]);

impl<const N: usize> ConstantTimeEq for CtByteArray<N> {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

impl<const N: usize> PartialEq for CtByteArray<N> {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}
impl<const N: usize> Eq for CtByteArray<N> {}

impl<const N: usize> From<[u8; N]> for CtByteArray<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<CtByteArray<N>> for [u8; N] {
    fn from(value: CtByteArray<N>) -> Self {
        value.0
    }
}

impl<const N: usize> Ord for CtByteArray<N> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // At every point, this value will be set to:
        //       0 if a[i]==b[i] for all i considered so far.
        //       a[i] - b[i] for the lowest i that has a nonzero
        //       difference.
        let mut first_nonzero_difference = 0_i16;

        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let difference = i16::from(*a) - i16::from(*b);

            // If it's already set to a nonzero value, this conditional
            // assignment does nothing. Otherwise, it sets it to
            // `difference`.
            //
            // The use of conditional_assign and ct_eq ensures that the
            // compiler won't short-circuit our logic here and end the
            // loop (or stop computing differences) on the first nonzero
            // difference.
            first_nonzero_difference
                .conditional_assign(&difference, first_nonzero_difference.ct_eq(&0));
        }

        // This comparison with zero is not itself constant-time, but
        // that's okay: we only want our Ord function not to leak the
        // array values.
        first_nonzero_difference.cmp(&0)
    }
}

impl<const N: usize> PartialOrd for CtByteArray<N> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> AsRef<[u8; N]> for CtByteArray<N> {
    fn as_ref(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> AsMut<[u8; N]> for CtByteArray<N> {
    fn as_mut(&mut self) -> &mut [u8; N] {
        &mut self.0
    }
}

/// Compare two slices for equality in constant time.
///
/// If the slices are of different lengths, the answer is false, and
/// the amount of time taken does not depend on their contents.
pub fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Return true if every byte of `x` is zero, in constant time.
pub fn is_zero(x: &[u8]) -> bool {
    if x.is_empty() {
        return true;
    }
    let zero = vec![0_u8; x.len()];
    x.ct_eq(&zero[..]).into()
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_bytes_eq() {
        assert!(bytes_eq(&b"123"[..], &b"1234"[..3]));
        assert!(!bytes_eq(&b"123"[..], &b"1234"[..]));
        assert!(!bytes_eq(&b"123"[..], &b"125"[..]));
        assert!(bytes_eq(&b""[..], &b""[..]));
    }

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[]));
        assert!(is_zero(&[0, 0, 0]));
        assert!(!is_zero(&[0, 0, 1]));
        assert!(!is_zero(&[1, 0, 0]));
    }

    #[test]
    fn ct_arrays() {
        let a: CtByteArray<3> = [1, 2, 3].into();
        let b: CtByteArray<3> = [1, 2, 4].into();
        assert!(a < b);
        assert_ne!(a, b);
        assert_eq!(a, [1, 2, 3].into());
        let arr: [u8; 3] = a.into();
        assert_eq!(arr, [1, 2, 3]);
    }
}
