//! A variable-sized buffer for holding secret data.

use crate::Writer;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A growable buffer for secret key material.
///
/// This behaves like a `Vec<u8>`, except that its contents are zeroed
/// on drop, and it avoids implementing Debug/Display in a way that
/// could leak its contents to a log.
///
/// Handshake code uses this type to accumulate "secret input" values
/// and derived key streams, so that discarded intermediate values do
/// not linger in freed memory.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretBuf(Vec<u8>);

impl SecretBuf {
    /// Construct a new empty SecretBuf.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a new empty SecretBuf with a specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        SecretBuf(Vec::with_capacity(capacity))
    }

    /// Add all the bytes from `slice` to the end of this buffer.
    pub fn extend_from_slice(&mut self, slice: &[u8]) {
        self.0.extend_from_slice(slice);
    }

    /// Truncate this buffer to `len` bytes.
    ///
    /// (The removed bytes are *not* zeroed immediately; they stay
    /// allocated until the buffer is dropped.)
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    /// Return the length of this buffer.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Return true if this buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SecretBuf {
    fn from(v: Vec<u8>) -> Self {
        SecretBuf(v)
    }
}

impl std::ops::Deref for SecretBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl AsRef<[u8]> for SecretBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl PartialEq for SecretBuf {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for SecretBuf {}

impl Writer for SecretBuf {
    fn write_all(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

// Deliberately *not* derived, so that key material can't end up in a
// debug log.
impl std::fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuf({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn basic_ops() {
        let mut b = SecretBuf::with_capacity(10);
        assert!(b.is_empty());
        b.extend_from_slice(b"hello");
        b.write_u16(0x776f);
        assert_eq!(&b[..], &b"hellowo"[..]);
        assert_eq!(b.len(), 7);
        b.truncate(5);
        assert_eq!(&b[..], &b"hello"[..]);

        let b2: SecretBuf = b"hello".to_vec().into();
        assert_eq!(b, b2);
        assert_eq!(format!("{:?}", b2), "SecretBuf(5 bytes)");
    }
}
