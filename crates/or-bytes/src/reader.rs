//! Internal: Declare the Reader type for or-bytes

use crate::{Error, Readable, Result};

/// A type for reading messages from a slice of bytes.
///
/// Unlike io::Read, this object has a simpler error type, and is
/// designed for in-memory parsing only.
///
/// The methods in [`Reader`] should never panic, with one exception:
/// the `extract` and `extract_n` methods will panic if the underlying
/// [`Readable`] object's `take_from` method panics.
///
/// # Examples
///
/// You can use a Reader to extract information byte-by-byte:
///
/// ```
/// use or_bytes::{Reader,Result};
/// let msg = [ 0x00, 0x01, 0x23, 0x45, 0x22, 0x00, 0x00, 0x00 ];
/// let mut b = Reader::from_slice(&msg[..]);
/// // Multi-byte values are always big-endian.
/// assert_eq!(b.take_u32()?, 0x12345);
/// assert_eq!(b.take_u8()?, 0x22);
///
/// // You can check on the length of the message...
/// assert_eq!(b.total_len(), 8);
/// assert_eq!(b.consumed(), 5);
/// assert_eq!(b.remaining(), 3);
/// // then skip over some bytes...
/// b.advance(3)?;
/// // ... and check that the message is really exhausted.
/// b.should_be_exhausted()?;
/// # Result::Ok(())
/// ```
pub struct Reader<'a> {
    /// The underlying slice that we're reading from
    b: &'a [u8],
    /// The next position in the slice that we intend to read from.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader from a slice of bytes.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }

    /// Construct a new Reader from a 'Bytes' object.
    pub fn from_bytes(b: &'a bytes::Bytes) -> Self {
        Self::from_slice(b.as_ref())
    }

    /// Return the total length of the slice in this reader, including
    /// consumed bytes and remaining bytes.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }

    /// Return the total number of bytes in this reader that have not
    /// yet been read.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }

    /// Consume this reader, and return a slice containing the
    /// remaining bytes from its slice that it did not consume.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }

    /// Return the total number of bytes in this reader that have
    /// already been read.
    pub fn consumed(&self) -> usize {
        self.off
    }

    /// Skip `n` bytes from the reader.
    ///
    /// Returns Ok on success.  Returns Err(Error::Truncated) if there
    /// were not enough bytes to skip.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        let _ = self.peek(n)?;
        self.off += n;
        Ok(())
    }

    /// Check whether this reader is exhausted (out of bytes).
    ///
    /// Return Ok if it is, and Err(Error::ExtraneousBytes) if there
    /// were extra bytes.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ExtraneousBytes);
        }
        Ok(())
    }

    /// Truncate this reader, so that no more than `n` bytes remain.
    ///
    /// Fewer than `n` bytes may remain if there were not enough bytes
    /// in the first place.
    pub fn truncate(&mut self, n: usize) {
        if n < self.remaining() {
            self.b = &self.b[..self.off + n];
        }
    }

    /// Try to return a slice of `n` bytes from this reader without
    /// consuming them.
    ///
    /// On success, returns Ok(slice).  If there are fewer than n
    /// bytes, returns Err(Error::Truncated).
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated);
        }
        Ok(&self.b[self.off..(self.off + n)])
    }

    /// Try to consume and return a slice of `n` bytes from this
    /// reader.
    ///
    /// On success, returns Ok(slice).  If there are fewer than n
    /// bytes, returns Err(Error::Truncated).
    ///
    /// # Example
    /// ```
    /// use or_bytes::{Reader,Result};
    /// let m = b"Hello World";
    /// let mut b = Reader::from_slice(&m[..]);
    /// assert_eq!(b.take(5)?, b"Hello");
    /// assert_eq!(b.take_u8()?, 0x20);
    /// assert_eq!(b.take(5)?, b"World");
    /// b.should_be_exhausted()?;
    /// # Result::Ok(())
    /// ```
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let result = self.peek(n)?;
        self.advance(n)?;
        Ok(result)
    }

    /// Try to fill a provided buffer with bytes consumed from this reader.
    ///
    /// On success, the buffer will be filled with data from the
    /// reader, the reader will advance by the length of the buffer,
    /// and we'll return Ok(()).  On failure the buffer will be
    /// unchanged.
    pub fn take_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = buf.len();
        let b = self.take(n)?;
        buf.copy_from_slice(b);
        Ok(())
    }

    /// Try to consume and return a u8 from this reader.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    /// Try to consume and return a big-endian u16 from this reader.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b: [u8; 2] = self.extract()?;
        let r = u16::from_be_bytes(b);
        Ok(r)
    }

    /// Try to consume and return a big-endian u32 from this reader.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b: [u8; 4] = self.extract()?;
        let r = u32::from_be_bytes(b);
        Ok(r)
    }

    /// Try to consume and return a big-endian u64 from this reader.
    pub fn take_u64(&mut self) -> Result<u64> {
        let b: [u8; 8] = self.extract()?;
        let r = u64::from_be_bytes(b);
        Ok(r)
    }

    /// Try to consume and return bytes from this reader until we
    /// encounter a terminating byte equal to `term`.
    ///
    /// On success, returns Ok(Slice), where the slice does not
    /// include the terminating byte.  Returns Err(Error::Truncated)
    /// if we do not find the terminating byte.
    ///
    /// Advances the reader to the point immediately after the
    /// terminating byte.
    pub fn take_until(&mut self, term: u8) -> Result<&'a [u8]> {
        let pos = self.b[self.off..]
            .iter()
            .position(|b| *b == term)
            .ok_or(Error::Truncated)?;
        let result = self.take(pos)?;
        self.advance(1)?;
        Ok(result)
    }

    /// Consume and return all the remaining bytes, but do not consume
    /// the reader.
    ///
    /// This can be useful if you'd like to parse something, then keep
    /// parsing the rest of the message.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let result = &self.b[self.off..];
        self.off = self.b.len();
        result
    }

    /// Try to decode and remove a Readable object from this reader,
    /// using its take_from() method.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        E::take_from(self)
    }

    /// Try to decode and remove `n` Readable objects from this
    /// reader, returning them in a vector.
    pub fn extract_n<E: Readable>(&mut self, n: usize) -> Result<Vec<E>> {
        // This `min` will help us defend against a pathological case
        // where an attacker tells us that there are BIGNUM items, and
        // then sends a fairly short message.
        let n_alloc = std::cmp::min(n, self.remaining());
        let mut result = Vec::with_capacity(n_alloc);
        for _ in 0..n {
            result.push(E::take_from(self)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bytecursor_read_ok() {
        let bytes = b"On a mountain halfway between Reno and Rome";
        let mut bc = Reader::from_slice(&bytes[..]);

        assert_eq!(bc.take(3).unwrap(), &b"On "[..]);
        assert_eq!(bc.take_u8().unwrap(), 0x61);
        assert_eq!(bc.take_until(0x20).unwrap(), &b""[..]);
        assert_eq!(bc.take_u16().unwrap(), 0x6d6f);
        assert_eq!(bc.take_u32().unwrap(), 0x756e7461);
        assert_eq!(bc.take_u64().unwrap(), 0x696e2068616c6677);
        assert_eq!(bc.take_until(0x20).unwrap(), &b"ay"[..]);
        assert_eq!(bc.remaining(), 21);
        assert_eq!(bc.consumed(), 22);
        bc.advance(13).unwrap();
        assert_eq!(bc.take_rest(), &b"and Rome"[..]);
        assert!(bc.should_be_exhausted().is_ok());
    }

    #[test]
    fn bytecursor_read_missing() {
        let bytes = b"Rome";
        let mut bc = Reader::from_slice(&bytes[..]);

        assert_eq!(bc.take_u64(), Err(Error::Truncated));
        assert_eq!(bc.take_until(0x00), Err(Error::Truncated));
        assert_eq!(bc.take_u32().unwrap(), 0x526f6d65);
        assert_eq!(bc.take_u8(), Err(Error::Truncated));
        assert_eq!(bc.advance(1), Err(Error::Truncated));
        assert!(bc.should_be_exhausted().is_ok());
    }

    #[test]
    fn truncate() {
        let bytes = b"Portland";
        let mut bc = Reader::from_slice(&bytes[..]);
        assert_eq!(bc.take(4).unwrap(), &b"Port"[..]);
        bc.truncate(2);
        assert_eq!(bc.remaining(), 2);
        assert_eq!(bc.take(2).unwrap(), &b"la"[..]);
        assert!(bc.should_be_exhausted().is_ok());
    }

    #[test]
    fn extract() {
        #[derive(Debug, Eq, PartialEq)]
        struct Pair(u8, u16);
        impl Readable for Pair {
            fn take_from(r: &mut Reader<'_>) -> Result<Self> {
                Ok(Pair(r.take_u8()?, r.take_u16()?))
            }
        }

        let bytes = [1, 0, 2, 3, 0, 4, 5, 0, 6];
        let mut r = Reader::from_slice(&bytes[..]);
        let pairs: Vec<Pair> = r.extract_n(3).unwrap();
        assert_eq!(pairs, vec![Pair(1, 2), Pair(3, 4), Pair(5, 6)]);
        r.should_be_exhausted().unwrap();

        // Not enough bytes for four pairs.
        let mut r = Reader::from_slice(&bytes[..]);
        assert_eq!(r.extract_n::<Pair>(4), Err(Error::Truncated));
    }
}
