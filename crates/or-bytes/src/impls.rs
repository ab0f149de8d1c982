//! Implementations of Writeable and Readable for several items that
//! we use in the protocol.
//!
//! These don't need to be in a separate module, but for convenience
//! this is where we're putting them.

use super::*;

// ----------------------------------------------------------------------

/// `Vec<u8>` is the main type that implements [`Writer`].
impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
    fn write_u8(&mut self, byte: u8) {
        // specialize for performance
        self.push(byte);
    }
    fn write_zeros(&mut self, n: usize) {
        // specialize for performance
        let new_len = self.len().saturating_add(n);
        self.resize(new_len, 0);
    }
}

impl Writer for bytes::BytesMut {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

// ----------------------------------------------------------------------

impl Writeable for [u8] {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(self);
        Ok(())
    }
}

impl Writeable for Vec<u8> {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(&self[..]);
        Ok(())
    }
}

impl<const N: usize> Readable for [u8; N] {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        // note: Conversion from a slice to an array of the same
        // length can't fail.
        Ok(r.take(N)?.try_into().expect("slice had wrong length"))
    }
}

impl<const N: usize> Writeable for [u8; N] {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(&self[..]);
        Ok(())
    }
}

// We need to implement our traits for generic_array, since that's what
// the digest crate uses (as of digest 0.10).
impl<N> Readable for digest::generic_array::GenericArray<u8, N>
where
    N: digest::generic_array::ArrayLength<u8>,
{
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        // safety -- "take" returns the requested bytes or error.
        Ok(Self::clone_from_slice(b.take(N::to_usize())?))
    }
}

impl<N> Writeable for digest::generic_array::GenericArray<u8, N>
where
    N: digest::generic_array::ArrayLength<u8>,
{
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(self.as_slice());
        Ok(())
    }
}

/// Make Readable and Writeable implementations for a provided
/// unsigned type, delegating to the `take_uNN` and `write_uNN` methods.
macro_rules! impl_u {
    ( $t:ty, $wrfn:ident, $rdfn:ident ) => {
        impl Writeable for $t {
            fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
                b.$wrfn(*self);
                Ok(())
            }
        }
        impl Readable for $t {
            fn take_from(b: &mut Reader<'_>) -> Result<Self> {
                b.$rdfn()
            }
        }
    };
}

impl_u!(u8, write_u8, take_u8);
impl_u!(u16, write_u16, take_u16);
impl_u!(u32, write_u32, take_u32);
impl_u!(u64, write_u64, take_u64);

// ----------------------------------------------------------------------

/// Implement Readable and Writeable for IPv4 and IPv6 addresses.
///
/// These are encoded as a sequence of octets, not as strings.
mod net_impls {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    impl Writeable for Ipv4Addr {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
            b.write_all(&self.octets()[..]);
            Ok(())
        }
    }

    impl Readable for Ipv4Addr {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            Ok(r.take_u32()?.into())
        }
    }

    impl Writeable for Ipv6Addr {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
            b.write_all(&self.octets()[..]);
            Ok(())
        }
    }

    impl Readable for Ipv6Addr {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            let bytes: [u8; 16] = r.extract()?;
            Ok(bytes.into())
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn vec_u8() {
        let mut v: Vec<u8> = Vec::new();
        v.write(&7_u8).unwrap();
        v.write(&0x0102_u16).unwrap();
        v.write(&0x03040506_u32).unwrap();
        assert_eq!(v, hex!("07 0102 03040506"));

        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.extract::<u8>().unwrap(), 7);
        assert_eq!(r.extract::<u16>().unwrap(), 0x0102);
        assert_eq!(r.extract::<u32>().unwrap(), 0x03040506);
    }

    #[test]
    fn arrays() {
        let bytes = hex!("0102030405");
        let mut r = Reader::from_slice(&bytes[..]);
        let a: [u8; 5] = r.extract().unwrap();
        assert_eq!(a, bytes);

        let mut v = Vec::new();
        v.write(&a).unwrap();
        assert_eq!(&v[..], &bytes[..]);
    }

    #[test]
    fn addrs() {
        use std::net::{Ipv4Addr, Ipv6Addr};

        let mut v = Vec::new();
        let ip4: Ipv4Addr = "127.0.0.1".parse().unwrap();
        let ip6: Ipv6Addr = "::2".parse().unwrap();
        v.write(&ip4).unwrap();
        v.write(&ip6).unwrap();
        assert_eq!(
            &v[..],
            &hex!("7f000001 00000000000000000000000000000002")[..]
        );

        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.extract::<Ipv4Addr>().unwrap(), ip4);
        assert_eq!(r.extract::<Ipv6Addr>().unwrap(), ip6);
    }
}
