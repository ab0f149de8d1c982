//! Onion addresses and service identifiers.

use crate::Error;
use data_encoding::BASE32_NOPAD;
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a hidden-service identifier.
pub const HSID_LEN: usize = 10;

/// The identifier of a hidden service: the first 80 bits of the
/// SHA-1 digest of the service's public key.
///
/// In its encoded form, this is the familiar 16-character base32
/// string in front of `.onion`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HsId([u8; HSID_LEN]);

impl HsId {
    /// Construct an HsId from its raw bytes.
    pub fn from_bytes(bytes: [u8; HSID_LEN]) -> Self {
        HsId(bytes)
    }

    /// Return the raw bytes of this identifier.
    pub fn as_bytes(&self) -> &[u8; HSID_LEN] {
        &self.0
    }

    /// Compute the HsId of a service from the DER encoding of its
    /// public key.
    pub fn from_service_key_der(der: &[u8]) -> Self {
        use digest::Digest;
        let d = or_llcrypto::d::Sha1::digest(der);
        let mut bytes = [0_u8; HSID_LEN];
        bytes.copy_from_slice(&d[..HSID_LEN]);
        HsId(bytes)
    }

    /// Return true if `addr` looks like an onion address (i.e., it
    /// ends with ".onion").
    pub fn looks_like_onion_addr(addr: &str) -> bool {
        addr.to_ascii_lowercase().ends_with(".onion")
    }
}

impl fmt::Display for HsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = BASE32_NOPAD.encode(&self.0).to_ascii_lowercase();
        write!(f, "{}.onion", encoded)
    }
}

impl FromStr for HsId {
    type Err = Error;

    /// Parse an onion address, with or without its ".onion" suffix.
    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.to_ascii_uppercase();
        let label = s.strip_suffix(".ONION").unwrap_or(&s);
        // A v2 address is 16 base32 characters: 80 bits.
        if label.len() != 16 {
            return Err(Error::BadOnionAddress);
        }
        let decoded = BASE32_NOPAD
            .decode(label.as_bytes())
            .map_err(|_| Error::BadOnionAddress)?;
        let bytes: [u8; HSID_LEN] = decoded.try_into().map_err(|_| Error::BadOnionAddress)?;
        Ok(HsId(bytes))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn roundtrip() {
        let id = HsId::from_bytes([0x1d, 0xd6, 0x75, 0x83, 0x2b, 0x93, 0x15, 0x62, 0xa1, 0x0e]);
        let s = id.to_string();
        assert!(s.ends_with(".onion"));
        assert_eq!(s.len(), 16 + 6);
        let id2: HsId = s.parse().unwrap();
        assert_eq!(id, id2);

        // Parsing is case-insensitive and tolerates a missing suffix.
        let id3: HsId = s.to_ascii_uppercase().parse().unwrap();
        assert_eq!(id, id3);
        let id4: HsId = s.strip_suffix(".onion").unwrap().parse().unwrap();
        assert_eq!(id, id4);
    }

    #[test]
    fn the_canonical_example() {
        // The spec's favorite example address.
        let id: HsId = "duskgytldkxiuqc6.onion".parse().unwrap();
        assert_eq!(id.to_string(), "duskgytldkxiuqc6.onion");
    }

    #[test]
    fn bad_addresses() {
        assert!("tooshort.onion".parse::<HsId>().is_err());
        assert!("wayyyyyytoolongforav2address.onion".parse::<HsId>().is_err());
        assert!("duskgytldkxiuqc1.onion".parse::<HsId>().is_err()); // '1' is not base32
        assert!(HsId::looks_like_onion_addr("duskgytldkxiuqc6.onion"));
        assert!(HsId::looks_like_onion_addr("www.EXAMPLE.ONION"));
        assert!(!HsId::looks_like_onion_addr("www.example.com"));
    }

    #[test]
    fn from_key() {
        // The identifier is the truncated SHA-1 of the key.
        use digest::Digest;
        let fake_der = b"not really a key";
        let id = HsId::from_service_key_der(fake_der);
        let d = or_llcrypto::d::Sha1::digest(fake_der);
        assert_eq!(&id.as_bytes()[..], &d[..10]);
    }
}
