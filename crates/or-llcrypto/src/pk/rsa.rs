//! Re-exporting RSA implementations.
//!
//! This module handles the RSA keys used in the onion-routing
//! protocol: relay identities (a SHA-1 digest of a DER-encoded public
//! key), onion keys (used to encrypt TAP onionskins), and
//! hidden-service keys.
//!
//! The OAEP padding mode here is OAEP with SHA-1 and an empty label,
//! since that is what the TAP and introduction handshakes specify.

use crate::util::ct::CtByteArray;
use crate::util::rand_compat::RngCompatExt;
use rand::{CryptoRng, RngCore};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use std::fmt;

/// How many bytes are in an "RSA ID"?  (This is the length of a SHA-1
/// digest of a DER-encoded public key.)
pub const RSA_ID_LEN: usize = 20;

/// An identifier for an RSA key, based on SHA1 and DER.
///
/// These are used all over the protocol: to identify relays, to name
/// hidden services, and to confirm EXTEND targets.
///
/// This object is an "identity" in the sense that it identifies (up
/// to) one RSA key.  It may also represent the identity for a
/// particular entity, such as a relay or a directory authority.
#[derive(Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct RsaIdentity {
    /// SHA1 digest of a DER encoded public key.
    id: CtByteArray<RSA_ID_LEN>,
}

impl fmt::Display for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", hex::encode(&self.id.as_ref()[..]))
    }
}
impl fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RsaIdentity {{ {} }}", self)
    }
}

impl RsaIdentity {
    /// Expose an RsaIdentity as a slice of bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.id.as_ref()[..]
    }

    /// Construct an RsaIdentity from a slice of bytes.
    ///
    /// Returns None if the input is not of the correct length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(RsaIdentity {
            id: CtByteArray::from(<[u8; RSA_ID_LEN]>::try_from(bytes).ok()?),
        })
    }

    /// Decode an RsaIdentity from a hexadecimal string.
    ///
    /// The string must have no spaces, or any extra characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut array = [0_u8; RSA_ID_LEN];
        match hex::decode_to_slice(s, &mut array) {
            Err(_) => None,
            Ok(()) => Some(RsaIdentity::from(array)),
        }
    }

    /// Return true if this RsaIdentity is composed entirely of zero-valued
    /// bytes.
    ///
    /// Such all-zero values should not be used internally, since they
    /// are not the ID of any valid key.  Instead, they are used in
    /// some places in the wire protocol as placeholders.
    pub fn is_zero(&self) -> bool {
        // We do a constant-time comparison to avoid side-channels.
        self.id == [0; RSA_ID_LEN].into()
    }
}

impl From<[u8; 20]> for RsaIdentity {
    fn from(id: [u8; 20]) -> RsaIdentity {
        RsaIdentity { id: id.into() }
    }
}

impl From<RsaIdentity> for [u8; 20] {
    fn from(value: RsaIdentity) -> Self {
        value.id.into()
    }
}

impl serde::Serialize for RsaIdentity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(&self.id.as_ref()[..]))
        } else {
            serializer.serialize_bytes(&self.id.as_ref()[..])
        }
    }
}

impl<'de> serde::Deserialize<'de> for RsaIdentity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        /// Deserialization helper
        struct RsaIdentityVisitor;
        impl<'de> serde::de::Visitor<'de> for RsaIdentityVisitor {
            type Value = RsaIdentity;
            fn expecting(&self, fmt: &mut std::fmt::Formatter<'_>) -> fmt::Result {
                fmt.write_str("RSA identity")
            }
            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                RsaIdentity::from_hex(s)
                    .ok_or_else(|| E::custom("wrong encoding for RSA identity"))
            }
            fn visit_bytes<E>(self, b: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                RsaIdentity::from_bytes(b)
                    .ok_or_else(|| E::custom("wrong length for RSA identity"))
            }
        }
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(RsaIdentityVisitor)
        } else {
            deserializer.deserialize_bytes(RsaIdentityVisitor)
        }
    }
}

/// An error produced by an RSA operation in this module.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RsaError {
    /// A key could not be decoded from its DER representation.
    #[error("cannot decode RSA key")]
    BadKeyFormat,
    /// The key was structurally fine, but an encrypt or decrypt
    /// operation on it failed.
    #[error("RSA operation failed")]
    OperationFailed,
}

/// An RSA public key.
///
/// This implementation is a simple wrapper so that we can define our
/// own serialization and DER-hashing logic.
#[derive(Clone, Debug)]
pub struct PublicKey(rsa::RsaPublicKey);

impl PublicKey {
    /// Construct a PublicKey from DER pkcs1 encoding.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        Some(PublicKey(rsa::RsaPublicKey::from_pkcs1_der(der).ok()?))
    }

    /// Return the DER pkcs1 encoding of this key.
    pub fn to_der(&self) -> Vec<u8> {
        self.0
            .to_pkcs1_der()
            .expect("RSA key encoding failed")
            .as_bytes()
            .to_vec()
    }

    /// Return the length of the modulus of this key, in bits.
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// Compute the RsaIdentity for this public key.
    pub fn to_rsa_identity(&self) -> RsaIdentity {
        use digest::Digest;
        let id: [u8; RSA_ID_LEN] = crate::d::Sha1::digest(self.to_der()).into();
        RsaIdentity { id: id.into() }
    }

    /// Encrypt `msg` to this key using OAEP-SHA1 padding.
    ///
    /// The caller must make sure that `msg` is short enough to fit:
    /// for a 1024-bit key, the limit is 86 bytes.
    pub fn encrypt_oaep<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        msg: &[u8],
    ) -> Result<Vec<u8>, RsaError> {
        let padding = rsa::Oaep::new::<crate::d::Sha1>();
        self.0
            .encrypt(&mut rng.rng_compat(), padding, msg)
            .map_err(|_| RsaError::OperationFailed)
    }
}

/// An RSA private key.
///
/// The client role only ever *encrypts* to other parties' public
/// keys; we keep a private-key type so that handshakes can be
/// exercised end-to-end in tests, and for the day we grow a relay
/// role.
#[derive(Clone)]
pub struct PrivateKey(rsa::RsaPrivateKey);

impl PrivateKey {
    /// Construct a PrivateKey from DER pkcs1 encoding.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        Some(PrivateKey(rsa::RsaPrivateKey::from_pkcs1_der(der).ok()?))
    }

    /// Generate a new RSA private key with `bits` modulus bits.
    ///
    /// (The protocol era we implement uses 1024-bit keys.)
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self, RsaError> {
        rsa::RsaPrivateKey::new(&mut rng.rng_compat(), bits)
            .map(PrivateKey)
            .map_err(|_| RsaError::OperationFailed)
    }

    /// Return the public component of this key.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }

    /// Decrypt `ciphertext` with this key, using OAEP-SHA1 padding.
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RsaError> {
        let padding = rsa::Oaep::new::<crate::d::Sha1>();
        self.0
            .decrypt(padding, ciphertext)
            .map_err(|_| RsaError::OperationFailed)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Deliberately not showing the key material.
        write!(f, "PrivateKey {{ {} bits }}", self.0.size() * 8)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn identities() {
        let id1 = RsaIdentity::from([17; 20]);
        let id2 = RsaIdentity::from_hex(&"11".repeat(20)).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.as_bytes(), &[17; 20]);
        assert!(!id1.is_zero());
        assert!(RsaIdentity::from([0; 20]).is_zero());
        assert_eq!(
            id1.to_string(),
            "$1111111111111111111111111111111111111111"
        );

        assert!(RsaIdentity::from_bytes(&[1, 2, 3]).is_none());
        assert!(RsaIdentity::from_hex("spinach").is_none());
    }

    #[test]
    fn oaep_roundtrip() {
        let mut rng = testing_rng();
        let sk = PrivateKey::generate(&mut rng, 1024).unwrap();
        let pk = sk.to_public_key();
        assert_eq!(pk.bits(), 1024);

        let msg = b"attack at dawn";
        let enc = pk.encrypt_oaep(&mut rng, msg).unwrap();
        assert_eq!(enc.len(), 128);
        let dec = sk.decrypt_oaep(&enc).unwrap();
        assert_eq!(&dec[..], msg);

        // Tampering makes decryption fail.
        let mut bad = enc;
        bad[30] ^= 1;
        assert!(sk.decrypt_oaep(&bad).is_err());

        // An 86-byte message is the longest that fits under OAEP-SHA1.
        let msg = [3_u8; 86];
        let enc = pk.encrypt_oaep(&mut rng, &msg).unwrap();
        assert_eq!(sk.decrypt_oaep(&enc).unwrap(), msg);
        assert!(pk.encrypt_oaep(&mut rng, &[0_u8; 87]).is_err());
    }

    #[test]
    fn der_and_identity() {
        let mut rng = testing_rng();
        let sk = PrivateKey::generate(&mut rng, 1024).unwrap();
        let pk = sk.to_public_key();
        let der = pk.to_der();
        let pk2 = PublicKey::from_der(&der).unwrap();
        assert_eq!(pk.to_rsa_identity(), pk2.to_rsa_identity());

        assert!(PublicKey::from_der(b"not a key").is_none());
    }
}
