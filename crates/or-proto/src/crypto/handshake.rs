//! Circuit extension handshakes.
//!
//! Circuit handshakes all implement a one-way-authenticated key
//! exchange, where a client that knows a public "onion key" for a
//! relay sends a "client onionskin" to extend to a relay, and
//! receives a "relay onionskin" in response.  When the handshake is
//! successful, both the client and relay share a set of session keys,
//! and the client knows that nobody _else_ shares those keys unless
//! they have the relay's private onion key.
//!
//! This module implements the two handshakes of its protocol era:
//! "TAP" (RSA-OAEP plus DH-1024) for ordinary hops, and the
//! unauthenticated "CREATE_FAST" exchange for the first hop of
//! single-purpose circuits.

pub(crate) mod fast;
pub(crate) mod tap;

use crate::Result;
use or_bytes::SecretBuf;
use rand::{CryptoRng, RngCore};

/// A ClientHandshake is used to generate a client onionskin and
/// handle a relay onionskin.
pub(crate) trait ClientHandshake {
    /// The type for the onion key.
    type KeyType;
    /// The type for the state that the client holds while waiting for
    /// a reply.
    type StateType;
    /// A type that is returned and used to generate session keys.
    type KeyGen;
    /// Generate a new client onionskin for a relay with a given onion
    /// key.
    ///
    /// On success, return a state object that will be used to
    /// complete the handshake, along with the message to send.
    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)>;
    /// Handle an onionskin from a relay, and produce a key generator.
    ///
    /// The state object must match the one that was used to make the
    /// client onionskin that the server is replying to.
    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen>;
}

/// A ServerHandshake is used to handle a client onionskin and
/// generate a server onionskin.
///
/// (We never play the server role on the live network, but the server
/// side is what lets tests exercise the client side end-to-end.)
pub(crate) trait ServerHandshake {
    /// The type for the onion key.  This is a private key type.
    type KeyType;
    /// The returned key generator type.
    type KeyGen;

    /// Perform the server handshake.  Take as input our private onion
    /// key (if any), and the client's message.
    ///
    /// On success, return a key generator and a server handshake
    /// message to send in reply.
    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &Self::KeyType,
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)>;
}

/// A KeyGenerator is returned by a handshake, and used to generate
/// session keys for the protocol.
///
/// Typically, it wraps a KDF function, and some seed key material.
///
/// It can only be used once.
pub(crate) trait KeyGenerator {
    /// Consume the key material and return a keystream of the
    /// requested length.
    fn expand(self, keylen: usize) -> Result<SecretBuf>;
}

/// Generates keys based on the KDF-TOR function.
///
/// This is deprecated and shouldn't be used for new protocols, but
/// it's what the TAP era runs on.
pub(crate) struct TapKeyGenerator {
    /// Seed for the KDF.
    seed: SecretBuf,
}

impl TapKeyGenerator {
    /// Create a key generator based on a provided seed.
    pub(crate) fn new(seed: SecretBuf) -> Self {
        TapKeyGenerator { seed }
    }
}

impl KeyGenerator for TapKeyGenerator {
    fn expand(self, keylen: usize) -> Result<SecretBuf> {
        use crate::crypto::ll::kdf::{Kdf, LegacyKdf};
        // Index 1: the first block of the KDF stream is the KH check
        // value, which the handshake consumed already.
        LegacyKdf::new(1).derive(&self.seed[..], keylen)
    }
}
