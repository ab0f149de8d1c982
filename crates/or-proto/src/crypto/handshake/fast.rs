//! Implementation for the CreateFast handshake.
//!
//! This handshake does no public-key cryptography at all: both sides
//! contribute 20 bytes of randomness, and the shared keys are derived
//! from the concatenation.  It is safe only when used on an
//! already-secure TLS connection, and so it is only ever used for the
//! first hop of a circuit, and only when that circuit doesn't demand
//! real cryptographic binding (directory fetches, mostly).

use super::{ClientHandshake, KeyGenerator, ServerHandshake, TapKeyGenerator};
use crate::crypto::ll::kdf::{Kdf, LegacyKdf};
use crate::{Error, Result};

use or_bytes::SecretBuf;
use or_llcrypto::util::ct;
use rand::{CryptoRng, RngCore};

/// Number of bytes used for a "CREATE_FAST" handshake by the
/// initiator.
pub(crate) const FAST_C_HANDSHAKE_LEN: usize = 20;
/// Number of bytes used for a "CREATE_FAST" handshake by the
/// responder.
pub(crate) const FAST_S_HANDSHAKE_LEN: usize = 20 * 2;

/// How many bytes does this handshake use for its input seed?
const SECRET_INPUT_LEN: usize = 40;

/// State for a CREATE_FAST client handshake.
pub(crate) struct CreateFastClientState([u8; FAST_C_HANDSHAKE_LEN]);

/// Client-handshake for CREATE_FAST.
///
/// See module documentation; you probably don't want to use this.
pub(crate) struct CreateFastClient;

impl ClientHandshake for CreateFastClient {
    type KeyType = ();
    type StateType = CreateFastClientState;
    type KeyGen = TapKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        _key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let mut state = [0_u8; FAST_C_HANDSHAKE_LEN];
        rng.fill_bytes(&mut state);
        Ok((CreateFastClientState(state), state.into()))
    }

    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen> {
        let msg = msg.as_ref();
        if msg.len() != FAST_S_HANDSHAKE_LEN {
            return Err(Error::BadCircHandshakeAuth);
        }
        let mut inp = SecretBuf::with_capacity(SECRET_INPUT_LEN);
        inp.extend_from_slice(&state.0[..]);
        inp.extend_from_slice(&msg[0..20]);

        let kh_expect = LegacyKdf::new(0).derive(&inp[..], 20)?;

        if !ct::bytes_eq(&kh_expect, &msg[20..40]) {
            return Err(Error::BadCircHandshakeAuth);
        }

        Ok(TapKeyGenerator::new(inp))
    }
}

/// Relay-handshake for CREATE_FAST.  Testing only.
pub(crate) struct CreateFastServer;

impl ServerHandshake for CreateFastServer {
    type KeyType = ();
    type KeyGen = TapKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        _key: &Self::KeyType,
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)> {
        let msg = msg.as_ref();
        if msg.len() != FAST_C_HANDSHAKE_LEN {
            return Err(Error::HandshakeProto("wrong length CREATE_FAST".into()));
        }
        let mut reply = vec![0_u8; FAST_S_HANDSHAKE_LEN];
        rng.fill_bytes(&mut reply[0..20]);

        let mut inp = SecretBuf::with_capacity(SECRET_INPUT_LEN);
        inp.extend_from_slice(msg);
        inp.extend_from_slice(&reply[0..20]);
        let kh = LegacyKdf::new(0).derive(&inp[..], 20)?;
        reply[20..].copy_from_slice(&kh);

        Ok((TapKeyGenerator::new(inp), reply))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn roundtrip() {
        let mut rng = testing_rng();

        let (state, cmsg) = CreateFastClient::client1(&mut rng, &()).unwrap();
        let (s_kg, smsg) = CreateFastServer::server(&mut rng, &(), cmsg).unwrap();
        let c_kg = CreateFastClient::client2(state, smsg).unwrap();

        let s_key = s_kg.expand(200).unwrap();
        let c_key = c_kg.expand(200).unwrap();

        assert_eq!(s_key, c_key);
    }

    #[test]
    fn failure() {
        let mut rng = testing_rng();

        // badly formatted client message.
        let cmsg = [6_u8; 19];
        let ans = CreateFastServer::server(&mut rng, &(), cmsg);
        assert!(ans.is_err());

        // corrupt/incorrect server reply.
        let (state, cmsg) = CreateFastClient::client1(&mut rng, &()).unwrap();
        let (_, mut smsg) = CreateFastServer::server(&mut rng, &(), cmsg).unwrap();
        smsg[35] ^= 16;
        let ans = CreateFastClient::client2(state, smsg);
        assert!(matches!(ans, Err(Error::BadCircHandshakeAuth)));
    }
}
