//! Implementation of the TAP circuit-extension handshake.
//!
//! TAP is the original circuit handshake: the client picks a
//! symmetric key K and a DH keypair (x, g^x), and sends
//! `RSA-OAEP(K | g^x [0..70]) | AES_K(g^x [70..128])` encrypted to
//! the relay's RSA-1024 onion key.  The relay replies with its own
//! `g^y` and a 20-byte check value KH derived from the shared secret.
//!
//! The hidden-service rendezvous handshake reuses the same reply
//! format, so [`TapClient::client2`] also serves to process
//! RENDEZVOUS2 messages.

use super::{ClientHandshake, KeyGenerator, ServerHandshake, TapKeyGenerator};
use crate::crypto::ll::kdf::{Kdf, LegacyKdf};
use crate::{Error, Result};

use cipher::{KeyIvInit, StreamCipher};
use or_bytes::SecretBuf;
use or_error::internal;
use or_llcrypto::cipher::aes::Aes128Ctr;
use or_llcrypto::pk::dh;
use or_llcrypto::pk::rsa;
use or_llcrypto::util::ct;
use rand::{CryptoRng, Rng, RngCore};
use zeroize::Zeroizing;

/// Number of bytes in the symmetric key used to encrypt the part of
/// g^x that doesn't fit in the RSA-OAEP block.
const TAP_KEY_LEN: usize = 16;
/// Number of bytes of g^x that ride inside the RSA-OAEP block.
///
/// (An RSA-1024 OAEP-SHA1 block holds 86 bytes; 16 of those are the
/// symmetric key.)
const TAP_GX_IN_RSA: usize = 86 - TAP_KEY_LEN;
/// Length of a client onionskin.
pub(crate) const TAP_C_HANDSHAKE_LEN: usize = 128 + dh::DH_LEN - TAP_GX_IN_RSA;
/// Length of a relay's reply: g^y followed by KH.
pub(crate) const TAP_S_HANDSHAKE_LEN: usize = dh::DH_LEN + 20;

/// State for a TAP client handshake: the DH keypair whose public half
/// we sent.
pub(crate) struct TapClientState {
    /// Our ephemeral DH keypair.
    keypair: dh::KeyPair,
}

/// Client-side TAP handshake.
pub(crate) struct TapClient;

impl ClientHandshake for TapClient {
    type KeyType = rsa::PublicKey;
    type StateType = TapClientState;
    type KeyGen = TapKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let keypair = dh::KeyPair::generate(rng);
        let gx = keypair.public_key();

        let symkey: Zeroizing<[u8; TAP_KEY_LEN]> = Zeroizing::new(rng.random());

        // M = K | g^x [0..70]; RSA-OAEP encrypted.
        let mut m = SecretBuf::with_capacity(TAP_KEY_LEN + TAP_GX_IN_RSA);
        m.extend_from_slice(&symkey[..]);
        m.extend_from_slice(&gx[..TAP_GX_IN_RSA]);
        let rsa_part = key
            .encrypt_oaep(rng, &m[..])
            .map_err(|_| Error::HandshakeProto("onion key refused our onionskin".into()))?;

        // The rest of g^x, encrypted with K.
        let mut aes_part = gx[TAP_GX_IN_RSA..].to_vec();
        let mut cipher = Aes128Ctr::new(&(*symkey).into(), &Default::default());
        cipher.apply_keystream(&mut aes_part);

        let mut onionskin = rsa_part;
        onionskin.extend_from_slice(&aes_part);
        debug_assert_eq!(onionskin.len(), TAP_C_HANDSHAKE_LEN);

        Ok((TapClientState { keypair }, onionskin))
    }

    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen> {
        let msg = msg.as_ref();
        if msg.len() != TAP_S_HANDSHAKE_LEN {
            return Err(Error::BadCircHandshakeAuth);
        }
        let gy = &msg[0..dh::DH_LEN];
        let kh = &msg[dh::DH_LEN..];

        let secret = state
            .keypair
            .compute_secret(gy)
            .map_err(|_| Error::BadCircHandshakeAuth)?;
        let mut seed = SecretBuf::with_capacity(secret.len());
        seed.extend_from_slice(&secret[..]);

        let kh_expect = LegacyKdf::new(0).derive(&seed[..], 20)?;
        if !ct::bytes_eq(&kh_expect, kh) {
            return Err(Error::BadCircHandshakeAuth);
        }

        Ok(TapKeyGenerator::new(seed))
    }
}

/// Server-side TAP handshake.  Testing only.
pub(crate) struct TapServer;

impl ServerHandshake for TapServer {
    type KeyType = rsa::PrivateKey;
    type KeyGen = TapKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &Self::KeyType,
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)> {
        let msg = msg.as_ref();
        if msg.len() != TAP_C_HANDSHAKE_LEN {
            return Err(Error::HandshakeProto("wrong length onionskin".into()));
        }
        let m = key
            .decrypt_oaep(&msg[0..128])
            .map_err(|_| Error::HandshakeProto("undecryptable onionskin".into()))?;
        if m.len() != TAP_KEY_LEN + TAP_GX_IN_RSA {
            return Err(Error::HandshakeProto("bad onionskin plaintext".into()));
        }
        let symkey: [u8; TAP_KEY_LEN] = m[0..TAP_KEY_LEN]
            .try_into()
            .map_err(|_| internal!("somehow a 16-byte slice was not 16 bytes"))?;

        let mut gx = m[TAP_KEY_LEN..].to_vec();
        let mut rest = msg[128..].to_vec();
        let mut cipher = Aes128Ctr::new(&symkey.into(), &Default::default());
        cipher.apply_keystream(&mut rest);
        gx.extend_from_slice(&rest);

        let keypair = dh::KeyPair::generate(rng);
        let secret = keypair
            .compute_secret(&gx)
            .map_err(|_| Error::HandshakeProto("bad g^x value".into()))?;
        let mut seed = SecretBuf::with_capacity(secret.len());
        seed.extend_from_slice(&secret[..]);

        let kh = LegacyKdf::new(0).derive(&seed[..], 20)?;
        let mut reply = keypair.public_key().to_vec();
        reply.extend_from_slice(&kh);
        debug_assert_eq!(reply.len(), TAP_S_HANDSHAKE_LEN);

        Ok((TapKeyGenerator::new(seed), reply))
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
        let relay_sk = rsa::PrivateKey::generate(&mut rng, 1024).unwrap();
        let relay_pk = relay_sk.to_public_key();

        let (state, cmsg) = TapClient::client1(&mut rng, &relay_pk).unwrap();
        assert_eq!(cmsg.len(), TAP_C_HANDSHAKE_LEN);
        assert_eq!(cmsg.len(), 186);

        let (s_kg, smsg) = TapServer::server(&mut rng, &relay_sk, &cmsg).unwrap();
        assert_eq!(smsg.len(), TAP_S_HANDSHAKE_LEN);
        assert_eq!(smsg.len(), 148);

        let c_kg = TapClient::client2(state, smsg).unwrap();

        let s_key = s_kg.expand(72).unwrap();
        let c_key = c_kg.expand(72).unwrap();
        assert_eq!(s_key, c_key);
    }

    #[test]
    fn failures() {
        let mut rng = testing_rng();
        let relay_sk = rsa::PrivateKey::generate(&mut rng, 1024).unwrap();
        let relay_pk = relay_sk.to_public_key();
        let other_sk = rsa::PrivateKey::generate(&mut rng, 1024).unwrap();

        // Corrupted onionskin: the wrong relay can't decrypt it.
        let (_state, cmsg) = TapClient::client1(&mut rng, &relay_pk).unwrap();
        assert!(TapServer::server(&mut rng, &other_sk, &cmsg).is_err());

        // Too-short onionskin.
        assert!(TapServer::server(&mut rng, &relay_sk, &cmsg[..100]).is_err());

        // Corrupted reply: client notices.
        let (state, cmsg) = TapClient::client1(&mut rng, &relay_pk).unwrap();
        let (_kg, mut smsg) = TapServer::server(&mut rng, &relay_sk, &cmsg).unwrap();
        smsg[140] ^= 4; // flip a bit in KH
        let r = TapClient::client2(state, smsg);
        assert!(matches!(r, Err(Error::BadCircHandshakeAuth)));

        // Wrong-length reply.
        let (state, _) = TapClient::client1(&mut rng, &relay_pk).unwrap();
        let r = TapClient::client2(state, [3; 147]);
        assert!(matches!(r, Err(Error::BadCircHandshakeAuth)));
    }
}
