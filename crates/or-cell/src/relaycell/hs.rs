//! Encoding and decoding for relay messages related to hidden
//! services (client side).

use super::msg::Body;
use caret::caret_int;
use or_bytes::{EncodeError, EncodeResult, Error as BytesError, Readable, Result, Writeable};
use or_bytes::{Reader, Writer};
use or_llcrypto::pk::rsa::RsaIdentity;
use std::net::Ipv4Addr;

/// The length of a rendezvous cookie.
pub const REND_COOKIE_LEN: usize = 20;

/// A rendezvous cookie: an arbitrary 20-byte value, chosen randomly
/// by the client and presented to both the rendezvous point and (via
/// the introduction point) the service.
pub type RendCookie = [u8; REND_COOKIE_LEN];

/// A message sent from client to rendezvous point to set up a
/// rendezvous circuit.
#[derive(Debug, Clone)]
pub struct EstablishRendezvous {
    /// The rendezvous cookie to wait for.
    cookie: RendCookie,
}
impl EstablishRendezvous {
    /// Construct a new establish rendezvous cell.
    pub fn new(cookie: RendCookie) -> Self {
        Self { cookie }
    }
}
impl Body for EstablishRendezvous {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let cookie = r.extract()?;
        let _ = r.take_rest();
        Ok(Self { cookie })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.cookie)
    }
}

/// A message sent from the rendezvous point to the client, telling it
/// that its rendezvous point is established and waiting.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RendezvousEstablished {}
impl RendezvousEstablished {
    /// Construct a new rendezvous established message.
    pub fn new() -> Self {
        Self::default()
    }
}
impl Body for RendezvousEstablished {
    fn decode_from_reader(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// A message sent from the client to an introduction point, asking it
/// to pass an introduction request along to the service.
///
/// On the wire, this is the hash of the service's introduction
/// service key, followed by a payload that is encrypted to that key.
/// (See [`IntroPayload`] for the plaintext format.)
#[derive(Debug, Clone)]
pub struct Introduce1 {
    /// Hash of the service key of the introduction point.
    pk_id: RsaIdentity,
    /// The encrypted introduction request, readable only by the
    /// service.
    encrypted: Vec<u8>,
}
impl Introduce1 {
    /// Construct a new Introduce1 message.
    pub fn new(pk_id: RsaIdentity, encrypted: Vec<u8>) -> Self {
        Self { pk_id, encrypted }
    }
}
impl Body for Introduce1 {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let pk_id = RsaIdentity::from_bytes(r.take(20)?)
            .ok_or_else(|| BytesError::InvalidMessage("bad key hash in INTRODUCE1".into()))?;
        let encrypted = r.take_rest().into();
        Ok(Self { pk_id, encrypted })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(self.pk_id.as_bytes());
        w.write_all(&self.encrypted[..]);
        Ok(())
    }
}

/// A message sent from the introduction point to the client,
/// acknowledging its Introduce1 message.
///
/// An empty body indicates that the introduction request was passed
/// on; a nonempty body is a refusal.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct IntroduceAck {
    /// The status of the introduction, if given: nothing means
    /// success.
    status: Vec<u8>,
}
impl IntroduceAck {
    /// Construct a new (successful) IntroduceAck message.
    pub fn new_success() -> Self {
        Self::default()
    }
    /// Return true if this acknowledgement indicates that the
    /// introduction request was relayed to the service.
    pub fn success(&self) -> bool {
        self.status.is_empty()
    }
}
impl Body for IntroduceAck {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let status = r.take_rest().into();
        Ok(Self { status })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.status[..]);
        Ok(())
    }
}

/// A message sent from the rendezvous point to the client, containing
/// the service's half of the rendezvous handshake.
///
/// Its body has the same format as the reply to a TAP handshake: a DH
/// public value followed by a 20-byte key-derivation check value.
#[derive(Debug, Clone)]
pub struct Rendezvous2 {
    /// The handshake message from the service.
    handshake_info: Vec<u8>,
}
impl Rendezvous2 {
    /// Construct a new Rendezvous2 message carrying a given handshake
    /// reply.
    pub fn new<B: Into<Vec<u8>>>(handshake_info: B) -> Self {
        Self {
            handshake_info: handshake_info.into(),
        }
    }
    /// Consume this message, returning the handshake within.
    pub fn into_handshake(self) -> Vec<u8> {
        self.handshake_info
    }
}
impl Body for Rendezvous2 {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let handshake_info = r.take_rest().into();
        Ok(Self { handshake_info })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake_info[..]);
        Ok(())
    }
}

caret_int! {
    /// The type of client authorization data carried in an
    /// introduction request.
    pub struct AuthType(u8) {
        /// No authorization data.
        NONE = 0,
        /// A descriptor cookie shared with a group of clients.
        BASIC = 1,
        /// A descriptor cookie specific to a single client.
        STEALTH = 2,
    }
}

/// The version number we use for introduction payloads.
const INTRO_PAYLOAD_VERSION: u8 = 3;

/// The plaintext of the encrypted portion of an [`Introduce1`]
/// message (version 3).
///
/// This is the part that the client encrypts to the service's
/// introduction key; the introduction point cannot read it.  It names
/// the rendezvous point, proves knowledge of the rendezvous cookie,
/// and begins the final DH handshake.
#[derive(Debug, Clone)]
pub struct IntroPayload {
    /// Type of client authorization data present.
    auth_type: AuthType,
    /// Client authorization data (a descriptor cookie), if any.
    auth_data: Vec<u8>,
    /// Timestamp when this payload was generated, in seconds since
    /// the epoch.
    timestamp: u32,
    /// IPv4 address of the rendezvous point.
    rend_addr: Ipv4Addr,
    /// OR port of the rendezvous point.
    rend_port: u16,
    /// RSA identity of the rendezvous point.
    rend_identity: RsaIdentity,
    /// The rendezvous point's onion key, DER encoded.
    rend_onion_key: Vec<u8>,
    /// The rendezvous cookie that the client gave the rendezvous
    /// point.
    cookie: RendCookie,
    /// The client's DH public value (g^x), beginning the final
    /// handshake with the service.
    dh_public: Vec<u8>,
}

impl IntroPayload {
    /// Construct a new introduction payload.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: Option<(AuthType, Vec<u8>)>,
        timestamp: u32,
        rend_addr: Ipv4Addr,
        rend_port: u16,
        rend_identity: RsaIdentity,
        rend_onion_key: Vec<u8>,
        cookie: RendCookie,
        dh_public: Vec<u8>,
    ) -> Self {
        let (auth_type, auth_data) = auth.unwrap_or((AuthType::NONE, Vec::new()));
        IntroPayload {
            auth_type,
            auth_data,
            timestamp,
            rend_addr,
            rend_port,
            rend_identity,
            rend_onion_key,
            cookie,
            dh_public,
        }
    }

    /// Return the client's DH public value.
    pub fn dh_public(&self) -> &[u8] {
        &self.dh_public[..]
    }

    /// Return the rendezvous cookie in this payload.
    pub fn cookie(&self) -> &RendCookie {
        &self.cookie
    }

    /// Return the identity of the rendezvous point named in this
    /// payload.
    pub fn rend_identity(&self) -> &RsaIdentity {
        &self.rend_identity
    }
}

impl Writeable for IntroPayload {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(INTRO_PAYLOAD_VERSION);
        w.write_u8(self.auth_type.into());
        if self.auth_type != AuthType::NONE {
            let auth_len: u16 = self
                .auth_data
                .len()
                .try_into()
                .map_err(|_| EncodeError::BadLengthValue)?;
            w.write_u16(auth_len);
            w.write_all(&self.auth_data[..]);
        }
        w.write_u32(self.timestamp);
        w.write_all(&self.rend_addr.octets()[..]);
        w.write_u16(self.rend_port);
        w.write_all(self.rend_identity.as_bytes());
        let klen: u16 = self
            .rend_onion_key
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u16(klen);
        w.write_all(&self.rend_onion_key[..]);
        w.write_all(&self.cookie[..]);
        w.write_all(&self.dh_public[..]);
        Ok(())
    }
}

impl Readable for IntroPayload {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.take_u8()?;
        if version != INTRO_PAYLOAD_VERSION {
            return Err(BytesError::InvalidMessage(
                "unsupported introduction payload version".into(),
            ));
        }
        let auth_type: AuthType = r.take_u8()?.into();
        let auth_data = if auth_type != AuthType::NONE {
            let auth_len = r.take_u16()?;
            r.take(auth_len as usize)?.to_vec()
        } else {
            Vec::new()
        };
        let timestamp = r.take_u32()?;
        let rend_addr: Ipv4Addr = r.extract()?;
        let rend_port = r.take_u16()?;
        let rend_identity = RsaIdentity::from_bytes(r.take(20)?)
            .ok_or_else(|| BytesError::InvalidMessage("bad rendezvous identity".into()))?;
        let klen = r.take_u16()?;
        let rend_onion_key = r.take(klen as usize)?.to_vec();
        let cookie = r.extract()?;
        let dh_public = r.take_rest().to_vec();
        Ok(IntroPayload {
            auth_type,
            auth_data,
            timestamp,
            rend_addr,
            rend_port,
            rend_identity,
            rend_onion_key,
            cookie,
            dh_public,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn establish_rendezvous() {
        let cookie = [5; REND_COOKIE_LEN];
        let er = EstablishRendezvous::new(cookie);
        let mut v = Vec::new();
        er.encode_onto(&mut v).unwrap();
        assert_eq!(v, vec![5; 20]);

        let mut r = Reader::from_slice(&v);
        let _er = EstablishRendezvous::decode_from_reader(&mut r).unwrap();
    }

    #[test]
    fn introduce_ack() {
        let mut r = Reader::from_slice(&[]);
        let ack = IntroduceAck::decode_from_reader(&mut r).unwrap();
        assert!(ack.success());

        let mut r = Reader::from_slice(&[1]);
        let nack = IntroduceAck::decode_from_reader(&mut r).unwrap();
        assert!(!nack.success());
    }

    #[test]
    fn intro_payload_layout() {
        // Check the exact layout of a version-3 payload without
        // client authorization.
        let payload = IntroPayload::new(
            None,
            0x5f362b44,
            "10.0.0.2".parse().unwrap(),
            9001,
            RsaIdentity::from([0xaa; 20]),
            vec![0xbb; 4], // stand-in for a DER key
            [0xcc; 20],
            vec![0xdd; 8], // stand-in for g^x
        );
        let mut v = Vec::new();
        v.write(&payload).unwrap();
        let expected = hex!(
            "03"                                         // version
            "00"                                         // auth type: none
            "5f362b44"                                   // timestamp
            "0a000002"                                   // rp addr
            "2329"                                       // rp port
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"   // rp identity
            "0004" "bbbbbbbb"                            // onion key len, key
            "cccccccccccccccccccccccccccccccccccccccc"   // cookie
            "dddddddddddddddd"                           // g^x
        );
        assert_eq!(v, expected);

        // And it parses back.
        let mut r = Reader::from_slice(&v);
        let p: IntroPayload = r.extract().unwrap();
        r.should_be_exhausted().unwrap();
        assert_eq!(p.dh_public(), &[0xdd; 8]);
        assert_eq!(p.cookie(), &[0xcc; 20]);
        assert_eq!(p.rend_identity(), &RsaIdentity::from([0xaa; 20]));
    }

    #[test]
    fn intro_payload_with_auth() {
        let payload = IntroPayload::new(
            Some((AuthType::BASIC, vec![1, 2, 3, 4])),
            0,
            "10.0.0.2".parse().unwrap(),
            9001,
            RsaIdentity::from([0xaa; 20]),
            vec![0xbb; 4],
            [0xcc; 20],
            vec![0xdd; 8],
        );
        let mut v = Vec::new();
        v.write(&payload).unwrap();
        // version, auth type, auth len, auth data...
        assert_eq!(&v[..8], &hex!("03 01 0004 01020304")[..]);

        let mut r = Reader::from_slice(&v);
        let p: IntroPayload = r.extract().unwrap();
        assert_eq!(p.auth_type, AuthType::BASIC);
        assert_eq!(p.auth_data, vec![1, 2, 3, 4]);
    }
}
