//! Different kinds of messages that can be encoded in channel cells.

use super::{BoxedCellBody, ChanCmd, RawCellBody, CELL_DATA_LEN};
use caret::caret_int;
use or_bytes::{EncodeError, EncodeResult, Error, Readable, Reader, Result, Writer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Trait for the 'bodies' of channel messages.
pub trait Body: Readable {
    /// Decode a channel cell body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        r.extract()
    }
    /// Consume this message and encode its body onto `w`.
    ///
    /// Does not encode anything _but_ the cell body, and does not pad
    /// to the cell length.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>;
}

/// Decoded message from a channel cell of any "acceptable" type.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum AnyChanMsg {
    /// A Padding message
    Padding(Padding),
    /// Variable-length padding message
    Vpadding(Vpadding),
    /// Create a circuit (TAP handshake)
    Create(Create),
    /// Response to a Create message (TAP handshake)
    Created(Created),
    /// Create a circuit (no public-key)
    CreateFast(CreateFast),
    /// Response to a CreateFast message
    CreatedFast(CreatedFast),
    /// A message sent along a circuit, likely to a more-distant relay.
    Relay(Relay),
    /// A message sent along a circuit (limited supply)
    RelayEarly(Relay),
    /// Tear down a circuit
    Destroy(Destroy),
    /// Part of the channel handshake: describe network connection
    Netinfo(Netinfo),
    /// Part of the channel handshake: describe link protocol versions
    Versions(Versions),
    /// Part of the channel handshake: additional certificates
    Certs(Certs),
    /// Part of the channel handshake: challenge for proving possession
    /// of the TLS keys
    AuthChallenge(AuthChallenge),
    /// Any unrecognized channel message.
    Unrecognized(Unrecognized),
}

/// Declare a From implementation and an enum accessor for a message
/// variant.
macro_rules! msg_into_cell {
    ($body:ident) => {
        impl From<$body> for AnyChanMsg {
            fn from(body: $body) -> AnyChanMsg {
                AnyChanMsg::$body(body)
            }
        }
    };
}

msg_into_cell!(Padding);
msg_into_cell!(Vpadding);
msg_into_cell!(Create);
msg_into_cell!(Created);
msg_into_cell!(CreateFast);
msg_into_cell!(CreatedFast);
msg_into_cell!(Destroy);
msg_into_cell!(Netinfo);
msg_into_cell!(Versions);
msg_into_cell!(Certs);
msg_into_cell!(AuthChallenge);
msg_into_cell!(Unrecognized);

impl From<Relay> for AnyChanMsg {
    fn from(body: Relay) -> AnyChanMsg {
        AnyChanMsg::Relay(body)
    }
}

impl super::ChanMsg for AnyChanMsg {
    fn cmd(&self) -> ChanCmd {
        use AnyChanMsg::*;
        match self {
            Padding(_) => ChanCmd::PADDING,
            Vpadding(_) => ChanCmd::VPADDING,
            Create(_) => ChanCmd::CREATE,
            Created(_) => ChanCmd::CREATED,
            CreateFast(_) => ChanCmd::CREATE_FAST,
            CreatedFast(_) => ChanCmd::CREATED_FAST,
            Relay(_) => ChanCmd::RELAY,
            RelayEarly(_) => ChanCmd::RELAY_EARLY,
            Destroy(_) => ChanCmd::DESTROY,
            Netinfo(_) => ChanCmd::NETINFO,
            Versions(_) => ChanCmd::VERSIONS,
            Certs(_) => ChanCmd::CERTS,
            AuthChallenge(_) => ChanCmd::AUTH_CHALLENGE,
            Unrecognized(m) => m.cmd(),
        }
    }

    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        use AnyChanMsg::*;
        match self {
            Padding(b) => b.encode_onto(w),
            Vpadding(b) => b.encode_onto(w),
            Create(b) => b.encode_onto(w),
            Created(b) => b.encode_onto(w),
            CreateFast(b) => b.encode_onto(w),
            CreatedFast(b) => b.encode_onto(w),
            Relay(b) => b.encode_onto(w),
            RelayEarly(b) => b.encode_onto(w),
            Destroy(b) => b.encode_onto(w),
            Netinfo(b) => b.encode_onto(w),
            Versions(b) => b.encode_onto(w),
            Certs(b) => b.encode_onto(w),
            AuthChallenge(b) => b.encode_onto(w),
            Unrecognized(b) => b.encode_onto(w),
        }
    }

    fn decode_from_reader(cmd: ChanCmd, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match cmd {
            ChanCmd::PADDING => Padding::decode_from_reader(r)?.into(),
            ChanCmd::VPADDING => Vpadding::decode_from_reader(r)?.into(),
            ChanCmd::CREATE => Create::decode_from_reader(r)?.into(),
            ChanCmd::CREATED => Created::decode_from_reader(r)?.into(),
            ChanCmd::CREATE_FAST => CreateFast::decode_from_reader(r)?.into(),
            ChanCmd::CREATED_FAST => CreatedFast::decode_from_reader(r)?.into(),
            ChanCmd::RELAY => Relay::decode_from_reader(r)?.into(),
            ChanCmd::RELAY_EARLY => AnyChanMsg::RelayEarly(Relay::decode_from_reader(r)?),
            ChanCmd::DESTROY => Destroy::decode_from_reader(r)?.into(),
            ChanCmd::NETINFO => Netinfo::decode_from_reader(r)?.into(),
            ChanCmd::VERSIONS => Versions::decode_from_reader(r)?.into(),
            ChanCmd::CERTS => Certs::decode_from_reader(r)?.into(),
            ChanCmd::AUTH_CHALLENGE => AuthChallenge::decode_from_reader(r)?.into(),
            _ => Unrecognized::decode_with_cmd(cmd, r)?.into(),
        })
    }
}

/// A Padding message is a fixed-length message, transmitted to be
/// ignored.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Padding {}
impl Padding {
    /// Create a new fixed-length padding cell
    pub fn new() -> Self {
        Padding {}
    }
}
impl Body for Padding {
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}
impl Readable for Padding {
    fn take_from(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(Padding {})
    }
}

/// A VPadding message is a variable-length padding message, transmitted
/// to be ignored.
#[derive(Clone, Debug)]
pub struct Vpadding {
    /// How much padding to send in this cell's body.
    len: u16,
}
impl Vpadding {
    /// Return a new vpadding message with given length.
    pub fn new(len: u16) -> Self {
        Vpadding { len }
    }
}
impl Body for Vpadding {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_zeros(self.len as usize);
        Ok(())
    }
}
impl Readable for Vpadding {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() > u16::MAX as usize {
            return Err(Error::BadLengthValue);
        }
        Ok(Vpadding {
            len: r.remaining() as u16,
        })
    }
}

/// Number of bytes used for a TAP handshake by the initiator.
///
/// (That's 128 bytes of RSA-OAEP block, plus the 16-byte symmetric
/// key and 42 bytes of OAEP overhead folded into the layout: the
/// onionskin is RSA(K || g^x [0..70]) || AES_K(g^x [70..128]).)
pub const TAP_C_HANDSHAKE_LEN: usize = 128 + 16 + 42;
/// Number of bytes used for a TAP handshake response: g^y followed by
/// KH.
pub const TAP_S_HANDSHAKE_LEN: usize = 128 + 20;

/// Number of bytes used for a CREATE_FAST handshake by the initiator.
pub const FAST_C_HANDSHAKE_LEN: usize = 20;
/// Number of bytes used for a CREATE_FAST handshake response.
pub const FAST_S_HANDSHAKE_LEN: usize = 20 + 20;

/// Declare a handshake message with a fixed-length body.
macro_rules! fixed_len_handshake {
    {
        $(#[$meta:meta])*
        $name:ident , $cmd:ident, $len:ident
    } => {
        $(#[$meta])*
        #[derive(Clone,Debug)]
        pub struct $name {
            /// The body of the handshake.
            handshake: Vec<u8>
        }
        impl $name {
            /// Create a new cell from a provided handshake.
            pub fn new<B>(handshake: B) -> Self
                where B: Into<Vec<u8>>
            {
                let handshake = handshake.into();
                $name { handshake }
            }
            /// Return the content of this handshake.
            pub fn handshake(&self) -> &[u8] {
                &self.handshake
            }
            /// Consume this message and return the content of this
            /// handshake.
            pub fn into_handshake(self) -> Vec<u8> {
                self.handshake
            }
        }
        impl Body for $name {
            fn encode_onto<W: Writer + ?Sized>(self, w: &mut W)  -> EncodeResult<()> {
                w.write_all(&self.handshake[..]);
                Ok(())
            }
        }
        impl Readable for $name {
            fn take_from(b: &mut Reader<'_>) -> Result<Self> {
                Ok($name {
                    handshake: b.take($len)?.into(),
                })
            }
        }
    }
}

fixed_len_handshake! {
    /// A Create message creates a circuit, using the TAP handshake.
    ///
    /// TAP is an obsolete handshake based on RSA-1024 and DH-1024,
    /// but it is the one that this protocol era uses for multi-hop
    /// circuits.  Relays respond to a Create message with a Created
    /// reply on success, or a Destroy message on failure.
    Create, CREATE, TAP_C_HANDSHAKE_LEN
}
fixed_len_handshake! {
    /// A Created message responds to a Create message, using the TAP
    /// handshake.
    Created, CREATED, TAP_S_HANDSHAKE_LEN
}
fixed_len_handshake! {
    /// A CreateFast message creates a circuit using no public-key
    /// crypto.
    ///
    /// CreateFast is safe only when used on an already-secure TLS
    /// connection.  It can only be used for the first hop of a
    /// circuit.
    ///
    /// Relays reply to a CreateFast message with CreatedFast on
    /// success, or a Destroy message on failure.
    CreateFast, CREATE_FAST, FAST_C_HANDSHAKE_LEN
}
fixed_len_handshake! {
    /// A CreatedFast message responds to a CreateFast message.
    CreatedFast, CREATED_FAST, FAST_S_HANDSHAKE_LEN
}

/// A Relay message is a message transmitted over a circuit.
///
/// Once a circuit has been established, relay cells can be sent over
/// it.  Clients can send relay cells to any relay on the circuit. Any
/// relay on the circuit can send relay cells to the client, either
/// directly (if it is the first hop), or indirectly through the
/// intermediate hops.
///
/// A different protocol is defined over the relay cells; it is
/// implemented in the [crate::relaycell] module.
#[derive(Clone)]
pub struct Relay {
    /// The contents of the relay cell as encoded for transfer.
    body: BoxedCellBody,
}
impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The body is opaque ciphertext; don't dump all 509 bytes.
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}
impl Relay {
    /// Construct a Relay message from a slice containing its contents.
    ///
    /// The slice must not be longer than the cell body length.
    pub fn new<P>(body: P) -> Self
    where
        P: AsRef<[u8]>,
    {
        let body = body.as_ref();
        debug_assert!(body.len() <= CELL_DATA_LEN);
        let mut r = [0_u8; CELL_DATA_LEN];
        r[..body.len()].copy_from_slice(body);
        Relay { body: Box::new(r) }
    }

    /// Construct a Relay message from its body.
    pub fn from_raw(body: RawCellBody) -> Self {
        Relay {
            body: Box::new(body),
        }
    }

    /// Consume this Relay message and return a BoxedCellBody for
    /// encryption/decryption.
    pub fn into_relay_body(self) -> BoxedCellBody {
        self.body
    }

    /// Wrap this Relay message into an AnyChanMsg as a RELAY_EARLY
    /// cell.
    pub fn into_early(self) -> AnyChanMsg {
        AnyChanMsg::RelayEarly(self)
    }
}
impl Body for Relay {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.body[..]);
        Ok(())
    }
}
impl Readable for Relay {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let mut body = Box::new([0_u8; CELL_DATA_LEN]);
        body.copy_from_slice(r.take(CELL_DATA_LEN)?);
        Ok(Relay { body })
    }
}

/// The Destroy message tears down a circuit.
///
/// On receiving a Destroy message, a relay or client should drop all
/// state for the circuit, and pass the destroy onwards to the other
/// parties on the circuit (if any).
#[derive(Clone, Debug)]
pub struct Destroy {
    /// Reason code given for tearing down this circuit
    reason: DestroyReason,
}
impl Destroy {
    /// Create a new destroy cell.
    pub fn new(reason: DestroyReason) -> Self {
        Destroy { reason }
    }
    /// Return the provided reason for destroying the circuit.
    pub fn reason(&self) -> DestroyReason {
        self.reason
    }
}
impl Body for Destroy {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.reason.into());
        Ok(())
    }
}
impl Readable for Destroy {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let reason = if r.remaining() == 0 {
            DestroyReason::NONE
        } else {
            r.take_u8()?.into()
        };
        Ok(Destroy { reason })
    }
}

caret_int! {
    /// A declared reason for destroying a circuit.
    pub struct DestroyReason(u8) {
        /// No reason given.
        ///
        /// (This is the only reason that clients send.)
        NONE = 0,
        /// Protocol violation
        PROTOCOL = 1,
        /// Internal error.
        INTERNAL = 2,
        /// Client sent a TRUNCATE command.
        REQUESTED = 3,
        /// Relay is hibernating and not accepting requests
        HIBERNATING = 4,
        /// Ran out of memory, sockets, or circuit IDs
        RESOURCELIMIT = 5,
        /// Couldn't connect to relay.
        CONNECTFAILED = 6,
        /// Connected to a relay, but its OR identity was not as
        /// requested.
        OR_IDENTITY = 7,
        /// The channel that was carrying this circuit died.
        CHANNEL_CLOSED = 8,
        /// Circuit expired for being too dirty or old
        FINISHED = 9,
        /// Circuit construction took too long
        TIMEOUT = 10,
        /// Circuit was destroyed without client truncate
        DESTROYED = 11,
        /// Request for unknown hidden service
        NOSUCHSERVICE = 12
    }
}

impl DestroyReason {
    /// Return a human-readable string for this reason.
    pub fn human_str(&self) -> &'static str {
        match *self {
            DestroyReason::NONE => "No reason",
            DestroyReason::PROTOCOL => "Protocol violation",
            DestroyReason::INTERNAL => "Internal error",
            DestroyReason::REQUESTED => "Client sent a TRUNCATE command",
            DestroyReason::HIBERNATING => "Relay is hibernating and not accepting requests",
            DestroyReason::RESOURCELIMIT => "Relay ran out of resources",
            DestroyReason::CONNECTFAILED => "Couldn't connect to relay",
            DestroyReason::OR_IDENTITY => "Connected to relay with different OR identity",
            DestroyReason::CHANNEL_CLOSED => "The channel carrying this circuit died",
            DestroyReason::FINISHED => "Circuit expired for being too dirty or old",
            DestroyReason::TIMEOUT => "Circuit construction took too long",
            DestroyReason::DESTROYED => "Circuit was destroyed without client truncate",
            DestroyReason::NOSUCHSERVICE => "No such hidden service",
            _ => "Unrecognized reason",
        }
    }
}

/// The Netinfo message ends channel negotiation.
///
/// It tells the other party on the channel our view of the current
/// time, our own list of public addresses, and our view of its
/// address.
///
/// When we get a netinfo cell, we can observe whether the other party
/// knows our address, and whether their clock matches ours: a large
/// difference is worth a warning.
#[derive(Clone, Debug)]
pub struct Netinfo {
    /// Time when this cell was sent, or 0 if this cell is sent by a
    /// client.
    timestamp: u32,
    /// Observed address for the party that did not send this cell.
    their_addr: Option<IpAddr>,
    /// Canonical addresses for the party that did send this cell.
    my_addr: Vec<IpAddr>,
}

/// Helper: encode a single address in the format used in Netinfo
/// messages.
fn enc_one_netinfo_addr<W: Writer + ?Sized>(w: &mut W, addr: &IpAddr) {
    match addr {
        IpAddr::V4(ipv4) => {
            w.write_u8(0x04); // type.
            w.write_u8(4); // length.
            w.write_all(&ipv4.octets()[..]);
        }
        IpAddr::V6(ipv6) => {
            w.write_u8(0x06); // type.
            w.write_u8(16); // length.
            w.write_all(&ipv6.octets()[..]);
        }
    }
}

/// Helper: decode a single address in the format used in Netinfo
/// messages.
fn take_one_netinfo_addr(r: &mut Reader<'_>) -> Result<Option<IpAddr>> {
    let atype = r.take_u8()?;
    let alen = r.take_u8()?;
    let abody = r.take(alen as usize)?;
    match (atype, alen) {
        (0x04, 4) => {
            let bytes = <[u8; 4]>::try_from(abody).map_err(|_| Error::Truncated)?;
            Ok(Some(IpAddr::V4(bytes.into())))
        }
        (0x06, 16) => {
            let bytes = <[u8; 16]>::try_from(abody).map_err(|_| Error::Truncated)?;
            Ok(Some(IpAddr::V6(bytes.into())))
        }
        (_, _) => Ok(None),
    }
}

impl Netinfo {
    /// Construct a new Netinfo to be sent by a client.
    ///
    /// Clients send a zero timestamp to avoid exposing their view of
    /// the clock.
    pub fn from_client(their_addr: Option<IpAddr>) -> Self {
        Netinfo {
            timestamp: 0,
            their_addr,
            my_addr: Vec::new(), // clients don't report their addrs.
        }
    }

    /// Return the time reported in this cell, if any.
    pub fn timestamp(&self) -> Option<std::time::SystemTime> {
        use std::time::{Duration, SystemTime};
        if self.timestamp == 0 {
            None
        } else {
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(self.timestamp.into()))
        }
    }

    /// Return the address that the sender claims to have observed for
    /// us.
    pub fn their_addr(&self) -> Option<&IpAddr> {
        self.their_addr.as_ref()
    }
}
impl Body for Netinfo {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.timestamp);
        match self.their_addr {
            Some(addr) => enc_one_netinfo_addr(w, &addr),
            None => {
                // There's no good way to encode "no address", so we
                // write a length-0 unspecified address instead.
                w.write_u8(0); // type
                w.write_u8(0); // length
            }
        }
        let n_addrs: u8 = self
            .my_addr
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u8(n_addrs);
        for addr in &self.my_addr {
            enc_one_netinfo_addr(w, addr);
        }
        Ok(())
    }
}
impl Readable for Netinfo {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let timestamp = r.take_u32()?;
        let their_addr = take_one_netinfo_addr(r)?.filter(|a| !a.is_unspecified());
        let my_n_addrs = r.take_u8()?;
        let mut my_addr = Vec::with_capacity(my_n_addrs.into());
        for _ in 0..my_n_addrs {
            if let Some(a) = take_one_netinfo_addr(r)? {
                my_addr.push(a);
            }
        }
        Ok(Netinfo {
            timestamp,
            their_addr,
            my_addr,
        })
    }
}

/// A Versions message begins channel negotiation.
///
/// Every channel must begin by sending a Versions message.  This message
/// lists the link protocol versions that this party is willing to
/// support.
///
/// Note that a Versions message is always sent with a two-byte circuit
/// ID field.  (That's the only kind of circuit ID in the protocol
/// versions we implement, but it bears repeating, since it remains true
/// even on links that negotiate protocol 4 or later.)
#[derive(Clone, Debug)]
pub struct Versions {
    /// List of supported link protocol versions
    versions: Vec<u16>,
}
impl Versions {
    /// Construct a new Versions message using a provided list of link
    /// protocols.
    ///
    /// Returns an error if the list of versions is too long.
    pub fn new<B: Into<Vec<u16>>>(vs: B) -> crate::Result<Self> {
        let versions = vs.into();
        if versions.len() < (u16::MAX / 2) as usize {
            Ok(Self { versions })
        } else {
            Err(crate::Error::CantEncode("too many versions"))
        }
    }

    /// Encode this VERSIONS cell in the manner expected for a
    /// handshake.
    ///
    /// (That's with a two-byte circuit ID of zero, a one-byte command,
    /// and a two-byte length.)
    pub fn encode_for_handshake(self) -> EncodeResult<Vec<u8>> {
        let mut v = Vec::new();
        v.write_u16(0); // obsolete circuit ID
        v.write_u8(ChanCmd::VERSIONS.into());
        v.write_u16((self.versions.len() * 2) as u16); // message length.
        self.encode_onto(&mut v)?;
        Ok(v)
    }

    /// Return the best (numerically highest) link protocol that is
    /// shared by this versions cell and my_protos.
    pub fn best_shared_link_protocol(&self, my_protos: &[u16]) -> Option<u16> {
        // NOTE: this implementation is quadratic, but it shouldn't
        // matter much given that my_protos will not be very long.
        my_protos
            .iter()
            .filter(|p| self.versions.contains(p))
            .fold(None, |a, b| Some(std::cmp::max(a.unwrap_or(0), *b)))
    }
}
impl Body for Versions {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        for v in &self.versions {
            w.write_u16(*v);
        }
        Ok(())
    }
}
impl Readable for Versions {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let mut versions = Vec::new();
        while r.remaining() > 0 {
            versions.push(r.take_u16()?);
        }
        Ok(Versions { versions })
    }
}

caret_int! {
    /// A type of certificate sent as part of the channel handshake.
    pub struct CertType(u8) {
        /// Link key, signed by identity key.
        TLS_LINK = 1,
        /// Self-signed identity key.
        RSA_ID = 2,
        /// Authentication key, signed by identity key.
        LINK_AUTH = 3,
    }
}

/// A single certificate in a Certs cell.
#[derive(Clone, Debug)]
pub struct TorCert {
    /// The type of the certificate.
    cert_type: CertType,
    /// The encoded certificate body.
    cert: Vec<u8>,
}

/// A Certs message is used as part of the channel handshake to send
/// additional certificates.
///
/// These certificates are not presented as part of the TLS handshake.
/// Originally, the protocol was designed to use TLS certificates, but
/// that turned out to be pretty bad for anticensorship purposes.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Certs {
    /// The certificates in this cell
    certs: Vec<TorCert>,
}

impl Certs {
    /// Return a new empty certs cell.
    pub fn new_empty() -> Self {
        Certs { certs: Vec::new() }
    }

    /// Add a new certificate to this cell.
    pub fn push_cert_body<B>(&mut self, cert_type: CertType, cert: B)
    where
        B: Into<Vec<u8>>,
    {
        let cert = cert.into();
        self.certs.push(TorCert { cert_type, cert });
    }

    /// Return the body of the certificate with a given type, if there
    /// is exactly one.
    pub fn cert_body(&self, cert_type: CertType) -> Option<&[u8]> {
        let mut certs = self.certs.iter().filter(|c| c.cert_type == cert_type);
        let result = certs.next()?;
        if certs.next().is_some() {
            // Duplicate certificates are forbidden.
            return None;
        }
        Some(&result.cert[..])
    }
}

impl Body for Certs {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        let n_certs: u8 = self
            .certs
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u8(n_certs);
        for c in self.certs {
            w.write_u8(c.cert_type.into());
            let cert_len: u16 = c
                .cert
                .len()
                .try_into()
                .map_err(|_| EncodeError::BadLengthValue)?;
            w.write_u16(cert_len);
            w.write_all(&c.cert[..]);
        }
        Ok(())
    }
}
impl Readable for Certs {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let n = r.take_u8()?;
        let mut certs = Vec::new();
        for _ in 0..n {
            let cert_type = r.take_u8()?.into();
            let cert_len = r.take_u16()?;
            let cert = r.take(cert_len as usize)?.to_vec();
            certs.push(TorCert { cert_type, cert });
        }
        Ok(Certs { certs })
    }
}

/// Length of the challenge in an AuthChallenge message.
const CHALLENGE_LEN: usize = 32;

/// An AuthChallenge message is part of negotiation, sent by responders
/// to initiators.
///
/// The AuthChallenge cell is used to ensure that some unpredictable
/// material has been sent on the channel, and to tell the initiator
/// what authentication methods will be accepted.
///
/// Clients can safely ignore this message: they don't need to
/// authenticate.
#[derive(Clone, Debug)]
pub struct AuthChallenge {
    /// Random challenge to be used in generating response
    challenge: [u8; CHALLENGE_LEN],
    /// List of permitted authentication methods
    methods: Vec<u16>,
}

impl AuthChallenge {
    /// Construct a new AuthChallenge cell with a provided challenge
    /// and methods.
    pub fn new<B, M>(challenge: B, methods: M) -> Self
    where
        B: Into<[u8; CHALLENGE_LEN]>,
        M: Into<Vec<u16>>,
    {
        AuthChallenge {
            challenge: challenge.into(),
            methods: methods.into(),
        }
    }
}

impl Body for AuthChallenge {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.challenge[..]);
        let n_methods = self
            .methods
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u16(n_methods);
        for m in self.methods {
            w.write_u16(m);
        }
        Ok(())
    }
}
impl Readable for AuthChallenge {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let challenge = r.extract()?;
        let n_methods = r.take_u16()?;
        let methods = r.extract_n(n_methods.into())?;
        Ok(AuthChallenge { challenge, methods })
    }
}

/// Holds any message whose command we do not recognize.
///
/// Well-behaved implementations are required to ignore unrecognized
/// cells.
#[derive(Clone, Debug)]
pub struct Unrecognized {
    /// The channel command that we got with this cell
    cmd: ChanCmd,
    /// The contents of the cell
    content: Vec<u8>,
}

impl Unrecognized {
    /// Construct a new unrecognized cell.
    pub fn new<B>(cmd: ChanCmd, content: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        let content = content.into();
        Unrecognized { cmd, content }
    }

    /// Return the command from this cell.
    fn cmd(&self) -> ChanCmd {
        self.cmd
    }

    /// Decode this unrecognized cell from a reader, with a provided
    /// command value.
    fn decode_with_cmd(cmd: ChanCmd, r: &mut Reader<'_>) -> Result<Unrecognized> {
        let mut u = Unrecognized::take_from(r)?;
        u.cmd = cmd;
        Ok(u)
    }
}

impl Body for Unrecognized {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.content[..]);
        Ok(())
    }
}
impl Readable for Unrecognized {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Unrecognized {
            cmd: 0.into(),
            content: r.take(r.remaining())?.into(),
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::chancell::ChanMsg;
    use hex_literal::hex;

    /// Helper: decode a body with a given command, and re-encode it.
    fn decode_encode(cmd: ChanCmd, body: &[u8]) -> AnyChanMsg {
        let mut r = Reader::from_slice(body);
        let msg = AnyChanMsg::decode_from_reader(cmd, &mut r).unwrap();
        assert_eq!(msg.cmd(), cmd);
        msg
    }

    #[test]
    fn versions() {
        let v = Versions::new(vec![2, 3]).unwrap();
        let encoded = v.clone().encode_for_handshake().unwrap();
        assert_eq!(encoded, hex!("0000 07 0004 0002 0003"));
        assert_eq!(v.best_shared_link_protocol(&[2, 3, 4]), Some(3));
        assert_eq!(v.best_shared_link_protocol(&[2]), Some(2));
        assert_eq!(v.best_shared_link_protocol(&[9]), None);

        let m = decode_encode(ChanCmd::VERSIONS, &hex!("0002 0003"));
        match m {
            AnyChanMsg::Versions(v2) => {
                assert_eq!(v2.best_shared_link_protocol(&[3]), Some(3));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn netinfo_roundtrip() {
        let ni = Netinfo::from_client(Some("18.0.0.1".parse().unwrap()));
        let mut encoded = Vec::new();
        ni.encode_onto(&mut encoded).unwrap();
        assert_eq!(encoded, hex!("00000000 04 04 12000001 00"));

        let m = decode_encode(ChanCmd::NETINFO, &encoded);
        match m {
            AnyChanMsg::Netinfo(ni) => {
                assert_eq!(ni.timestamp(), None);
                assert_eq!(
                    ni.their_addr(),
                    Some(&"18.0.0.1".parse::<IpAddr>().unwrap())
                );
            }
            _ => panic!(),
        }
    }

    #[test]
    fn netinfo_with_time() {
        // A relay-style netinfo with a real timestamp.
        let body = hex!("5F362B44 04 04 7f000001 01 04 04 0a000001");
        let m = decode_encode(ChanCmd::NETINFO, &body);
        match m {
            AnyChanMsg::Netinfo(ni) => {
                assert!(ni.timestamp().is_some());
            }
            _ => panic!(),
        }
    }

    #[test]
    fn handshakes() {
        let create = Create::new(vec![b'x'; TAP_C_HANDSHAKE_LEN]);
        let mut encoded = Vec::new();
        create.encode_onto(&mut encoded).unwrap();
        assert_eq!(encoded.len(), TAP_C_HANDSHAKE_LEN);

        // Decoding a truncated handshake fails.
        let mut r = Reader::from_slice(&encoded[..100]);
        assert!(Create::take_from(&mut r).is_err());

        let fast = CreatedFast::new(&b"this offer is unrepeatable!!! yes 40 byt"[..]);
        assert_eq!(fast.handshake().len(), FAST_S_HANDSHAKE_LEN);
        let b = fast.into_handshake();
        assert_eq!(b.len(), FAST_S_HANDSHAKE_LEN);
    }

    #[test]
    fn destroy() {
        let d = Destroy::new(DestroyReason::TIMEOUT);
        let mut encoded = Vec::new();
        d.encode_onto(&mut encoded).unwrap();
        assert_eq!(encoded, [10]);

        let m = decode_encode(ChanCmd::DESTROY, &encoded);
        match m {
            AnyChanMsg::Destroy(d) => {
                assert_eq!(d.reason(), DestroyReason::TIMEOUT);
                assert_eq!(d.reason().human_str(), "Circuit construction took too long");
            }
            _ => panic!(),
        }

        // Empty destroy bodies get reason NONE.
        let m = decode_encode(ChanCmd::DESTROY, &[]);
        match m {
            AnyChanMsg::Destroy(d) => assert_eq!(d.reason(), DestroyReason::NONE),
            _ => panic!(),
        }
    }

    #[test]
    fn certs() {
        let mut c = Certs::new_empty();
        c.push_cert_body(CertType::RSA_ID, &b"not a cert"[..]);
        assert_eq!(c.cert_body(CertType::RSA_ID), Some(&b"not a cert"[..]));
        assert_eq!(c.cert_body(CertType::TLS_LINK), None);

        let mut encoded = Vec::new();
        c.encode_onto(&mut encoded).unwrap();
        assert_eq!(encoded, hex!("01 02 000a 6e6f7420612063657274"));

        // Duplicate certificates of one type are rejected.
        let mut c = Certs::new_empty();
        c.push_cert_body(CertType::RSA_ID, &b"a"[..]);
        c.push_cert_body(CertType::RSA_ID, &b"b"[..]);
        assert_eq!(c.cert_body(CertType::RSA_ID), None);
    }

    #[test]
    fn unrecognized() {
        let m = decode_encode(77.into(), &hex!("010203"));
        match &m {
            AnyChanMsg::Unrecognized(u) => assert_eq!(u.content, vec![1, 2, 3]),
            _ => panic!(),
        }
    }

    #[test]
    fn relay_early() {
        let r = Relay::new(&b"hello"[..]);
        let early = r.clone().into_early();
        assert_eq!(early.cmd(), ChanCmd::RELAY_EARLY);
        assert_eq!(AnyChanMsg::from(r).cmd(), ChanCmd::RELAY);
    }
}
