//! Encoding and decoding for relay messages
//!
//! Relay messages are sent along circuits, inside RELAY or RELAY_EARLY
//! cells.

use super::{RelayCmd, RelayMsg};
use crate::chancell::msg::{DestroyReason, TAP_C_HANDSHAKE_LEN, TAP_S_HANDSHAKE_LEN};
use crate::chancell::CELL_DATA_LEN;
use caret::caret_int;
use or_bytes::{EncodeError, EncodeResult, Error, Result};
use or_bytes::{Readable, Reader, Writeable, Writer};
use or_llcrypto::pk::rsa::RsaIdentity;
use std::net::{IpAddr, Ipv4Addr};

use bitflags::bitflags;

pub use super::hs::{
    EstablishRendezvous, Introduce1, IntroduceAck, Rendezvous2, RendezvousEstablished,
};

/// A single parsed relay message, sent or received along a circuit
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AnyRelayMsg {
    /// Create a stream
    Begin(Begin),
    /// Send data on a stream
    Data(Data),
    /// Close a stream
    End(End),
    /// Successful response to a Begin message
    Connected(Connected),
    /// For flow control
    Sendme(Sendme),
    /// Extend a circuit to a new hop (TAP handshake)
    Extend(Extend),
    /// Successful response to an Extend message
    Extended(Extended),
    /// Partially close a circuit
    Truncate(Truncate),
    /// Tell the client that a circuit has been partially closed
    Truncated(Truncated),
    /// Used for padding
    Drop(Drop),
    /// Launch a DNS request
    Resolve(Resolve),
    /// Response to a Resolve message
    Resolved(Resolved),
    /// Start a directory stream
    BeginDir(BeginDir),
    /// Establish Rendezvous
    EstablishRendezvous(EstablishRendezvous),
    /// Acknowledgment for EstablishRendezvous
    RendezvousEstablished(RendezvousEstablished),
    /// Introduce1 (client to introduction point)
    Introduce1(Introduce1),
    /// Acknowledgement for Introduce1
    IntroduceAck(IntroduceAck),
    /// Rendezvous2 (rendezvous point to client)
    Rendezvous2(Rendezvous2),
    /// An unrecognized command.
    Unrecognized(Unrecognized),
}

/// Internal: traits in common different cell bodies.
pub trait Body: Sized {
    /// Decode a relay cell body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self>;
    /// Encode the body of this cell into the end of a writer.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>;
}

/// Declare a From implementation for a message variant.
macro_rules! msg_into_any {
    ($body:ident) => {
        impl From<$body> for AnyRelayMsg {
            fn from(body: $body) -> AnyRelayMsg {
                AnyRelayMsg::$body(body)
            }
        }
    };
}

msg_into_any!(Begin);
msg_into_any!(Data);
msg_into_any!(End);
msg_into_any!(Connected);
msg_into_any!(Sendme);
msg_into_any!(Extend);
msg_into_any!(Extended);
msg_into_any!(Truncate);
msg_into_any!(Truncated);
msg_into_any!(Drop);
msg_into_any!(Resolve);
msg_into_any!(Resolved);
msg_into_any!(BeginDir);
msg_into_any!(EstablishRendezvous);
msg_into_any!(RendezvousEstablished);
msg_into_any!(Introduce1);
msg_into_any!(IntroduceAck);
msg_into_any!(Rendezvous2);
msg_into_any!(Unrecognized);

impl RelayMsg for AnyRelayMsg {
    fn cmd(&self) -> RelayCmd {
        use AnyRelayMsg::*;
        match self {
            Begin(_) => RelayCmd::BEGIN,
            Data(_) => RelayCmd::DATA,
            End(_) => RelayCmd::END,
            Connected(_) => RelayCmd::CONNECTED,
            Sendme(_) => RelayCmd::SENDME,
            Extend(_) => RelayCmd::EXTEND,
            Extended(_) => RelayCmd::EXTENDED,
            Truncate(_) => RelayCmd::TRUNCATE,
            Truncated(_) => RelayCmd::TRUNCATED,
            Drop(_) => RelayCmd::DROP,
            Resolve(_) => RelayCmd::RESOLVE,
            Resolved(_) => RelayCmd::RESOLVED,
            BeginDir(_) => RelayCmd::BEGIN_DIR,
            EstablishRendezvous(_) => RelayCmd::ESTABLISH_RENDEZVOUS,
            RendezvousEstablished(_) => RelayCmd::RENDEZVOUS_ESTABLISHED,
            Introduce1(_) => RelayCmd::INTRODUCE1,
            IntroduceAck(_) => RelayCmd::INTRODUCE_ACK,
            Rendezvous2(_) => RelayCmd::RENDEZVOUS2,
            Unrecognized(m) => m.cmd(),
        }
    }

    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        use AnyRelayMsg::*;
        match self {
            Begin(b) => b.encode_onto(w),
            Data(b) => b.encode_onto(w),
            End(b) => b.encode_onto(w),
            Connected(b) => b.encode_onto(w),
            Sendme(b) => b.encode_onto(w),
            Extend(b) => b.encode_onto(w),
            Extended(b) => b.encode_onto(w),
            Truncate(b) => b.encode_onto(w),
            Truncated(b) => b.encode_onto(w),
            Drop(b) => b.encode_onto(w),
            Resolve(b) => b.encode_onto(w),
            Resolved(b) => b.encode_onto(w),
            BeginDir(b) => b.encode_onto(w),
            EstablishRendezvous(b) => b.encode_onto(w),
            RendezvousEstablished(b) => b.encode_onto(w),
            Introduce1(b) => b.encode_onto(w),
            IntroduceAck(b) => b.encode_onto(w),
            Rendezvous2(b) => b.encode_onto(w),
            Unrecognized(b) => b.encode_onto(w),
        }
    }

    fn decode_from_reader(cmd: RelayCmd, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match cmd {
            RelayCmd::BEGIN => Begin::decode_from_reader(r)?.into(),
            RelayCmd::DATA => Data::decode_from_reader(r)?.into(),
            RelayCmd::END => End::decode_from_reader(r)?.into(),
            RelayCmd::CONNECTED => Connected::decode_from_reader(r)?.into(),
            RelayCmd::SENDME => Sendme::decode_from_reader(r)?.into(),
            RelayCmd::EXTEND => Extend::decode_from_reader(r)?.into(),
            RelayCmd::EXTENDED => Extended::decode_from_reader(r)?.into(),
            RelayCmd::TRUNCATE => Truncate::decode_from_reader(r)?.into(),
            RelayCmd::TRUNCATED => Truncated::decode_from_reader(r)?.into(),
            RelayCmd::DROP => Drop::decode_from_reader(r)?.into(),
            RelayCmd::RESOLVE => Resolve::decode_from_reader(r)?.into(),
            RelayCmd::RESOLVED => Resolved::decode_from_reader(r)?.into(),
            RelayCmd::BEGIN_DIR => BeginDir::decode_from_reader(r)?.into(),
            RelayCmd::ESTABLISH_RENDEZVOUS => EstablishRendezvous::decode_from_reader(r)?.into(),
            RelayCmd::RENDEZVOUS_ESTABLISHED => {
                RendezvousEstablished::decode_from_reader(r)?.into()
            }
            RelayCmd::INTRODUCE1 => Introduce1::decode_from_reader(r)?.into(),
            RelayCmd::INTRODUCE_ACK => IntroduceAck::decode_from_reader(r)?.into(),
            RelayCmd::RENDEZVOUS2 => Rendezvous2::decode_from_reader(r)?.into(),
            _ => Unrecognized::decode_with_cmd(cmd, r)?.into(),
        })
    }
}

bitflags! {
    /// A set of recognized flags that can be attached to a begin cell.
    ///
    /// For historical reasons, these flags are constructed so that 0
    /// is a reasonable default for all of them.
    #[derive(Clone, Copy, Debug)]
    pub struct BeginFlags : u32 {
        /// The client would accept a connection to an IPv6 address.
        const IPV6_OKAY = (1<<0);
        /// The client would not accept a connection to an IPv4 address.
        const IPV4_NOT_OKAY = (1<<1);
        /// The client would rather have a connection to an IPv6 address.
        const IPV6_PREFERRED = (1<<2);
    }
}
impl From<u32> for BeginFlags {
    fn from(v: u32) -> Self {
        BeginFlags::from_bits_truncate(v)
    }
}

/// A Begin message creates a new data stream.
///
/// Upon receiving a Begin message, relays should try to open a new
/// stream for the client, if their exit policy permits, and associate
/// it with a new TCP connection to the target address.
///
/// If the exit decides to reject the Begin message, or if the TCP
/// connection fails, the exit should send an End message.
///
/// Clients should reject these messages.
#[derive(Debug, Clone)]
pub struct Begin {
    /// Ascii string describing target address
    addr: Vec<u8>,
    /// Target port
    port: u16,
    /// Flags that describe how to resolve the address
    flags: BeginFlags,
}

impl Begin {
    /// Construct a new Begin cell
    pub fn new<F>(addr: &str, port: u16, flags: F) -> crate::Result<Self>
    where
        F: Into<BeginFlags>,
    {
        if !addr.is_ascii() {
            return Err(crate::Error::BadStreamAddress);
        }
        let mut addr = addr.to_string();
        addr.make_ascii_lowercase();
        Ok(Begin {
            addr: addr.into_bytes(),
            port,
            flags: flags.into(),
        })
    }

    /// Return the address requested in this message.
    pub fn addr(&self) -> &[u8] {
        &self.addr[..]
    }

    /// Return the port requested by this message.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the set of flags provided in this message.
    pub fn flags(&self) -> BeginFlags {
        self.flags
    }
}

impl Body for Begin {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let addr = {
            if r.peek(1)? == b"[" {
                // IPv6 address
                r.advance(1)?;
                let a = r.take_until(b']')?;
                let colon = r.take_u8()?;
                if colon != b':' {
                    return Err(Error::InvalidMessage("missing port in begin cell".into()));
                }
                a
            } else {
                // IPv4 address, or hostname.
                r.take_until(b':')?
            }
        };
        let port = r.take_until(0)?;
        let flags = if r.remaining() >= 4 { r.take_u32()? } else { 0 };

        if !addr.is_ascii() {
            return Err(Error::InvalidMessage(
                "target address in begin cell not ascii".into(),
            ));
        }

        let port = std::str::from_utf8(port)
            .map_err(|_| Error::InvalidMessage("port in begin cell not utf8".into()))?;

        let port = port
            .parse()
            .map_err(|_| Error::InvalidMessage("port in begin cell not a valid port".into()))?;

        Ok(Begin {
            addr: addr.into(),
            port,
            flags: flags.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        if self.addr.contains(&b':') {
            w.write_u8(b'[');
            w.write_all(&self.addr[..]);
            w.write_u8(b']');
        } else {
            w.write_all(&self.addr[..]);
        }
        w.write_u8(b':');
        w.write_all(self.port.to_string().as_bytes());
        w.write_u8(0);
        if self.flags.bits() != 0 {
            w.write_u32(self.flags.bits());
        }
        Ok(())
    }
}

/// A Data message represents data sent along a stream.
///
/// Upon receiving a Data message for a live stream, the client or
/// exit sends that data onto the associated TCP connection.
///
/// These messages hold between 1 and [Data::MAXLEN] bytes of data
/// each; they are the most numerous messages on the network.
#[derive(Debug, Clone)]
pub struct Data {
    /// Contents of the cell, to be sent on a specific stream
    ///
    /// INVARIANT: Holds between 1 and [`Data::MAXLEN`] bytes,
    /// inclusive.
    body: Vec<u8>,
}
impl Data {
    /// The longest allowable body length for a single data cell.
    ///
    /// Relay command (1) + 'Recognized' (2) + StreamID (2) +
    /// Digest (4) + Length (2) = 11.
    pub const MAXLEN: usize = CELL_DATA_LEN - 11;

    /// Construct a new data cell.
    ///
    /// Returns an error if `inp` is longer than [`Data::MAXLEN`]
    /// bytes, or if it is empty.
    pub fn new(inp: &[u8]) -> crate::Result<Self> {
        if inp.len() > Data::MAXLEN {
            return Err(crate::Error::CantEncode("Data message too long"));
        }
        if inp.is_empty() {
            return Err(crate::Error::CantEncode("Empty data message"));
        }
        Ok(Self::new_unchecked(inp.into()))
    }

    /// Construct a new data cell, taking as many bytes from `inp` as
    /// possible.
    ///
    /// Return the data cell, and a slice holding any bytes that
    /// wouldn't fit (if any).
    ///
    /// Returns None if the input was empty.
    pub fn try_split_from(inp: &[u8]) -> Option<(Self, &[u8])> {
        if inp.is_empty() {
            return None;
        }
        let len = std::cmp::min(inp.len(), Data::MAXLEN);
        let (data, remainder) = inp.split_at(len);
        Some((Self::new_unchecked(data.into()), remainder))
    }

    /// Construct a new data cell from a provided vector of bytes.
    ///
    /// The vector _must_ not have more than [`Data::MAXLEN`] bytes,
    /// and must not be empty.
    fn new_unchecked(body: Vec<u8>) -> Self {
        debug_assert!((1..=Data::MAXLEN).contains(&body.len()));
        Data { body }
    }
}
impl From<Data> for Vec<u8> {
    fn from(data: Data) -> Vec<u8> {
        data.body
    }
}
impl AsRef<[u8]> for Data {
    fn as_ref(&self) -> &[u8] {
        &self.body[..]
    }
}

impl Body for Data {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() == 0 {
            return Err(Error::InvalidMessage("Empty DATA message".into()));
        }
        Ok(Data {
            body: r.take(r.remaining())?.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.body);
        Ok(())
    }
}

/// An End message tells the other end of the circuit to close a
/// stream.
#[derive(Debug, Clone)]
pub struct End {
    /// Reason for closing the stream
    reason: EndReason,
    /// If the reason is EXITPOLICY, this holds the resolved address
    /// and an associated TTL.  The TTL is set to MAX if none was
    /// given.
    addr: Option<(IpAddr, u32)>,
}

caret_int! {
    /// A declared reason for closing a stream
    pub struct EndReason(u8) {
        /// Closing a stream because of an unspecified reason.
        ///
        /// This is the only END reason that clients send.
        MISC = 1,
        /// Couldn't look up hostname.
        RESOLVEFAILED = 2,
        /// Remote host refused connection.
        CONNECTREFUSED = 3,
        /// Closing a stream because of an exit-policy violation.
        EXITPOLICY = 4,
        /// Circuit destroyed
        DESTROY = 5,
        /// Anonymized TCP connection was closed
        DONE = 6,
        /// Connection timed out, or relay timed out while connecting
        TIMEOUT = 7,
        /// No route to target destination.
        NOROUTE = 8,
        /// Relay is entering hibernation and not handling requests
        HIBERNATING = 9,
        /// Internal error at the relay
        INTERNAL = 10,
        /// Ran out of resources to fulfill requests
        RESOURCELIMIT = 11,
        /// Connection unexpectedly reset
        CONNRESET = 12,
        /// Onion-routing protocol violation
        TORPROTOCOL = 13,
        /// BEGIN_DIR cell at a non-directory-cache.
        NOTDIRECTORY = 14,
    }
}

impl or_error::HasKind for EndReason {
    fn kind(&self) -> or_error::ErrorKind {
        use or_error::ErrorKind as EK;
        use EndReason as E;
        match *self {
            E::MISC => EK::RemoteStreamError,
            E::RESOLVEFAILED => EK::RemoteHostResolutionFailed,
            E::CONNECTREFUSED => EK::RemoteConnectionRefused,
            E::EXITPOLICY => EK::ExitPolicyRejected,
            E::DESTROY => EK::CircuitCollapse,
            E::DONE => EK::RemoteStreamClosed,
            E::TIMEOUT => EK::RemoteNetworkFailed,
            E::NOROUTE => EK::RemoteNetworkFailed,
            E::RESOURCELIMIT | E::HIBERNATING => EK::RelayTooBusy,
            E::INTERNAL | E::TORPROTOCOL | E::NOTDIRECTORY => EK::ProtocolViolation,
            E::CONNRESET => EK::RemoteStreamReset,
            _ => EK::RemoteStreamError,
        }
    }
}

impl End {
    /// Make a new END_REASON_MISC message.
    ///
    /// Clients send this every time they decide to close a stream.
    pub fn new_misc() -> Self {
        End {
            reason: EndReason::MISC,
            addr: None,
        }
    }
    /// Make a new END message with the provided end reason.
    pub fn new_with_reason(reason: EndReason) -> Self {
        End { reason, addr: None }
    }
    /// Make a new END message with END_REASON_EXITPOLICY, and the
    /// provided address and ttl.
    pub fn new_exitpolicy(addr: IpAddr, ttl: u32) -> Self {
        End {
            reason: EndReason::EXITPOLICY,
            addr: Some((addr, ttl)),
        }
    }
    /// Return the provided EndReason for this End cell.
    pub fn reason(&self) -> EndReason {
        self.reason
    }
}
impl Body for End {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() == 0 {
            return Ok(End {
                reason: EndReason::MISC,
                addr: None,
            });
        }
        let reason = r.take_u8()?.into();
        if reason == EndReason::EXITPOLICY {
            let addr = match r.remaining() {
                4 | 8 => IpAddr::V4(r.extract()?),
                16 | 20 => IpAddr::V6(r.extract()?),
                _ => {
                    // Ignores other message lengths.
                    return Ok(End { reason, addr: None });
                }
            };
            let ttl = if r.remaining() == 4 {
                r.take_u32()?
            } else {
                u32::MAX
            };
            Ok(End {
                reason,
                addr: Some((addr, ttl)),
            })
        } else {
            Ok(End { reason, addr: None })
        }
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.reason.into());
        if let (EndReason::EXITPOLICY, Some((addr, ttl))) = (self.reason, self.addr) {
            match addr {
                IpAddr::V4(v4) => w.write(&v4)?,
                IpAddr::V6(v6) => w.write(&v6)?,
            }
            w.write_u32(ttl);
        }
        Ok(())
    }
}

impl From<EndReason> for std::io::ErrorKind {
    fn from(e: EndReason) -> Self {
        use std::io::ErrorKind::*;
        match e {
            EndReason::RESOLVEFAILED => NotFound,
            EndReason::CONNECTREFUSED => ConnectionRefused,
            EndReason::EXITPOLICY => ConnectionRefused,
            EndReason::DESTROY => ConnectionAborted,
            EndReason::DONE => UnexpectedEof,
            EndReason::TIMEOUT => TimedOut,
            EndReason::HIBERNATING => ConnectionRefused,
            EndReason::RESOURCELIMIT => ConnectionRefused,
            EndReason::CONNRESET => ConnectionReset,
            EndReason::TORPROTOCOL => InvalidData,
            EndReason::NOTDIRECTORY => ConnectionRefused,
            EndReason::INTERNAL | EndReason::NOROUTE | EndReason::MISC => Other,
            _ => Other,
        }
    }
}

/// A Connected message is a successful response to a Begin message
///
/// When an outgoing connection succeeds, the exit sends a Connected
/// back to the client.
///
/// Clients never send Connected messages.
#[derive(Debug, Clone)]
pub struct Connected {
    /// Resolved address and TTL (time to live) in seconds
    addr: Option<(IpAddr, u32)>,
}
impl Connected {
    /// Construct a new empty connected cell.
    pub fn new_empty() -> Self {
        Connected { addr: None }
    }
    /// Construct a connected cell with an address and a time-to-live
    /// value.
    pub fn new_with_addr(addr: IpAddr, ttl: u32) -> Self {
        Connected {
            addr: Some((addr, ttl)),
        }
    }
    /// Return the address and TTL reported in this message, if any.
    pub fn addr(&self) -> Option<(IpAddr, u32)> {
        self.addr
    }
}
impl Body for Connected {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() == 0 {
            return Ok(Connected { addr: None });
        }
        let ipv4 = r.take_u32()?;
        let addr = if ipv4 == 0 {
            if r.take_u8()? != 6 {
                return Err(Error::InvalidMessage(
                    "Invalid address type in CONNECTED cell".into(),
                ));
            }
            IpAddr::V6(r.extract()?)
        } else {
            IpAddr::V4(ipv4.into())
        };
        let ttl = r.take_u32()?;

        Ok(Connected {
            addr: Some((addr, ttl)),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        if let Some((addr, ttl)) = self.addr {
            match addr {
                IpAddr::V4(v4) => w.write(&v4)?,
                IpAddr::V6(v6) => {
                    w.write_u32(0);
                    w.write_u8(6);
                    w.write(&v6)?;
                }
            }
            w.write_u32(ttl);
        }
        Ok(())
    }
}

/// A Sendme message is used to increase flow-control windows.
///
/// To avoid congestion, each circuit and stream keeps track of a
/// number of data cells that it is willing to send.  It decrements
/// these numbers every time it sends a cell.  If these numbers reach
/// zero, then no more cells can be sent on the stream or circuit.
///
/// The only way to re-increment these numbers is by receiving a
/// Sendme cell from the other end of the circuit or stream.
///
/// In the protocol versions we implement, Sendme messages have an
/// empty body.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Sendme {}
impl Sendme {
    /// Return a new empty sendme cell
    pub fn new_empty() -> Self {
        Sendme {}
    }
}
impl Body for Sendme {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        // Tolerate (and ignore) a nonempty body, for compatibility
        // with future versions that authenticate sendmes.
        let _ = r.take_rest();
        Ok(Sendme {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// Extend tells the last relay in a circuit to extend to a new hop.
///
/// This format only handles IPv4 addresses, RSA identities, and the
/// TAP handshake, which is what the protocol era we implement uses.
///
/// When a relay (call it R) receives an Extend message, it tries to
/// find (or make) a channel to the other relay (R') described by the
/// address and identity fingerprint.  Once R has such a channel, it
/// packages the client's handshake data as a new Create message to
/// R'.  If R' replies with a Created (success) message, R packages
/// that message's contents in an Extended message.
#[derive(Debug, Clone)]
pub struct Extend {
    /// Where to extend to (address)
    addr: Ipv4Addr,
    /// Where to extend to (port)
    port: u16,
    /// A TAP handshake to send
    handshake: Vec<u8>,
    /// The RSA identity of the target relay
    rsaid: RsaIdentity,
}
impl Extend {
    /// Construct a new Extend message.
    pub fn new(addr: Ipv4Addr, port: u16, handshake: Vec<u8>, rsaid: RsaIdentity) -> Self {
        Extend {
            addr,
            port,
            handshake,
            rsaid,
        }
    }

    /// Return the address of the target relay.
    pub fn addr(&self) -> &Ipv4Addr {
        &self.addr
    }

    /// Return the port of the target relay.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the handshake to be sent in a CREATE cell.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }

    /// Return the RSA identity of the target relay.
    pub fn rsaid(&self) -> &RsaIdentity {
        &self.rsaid
    }
}
impl Body for Extend {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let addr = r.extract()?;
        let port = r.take_u16()?;
        let handshake = r.take(TAP_C_HANDSHAKE_LEN)?.into();
        let rsaid = RsaIdentity::from_bytes(r.take(20)?)
            .ok_or_else(|| Error::InvalidMessage("bad RSA identity in EXTEND cell".into()))?;
        Ok(Extend {
            addr,
            port,
            handshake,
            rsaid,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write(&self.addr)?;
        w.write_u16(self.port);
        w.write_all(&self.handshake[..]);
        w.write_all(self.rsaid.as_bytes());
        Ok(())
    }
}

/// Extended is a successful reply to an Extend message.
#[derive(Debug, Clone)]
pub struct Extended {
    /// Contents of the handshake sent in response to the EXTEND
    handshake: Vec<u8>,
}
impl Extended {
    /// Construct a new Extended message with the provided handshake
    pub fn new(handshake: Vec<u8>) -> Self {
        Extended { handshake }
    }
    /// Consume this extended message, and return a vector of its
    /// handshake data.
    pub fn into_body(self) -> Vec<u8> {
        self.handshake
    }
}
impl Body for Extended {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let handshake = r.take(TAP_S_HANDSHAKE_LEN)?.into();
        Ok(Extended { handshake })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A Truncate message tells the relays in a circuit to shut down
/// every relay on the circuit after the one that received the
/// message.
///
/// Clients may send Truncate messages; nobody else does.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Truncate {}
impl Truncate {
    /// Construct a new truncate message.
    pub fn new() -> Self {
        Self::default()
    }
}
impl Body for Truncate {
    fn decode_from_reader(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(Truncate {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// A Truncated message tells the client that the remainder of the
/// circuit has been shut down.
#[derive(Debug, Clone)]
pub struct Truncated {
    /// Reason for which this circuit was truncated.
    reason: DestroyReason,
}
impl Truncated {
    /// Construct a new truncated message.
    pub fn new(reason: DestroyReason) -> Self {
        Truncated { reason }
    }
    /// Get the provided reason to truncate the circuit.
    pub fn reason(self) -> DestroyReason {
        self.reason
    }
}
impl Body for Truncated {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Truncated {
            reason: r.take_u8()?.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.reason.into());
        Ok(())
    }
}

/// A Drop message is a longer-range padding message.
///
/// Relays ignore it, but it counts against the circuit's windows the
/// same as any other relay message.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Drop {}
impl Drop {
    /// Construct a new drop message.
    pub fn new() -> Self {
        Self::default()
    }
}
impl Body for Drop {
    fn decode_from_reader(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(Drop {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// A Resolve message launches a DNS lookup stream.
///
/// A client sends a Resolve message when it wants to perform a DNS
/// lookup _without_ connecting to the resulting address.  On success
/// the exit responds with a Resolved message; on failure it responds
/// with an End message.
#[derive(Debug, Clone)]
pub struct Resolve {
    /// Ascii string describing the hostname to look up.
    query: Vec<u8>,
}
impl Resolve {
    /// Construct a new resolve message to look up a hostname.
    pub fn new(s: &str) -> Self {
        Resolve {
            query: s.as_bytes().into(),
        }
    }
    /// Construct a new resolve message to do a reverse lookup on an
    /// address.
    pub fn new_reverse(addr: &IpAddr) -> Self {
        let query = match addr {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
            }
            IpAddr::V6(v6) => {
                let mut s = String::with_capacity(72);
                for o in v6.octets().iter().rev() {
                    s.push_str(&format!("{:x}.{:x}.", o & 0xf, o >> 4));
                }
                s.push_str("ip6.arpa");
                s
            }
        };
        Resolve {
            query: query.into_bytes(),
        }
    }
    /// Return the query contained in this message.
    pub fn query(&self) -> &[u8] {
        &self.query[..]
    }
}
impl Body for Resolve {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let query = r.take_until(0)?;
        Ok(Resolve {
            query: query.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.query[..]);
        w.write_u8(0);
        Ok(())
    }
}

/// Possible response to a DNS lookup
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ResolvedVal {
    /// We found an IP address
    Ip(IpAddr),
    /// We found a hostname
    Hostname(Vec<u8>),
    /// Error; try again
    TransientError,
    /// Error; don't try again
    NontransientError,
    /// A DNS lookup response that we didn't recognize
    Unrecognized(u8, Vec<u8>),
}

/// Indicates a hostname response
const RES_HOSTNAME: u8 = 0;
/// Indicates an IPv4 response
const RES_IPV4: u8 = 4;
/// Indicates an IPv6 response
const RES_IPV6: u8 = 6;
/// Transient error (okay to try again)
const RES_ERR_TRANSIENT: u8 = 0xF0;
/// Non-transient error (don't try again)
const RES_ERR_NONTRANSIENT: u8 = 0xF1;

impl Readable for ResolvedVal {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        /// Helper: return the expected length of a resolved answer with
        /// a given type, if there is a particular expected length.
        fn res_len(tp: u8) -> Option<usize> {
            match tp {
                RES_IPV4 => Some(4),
                RES_IPV6 => Some(16),
                _ => None,
            }
        }
        let tp = r.take_u8()?;
        let len = r.take_u8()? as usize;
        if let Some(expected_len) = res_len(tp) {
            if len != expected_len {
                return Err(Error::InvalidMessage(
                    "Wrong length for RESOLVED answer".into(),
                ));
            }
        }
        Ok(match tp {
            RES_HOSTNAME => Self::Hostname(r.take(len)?.into()),
            RES_IPV4 => Self::Ip(IpAddr::V4(r.extract()?)),
            RES_IPV6 => Self::Ip(IpAddr::V6(r.extract()?)),
            RES_ERR_TRANSIENT => {
                r.advance(len)?;
                Self::TransientError
            }
            RES_ERR_NONTRANSIENT => {
                r.advance(len)?;
                Self::NontransientError
            }
            _ => Self::Unrecognized(tp, r.take(len)?.into()),
        })
    }
}

impl Writeable for ResolvedVal {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> EncodeResult<()> {
        match self {
            Self::Hostname(h) => {
                w.write_u8(RES_HOSTNAME);
                let h_len = h
                    .len()
                    .try_into()
                    .map_err(|_| EncodeError::BadLengthValue)?;
                w.write_u8(h_len);
                w.write_all(&h[..]);
            }
            Self::Ip(IpAddr::V4(a)) => {
                w.write_u8(RES_IPV4);
                w.write_u8(4); // length
                w.write_all(&a.octets()[..]);
            }
            Self::Ip(IpAddr::V6(a)) => {
                w.write_u8(RES_IPV6);
                w.write_u8(16); // length
                w.write_all(&a.octets()[..]);
            }
            Self::TransientError => {
                w.write_u8(RES_ERR_TRANSIENT);
                w.write_u8(0); // length
            }
            Self::NontransientError => {
                w.write_u8(RES_ERR_NONTRANSIENT);
                w.write_u8(0); // length
            }
            Self::Unrecognized(tp, v) => {
                w.write_u8(*tp);
                let v_len = v
                    .len()
                    .try_into()
                    .map_err(|_| EncodeError::BadLengthValue)?;
                w.write_u8(v_len);
                w.write_all(&v[..]);
            }
        }
        Ok(())
    }
}

/// A Resolved message is a successful response to a Resolve message.
///
/// The Resolved message contains a list of zero or more addresses,
/// and their associated times-to-live in seconds.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Resolved {
    /// List of addresses and their associated time-to-live values.
    answers: Vec<(ResolvedVal, u32)>,
}
impl Resolved {
    /// Return a new empty Resolved object with no answers.
    pub fn new_empty() -> Self {
        Self::default()
    }
    /// Return a new Resolved object reporting a name lookup error.
    pub fn new_err(transient: bool, ttl: u32) -> Self {
        let mut res = Self::new_empty();
        let err = if transient {
            ResolvedVal::TransientError
        } else {
            ResolvedVal::NontransientError
        };
        res.add_answer(err, ttl);
        res
    }
    /// Add a single answer to this Resolved message
    pub fn add_answer(&mut self, answer: ResolvedVal, ttl: u32) {
        self.answers.push((answer, ttl));
    }

    /// Consume this Resolved message, returning a vector of the
    /// answers and TTL values that it contains.
    ///
    /// Note that actually relying on these TTL values can be
    /// dangerous in practice, since the relay that sent the cell
    /// could be lying in order to cause more lookups, or to get a
    /// false answer cached for longer.
    pub fn into_answers(self) -> Vec<(ResolvedVal, u32)> {
        self.answers
    }
}
impl Body for Resolved {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let mut answers = Vec::new();
        while r.remaining() > 0 {
            let rv = r.extract()?;
            let ttl = r.take_u32()?;
            answers.push((rv, ttl));
        }
        Ok(Resolved { answers })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        for (rv, ttl) in &self.answers {
            w.write(rv)?;
            w.write_u32(*ttl);
        }
        Ok(())
    }
}

/// A BeginDir message creates a stream to the directory service of
/// the relay that receives it.
///
/// These streams carry HTTP directory requests, and are permitted
/// even on one-hop circuits.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct BeginDir {}
impl BeginDir {
    /// Construct a new BeginDir message.
    pub fn new() -> Self {
        Self::default()
    }
}
impl Body for BeginDir {
    fn decode_from_reader(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(BeginDir {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> EncodeResult<()> {
        Ok(())
    }
}

/// An unrecognized relay message.
#[derive(Debug, Clone)]
pub struct Unrecognized {
    /// Command that we didn't recognize
    cmd: RelayCmd,
    /// Body associated with that command
    body: Vec<u8>,
}

impl Unrecognized {
    /// Create a new 'unrecognized' cell.
    pub fn new<B>(cmd: RelayCmd, body: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        let body = body.into();
        Unrecognized { cmd, body }
    }

    /// Return the command associated with this message
    pub fn cmd(&self) -> RelayCmd {
        self.cmd
    }

    /// Decode this message, using a provided command.
    pub fn decode_with_cmd(cmd: RelayCmd, r: &mut Reader<'_>) -> Result<Self> {
        let mut r = Unrecognized::decode_from_reader(r)?;
        r.cmd = cmd;
        Ok(r)
    }
}

impl Body for Unrecognized {
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Unrecognized {
            cmd: 0.into(),
            body: r.take(r.remaining())?.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.body[..]);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    /// Helper: encode a message and return the bytes.
    fn encode<M: Body>(m: M) -> Vec<u8> {
        let mut v = Vec::new();
        m.encode_onto(&mut v).unwrap();
        v
    }

    /// Helper: decode a message body from bytes.
    fn decode<M: Body>(body: &[u8]) -> Result<M> {
        let mut r = Reader::from_slice(body);
        M::decode_from_reader(&mut r)
    }

    #[test]
    fn begin_encoding() {
        let b = Begin::new("www.example.com", 80, 0).unwrap();
        assert_eq!(encode(b), &b"www.example.com:80\0"[..]);

        // hostnames are lowercased.
        let b = Begin::new("WWW.EXAMPLE.COM", 443, BeginFlags::IPV6_OKAY).unwrap();
        assert_eq!(encode(b), &b"www.example.com:443\0\0\0\0\x01"[..]);

        // ipv6 literals get brackets.
        let b = Begin::new("::1", 22, 0).unwrap();
        assert_eq!(encode(b), &b"[::1]:22\0"[..]);

        // non-ascii is rejected.
        assert!(Begin::new("çà.example.com", 80, 0).is_err());
    }

    #[test]
    fn begin_decoding() {
        let b: Begin = decode(&b"www.example.com:80\0"[..]).unwrap();
        assert_eq!(b.addr(), b"www.example.com");
        assert_eq!(b.port(), 80);

        let b: Begin = decode(&b"[::1]:22\0"[..]).unwrap();
        assert_eq!(b.addr(), b"::1");
        assert_eq!(b.port(), 22);

        // Missing the NUL after the port: invalid.
        assert!(decode::<Begin>(&b"www.example.com:80"[..]).is_err());
        // Bad port.
        assert!(decode::<Begin>(&b"www.example.com:80000\0"[..]).is_err());
    }

    #[test]
    fn data_limits() {
        assert!(Data::new(&[0; Data::MAXLEN]).is_ok());
        assert!(Data::new(&[0; Data::MAXLEN + 1]).is_err());
        assert!(Data::new(&[]).is_err());

        let (d, rest) = Data::try_split_from(&[5; 1000]).unwrap();
        assert_eq!(d.as_ref().len(), Data::MAXLEN);
        assert_eq!(rest.len(), 1000 - Data::MAXLEN);

        assert!(Data::try_split_from(&[]).is_none());
    }

    #[test]
    fn end_roundtrip() {
        let e = End::new_misc();
        assert_eq!(encode(e), [1]);

        let e = End::new_with_reason(EndReason::EXITPOLICY);
        assert_eq!(encode(e), [4]);

        let e = End::new_exitpolicy("127.0.0.5".parse().unwrap(), 17);
        assert_eq!(encode(e), hex!("04 7f000005 00000011"));

        let e: End = decode(&hex!("04 7f000005 00000011")).unwrap();
        assert_eq!(e.reason(), EndReason::EXITPOLICY);

        // An empty END is treated as MISC.
        let e: End = decode(&[]).unwrap();
        assert_eq!(e.reason(), EndReason::MISC);
    }

    #[test]
    fn extend_roundtrip() {
        let rsaid = RsaIdentity::from([7; 20]);
        let hs = vec![9; TAP_C_HANDSHAKE_LEN];
        let e = Extend::new("127.0.0.1".parse().unwrap(), 9001, hs.clone(), rsaid);
        let body = encode(e);
        assert_eq!(body.len(), 4 + 2 + TAP_C_HANDSHAKE_LEN + 20);
        assert_eq!(&body[..6], &hex!("7f000001 2329"));

        let e: Extend = decode(&body).unwrap();
        assert_eq!(e.port(), 9001);
        assert_eq!(e.handshake(), &hs[..]);
        assert_eq!(e.rsaid(), &rsaid);
    }

    #[test]
    fn extended_roundtrip() {
        let hs = vec![3; TAP_S_HANDSHAKE_LEN];
        let e = Extended::new(hs.clone());
        let body = encode(e);
        let e: Extended = decode(&body).unwrap();
        assert_eq!(e.into_body(), hs);

        // Too-short EXTENDED is rejected.
        assert!(decode::<Extended>(&body[..100]).is_err());
    }

    #[test]
    fn resolve_reverse() {
        let r = Resolve::new_reverse(&"127.0.0.1".parse().unwrap());
        assert_eq!(r.query(), b"1.0.0.127.in-addr.arpa");
        let body = encode(r);
        let r: Resolve = decode(&body).unwrap();
        assert_eq!(r.query(), b"1.0.0.127.in-addr.arpa");
    }

    #[test]
    fn resolved_roundtrip() {
        let mut res = Resolved::new_empty();
        res.add_answer(ResolvedVal::Ip("127.0.0.2".parse().unwrap()), 3600);
        res.add_answer(ResolvedVal::Hostname(b"www.torproject.org".to_vec()), 100);

        let body = encode(res);
        let res: Resolved = decode(&body).unwrap();
        let answers = res.into_answers();
        assert_eq!(answers.len(), 2);
        assert_eq!(
            answers[0],
            (ResolvedVal::Ip("127.0.0.2".parse().unwrap()), 3600)
        );

        // Error responses.
        let res = Resolved::new_err(true, 30);
        let body = encode(res);
        let res: Resolved = decode(&body).unwrap();
        assert_eq!(res.into_answers(), vec![(ResolvedVal::TransientError, 30)]);
    }

    #[test]
    fn connected_decoding() {
        let c: Connected = decode(&[]).unwrap();
        assert!(c.addr().is_none());

        let c: Connected = decode(&hex!("7f000001 00000e10")).unwrap();
        assert_eq!(c.addr(), Some(("127.0.0.1".parse().unwrap(), 3600)));

        // An IPv6 connected cell.
        let c: Connected =
            decode(&hex!("00000000 06 00000000000000000000000000000001 00000e10")).unwrap();
        assert_eq!(c.addr(), Some(("::1".parse().unwrap(), 3600)));
    }

    #[test]
    fn truncated() {
        let t: Truncated = decode(&[8]).unwrap();
        assert_eq!(t.reason(), DestroyReason::CHANNEL_CLOSED);
    }
}
