//! Implementation for parsing and encoding relay cells

use std::num::NonZeroU16;

use crate::chancell::{BoxedCellBody, CELL_DATA_LEN};
use or_bytes::{EncodeResult, Error, Result};
use or_bytes::{Reader, Writer};

use caret::caret_int;
use rand::{CryptoRng, Rng};

pub mod hs;
pub mod msg;

caret_int! {
    /// A command that identifies the type of a relay cell
    pub struct RelayCmd(u8) {
        /// Start a new stream
        BEGIN = 1,
        /// Data on a stream
        DATA = 2,
        /// Close a stream
        END = 3,
        /// Acknowledge a BEGIN; stream is open
        CONNECTED = 4,
        /// Used for flow control
        SENDME = 5,
        /// Extend a circuit to a new hop
        EXTEND = 6,
        /// Reply to an EXTEND handshake
        EXTENDED = 7,
        /// Partially close a circuit
        TRUNCATE = 8,
        /// Circuit has been partially closed
        TRUNCATED = 9,
        /// Padding cell
        DROP = 10,
        /// Start a DNS lookup
        RESOLVE = 11,
        /// Reply to a DNS lookup
        RESOLVED = 12,
        /// Start a directory stream
        BEGIN_DIR = 13,

        /// HS: establish an introduction point.
        ESTABLISH_INTRO = 32,
        /// HS: establish a rendezvous point.
        ESTABLISH_RENDEZVOUS = 33,
        /// HS: send introduction (client to introduction point)
        INTRODUCE1 = 34,
        /// HS: send introduction (introduction point to service)
        INTRODUCE2 = 35,
        /// HS: connect rendezvous point (service to rendezvous point)
        RENDEZVOUS1 = 36,
        /// HS: connect rendezvous point (rendezvous point to client)
        RENDEZVOUS2 = 37,
        /// HS: Response to ESTABLISH_INTRO
        INTRO_ESTABLISHED = 38,
        /// HS: Response to ESTABLISH_RENDEZVOUS
        RENDEZVOUS_ESTABLISHED = 39,
        /// HS: Response to INTRODUCE1 from introduction point to client
        INTRODUCE_ACK = 40,
    }
}

/// Possible requirements on stream IDs for a relay command.
enum StreamIdReq {
    /// Can only be used with a stream ID of 0
    WantNone,
    /// Can only be used with a stream ID that isn't 0
    WantSome,
    /// Unrecognized; might be used with a stream ID or without.
    Unrecognized,
}

impl RelayCmd {
    /// Check whether this command requires a certain kind of
    /// StreamId, and return a corresponding StreamIdReq.
    fn expects_streamid(self) -> StreamIdReq {
        match self {
            RelayCmd::BEGIN
            | RelayCmd::DATA
            | RelayCmd::END
            | RelayCmd::CONNECTED
            | RelayCmd::RESOLVE
            | RelayCmd::RESOLVED
            | RelayCmd::BEGIN_DIR => StreamIdReq::WantSome,
            RelayCmd::EXTEND
            | RelayCmd::EXTENDED
            | RelayCmd::TRUNCATE
            | RelayCmd::TRUNCATED
            | RelayCmd::DROP
            | RelayCmd::ESTABLISH_INTRO
            | RelayCmd::ESTABLISH_RENDEZVOUS
            | RelayCmd::INTRODUCE1
            | RelayCmd::INTRODUCE2
            | RelayCmd::RENDEZVOUS1
            | RelayCmd::RENDEZVOUS2
            | RelayCmd::INTRO_ESTABLISHED
            | RelayCmd::RENDEZVOUS_ESTABLISHED
            | RelayCmd::INTRODUCE_ACK => StreamIdReq::WantNone,
            // NOTE: stream-level SENDME cells have a stream ID, and
            // circuit-level ones don't, so we can't say anything here.
            RelayCmd::SENDME => StreamIdReq::Unrecognized,
            _ => StreamIdReq::Unrecognized,
        }
    }
    /// Return true if this command is one that accepts the particular
    /// stream ID `id`.
    pub fn accepts_streamid_val(self, id: Option<StreamId>) -> bool {
        match self.expects_streamid() {
            StreamIdReq::WantNone => id.is_none(),
            StreamIdReq::WantSome => id.is_some(),
            StreamIdReq::Unrecognized => true,
        }
    }
}

/// Identify a single stream on a circuit.
///
/// These identifiers are local to each hop on a circuit.  This can't
/// be zero; if you need something that can be zero in the protocol,
/// use `Option<StreamId>`.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct StreamId(NonZeroU16);

impl From<NonZeroU16> for StreamId {
    fn from(id: NonZeroU16) -> Self {
        Self(id)
    }
}

impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0.get()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

impl StreamId {
    /// Creates a `StreamId` for non-zero `stream_id`.
    ///
    /// Returns `None` when `stream_id` is zero. Messages with a
    /// zero/None stream ID apply to the circuit as a whole instead of
    /// a particular stream.
    pub fn new(stream_id: u16) -> Option<Self> {
        NonZeroU16::new(stream_id).map(Self)
    }

    /// Convenience function to convert to a `u16`; `None` is mapped
    /// to 0.
    pub fn get_or_zero(stream_id: Option<Self>) -> u16 {
        match stream_id {
            Some(stream_id) => stream_id.0.get(),
            None => 0,
        }
    }
}

/// Trait implemented by anything that can serve as a relay message.
pub trait RelayMsg {
    /// Return the [`RelayCmd`] for this message.
    fn cmd(&self) -> RelayCmd;
    /// Encode the body of this message (not including command or
    /// header) onto a writer.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>
    where
        Self: Sized;
    /// Extract the body of a message with command `cmd` from reader
    /// `r`.
    fn decode_from_reader(cmd: RelayCmd, r: &mut Reader<'_>) -> Result<Self>
    where
        Self: Sized;
}

/// A decoded and parsed relay message of unrestricted type.
pub type AnyRelayCell = RelayCell<msg::AnyRelayMsg>;

/// A parsed relay cell: a message that can be sent along a circuit,
/// targeted at a particular hop.
#[derive(Debug)]
pub struct RelayCell<M> {
    /// The stream ID for the stream that this cell corresponds to.
    streamid: Option<StreamId>,
    /// The message for this cell.
    msg: M,
}

/// Position of the stream ID within the cell body.
const STREAM_ID_OFFSET: usize = 3;
/// Position of the 'recognized' field within the cell body.
const RECOGNIZED_OFFSET: usize = 1;
/// Position of the digest within the cell body.
const DIGEST_OFFSET: usize = 5;

impl<M: RelayMsg> RelayCell<M> {
    /// Construct a new relay cell.
    pub fn new(streamid: Option<StreamId>, msg: M) -> Self {
        RelayCell { streamid, msg }
    }
    /// Consume this cell and return its components.
    pub fn into_streamid_and_msg(self) -> (Option<StreamId>, M) {
        (self.streamid, self.msg)
    }
    /// Return the command for this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.msg.cmd()
    }
    /// Return the stream ID for the stream that this cell corresponds
    /// to.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.streamid
    }
    /// Return a reference to the message contained in this cell.
    pub fn msg(&self) -> &M {
        &self.msg
    }
    /// Consume this cell and return the message it contains.
    pub fn into_msg(self) -> M {
        self.msg
    }
    /// Consume this relay message and encode it as a 509-byte padded
    /// cell body.
    pub fn encode<R: Rng + CryptoRng>(self, rng: &mut R) -> crate::Result<BoxedCellBody> {
        /// We skip this much space before adding any random padding to
        /// the end of the cell: this keeps an all-zero digest-input
        /// prefix after the data, so that data length remains
        /// unambiguous.
        const MIN_SPACE_BEFORE_PADDING: usize = 4;

        let (mut body, enc_len) = self.encode_to_cell()?;
        debug_assert!(enc_len <= CELL_DATA_LEN);
        if enc_len < CELL_DATA_LEN - MIN_SPACE_BEFORE_PADDING {
            rng.fill(&mut body[enc_len + MIN_SPACE_BEFORE_PADDING..]);
        }

        Ok(body)
    }

    /// Consume a relay cell and return its contents, encoded for use
    /// in a RELAY cell (without appending random padding).  Return the
    /// body along with the number of bytes actually used.
    fn encode_to_cell(self) -> crate::Result<(BoxedCellBody, usize)> {
        // NOTE: This implementation is a bit optimized, since it
        // happens to every relay cell that we produce.
        let mut buf = Box::new([0_u8; CELL_DATA_LEN]);
        /// Wrapper to implement Writer over a fixed-size buffer.
        struct BufWriter<'a> {
            /// The buffer we are writing into.
            buf: &'a mut [u8; CELL_DATA_LEN],
            /// How much of the buffer is used so far.
            used: usize,
            /// Whether we have overflowed the buffer.
            overflow: bool,
        }
        impl<'a> Writer for BufWriter<'a> {
            fn write_all(&mut self, b: &[u8]) {
                if self.used + b.len() > CELL_DATA_LEN {
                    self.overflow = true;
                } else {
                    self.buf[self.used..self.used + b.len()].copy_from_slice(b);
                    self.used += b.len();
                }
            }
        }
        let mut w = BufWriter {
            buf: &mut buf,
            used: 0,
            overflow: false,
        };

        w.write_u8(self.msg.cmd().into());
        w.write_u16(0); // "recognized"
        w.write_u16(StreamId::get_or_zero(self.streamid));
        w.write_u32(0); // Digest
        // Now, write the length field: we'll overwrite it with the
        // real length once the body is encoded.
        let len_pos = w.used;
        w.write_u16(0);
        let body_pos = w.used;
        self.msg
            .encode_onto(&mut w)
            .map_err(|e| crate::Error::EncodeErr("relay message", e))?;
        if w.overflow {
            return Err(crate::Error::CantEncode("relay message too long"));
        }
        let used = w.used;
        let payload_len = used - body_pos;
        debug_assert!(payload_len < u16::MAX as usize);
        buf[len_pos..len_pos + 2].copy_from_slice(&(payload_len as u16).to_be_bytes());
        Ok((buf, used))
    }

    /// Parse a RELAY cell body into a RelayCell.
    ///
    /// Requires that the cryptographic checks on the message have
    /// already been performed.
    pub fn decode(body: BoxedCellBody) -> crate::Result<Self> {
        let mut reader = Reader::from_slice(body.as_ref());
        RelayCell::decode_from_reader(&mut reader)
    }

    /// Parse a RELAY cell body into a RelayCell from a reader.
    ///
    /// Requires that the reader is set to the beginning of the cell
    /// body.
    fn decode_from_reader(r: &mut Reader<'_>) -> crate::Result<Self> {
        /// Wrap `be` as an appropriate type.
        fn wrap_err(be: Error) -> crate::Error {
            crate::Error::BytesErr {
                err: be,
                parsed: "relay cell",
            }
        }
        let cmd = r.take_u8().map_err(wrap_err)?.into();
        r.advance(2).map_err(wrap_err)?; // "recognized"
        let streamid = StreamId::new(r.take_u16().map_err(wrap_err)?);
        r.advance(4).map_err(wrap_err)?; // digest
        let len = r.take_u16().map_err(wrap_err)? as usize;
        if r.remaining() < len {
            return Err(crate::Error::BytesErr {
                err: Error::Truncated,
                parsed: "relay cell",
            });
        }
        r.truncate(len);
        let msg = M::decode_from_reader(cmd, r).map_err(wrap_err)?;
        if !cmd.accepts_streamid_val(streamid) {
            return Err(crate::Error::ChanProto(format!(
                "invalid stream ID {} for relay command {}",
                StreamId::get_or_zero(streamid),
                cmd
            )));
        }
        Ok(Self { streamid, msg })
    }
}

/// A relay cell that has not yet been fully parsed, but where we have
/// access to the command and stream ID, for dispatching purposes.
#[derive(Clone, Debug)]
pub struct UnparsedRelayCell {
    /// The body of the cell.
    body: BoxedCellBody,
}

impl UnparsedRelayCell {
    /// Wrap a BoxedCellBody as an UnparsedRelayCell.
    pub fn from_body(body: BoxedCellBody) -> Self {
        Self { body }
    }
    /// Return the command for this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.body[0].into()
    }
    /// Return the stream ID for the stream that this cell corresponds
    /// to.
    pub fn stream_id(&self) -> Option<StreamId> {
        let id = u16::from_be_bytes(
            self.body[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 2]
                .try_into()
                .expect("two-byte slice was not two bytes!?"),
        );
        StreamId::new(id)
    }
    /// Decode this unparsed cell into a given cell type.
    pub fn decode<M: RelayMsg>(self) -> crate::Result<RelayCell<M>> {
        RelayCell::decode(self.body)
    }
}

/// Ranges of the relay cell body that are reserved for cryptography.
///
/// (These are used by the relay-crypto code to find the fields it
/// must fill in and check.)
pub mod crypt {
    /// Byte range of the 'recognized' field.
    pub const RECOGNIZED_RANGE: std::ops::Range<usize> =
        super::RECOGNIZED_OFFSET..super::RECOGNIZED_OFFSET + 2;
    /// Byte range of the digest field.
    pub const DIGEST_RANGE: std::ops::Range<usize> =
        super::DIGEST_OFFSET..super::DIGEST_OFFSET + 4;
    /// An all-zero value to splice into the digest position while
    /// computing digests.
    pub const EMPTY_DIGEST: [u8; 4] = [0; 4];
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::relaycell::msg::AnyRelayMsg;
    use or_basic_utils::test_rng::testing_rng;

    #[test]
    fn streamid() {
        assert_eq!(StreamId::new(0), None);
        let id = StreamId::new(256).unwrap();
        assert_eq!(u16::from(id), 256);
        assert_eq!(id.to_string(), "256");
        assert_eq!(StreamId::get_or_zero(None), 0);
    }

    #[test]
    fn streamid_requirements() {
        let id = StreamId::new(77);
        assert!(RelayCmd::BEGIN.accepts_streamid_val(id));
        assert!(!RelayCmd::BEGIN.accepts_streamid_val(None));
        assert!(RelayCmd::EXTENDED.accepts_streamid_val(None));
        assert!(!RelayCmd::EXTENDED.accepts_streamid_val(id));
        // SENDME can be either circuit- or stream-level.
        assert!(RelayCmd::SENDME.accepts_streamid_val(id));
        assert!(RelayCmd::SENDME.accepts_streamid_val(None));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut rng = testing_rng();
        let data = msg::Data::new(b"hi there").unwrap();
        let cell = AnyRelayCell::new(StreamId::new(7), data.into());
        let body = cell.encode(&mut rng).unwrap();

        // The wire format of the header.
        assert_eq!(&body[..11], &[2, 0, 0, 0, 7, 0, 0, 0, 0, 0, 8]);
        assert_eq!(&body[11..19], b"hi there");
        // Check the zero gap before random padding.
        assert_eq!(&body[19..23], &[0; 4]);

        let parsed = UnparsedRelayCell::from_body(body);
        assert_eq!(parsed.cmd(), RelayCmd::DATA);
        assert_eq!(parsed.stream_id(), StreamId::new(7));
        let cell = parsed.decode::<AnyRelayMsg>().unwrap();
        assert_eq!(cell.cmd(), RelayCmd::DATA);
        match cell.msg() {
            AnyRelayMsg::Data(d) => assert_eq!(d.as_ref(), b"hi there"),
            _ => panic!(),
        }
    }

    #[test]
    fn data_of_exactly_one_cell() {
        let mut rng = testing_rng();
        let payload = vec![b'x'; msg::Data::MAXLEN];
        let data = msg::Data::new(&payload).unwrap();
        let cell = AnyRelayCell::new(StreamId::new(1), data.into());
        let body = cell.encode(&mut rng).unwrap();
        // Full cell: 11-byte header plus 498 bytes of payload.
        assert_eq!(&body[11..], &payload[..]);
    }

    #[test]
    fn bad_streamid_for_cmd() {
        let mut rng = testing_rng();
        // An EXTENDED cell with a stream ID is invalid.
        let ext = msg::Extended::new(vec![0; 148]);
        let cell = AnyRelayCell::new(StreamId::new(10), ext.into());
        let body = cell.encode(&mut rng).unwrap();
        let err = UnparsedRelayCell::from_body(body).decode::<AnyRelayMsg>();
        assert!(matches!(err, Err(crate::Error::ChanProto(_))));
    }
}
