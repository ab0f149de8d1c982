//! Implementation for encoding and decoding of ChanCells.

use super::{ChanCell, CELL_DATA_LEN};
use crate::chancell::{ChanCmd, ChanMsg, CircId};
use crate::Error;
use or_bytes::{self, Reader, Writer};
use or_error::internal;

use bytes::BytesMut;

/// This object can be used to encode and decode channel cells.
///
/// NOTE: only link protocol versions 2 and 3 are supported.  VERSIONS
/// cells are not supported via the encoder/decoder, since the
/// handshake code sends and parses them directly.
///
/// The implemented format is one of the following:
///
/// Variable-length cells:
/// ```ignore
///     u16 circid;
///     u8 command;
///     u16 len;
///     u8 body[len];
/// ```
///
/// Fixed-width cells:
/// ```ignore
///     u16 circid;
///     u8 command;
///     u8 body[509];
/// ```
pub struct ChannelCodec {
    #[allow(dead_code)] // We don't support any link versions where this matters.
    /// The link protocol version being used for this channel.
    ///
    /// (In both of the versions we support, the circuit ID is two
    /// bytes; version 4 would make it four.)
    link_version: u16,
}

/// Size of the header of a fixed-length cell.
const FIXED_HDR_LEN: usize = 3;
/// Size of the header of a variable-length cell.
const VAR_HDR_LEN: usize = 5;
/// Total size of a fixed-length cell.
const FIXED_CELL_LEN: usize = FIXED_HDR_LEN + CELL_DATA_LEN;

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol version
    pub fn new(link_version: u16) -> Self {
        ChannelCodec { link_version }
    }

    /// Write the given cell into the provided BytesMut object.
    pub fn write_cell<M: ChanMsg>(
        &mut self,
        item: ChanCell<M>,
        dst: &mut BytesMut,
    ) -> crate::Result<()> {
        let (circid, msg) = item.into_circid_and_msg();
        let cmd = msg.cmd();
        dst.write_u16(CircId::get_or_zero(circid));
        dst.write_u8(cmd.into());

        let pos = dst.len(); // always 3.

        // now write the cell body and handle the length.
        if cmd.is_var_cell() {
            dst.write_u16(0);
            msg.encode_onto(dst)
                .map_err(|e| Error::EncodeErr("cell", e))?;
            let len = dst.len() - pos - 2;
            if len > u16::MAX as usize {
                return Err(Error::Internal(internal!("ran out of space for varcell")));
            }
            // go back and set the length.
            *(<&mut [u8; 2]>::try_from(&mut dst[pos..pos + 2])
                .expect("two-byte slice was not two bytes!?")) = (len as u16).to_be_bytes();
        } else {
            msg.encode_onto(dst)
                .map_err(|e| Error::EncodeErr("cell", e))?;
            let len = dst.len() - pos;
            if len > CELL_DATA_LEN {
                return Err(Error::Internal(internal!("ran out of space for cell")));
            }
            // pad to end of fixed-length cell
            dst.write_zeros(CELL_DATA_LEN - len);
        }
        Ok(())
    }

    /// Try to decode a cell from the provided BytesMut object.
    ///
    /// On a definite decoding error, return Err(_).  On a cell that
    /// might just be truncated, return Ok(None).
    pub fn decode_cell<M: ChanMsg>(
        &mut self,
        src: &mut BytesMut,
    ) -> crate::Result<Option<ChanCell<M>>> {
        /// Wrap `be` as an appropriate type.
        fn wrap_err(be: or_bytes::Error) -> crate::Error {
            crate::Error::BytesErr {
                err: be,
                parsed: "channel cell",
            }
        }

        if src.len() < VAR_HDR_LEN {
            // Smallest possible cell: varcell with len 0.
            return Ok(None);
        }
        let cmd: ChanCmd = src[2].into();
        let varcell = cmd.is_var_cell();
        let cell_len: usize = if varcell {
            let msg_len = u16::from_be_bytes(
                src[3..5]
                    .try_into()
                    .expect("two-byte slice was not two bytes!?"),
            );
            msg_len as usize + VAR_HDR_LEN
        } else {
            FIXED_CELL_LEN
        };
        if src.len() < cell_len {
            return Ok(None);
        }

        let cell = src.split_to(cell_len).freeze();
        let mut r = Reader::from_bytes(&cell);
        let circid: Option<CircId> = CircId::new(r.take_u16().map_err(wrap_err)?);
        r.advance(if varcell { 3 } else { 1 }).map_err(wrap_err)?;
        let msg = M::decode_from_reader(cmd, &mut r).map_err(wrap_err)?;

        if !cmd.accepts_circid_val(circid) {
            return Err(Error::ChanProto(format!(
                "invalid circuit ID {} for cell command {}",
                CircId::get_or_zero(circid),
                cmd
            )));
        }
        Ok(Some(ChanCell { circid, msg }))
    }
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::chancell::msg::{self, AnyChanMsg};
    use crate::chancell::AnyChanCell;
    use hex_literal::hex;

    /// Helper: encode `cell` with a protocol-3 codec.
    fn encode(cell: AnyChanCell) -> BytesMut {
        let mut codec = ChannelCodec::new(3);
        let mut bm = BytesMut::new();
        codec.write_cell(cell, &mut bm).unwrap();
        bm
    }

    /// Helper: try to decode a cell from some bytes.
    fn decode(bm: &mut BytesMut) -> Option<AnyChanCell> {
        let mut codec = ChannelCodec::new(3);
        codec.decode_cell(bm).unwrap()
    }

    #[test]
    fn fixed_cell_roundtrip() {
        let destroy = msg::Destroy::new(5.into());
        let cell = AnyChanCell::new(CircId::new(0x0203), destroy.into());
        let mut encoded = encode(cell);
        assert_eq!(encoded.len(), FIXED_CELL_LEN);
        assert_eq!(&encoded[..5], &hex!("0203 04 05 00")[..]);

        let decoded = decode(&mut encoded).unwrap();
        assert_eq!(encoded.len(), 0); // consumed.
        assert_eq!(decoded.circid(), CircId::new(0x0203));
        match decoded.msg() {
            AnyChanMsg::Destroy(d) => assert_eq!(u8::from(d.reason()), 5),
            _ => panic!(),
        }
    }

    #[test]
    fn var_cell_roundtrip() {
        let mut certs = msg::Certs::new_empty();
        certs.push_cert_body(2.into(), &b"hello"[..]);
        let cell = AnyChanCell::new(None, certs.into());
        let mut encoded = encode(cell);
        assert_eq!(&encoded[..5], &hex!("0000 81 0009")[..]);
        assert_eq!(encoded.len(), 5 + 9);

        let decoded = decode(&mut encoded).unwrap();
        assert!(decoded.circid().is_none());
        match decoded.msg() {
            AnyChanMsg::Certs(c) => {
                assert_eq!(c.cert_body(2.into()), Some(&b"hello"[..]));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn truncated_cells() {
        // A partial header gives None.
        let mut bm = BytesMut::from(&hex!("0203 04")[..]);
        assert!(decode(&mut bm).is_none());
        assert_eq!(bm.len(), 3); // nothing is consumed.

        // A partial fixed cell gives None.
        let destroy = msg::Destroy::new(0.into());
        let cell = AnyChanCell::new(CircId::new(5), destroy.into());
        let encoded = encode(cell);
        let mut bm = BytesMut::from(&encoded[..200]);
        assert!(decode(&mut bm).is_none());

        // A partial variable cell gives None.
        let mut bm = BytesMut::from(&hex!("0000 81 0009 010203")[..]);
        assert!(decode(&mut bm).is_none());
    }

    #[test]
    fn bad_circid_for_cmd() {
        // A NETINFO cell with a nonzero circuit ID is invalid.
        let mut bm = BytesMut::new();
        bm.write_u16(44);
        bm.write_u8(8); // NETINFO
        bm.write_zeros(CELL_DATA_LEN);
        let mut codec = ChannelCodec::new(3);
        let err = codec.decode_cell::<AnyChanMsg>(&mut bm);
        assert!(matches!(err, Err(Error::ChanProto(_))));
    }

    #[test]
    fn two_cells_in_one_buffer() {
        let c1 = AnyChanCell::new(CircId::new(1), msg::Destroy::new(0.into()).into());
        let c2 = AnyChanCell::new(CircId::new(2), msg::Destroy::new(0.into()).into());
        let mut buf = encode(c1);
        buf.extend_from_slice(&encode(c2)[..]);

        let d1 = decode(&mut buf).unwrap();
        let d2 = decode(&mut buf).unwrap();
        assert!(decode(&mut buf).is_none());
        assert_eq!(d1.circid(), CircId::new(1));
        assert_eq!(d2.circid(), CircId::new(2));
    }
}
