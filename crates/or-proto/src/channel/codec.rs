//! Wrap or_cell's ChannelCodec for use with the futures_codec crate.

use std::io::Error as IoError;

use or_cell::chancell::{codec, AnyChanCell};

use asynchronous_codec as futures_codec;
use bytes::BytesMut;

/// An error from a ChannelCodec.
///
/// This is a separate error type for now because I suspect that we'll
/// want to handle these differently in the rest of our channel code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CodecError {
    /// An error from the underlying IO stream underneath a codec.
    #[error("Io error reading or writing a channel cell")]
    Io(#[from] IoError),
    /// An error from the cell decoding logic.
    #[error("Error decoding an incoming channel cell")]
    DecCell(#[source] or_cell::Error),
    /// An error from the cell encoding logic.
    #[error("Error encoding an outgoing channel cell")]
    EncCell(#[source] or_cell::Error),
}

impl From<CodecError> for crate::Error {
    fn from(err: CodecError) -> crate::Error {
        match err {
            CodecError::Io(e) => crate::Error::from_io(e),
            CodecError::DecCell(e) => crate::Error::CellDecodeErr {
                object: "channel cell",
                err: e,
            },
            CodecError::EncCell(e) => crate::Error::CellEncodeErr {
                object: "channel cell",
                err: e,
            },
        }
    }
}

/// Asynchronous wrapper around ChannelCodec in or_cell, with
/// implementation for use with futures_codec.
///
/// This type lets us wrap a TLS channel (or some other secure
/// AsyncRead+AsyncWrite type) as a Sink and a Stream of AnyChanCell,
/// so we can forget about byte-oriented communication.
pub(crate) struct ChannelCodec(codec::ChannelCodec);

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol.
    pub(crate) fn new(link_proto: u16) -> Self {
        ChannelCodec(codec::ChannelCodec::new(link_proto))
    }
}

impl futures_codec::Encoder for ChannelCodec {
    type Item = AnyChanCell;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.write_cell(item, dst).map_err(CodecError::EncCell)?;
        Ok(())
    }
}

impl futures_codec::Decoder for ChannelCodec {
    type Item = AnyChanCell;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_cell(src).map_err(CodecError::DecCell)
    }
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    use futures::io::{AsyncRead, AsyncWrite, Cursor, Result};
    use futures::sink::SinkExt;
    use futures::stream::StreamExt;
    use futures::task::{Context, Poll};
    use std::pin::Pin;

    use super::{futures_codec, ChannelCodec};
    use or_cell::chancell::{msg, AnyChanCell, CircId};

    /// Helper type for reading and writing bytes to/from buffers.
    pub(crate) struct MsgBuf {
        /// Data we have received as a reader.
        inbuf: futures::io::Cursor<Vec<u8>>,
        /// Data we write as a writer.
        outbuf: futures::io::Cursor<Vec<u8>>,
    }

    impl AsyncRead for MsgBuf {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<Result<usize>> {
            Pin::new(&mut self.inbuf).poll_read(cx, buf)
        }
    }
    impl AsyncWrite for MsgBuf {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<Result<usize>> {
            Pin::new(&mut self.outbuf).poll_write(cx, buf)
        }
        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
            Pin::new(&mut self.outbuf).poll_flush(cx)
        }
        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
            Pin::new(&mut self.outbuf).poll_close(cx)
        }
    }

    impl MsgBuf {
        /// Construct a new MsgBuf whose reader will yield `output`.
        pub(crate) fn new<T: Into<Vec<u8>>>(output: T) -> Self {
            let inbuf = Cursor::new(output.into());
            let outbuf = Cursor::new(Vec::new());
            MsgBuf { inbuf, outbuf }
        }

        /// Return the bytes that have been written to this buffer.
        pub(crate) fn into_response(self) -> Vec<u8> {
            self.outbuf.into_inner()
        }
    }

    #[test]
    fn check_encoding() {
        futures::executor::block_on(async {
            let buf = MsgBuf::new(&b""[..]);
            let mut framed = futures_codec::Framed::new(buf, ChannelCodec::new(3));

            let destroycell = msg::Destroy::new(2.into());
            framed
                .send(AnyChanCell::new(CircId::new(7), destroycell.into()))
                .await
                .unwrap();
            framed.flush().await.unwrap();

            let data = framed.into_inner().into_response();
            assert_eq!(&data[..5], &[0x00, 0x07, 0x04, 0x02, 0x00]);
            assert_eq!(data.len(), 512);
        });
    }

    #[test]
    fn check_decoding() {
        futures::executor::block_on(async {
            let mut cell = vec![0x00, 0x07, 0x04, 0x02];
            cell.resize(512, 0);
            let buf = MsgBuf::new(cell);
            let mut framed = futures_codec::Framed::new(buf, ChannelCodec::new(3));

            let cell = framed.next().await.unwrap().unwrap();
            assert_eq!(cell.circid(), CircId::new(7));
            assert!(matches!(cell.msg(), msg::AnyChanMsg::Destroy(_)));
        });
    }
}
