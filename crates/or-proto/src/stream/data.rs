//! Declare DataStream, a type that wraps StreamReader so as to be
//! useful for byte-oriented communication.

use crate::circuit::StreamTarget;
use crate::stream::StreamReader;
use crate::{Error, Result};

use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::{Context, Poll};
use futures::FutureExt;

use std::fmt::Debug;
use std::io::Result as IoResult;
use std::pin::Pin;

use or_cell::relaycell::msg::{AnyRelayMsg, Data, End, EndReason};
use or_cell::relaycell::{RelayCmd, UnparsedRelayCell};

/// An anonymized stream over the onion-routing network.
///
/// For most purposes, you can think of this type as an anonymized
/// TCP stream: it can read and write data, and get closed when it's
/// done.
///
/// [`DataStream`] implements [`futures::io::AsyncRead`] and
/// [`futures::io::AsyncWrite`], so you can use it anywhere that those
/// traits are expected.
///
/// # Semver note
///
/// Note that this type is re-exported as a part of the public API of
/// the top-level `onionroute` crate.
#[derive(Debug)]
pub struct DataStream {
    /// Underlying writer for this stream.
    w: DataWriter,
    /// Underlying reader for this stream.
    r: DataReader,
}

impl DataStream {
    /// Wrap a StreamReader as a DataStream.
    ///
    /// Call only after a CONNECTED cell has been received, or if one
    /// is expected imminently (and `wait_for_connection` will be
    /// called).
    pub(crate) fn new(reader: StreamReader) -> Self {
        let target = reader.target().clone();
        let r = DataReader {
            state: Some(DataReaderState::Ready(DataReaderImpl {
                s: reader,
                pending: Vec::new(),
                offset: 0,
                connected: false,
            })),
        };
        let w = DataWriter {
            state: Some(DataWriterState::Ready(DataWriterImpl {
                s: target,
                buf: Vec::with_capacity(Data::MAXLEN),
            })),
        };
        DataStream { w, r }
    }

    /// Divide this DataStream into its constituent parts.
    pub fn split(self) -> (DataReader, DataWriter) {
        (self.r, self.w)
    }

    /// Wait until a CONNECTED cell is received, or some other cell is
    /// received to indicate an error.
    ///
    /// Does nothing if this stream is already connected.
    pub async fn wait_for_connection(&mut self) -> Result<()> {
        self.r.wait_for_connection().await
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        Pin::new(&mut self.r).poll_read(cx, buf)
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        Pin::new(&mut self.w).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Pin::new(&mut self.w).poll_flush(cx)
    }
    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Pin::new(&mut self.w).poll_close(cx)
    }
}

/// An enumeration for the state of a DataWriter.
///
/// We have to use an enum here because, for as long as we're waiting
/// for a flush operation to complete, the future returned by
/// `flush_cell()` owns the DataWriterImpl.
enum DataWriterState {
    /// The writer has closed or gotten an error: nothing more to do.
    Closed,
    /// The writer is not currently flushing; more data can get queued
    /// immediately.
    Ready(DataWriterImpl),
    /// The writer is flushing a cell.
    Flushing(BoxFuture<'static, (DataWriterImpl, Result<()>)>),
}

/// Internal: the write part of a DataStream
struct DataWriterImpl {
    /// The underlying StreamTarget object.
    s: StreamTarget,
    /// Buffered data to send over the connection.
    buf: Vec<u8>,
}

impl DataWriterImpl {
    /// Try to flush the current buffer contents as data cells.
    async fn flush_buf(mut self) -> (Self, Result<()>) {
        let result = self.flush_buf_inner().await;
        (self, result)
    }

    /// Helper for flush_buf.
    async fn flush_buf_inner(&mut self) -> Result<()> {
        while !self.buf.is_empty() {
            let (cell, remainder) =
                Data::try_split_from(&self.buf[..]).expect("nonempty buffer split to nothing");
            let remainder = remainder.to_vec();
            self.s.send(AnyRelayMsg::Data(cell)).await?;
            self.buf = remainder;
        }
        Ok(())
    }
}

/// The write part of a DataStream.
#[derive(Debug)]
pub struct DataWriter {
    /// Internal state for this writer.
    ///
    /// This is stored in an Option so that we can mutate it in the
    /// AsyncWrite functions.  It might be possible to do better here,
    /// and we should refactor if so.
    state: Option<DataWriterState>,
}

impl Debug for DataWriterImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWriterImpl")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl Debug for DataWriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataWriterState::Closed => write!(f, "Closed"),
            DataWriterState::Ready(imp) => write!(f, "Ready({:?})", imp),
            DataWriterState::Flushing(_) => write!(f, "Flushing"),
        }
    }
}

impl DataWriter {
    /// Helper for poll_flush() and poll_close(): flush and optionally
    /// send an END afterwards.
    fn poll_flush_impl(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        should_close: bool,
    ) -> Poll<IoResult<()>> {
        let state = self.state.take().expect("missing state");

        match state {
            DataWriterState::Ready(imp) => {
                if imp.buf.is_empty() {
                    // Nothing to flush.
                    if should_close {
                        imp.s.close(End::new_misc());
                        self.state = Some(DataWriterState::Closed);
                    } else {
                        self.state = Some(DataWriterState::Ready(imp));
                    }
                    Poll::Ready(Ok(()))
                } else {
                    let fut = imp.flush_buf().boxed();
                    self.state = Some(DataWriterState::Flushing(fut));
                    // Try again, now that we're flushing.
                    self.poll_flush_impl(cx, should_close)
                }
            }
            DataWriterState::Flushing(mut fut) => match fut.poll_unpin(cx) {
                Poll::Ready((imp, Ok(()))) => {
                    self.state = Some(DataWriterState::Ready(imp));
                    self.poll_flush_impl(cx, should_close)
                }
                Poll::Ready((_imp, Err(e))) => {
                    self.state = Some(DataWriterState::Closed);
                    Poll::Ready(Err(e.into()))
                }
                Poll::Pending => {
                    self.state = Some(DataWriterState::Flushing(fut));
                    Poll::Pending
                }
            },
            DataWriterState::Closed => {
                self.state = Some(DataWriterState::Closed);
                if should_close {
                    // Closing twice is fine.
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(Error::NotConnected.into()))
                }
            }
        }
    }
}

impl AsyncWrite for DataWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let state = self.state.take().expect("missing state");

        match state {
            DataWriterState::Ready(mut imp) => {
                let n_queued = std::cmp::min(buf.len(), Data::MAXLEN - imp.buf.len());
                imp.buf.extend_from_slice(&buf[..n_queued]);
                if imp.buf.len() >= Data::MAXLEN {
                    // A whole cell's worth: start flushing.
                    let fut = imp.flush_buf().boxed();
                    self.state = Some(DataWriterState::Flushing(fut));
                } else {
                    self.state = Some(DataWriterState::Ready(imp));
                }
                if n_queued > 0 {
                    Poll::Ready(Ok(n_queued))
                } else {
                    // Buffer was full; wait on the flush.
                    self.poll_write(cx, buf)
                }
            }
            DataWriterState::Flushing(mut fut) => match fut.poll_unpin(cx) {
                Poll::Ready((imp, Ok(()))) => {
                    self.state = Some(DataWriterState::Ready(imp));
                    self.poll_write(cx, buf)
                }
                Poll::Ready((_imp, Err(e))) => {
                    self.state = Some(DataWriterState::Closed);
                    Poll::Ready(Err(e.into()))
                }
                Poll::Pending => {
                    self.state = Some(DataWriterState::Flushing(fut));
                    Poll::Pending
                }
            },
            DataWriterState::Closed => {
                self.state = Some(DataWriterState::Closed);
                Poll::Ready(Err(Error::NotConnected.into()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.poll_flush_impl(cx, false)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.poll_flush_impl(cx, true)
    }
}

/// An enumeration for the state of a DataReader.
enum DataReaderState {
    /// In this state we have received an end cell or an error.
    ///
    /// If the error is None, we got a clean end-of-stream.
    Closed(Option<Error>),
    /// In this state the reader is not currently fetching a cell; it
    /// has data in `pending` (or is out of data).
    Ready(DataReaderImpl),
    /// The reader is currently fetching a cell: this future will
    /// complete when it arrives.
    ReadingCell(BoxFuture<'static, (DataReaderImpl, Result<Option<Vec<u8>>>)>),
}

/// Wrapper for the read part of a DataStream.
struct DataReaderImpl {
    /// The underlying StreamReader object.
    s: StreamReader,
    /// Data that we have received and not yet handed to the caller.
    pending: Vec<u8>,
    /// Index into pending for the next byte to return.
    offset: usize,
    /// Have we received a CONNECTED cell on this stream?
    connected: bool,
}

/// The read part of a DataStream.
#[derive(Debug)]
pub struct DataReader {
    /// Internal state for this reader.
    ///
    /// See the note on [`DataWriter::state`].
    state: Option<DataReaderState>,
}

impl Debug for DataReaderImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReaderImpl")
            .field("pending", &(self.pending.len() - self.offset))
            .finish_non_exhaustive()
    }
}

impl Debug for DataReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataReaderState::Closed(e) => write!(f, "Closed({:?})", e),
            DataReaderState::Ready(imp) => write!(f, "Ready({:?})", imp),
            DataReaderState::ReadingCell(_) => write!(f, "ReadingCell"),
        }
    }
}

impl DataReader {
    /// Wait until a CONNECTED cell arrives on this stream.
    pub(crate) async fn wait_for_connection(&mut self) -> Result<()> {
        let state = self.state.take().expect("missing state");
        match state {
            DataReaderState::Ready(mut imp) => {
                let result = if imp.connected {
                    Ok(())
                } else {
                    imp.read_connected().await
                };
                match result {
                    Ok(()) => {
                        self.state = Some(DataReaderState::Ready(imp));
                        Ok(())
                    }
                    Err(e) => {
                        self.state = Some(DataReaderState::Closed(Some(e.clone())));
                        Err(e)
                    }
                }
            }
            DataReaderState::Closed(e) => {
                let result = match &e {
                    Some(err) => Err(err.clone()),
                    None => Err(Error::NotConnected),
                };
                self.state = Some(DataReaderState::Closed(e));
                result
            }
            DataReaderState::ReadingCell(fut) => {
                self.state = Some(DataReaderState::ReadingCell(fut));
                Err(or_error::internal!("waited for connection after reading data").into())
            }
        }
    }
}

impl DataReaderImpl {
    /// Wait for the initial CONNECTED cell.
    async fn read_connected(&mut self) -> Result<()> {
        let cell = self.s.recv_cell().await?;
        match cell.cmd() {
            RelayCmd::CONNECTED => {
                self.connected = true;
                Ok(())
            }
            RelayCmd::END => {
                self.s.note_ended();
                Err(Error::EndReceived(end_reason(cell)))
            }
            cmd => {
                self.s.target_mut().protocol_error();
                Err(Error::CircProto(format!(
                    "Received {} instead of CONNECTED",
                    cmd
                )))
            }
        }
    }

    /// Wait for a data cell, and return its contents.
    ///
    /// Returns Ok(None) on a clean end-of-stream.
    async fn read_cell(mut self) -> (Self, Result<Option<Vec<u8>>>) {
        let result = self.read_cell_inner().await;
        (self, result)
    }

    /// Helper for read_cell.
    async fn read_cell_inner(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let cell = self.s.recv_cell().await?;
            match cell.cmd() {
                RelayCmd::DATA => {
                    let cell = cell
                        .decode::<AnyRelayMsg>()
                        .map_err(|e| Error::CellDecodeErr {
                            object: "data cell",
                            err: e,
                        })?;
                    match cell.into_msg() {
                        AnyRelayMsg::Data(d) => return Ok(Some(d.into())),
                        _ => return Err(or_error::internal!("DATA cell was not Data").into()),
                    }
                }
                RelayCmd::CONNECTED if !self.connected => {
                    // (Tolerated for streams where the caller never
                    // waited for the connection explicitly.)
                    self.connected = true;
                }
                RelayCmd::END => {
                    self.s.note_ended();
                    let reason = end_reason(cell);
                    if reason == EndReason::DONE {
                        return Ok(None);
                    } else {
                        return Err(Error::EndReceived(reason));
                    }
                }
                cmd => {
                    self.s.target_mut().protocol_error();
                    return Err(Error::CircProto(format!(
                        "Unexpected {} cell on data stream",
                        cmd
                    )));
                }
            }
        }
    }

    /// Pull as many bytes as possible out of self.pending, and return
    /// the number of bytes moved.
    fn extract_bytes(&mut self, buf: &mut [u8]) -> usize {
        let remainder = &self.pending[self.offset..];
        let n_to_copy = std::cmp::min(buf.len(), remainder.len());
        buf[..n_to_copy].copy_from_slice(&remainder[..n_to_copy]);
        self.offset += n_to_copy;
        n_to_copy
    }

    /// Return true iff there are no pending bytes to return.
    fn buf_is_empty(&self) -> bool {
        self.pending.len() == self.offset
    }
}

/// Helper: extract the reason code from an END cell, defaulting to
/// MISC.
fn end_reason(cell: UnparsedRelayCell) -> EndReason {
    match cell.decode::<AnyRelayMsg>() {
        Ok(c) => match c.into_msg() {
            AnyRelayMsg::End(e) => e.reason(),
            _ => EndReason::MISC,
        },
        Err(_) => EndReason::MISC,
    }
}

impl AsyncRead for DataReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        // We're pulling the state object out of the reader.  We MUST
        // put it back before this function returns.
        let mut state = self.state.take().expect("missing state");

        loop {
            let mut future = match state {
                DataReaderState::Ready(mut imp) => {
                    // There may be data to read already.
                    let n_copied = imp.extract_bytes(buf);
                    if n_copied != 0 {
                        self.state = Some(DataReaderState::Ready(imp));
                        return Poll::Ready(Ok(n_copied));
                    }
                    // No data available; launch a read.
                    imp.read_cell().boxed()
                }
                DataReaderState::ReadingCell(fut) => fut,
                DataReaderState::Closed(None) => {
                    self.state = Some(DataReaderState::Closed(None));
                    return Poll::Ready(Ok(0));
                }
                DataReaderState::Closed(Some(e)) => {
                    let result = Err(e.clone().into());
                    self.state = Some(DataReaderState::Closed(Some(e)));
                    return Poll::Ready(result);
                }
            };

            match future.poll_unpin(cx) {
                Poll::Ready((mut imp, Ok(Some(bytes)))) => {
                    imp.pending = bytes;
                    imp.offset = 0;
                    state = DataReaderState::Ready(imp);
                    // Loop around and extract.
                }
                Poll::Ready((_imp, Ok(None))) => {
                    // Clean end of stream.
                    state = DataReaderState::Closed(None);
                }
                Poll::Ready((_imp, Err(e))) => {
                    state = DataReaderState::Closed(Some(e));
                }
                Poll::Pending => {
                    self.state = Some(DataReaderState::ReadingCell(future));
                    return Poll::Pending;
                }
            }
        }
    }
}
