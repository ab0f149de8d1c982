//! Type and code for handling a "half-closed" stream.
//!
//! A half-closed stream is one that we've sent an END on, but where
//! we might still receive some cells.

use crate::circuit::sendme::{StreamRecvWindow, StreamSendWindow};
use crate::{Error, Result};
use or_cell::relaycell::{RelayCmd, UnparsedRelayCell};

/// Type to track state of half-closed streams.
///
/// A half-closed stream is one where we've sent an END cell, but
/// where the other side might still send us data.
///
/// We need to track these streams instead of forgetting about them
/// entirely, since otherwise we'd be vulnerable to a class of
/// "DropMark" attacks, where an adversary marks a circuit by sending
/// baloney cells down streams that are no longer listening.
pub(super) struct HalfStream {
    /// Send window for this stream. Used to detect whether we get
    /// too many SENDME cells.
    sendw: StreamSendWindow,
    /// Receive window for this stream. Used to detect whether we get
    /// too many data cells.
    recvw: StreamRecvWindow,
    /// If true, accept a connected cell on this stream.
    connected_ok: bool,
}

/// A status value returned by [`HalfStream::handle_cell`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum HalfStreamStatus {
    /// The stream has been closed successfully and can now be
    /// dropped.
    Closed,
    /// The stream is still half-open, and must still be tracked.
    Open,
}

impl HalfStream {
    /// Create a new half-closed stream.
    pub(super) fn new(
        sendw: StreamSendWindow,
        recvw: StreamRecvWindow,
        connected_ok: bool,
    ) -> Self {
        HalfStream {
            sendw,
            recvw,
            connected_ok,
        }
    }

    /// Process an incoming cell and adjust this HalfStream
    /// accordingly.  Give an error if the protocol has been violated.
    pub(super) fn handle_cell(&mut self, cell: &UnparsedRelayCell) -> Result<HalfStreamStatus> {
        use HalfStreamStatus::*;
        match cell.cmd() {
            RelayCmd::SENDME => {
                self.sendw.put()?;
                Ok(Open)
            }
            RelayCmd::DATA => {
                self.recvw.take()?;
                Ok(Open)
            }
            RelayCmd::CONNECTED => {
                if self.connected_ok {
                    self.connected_ok = false;
                    Ok(Open)
                } else {
                    Err(Error::CircProto(
                        "Bad CONNECTED cell on a closed stream!".into(),
                    ))
                }
            }
            RelayCmd::END | RelayCmd::RESOLVED => Ok(Closed),
            cmd => Err(Error::CircProto(format!(
                "Bad {} cell on a closed stream!",
                cmd
            ))),
        }
    }
}
