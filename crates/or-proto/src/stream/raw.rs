//! Declare the lowest level of stream: a stream that operates on raw
//! cells.

use crate::circuit::StreamTarget;
use crate::{Error, Result};
use or_cell::relaycell::UnparsedRelayCell;

use futures::channel::mpsc;
use futures::stream::StreamExt;

/// The read part of a stream on a particular circuit.
///
/// A `StreamReader` receives the unparsed relay cells that the
/// circuit reactor has dispatched to its stream.  Higher-level stream
/// types interpret those cells.
#[derive(Debug)]
pub struct StreamReader {
    /// The underlying `StreamTarget` object.
    target: StreamTarget,
    /// Channel to receive stream messages from the reactor.
    receiver: mpsc::Receiver<UnparsedRelayCell>,
    /// True iff we've received a message that the stream (or its
    /// circuit) is finished.
    ended: bool,
}

impl StreamReader {
    /// Construct a new StreamReader.
    pub(crate) fn new(target: StreamTarget, receiver: mpsc::Receiver<UnparsedRelayCell>) -> Self {
        StreamReader {
            target,
            receiver,
            ended: false,
        }
    }

    /// Return a clone of this stream's target, for sending cells.
    pub(crate) fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// Return a mutable reference to this stream's target.
    pub(crate) fn target_mut(&mut self) -> &mut StreamTarget {
        &mut self.target
    }

    /// Try to read the next relay cell for this stream.
    ///
    /// Returns [`Error::CircuitClosed`] if the circuit has collapsed
    /// without delivering an END.
    pub(crate) async fn recv_cell(&mut self) -> Result<UnparsedRelayCell> {
        if self.ended {
            return Err(Error::NotConnected);
        }
        match self.receiver.next().await {
            Some(cell) => Ok(cell),
            None => {
                self.ended = true;
                Err(Error::CircuitClosed)
            }
        }
    }

    /// Record that this stream has ended; no more cells will be
    /// accepted.
    pub(crate) fn note_ended(&mut self) {
        self.ended = true;
    }
}
