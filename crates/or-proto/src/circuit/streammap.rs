//! Types and code for mapping StreamIDs to streams on a circuit.

use crate::circuit::halfstream::{HalfStream, HalfStreamStatus};
use crate::circuit::sendme::{StreamRecvWindow, StreamSendWindow};
use crate::{Error, Result};
use or_cell::relaycell::msg::AnyRelayMsg;
use or_cell::relaycell::{StreamId, UnparsedRelayCell};

use futures::channel::mpsc;
use or_error::internal;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use rand::Rng;

use tracing::debug;

/// The entry for a stream.
pub(super) enum StreamEnt {
    /// An open stream.
    Open {
        /// Sink to send relay cells tagged for this stream into.
        sink: mpsc::Sender<UnparsedRelayCell>,
        /// Stream for cells that should be sent down this stream.
        rx: mpsc::Receiver<AnyRelayMsg>,
        /// Send window, for congestion control purposes.
        send_window: StreamSendWindow,
        /// Receive window, for congestion control purposes.
        recv_window: StreamRecvWindow,
        /// Number of cells dropped due to the stream disappearing
        /// before we can transform this into an `EndSent`.
        dropped: u16,
        /// True if we have received a CONNECTED cell on this stream.
        received_connected: bool,
    },
    /// A stream for which we have received an END cell, but not yet
    /// had the stream object get dropped.
    EndReceived,
    /// A stream for which we have sent an END cell but not yet
    /// received an END cell.
    EndSent(HalfStream),
}

/// Return value to indicate whether or not we send an END cell upon
/// terminating a given stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum ShouldSendEnd {
    /// An END cell should be sent.
    Send,
    /// An END cell should not be sent.
    DontSend,
}

/// A map from stream IDs to stream entries. Each circuit has one for
/// each hop.
pub(super) struct StreamMap {
    /// Map from StreamId to StreamEnt.  If there is no entry for a
    /// StreamId, that stream doesn't exist.
    m: HashMap<StreamId, StreamEnt>,
    /// The next StreamId that we should use for a newly allocated
    /// stream.  (0 is not a valid stream ID.)
    next_stream_id: u16,
}

impl StreamMap {
    /// Make a new empty StreamMap.
    pub(super) fn new() -> Self {
        let mut rng = rand::rng();
        let next_stream_id: u16 = loop {
            let v: u16 = rng.random();
            if v != 0 {
                break v;
            }
        };
        StreamMap {
            m: HashMap::new(),
            next_stream_id,
        }
    }

    /// Get the `HashMap` inside this stream map.
    pub(super) fn inner(&mut self) -> &mut HashMap<StreamId, StreamEnt> {
        &mut self.m
    }

    /// Add an entry to this map; return the newly allocated StreamId.
    pub(super) fn add_ent(
        &mut self,
        sink: mpsc::Sender<UnparsedRelayCell>,
        rx: mpsc::Receiver<AnyRelayMsg>,
        send_window: StreamSendWindow,
        recv_window: StreamRecvWindow,
    ) -> Result<StreamId> {
        let stream_ent = StreamEnt::Open {
            sink,
            rx,
            send_window,
            recv_window,
            dropped: 0,
            received_connected: false,
        };
        // This "65536" seems too aggressive, but it's what the
        // reference implementation does.
        //
        // Also, going around in a loop here is (sadly) needed in
        // order to look like other clients.
        for _ in 1..=65536 {
            let id: StreamId = match StreamId::new(self.next_stream_id) {
                Some(id) => id,
                None => {
                    self.next_stream_id = self.next_stream_id.wrapping_add(1);
                    continue;
                }
            };
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            let ent = self.m.entry(id);
            if let Entry::Vacant(_) = ent {
                ent.or_insert(stream_ent);
                return Ok(id);
            }
        }

        Err(Error::IdRangeFull)
    }

    /// Return the entry for `id` in this map, if any.
    pub(super) fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEnt> {
        self.m.get_mut(&id)
    }

    /// Note that we received an END or RESOLVED message on the stream
    /// with `id`.
    pub(super) fn ending_msg_received(&mut self, id: StreamId) -> Result<()> {
        let mut stream_entry = match self.m.entry(id) {
            Entry::Vacant(_) => {
                return Err(Error::CircProto(
                    "Received END cell on nonexistent stream".into(),
                ))
            }
            Entry::Occupied(o) => o,
        };

        match stream_entry.get() {
            StreamEnt::EndReceived => Err(Error::CircProto(
                "Received two END cells on same stream".into(),
            )),
            StreamEnt::EndSent(_) => {
                debug!("Actually got an end cell on a half-closed stream!");
                // We got an END, and we already sent an END. Great!
                // We can forget about this stream.
                stream_entry.remove_entry();
                Ok(())
            }
            StreamEnt::Open { .. } => {
                stream_entry.insert(StreamEnt::EndReceived);
                Ok(())
            }
        }
    }

    /// Handle a cell that arrived on a half-closed (EndSent) stream,
    /// removing the stream if it is now fully closed.
    pub(super) fn handle_cell_on_half_closed(
        &mut self,
        id: StreamId,
        cell: &UnparsedRelayCell,
    ) -> Result<()> {
        let ent = self
            .m
            .get_mut(&id)
            .ok_or_else(|| internal!("tried to handle a cell on a missing stream"))?;
        match ent {
            StreamEnt::EndSent(halfstream) => {
                if halfstream.handle_cell(cell)? == HalfStreamStatus::Closed {
                    self.m.remove(&id);
                }
                Ok(())
            }
            _ => Err(internal!("stream was not half-closed").into()),
        }
    }

    /// Handle a termination of the stream with `id` from this side of
    /// the circuit. Return a ShouldSendEnd to say whether an END
    /// ought to be sent.
    pub(super) fn terminate(&mut self, id: StreamId) -> Result<ShouldSendEnd> {
        match self
            .m
            .remove(&id)
            .ok_or_else(|| Error::from(internal!("Somehow we terminated a nonexistent stream?")))?
        {
            StreamEnt::EndReceived => Ok(ShouldSendEnd::DontSend),
            StreamEnt::Open {
                send_window,
                mut recv_window,
                dropped,
                received_connected,
                // notably absent: the channels for sink and stream,
                // which will get dropped and closed (meaning
                // reads/writes from/to this stream will now fail)
                ..
            } => {
                recv_window.decrement_n(dropped)?;
                let connected_ok = !received_connected;
                let halfstream = HalfStream::new(send_window, recv_window, connected_ok);
                self.m.insert(id, StreamEnt::EndSent(halfstream));
                Ok(ShouldSendEnd::Send)
            }
            StreamEnt::EndSent(_) => {
                panic!("Hang on! We're sending an END on a stream where we already sent an END‽");
            }
        }
    }
}
