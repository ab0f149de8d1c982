//! Declare a type for streams that do hostname lookups

use crate::stream::StreamReader;
use crate::{Error, Result};
use or_cell::relaycell::msg::{AnyRelayMsg, Resolved};
use or_cell::relaycell::RelayCmd;

/// A ResolveStream represents a pending DNS request made with a
/// RESOLVE cell.
#[derive(Debug)]
pub struct ResolveStream {
    /// The underlying RawCellStream.
    s: StreamReader,
}

impl ResolveStream {
    /// Wrap a StreamReader into a ResolveStream.
    ///
    /// Call only after sending a RESOLVE cell.
    pub(crate) fn new(s: StreamReader) -> Self {
        ResolveStream { s }
    }

    /// Read a message from this stream telling us the answer to our
    /// name lookup request.
    pub async fn read_msg(&mut self) -> Result<Resolved> {
        let cell = self.s.recv_cell().await?;
        match cell.cmd() {
            RelayCmd::RESOLVED => {
                let msg = cell
                    .decode::<AnyRelayMsg>()
                    .map_err(|e| Error::CellDecodeErr {
                        object: "resolved cell",
                        err: e,
                    })?
                    .into_msg();
                self.s.note_ended();
                match msg {
                    AnyRelayMsg::Resolved(r) => Ok(r),
                    _ => Err(or_error::internal!("RESOLVED cell was not Resolved").into()),
                }
            }
            RelayCmd::END => {
                self.s.note_ended();
                let reason = match cell.decode::<AnyRelayMsg>() {
                    Ok(c) => match c.into_msg() {
                        AnyRelayMsg::End(e) => e.reason(),
                        _ => or_cell::relaycell::msg::EndReason::MISC,
                    },
                    Err(_) => or_cell::relaycell::msg::EndReason::MISC,
                };
                Err(Error::EndReceived(reason))
            }
            cmd => {
                self.s.target_mut().protocol_error();
                Err(Error::CircProto(format!(
                    "Unexpected {} on resolve stream",
                    cmd
                )))
            }
        }
    }
}
