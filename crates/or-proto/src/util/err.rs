//! Define an error type for the or-proto crate.

use or_cell::chancell::msg::DestroyReason;
use or_cell::relaycell::msg::EndReason;
use or_error::{Bug, ErrorKind, HasKind};
use std::sync::Arc;
use thiserror::Error;

/// An error type for the or-proto crate.
///
/// This type should probably be split into several.  There's more
/// than one kind of error, and they occur in different places.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred while communicating with a relay.
    #[error("IO error")]
    IoErr(#[source] Arc<std::io::Error>),
    /// An error occurred while trying to create or extend a circuit.
    #[error("handshake failed: {0}")]
    HandshakeProto(String),
    /// Cell encoding failed: {object} couldn't be represented.
    #[error("unable to encode {object}")]
    CellEncodeErr {
        /// What we were trying to create.
        object: &'static str,
        /// The error that occurred.
        #[source]
        err: or_cell::Error,
    },
    /// Cell decoding failed.
    #[error("error while parsing {object}")]
    CellDecodeErr {
        /// What we were trying to parse.
        object: &'static str,
        /// The error that occurred.
        #[source]
        err: or_cell::Error,
    },
    /// Protocol violation at the channel level.
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// Protocol violation at the circuit level.
    #[error("circuit protocol violation: {0}")]
    CircProto(String),
    /// The identity of the relay at the far end of the channel was
    /// not the one we expected.
    #[error("identity mismatch: {0}")]
    ChanMismatch(String),
    /// The channel is shut down and can no longer be used.
    #[error("channel closed")]
    ChannelClosed,
    /// The circuit is shut down and can no longer be used.
    #[error("circuit closed")]
    CircuitClosed,
    /// We were unable to allocate an identifier: the ID space is
    /// exhausted.
    #[error("identifier space exhausted")]
    IdRangeFull,
    /// The authentication value in a CREATED or RENDEZVOUS2 cell did
    /// not match what the key derivation produced.
    #[error("invalid handshake authentication")]
    BadCircHandshakeAuth,
    /// An inbound relay cell was not recognized by any hop on the
    /// circuit.
    #[error("relay cell authentication failed at every hop")]
    BadCellAuth,
    /// Tried to send a message to a hop that the circuit doesn't
    /// have.
    #[error("no such hop on circuit")]
    NoSuchHop,
    /// The remote end of the circuit destroyed it.
    #[error("circuit destroyed by remote: {}", .0.human_str())]
    CircDestroy(DestroyReason),
    /// The remote end of the stream closed it.
    ///
    /// Note that this is not an error for most purposes: streams are
    /// supposed to end eventually.
    #[error("stream ended (reason {0})")]
    EndReceived(EndReason),
    /// The stream was already closed when we tried to use it.
    #[error("stream already closed")]
    NotConnected,
    /// We could not spawn a reactor task.
    #[error("unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<futures::task::SpawnError>,
    },
    /// An internal error of some kind that should never occur.
    #[error("internal error")]
    Bug(#[from] Bug),
}

impl Error {
    /// Construct an Error from an io error encountered while
    /// communicating with a relay.
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        Error::IoErr(Arc::new(e))
    }

    /// Construct an Error from a or_bytes error encountered while
    /// parsing `object`.
    pub(crate) fn from_bytes_err(err: or_bytes::Error, object: &'static str) -> Self {
        Error::CellDecodeErr {
            err: or_cell::Error::BytesErr { err, parsed: object },
            object,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        use std::io::ErrorKind as IK;
        use Error::*;
        let kind = match err {
            IoErr(e) => match Arc::try_unwrap(e) {
                Ok(e) => return e,
                Err(arc) => return std::io::Error::new(arc.kind(), arc),
            },
            EndReceived(end_reason) => end_reason.into(),
            CircuitClosed | ChannelClosed | NotConnected => IK::ConnectionReset,
            CircDestroy(_) => IK::ConnectionAborted,
            BadCircHandshakeAuth | BadCellAuth | ChanProto(_) | CircProto(_)
            | HandshakeProto(_) | ChanMismatch(_) | CellDecodeErr { .. } => IK::InvalidData,
            Bug(_) | IdRangeFull | NoSuchHop | CellEncodeErr { .. } | Spawn { .. } => {
                IK::InvalidInput
            }
            _ => IK::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::IoErr(_) => EK::NetworkAccessFailed,
            E::HandshakeProto(_) => EK::ProtocolViolation,
            E::CellEncodeErr { .. } => EK::Internal,
            E::CellDecodeErr { .. } => EK::ProtocolViolation,
            E::ChanProto(_) | E::CircProto(_) => EK::ProtocolViolation,
            E::ChanMismatch(_) => EK::ProtocolViolation,
            E::ChannelClosed | E::CircuitClosed => EK::CircuitCollapse,
            E::IdRangeFull => EK::ResourceExhausted,
            E::BadCircHandshakeAuth | E::BadCellAuth => EK::ProtocolViolation,
            E::NoSuchHop => EK::BadApiUsage,
            E::CircDestroy(_) => EK::CircuitCollapse,
            E::EndReceived(reason) => reason.kind(),
            E::NotConnected => EK::BadApiUsage,
            E::Spawn { cause, .. } => {
                if cause.is_shutdown() {
                    EK::ReactorShuttingDown
                } else {
                    EK::Internal
                }
            }
            E::Bug(e) => e.kind(),
        }
    }
}

/// Internal type: wraps Error to indicate whether a reactor should
/// shut down cleanly or report a failure.
#[derive(Debug)]
pub enum ReactorError {
    /// The reactor should shut down with an aborting error.
    Err(Error),
    /// The reactor should shut down without an error, since everything
    /// it was waiting for is done.
    Shutdown,
}

impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}

impl From<Bug> for ReactorError {
    fn from(e: Bug) -> ReactorError {
        ReactorError::Err(e.into())
    }
}

impl ReactorError {
    /// Tests only: assert that this is an Error, and return it.
    #[cfg(test)]
    pub(crate) fn unwrap_err(self) -> Error {
        match self {
            ReactorError::Shutdown => panic!("reactor shut down cleanly"),
            ReactorError::Err(e) => e,
        }
    }
}
