//! Declare an error type for or-circmgr.

use or_error::{ErrorKind, HasKind};
use thiserror::Error;

/// An error returned while looking up or building a circuit.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// We don't have a directory, so we can't build circuits.
    #[error("Consensus directory is not present or not up-to-date")]
    NeedConsensus,

    /// We were unable to find a usable path for the requested
    /// circuit.
    #[error("No path available: {0}")]
    NoPath(String),

    /// We were unable to find a suitable exit relay.
    #[error("No exit available: {0}")]
    NoExit(String),

    /// A circuit build took too long to finish.
    #[error("Circuit took too long to build")]
    CircTimeout,

    /// A request spent too long waiting for a circuit.
    #[error("Spent too long waiting for a circuit to build")]
    RequestTimeout,

    /// We ran out of attempts for our request.
    #[error("Ran out of valid attempts for this request")]
    RequestFailed,

    /// A problem opening the channel for the first hop.
    #[error("Problem with channel")]
    Channel(#[from] or_chanmgr::Error),

    /// A protocol problem while building or using a circuit.
    #[error("Problem building or using a circuit")]
    Protocol(#[from] or_proto::Error),

    /// An internal error of some kind that should never occur.
    #[error("Internal error")]
    Bug(#[from] or_error::Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        match self {
            E::NeedConsensus => ErrorKind::BootstrapRequired,
            E::NoPath(_) => ErrorKind::NoPath,
            E::NoExit(_) => ErrorKind::NoExit,
            E::CircTimeout => ErrorKind::CircuitTimeout,
            E::RequestTimeout => ErrorKind::CircuitTimeout,
            E::RequestFailed => ErrorKind::NetworkAccessFailed,
            E::Channel(e) => e.kind(),
            E::Protocol(e) => e.kind(),
            E::Bug(e) => e.kind(),
        }
    }
}
