//! Declare an error type for or-hsclient.

use or_error::{ErrorKind, HasKind};
use thiserror::Error;

/// An error while trying to reach a hidden service.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The onion address was not syntactically valid.
    #[error("Invalid onion address")]
    BadOnionAddress,

    /// We don't have a directory, so we can't compute responsible
    /// directories or pick rendezvous points.
    #[error("Consensus directory is not present or not up-to-date")]
    NeedConsensus,

    /// We were unable to fetch the service's descriptor from any
    /// responsible directory.
    #[error("Unable to download hidden service descriptor")]
    DescriptorFetchFailed,

    /// The descriptor we fetched could not be parsed.
    #[error("Unable to parse hidden service descriptor: {0}")]
    BadDescriptor(String),

    /// Every introduction point in the descriptor failed.
    #[error("Every introduction point has failed")]
    IntroductionFailed,

    /// We could not set up a rendezvous point.
    #[error("Unable to establish a rendezvous point")]
    RendezvousFailed,

    /// A problem when building or using one of our circuits.
    #[error("Circuit problem while connecting to hidden service")]
    Circuit(#[from] or_circmgr::Error),

    /// A protocol problem on one of our circuits.
    #[error("Protocol problem while connecting to hidden service")]
    Protocol(#[from] or_proto::Error),

    /// An internal error of some kind that should never occur.
    #[error("Internal error")]
    Bug(#[from] or_error::Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        match self {
            E::BadOnionAddress => ErrorKind::BadApiUsage,
            E::NeedConsensus => ErrorKind::BootstrapRequired,
            E::DescriptorFetchFailed => ErrorKind::NetworkAccessFailed,
            E::BadDescriptor(_) => ErrorKind::ProtocolViolation,
            E::IntroductionFailed => ErrorKind::NetworkAccessFailed,
            E::RendezvousFailed => ErrorKind::NetworkAccessFailed,
            E::Circuit(e) => e.kind(),
            E::Protocol(e) => e.kind(),
            E::Bug(e) => e.kind(),
        }
    }
}
