//! Declare the overall error type for the onionroute crate.

use or_error::{ErrorKind, HasKind};
use thiserror::Error;

/// An error originating from the onionroute library.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The requested target address was invalid or forbidden.
    #[error("Invalid target address: {0}")]
    Address(String),

    /// The client has not finished bootstrapping.
    #[error("Client is not bootstrapped yet")]
    NotBootstrapped,

    /// A problem from the channel manager.
    #[error("Channel problem")]
    ChanMgr(#[from] or_chanmgr::Error),

    /// A problem from the circuit manager.
    #[error("Circuit problem")]
    CircMgr(#[from] or_circmgr::Error),

    /// A problem from the protocol engine.
    #[error("Protocol problem")]
    Proto(#[from] or_proto::Error),

    /// A problem while connecting to a hidden service.
    #[error("Hidden service problem")]
    HsClient(#[from] or_hsclient::Error),

    /// The stream could not be opened after every permitted retry.
    #[error("Stream attach failed after retries")]
    StreamAttachFailed,

    /// The library is shutting down.
    #[error("Shutting down")]
    ShuttingDown,

    /// The caller supplied a handle we don't recognize.
    #[error("No such stream handle")]
    NoSuchStream,

    /// The embedding surface was initialized twice, or used before
    /// initialization.
    #[error("Library initialized twice, or not initialized")]
    InitState,

    /// An internal error of some kind that should never occur.
    #[error("Internal error")]
    Bug(#[from] or_error::Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        match self {
            E::Address(_) => ErrorKind::BadApiUsage,
            E::NotBootstrapped => ErrorKind::BootstrapRequired,
            E::ChanMgr(e) => e.kind(),
            E::CircMgr(e) => e.kind(),
            E::Proto(e) => e.kind(),
            E::HsClient(e) => e.kind(),
            E::StreamAttachFailed => ErrorKind::NetworkAccessFailed,
            E::ShuttingDown => ErrorKind::ReactorShuttingDown,
            E::NoSuchStream => ErrorKind::BadApiUsage,
            E::InitState => ErrorKind::BadApiUsage,
            E::Bug(e) => e.kind(),
        }
    }
}
