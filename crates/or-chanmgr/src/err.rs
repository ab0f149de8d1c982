//! Declare error types for the or-chanmgr crate.

use or_error::{ErrorKind, HasKind};
use std::sync::Arc;
use thiserror::Error;

/// An error returned by a channel manager.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A network problem while trying to reach the relay.
    #[error("Unable to connect to {peer}")]
    Io {
        /// The address we were trying to reach.
        peer: std::net::SocketAddr,
        /// The I/O problem we encountered.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A protocol problem while the channel was handshaking.
    #[error("Problem building a channel")]
    Proto(#[from] or_proto::Error),

    /// We were waiting for somebody else's attempt to build this
    /// channel, and it failed.
    #[error("Pending channel attempt failed")]
    PendingFailed,

    /// Unable to spawn the channel's reactor task.
    #[error("Unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn
        spawning: &'static str,
        /// What happened when we tried to spawn it
        #[source]
        cause: Arc<futures::task::SpawnError>,
    },

    /// An internal error of some kind that should never occur.
    #[error("Internal error")]
    Internal(#[from] or_error::Bug),
}

impl Error {
    /// Construct an error from an io problem encountered while
    /// dialing `peer`.
    pub(crate) fn from_io(peer: std::net::SocketAddr, e: std::io::Error) -> Self {
        Error::Io {
            peer,
            source: Arc::new(e),
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        match self {
            E::Io { .. } => ErrorKind::NetworkAccessFailed,
            E::Proto(e) => e.kind(),
            E::PendingFailed => ErrorKind::NetworkAccessFailed,
            E::Spawn { cause, .. } => {
                if cause.is_shutdown() {
                    ErrorKind::ReactorShuttingDown
                } else {
                    ErrorKind::Internal
                }
            }
            E::Internal(e) => e.kind(),
        }
    }
}
