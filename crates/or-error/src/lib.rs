#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)]
#![allow(clippy::uninlined_format_args)]

use derive_more::Display;

mod internal;
mod report;

pub use internal::Bug;
pub use report::ErrorReport;

/// Classification of an error arising from the library.
///
/// The variants here describe a failure from the point of view of the
/// host application: where it happened and what (if anything) can be
/// done about it.  They deliberately do not correspond to code paths:
/// several layers may produce an error of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Error while trying to reach the onion-routing network.
    ///
    /// The local network may be down, or the chosen relay may not be
    /// working.  This kind of failure is usually transient: the usual
    /// recovery is to rebuild the affected circuits on other paths.
    #[display("error connecting to the network")]
    NetworkAccessFailed,

    /// An attempt was made to use the client before it was bootstrapped.
    #[display("attempted to use unbootstrapped client")]
    BootstrapRequired,

    /// A remote party violated the onion-routing protocol.
    ///
    /// This includes malformed cells, digest mismatches, impossible
    /// state transitions, and cryptographic failures on a particular
    /// path.  The offending circuit gets closed; other circuits are
    /// unaffected.
    #[display("network protocol violation")]
    ProtocolViolation,

    /// A remote stream failed for an unspecified reason.
    #[display("remote stream error")]
    RemoteStreamError,

    /// The stream was closed normally by the other side.
    #[display("remote stream closed")]
    RemoteStreamClosed,

    /// The stream was abruptly reset.
    #[display("remote stream reset")]
    RemoteStreamReset,

    /// The exit was unable to resolve the target hostname.
    #[display("remote hostname lookup failure")]
    RemoteHostResolutionFailed,

    /// The remote host refused the connection.
    #[display("remote connection refused")]
    RemoteConnectionRefused,

    /// An exit's policy did not permit the requested connection.
    ///
    /// The stream may be retried through a different exit, up to the
    /// per-stream retry budget.
    #[display("rejected by exit policy")]
    ExitPolicyRejected,

    /// The exit timed out, or could not route to the target.
    #[display("remote network failed")]
    RemoteNetworkFailed,

    /// A relay had insufficient resources (or was hibernating) and
    /// declined to handle our request.
    #[display("relay too busy")]
    RelayTooBusy,

    /// A circuit collapsed underneath one or more live streams.
    #[display("circuit collapsed")]
    CircuitCollapse,

    /// A circuit could not be built within its (possibly adaptive)
    /// timeout.
    #[display("circuit build timeout")]
    CircuitTimeout,

    /// We could not construct a suitable path with the current
    /// network directory and configuration.
    #[display("no usable path")]
    NoPath,

    /// No relay satisfying the exit requirements could be found.
    #[display("no suitable exit")]
    NoExit,

    /// A local resource (circuit IDs on a link, stream IDs on a
    /// circuit, buffer space) was exhausted.
    ///
    /// Surfaced as a transient failure; pressure is relieved by aging
    /// out idle circuits.
    #[display("local resource exhausted")]
    ResourceExhausted,

    /// The reactor is shutting down, so the operation cannot proceed.
    #[display("reactor is shutting down")]
    ReactorShuttingDown,

    /// The caller used the API incorrectly.
    #[display("bad API usage")]
    BadApiUsage,

    /// Internal error (bug) in the library.
    ///
    /// This is the "fatal" class of spec taxonomy: a corrupted
    /// invariant that the library cannot recover from.
    #[display("internal error (bug)")]
    Internal,

    /// Any error not otherwise classified.
    #[display("other error")]
    Other,
}

/// An error that can be classified with an [`ErrorKind`].
///
/// Every public `Error` type in this workspace implements this trait.
pub trait HasKind {
    /// Return the kind of this error.
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("example problem")]
    struct Example;

    impl HasKind for Example {
        fn kind(&self) -> ErrorKind {
            ErrorKind::ProtocolViolation
        }
    }

    #[test]
    fn kinds_display() {
        assert_eq!(
            ErrorKind::ProtocolViolation.to_string(),
            "network protocol violation"
        );
        assert_eq!(Example.kind(), ErrorKind::ProtocolViolation);
    }
}
