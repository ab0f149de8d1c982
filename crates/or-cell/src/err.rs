//! Define an error type for the or-cell crate.

use or_error::{ErrorKind, HasKind};
use thiserror::Error;

/// An error type for the or-cell crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while trying to parse a cell or message.
    #[error("unable to parse {parsed}")]
    BytesErr {
        /// The error that occurred while parsing.
        #[source]
        err: or_bytes::Error,
        /// What we were parsing.
        parsed: &'static str,
    },
    /// There was a problem encoding a cell or message.
    #[error("unable to encode {0}")]
    EncodeErr(&'static str, #[source] or_bytes::EncodeError),
    /// A cell was formatted in a way that violated the channel
    /// protocol.
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// A given address type was not recognized.
    #[error("invalid address type {0}")]
    BadAddrType(u8),
    /// A stream address was not valid.
    #[error("invalid stream target address")]
    BadStreamAddress,
    /// A message was too long to encode in its cell type.
    #[error("message too long: {0}")]
    CantEncode(&'static str),
    /// An internal error.
    #[error("internal error")]
    Internal(#[from] or_error::Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        match self {
            E::BytesErr { .. } => ErrorKind::ProtocolViolation,
            E::EncodeErr(..) => ErrorKind::Internal,
            E::ChanProto(_) => ErrorKind::ProtocolViolation,
            E::BadAddrType(_) => ErrorKind::ProtocolViolation,
            E::BadStreamAddress => ErrorKind::BadApiUsage,
            E::CantEncode(_) => ErrorKind::Internal,
            E::Internal(e) => e.kind(),
        }
    }
}
