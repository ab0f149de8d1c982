//! Internal: Declare an Error type for or-bytes

use std::borrow::Cow;

use or_error::{into_internal, Bug};
use thiserror::Error;

/// Error type for decoding protocol objects from bytes.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Tried to read something, but we didn't find enough bytes.
    ///
    /// This can mean that the object is truncated, or that we need to
    /// read more and try again.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// Called Reader::should_be_exhausted(), but found bytes anyway.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// Invalid length value.
    #[error("object length too large to represent")]
    BadLengthValue,
    /// An attempt to parse an object failed for some reason related to
    /// its contents.
    #[error("bad object: {0}")]
    InvalidMessage(Cow<'static, str>),
    /// A parsing error that should never happen.
    ///
    /// We use this one in lieu of calling assert() and expect() and
    /// unwrap() from within parsing code.
    #[error("internal error")]
    Bug(#[from] Bug),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use Error::*;
        match (self, other) {
            (Truncated, Truncated) => true,
            (ExtraneousBytes, ExtraneousBytes) => true,
            (BadLengthValue, BadLengthValue) => true,
            (InvalidMessage(a), InvalidMessage(b)) => a == b,
            // A bug is equal to nothing, not even itself.
            (_, _) => false,
        }
    }
}

/// Error type for encoding protocol objects to bytes.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum EncodeError {
    /// We tried to encode an object with an attached length, but the
    /// length was too large to encode in the available space.
    #[error("object length too large to encode")]
    BadLengthValue,
    /// An encoding error that should never happen.
    ///
    /// We use this variant instead of calling assert() and expect()
    /// and unwrap() from within encoding implementations.
    #[error("internal error")]
    Bug(#[from] Bug),
}

// This impl is used to convert any encoding error into a bug:
// encoding of messages we generate ourselves should never fail.
impl From<EncodeError> for Bug {
    fn from(error: EncodeError) -> Bug {
        match error {
            EncodeError::Bug(bug) => bug,
            EncodeError::BadLengthValue => into_internal!("encoding error")(error),
        }
    }
}
