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

mod err;
mod impls;
mod reader;
mod secretbuf;
mod writer;

pub use err::{EncodeError, Error};
pub use reader::Reader;
pub use secretbuf::SecretBuf;
pub use writer::Writer;

/// Result type returned by this crate for decoding operations.
pub type Result<T> = std::result::Result<T, Error>;
/// Result type returned by this crate for encoding operations.
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

/// Trait for an object that can be extracted from a Reader.
///
/// Implement this trait in order to make an object that can (maybe)
/// be decoded from a reader.
///
/// Most code won't need to call this directly, but will instead use
/// it implicitly via the Reader::extract() method.
///
/// # Example
///
/// ```
/// use or_bytes::{Readable,Reader,Result};
///
/// #[derive(Debug, Eq, PartialEq)]
/// struct Timestamp(u32);
///
/// impl Readable for Timestamp {
///     fn take_from(b: &mut Reader<'_>) -> Result<Self> {
///         Ok(Timestamp(b.take_u32()?))
///     }
/// }
///
/// let bytes = [0x00, 0x11, 0x22, 0x33];
/// let mut reader = Reader::from_slice(&bytes);
/// let tstamp: Timestamp = reader.extract()?;
/// assert_eq!(tstamp, Timestamp(0x112233));
/// # Result::Ok(())
/// ```
pub trait Readable: Sized {
    /// Try to extract an object of this type from a Reader.
    ///
    /// Implementations should generally try to be efficient: this is
    /// not the right place to check signatures or perform expensive
    /// operations.  If you have an object that must not be used until
    /// it is finally validated, consider making this function return
    /// an unvalidated wrapper type.
    fn take_from(b: &mut Reader<'_>) -> Result<Self>;
}

/// Trait for an object that can be encoded onto a Writer by reference.
///
/// Implement this trait in order to make an object that can always be
/// encoded.
pub trait Writeable {
    /// Encode this object into the writer `b`.
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()>;
}

/// Trait for an object that can be encoded and consumed by a Writer.
///
/// Implement this trait in order to make an object that can be
/// encoded by consuming it.  (For example, types that contain secrets
/// may want to implement only this trait, so that the secrets can be
/// zeroed afterwards.)
pub trait WriteableOnce: Sized {
    /// Encode this object into the writer `b`, and consume it.
    fn write_into<B: Writer + ?Sized>(self, b: &mut B) -> EncodeResult<()>;
}

impl<W: Writeable + Sized> WriteableOnce for W {
    fn write_into<B: Writer + ?Sized>(self, b: &mut B) -> EncodeResult<()> {
        self.write_onto(b)
    }
}
