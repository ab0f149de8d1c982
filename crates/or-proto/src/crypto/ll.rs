//! Low-level crypto implementations used internally by this crate.

pub(crate) mod kdf;
