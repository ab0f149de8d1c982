//! Internal utilities for or-proto.

pub(crate) mod err;
