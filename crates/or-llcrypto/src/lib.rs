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

pub mod cipher;
pub mod d;
pub mod pk;
pub mod util;
