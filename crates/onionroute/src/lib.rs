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

pub mod address;
mod client;
pub mod config;
pub mod embed;
mod err;
pub mod status;

pub use address::TorAddr;
pub use client::OnionRouteClient;
pub use config::OnionRouteConfig;
pub use err::Error;
pub use status::BootstrapStatus;

// Re-export the types a host is expected to touch.
pub use or_hsclient::{HsDesc, HsDescParser, HsId, IntroPoint};
pub use or_netdir::{DirProvider, NetDir, NetParameters, PortPolicy, RelayDesc, RelayFlags};
pub use or_proto::stream::{DataReader, DataStream, DataWriter};
pub use or_rtcompat::{PreferredRuntime, Runtime};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
