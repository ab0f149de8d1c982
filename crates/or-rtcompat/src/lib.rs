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

pub mod tokio_rt;
mod timeout;
mod traits;

pub use timeout::{SleepProviderExt, Timeout, TimeoutError};
pub use tokio_rt::PreferredRuntime;
pub use traits::{CertifiedConn, Runtime, SleepProvider, TcpProvider, TlsConnector, TlsProvider};

// Re-exported so that callers can write spawn code without naming
// `futures` explicitly.
pub use futures::task::{Spawn, SpawnError, SpawnExt};

/// Run a test case with a [`PreferredRuntime`].
///
/// The body must be a closure taking the runtime and returning a
/// future; the future is driven to completion on that runtime.
///
/// # Examples
///
/// ```
/// or_rtcompat::test_with_one_runtime!(|rt| async move {
///     use or_rtcompat::SleepProvider;
///     rt.sleep(std::time::Duration::from_millis(1)).await;
/// });
/// ```
#[macro_export]
macro_rules! test_with_one_runtime {
    ( $fn:expr ) => {{
        let runtime = $crate::PreferredRuntime::create().expect("failed to create runtime");
        let fut = { $fn }(runtime.clone());
        runtime.block_on(fut)
    }};
}
