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

mod builder;
mod err;
mod mgr;

pub use err::Error;

use mgr::AbstractChanMgr;
use or_llcrypto::pk::rsa::RsaIdentity;
use or_proto::channel::Channel;
use or_rtcompat::Runtime;
use std::net::SocketAddr;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything we need to know to open a channel to a relay.
#[derive(Clone, Debug)]
pub struct OwnedChanTarget {
    /// The address of the relay's OR port.
    addr: SocketAddr,
    /// The RSA identity of the relay.
    rsa_identity: RsaIdentity,
}

impl OwnedChanTarget {
    /// Construct a new OwnedChanTarget.
    pub fn new(addr: SocketAddr, rsa_identity: RsaIdentity) -> Self {
        OwnedChanTarget { addr, rsa_identity }
    }
    /// Return the address of this relay.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
    /// Return the RSA identity of this relay.
    pub fn rsa_identity(&self) -> &RsaIdentity {
        &self.rsa_identity
    }
}

/// An object that remembers a set of live channels, and launches new
/// ones on request.
///
/// Use the [`ChanMgr::get_or_launch`] function to get a [`Channel`].
///
/// A channel is kept open as long as there is a reference to it, or
/// something else (such as the relay or a network error) kills the
/// channel.
pub struct ChanMgr<R: Runtime> {
    /// Internal channel manager object that does the actual work.
    mgr: AbstractChanMgr<builder::ChanBuilder<R>>,
}

impl<R: Runtime> ChanMgr<R> {
    /// Construct a new channel manager.
    pub fn new(runtime: R) -> Self {
        let builder = builder::ChanBuilder::new(runtime);
        ChanMgr {
            mgr: AbstractChanMgr::new(builder),
        }
    }

    /// Try to get a suitable channel to the provided `target`,
    /// launching one if one does not exist.
    ///
    /// If there is already a channel launch attempt in progress, this
    /// function will wait until that launch is complete, and succeed
    /// or fail depending on its outcome.
    pub async fn get_or_launch(&self, target: &OwnedChanTarget) -> Result<Channel> {
        self.mgr.get_or_launch(target.clone()).await
    }

    /// Remove every closed channel from the manager.
    ///
    /// (This doesn't close anything: it just makes sure that the next
    /// request for a dead relay dials afresh.)
    pub fn remove_unusable_entries(&self) -> Result<()> {
        self.mgr.remove_unusable_entries()
    }
}
