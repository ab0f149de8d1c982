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

mod connect;
mod desc;
mod err;
mod hsid;
mod state;

pub use desc::{HsDesc, HsDescParser, IntroPoint};
pub use err::Error;
pub use hsid::HsId;

use or_circmgr::CircMgr;
use or_netdir::DirProvider;
use or_proto::circuit::ClientCirc;
use or_rtcompat::Runtime;
use std::sync::{Arc, Mutex};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An object that negotiates connections with hidden services.
///
/// There should be a single one of these per client; it remembers
/// which introduction points have been misbehaving, caches joined
/// rendezvous circuits, and holds the client-authorization cookies
/// from the configuration.
pub struct HsClientConnector<R: Runtime> {
    /// The runtime, used for timing.
    runtime: R,
    /// A CircMgr that we use to build circuits to HsDirs,
    /// introduction points, and rendezvous points.
    circmgr: Arc<CircMgr<R>>,
    /// A view of the network directory, for picking rendezvous points
    /// and responsible directories.
    dir: Arc<dyn DirProvider>,
    /// The descriptor parser provided by the embedder.
    parser: Arc<dyn HsDescParser>,
    /// Information we are remembering about different services.
    services: Mutex<state::Services>,
}

impl<R: Runtime> HsClientConnector<R> {
    /// Create a new `HsClientConnector`.
    pub fn new(
        runtime: R,
        circmgr: Arc<CircMgr<R>>,
        dir: Arc<dyn DirProvider>,
        parser: Arc<dyn HsDescParser>,
    ) -> Self {
        HsClientConnector {
            runtime,
            circmgr,
            dir,
            parser,
            services: Mutex::new(state::Services::default()),
        }
    }

    /// Register a client-authorization cookie for a service
    /// (the "HidServAuth" setting).
    pub fn set_auth_cookie(&self, hsid: HsId, cookie: Vec<u8>) {
        self.services
            .lock()
            .expect("services poisoned")
            .set_auth_cookie(hsid, cookie);
    }

    /// Forget every cached rendezvous circuit.
    pub fn retire_all_circuits(&self) {
        self.services
            .lock()
            .expect("services poisoned")
            .clear_circuits();
    }

    /// Return a circuit that ends (virtually) at the service
    /// identified by `hsid`, connecting if we don't have one.
    ///
    /// Streams targeting the service should be attached to the
    /// returned circuit exactly as for an ordinary exit circuit.
    pub async fn get_or_launch_connection(&self, hsid: HsId) -> Result<ClientCirc> {
        // Reuse a joined circuit when we have one.
        let (cached, auth) = {
            let mut services = self.services.lock().expect("services poisoned");
            (services.joined_circuit(&hsid), services.auth_cookie(&hsid))
        };
        if let Some(circ) = cached {
            return Ok(circ);
        }

        let circ = connect::connect(self, hsid, auth).await?;
        self.services
            .lock()
            .expect("services poisoned")
            .note_joined_circuit(hsid, circ.clone());
        Ok(circ)
    }
}
