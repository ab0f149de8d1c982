//! Implement a concrete channel factory that dials a relay over TCP,
//! wraps the connection in TLS, and runs the channel handshake.

use crate::mgr::ChannelFactory;
use crate::{Error, OwnedChanTarget, Result};

use async_trait::async_trait;
use or_proto::channel::{Channel, ChannelBuilder};
use or_rtcompat::{Runtime, SpawnExt, TlsConnector, TlsProvider};
use tracing::debug;

/// The factory that builds our real channels.
pub(crate) struct ChanBuilder<R: Runtime> {
    /// The runtime used to dial, wrap, and spawn.
    runtime: R,
}

impl<R: Runtime> ChanBuilder<R> {
    /// Construct a new ChanBuilder.
    pub(crate) fn new(runtime: R) -> Self {
        ChanBuilder { runtime }
    }
}

#[async_trait]
impl<R: Runtime> ChannelFactory for ChanBuilder<R> {
    type Channel = Channel;

    async fn build_channel(&self, target: &OwnedChanTarget) -> Result<Channel> {
        let addr = target.addr();
        debug!("Negotiating TLS with {}", addr);

        // 1. Connect and wrap in TLS.
        let stream = self
            .runtime
            .connect(&addr)
            .await
            .map_err(|e| Error::from_io(addr, e))?;
        let connector = <R as TlsProvider<R::TcpStream>>::tls_connector(&self.runtime);
        let tls = connector
            .negotiate_unvalidated(stream, &addr.ip().to_string())
            .await
            .map_err(|e| Error::from_io(addr, e))?;

        // 2. Negotiate the channel itself.
        let mut builder = ChannelBuilder::new();
        builder.set_declared_addr(addr);
        let unverified = builder.launch(tls).connect().await?;
        let verified = unverified.check(target.rsa_identity())?;
        let (chan, reactor) = verified.finish().await?;

        // 3. Launch a task to run the channel reactor.
        self.runtime
            .spawn(async {
                let _ = reactor.run().await;
            })
            .map_err(|e| Error::Spawn {
                spawning: "channel reactor",
                cause: std::sync::Arc::new(e),
            })?;
        Ok(chan)
    }
}
