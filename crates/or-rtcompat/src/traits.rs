//! Declarations for the traits that make up a [`Runtime`].

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::Spawn;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

/// A runtime that the rest of the library can use to drive itself.
///
/// This is a combination trait: anything that can spawn tasks, tell
/// the time, sleep, open TCP connections, and negotiate TLS over them
/// qualifies.  There is a blanket implementation, so you never
/// implement `Runtime` directly; implement the component traits
/// instead.
pub trait Runtime:
    Sync + Send + Spawn + Clone + SleepProvider + TcpProvider + TlsProvider<Self::TcpStream> + 'static
{
}

impl<T> Runtime for T where
    T: Sync
        + Send
        + Spawn
        + Clone
        + SleepProvider
        + TcpProvider
        + TlsProvider<Self::TcpStream>
        + 'static
{
}

/// Trait for a runtime that can wait until a timer has expired.
///
/// Every `SleepProvider` also implements [`SleepProviderExt`](crate::SleepProviderExt);
/// see that trait for timeout helpers.
pub trait SleepProvider: Clone + Send + Sync + 'static {
    /// A future returned by [`SleepProvider::sleep()`].
    type SleepFuture: futures::Future<Output = ()> + Send + 'static;

    /// Return a future that will be ready after `duration` has elapsed.
    #[must_use = "sleep() does nothing unless the future is awaited"]
    fn sleep(&self, duration: Duration) -> Self::SleepFuture;

    /// Return this runtime's view of the current instant.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Return this runtime's view of the current wall-clock time.
    fn wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Trait for a runtime that can make outgoing TCP connections.
#[async_trait]
pub trait TcpProvider: Clone + Send + Sync + 'static {
    /// The type for the TCP connections returned by this provider.
    type TcpStream: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static;

    /// Launch a TCP connection to a given socket address.
    async fn connect(&self, addr: &SocketAddr) -> IoResult<Self::TcpStream>;
}

/// An object with a peer certificate: typically a TLS connection.
pub trait CertifiedConn {
    /// Try to return the (DER-encoded) peer certificate for this
    /// connection, if any.
    fn peer_certificate(&self) -> IoResult<Option<Vec<u8>>>;
}

/// An object that knows how to wrap a TCP connection (or some other
/// stream) with TLS.
#[async_trait]
pub trait TlsConnector<S>: Send + Sync {
    /// The type of connection returned by this connector.
    type Conn: AsyncRead + AsyncWrite + CertifiedConn + Unpin + Send + 'static;

    /// Start a TLS session over the provided stream.
    ///
    /// Declare `sni_hostname` as the desired hostname, but don't
    /// actually check whether the certificate matches it, or whether
    /// it is signed by a recognized authority: the onion-routing link
    /// protocol authenticates relays by other means, above the TLS
    /// layer.
    async fn negotiate_unvalidated(&self, stream: S, sni_hostname: &str) -> IoResult<Self::Conn>;
}

/// Trait for a runtime that knows how to create TLS connections over a
/// given stream type, and objects to represent those connections.
pub trait TlsProvider<S>: Clone + Send + Sync + 'static {
    /// The connector object that this provider uses.
    type Connector: TlsConnector<S, Conn = Self::TlsStream> + Send + Sync + Unpin;

    /// The type of the stream returned by that connector.
    type TlsStream: AsyncRead + AsyncWrite + CertifiedConn + Unpin + Send + 'static;

    /// Return a TLS connector for use with this runtime.
    fn tls_connector(&self) -> Self::Connector;
}
