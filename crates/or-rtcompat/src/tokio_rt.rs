//! Implementation of the runtime traits on top of Tokio.
//!
//! We drive everything from a current-thread Tokio executor: the
//! embedding host's `run_main_loop()` becomes a single cooperative
//! reactor thread, which is the concurrency model the rest of the
//! library assumes.

use crate::traits::{CertifiedConn, SleepProvider, TcpProvider, TlsConnector, TlsProvider};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::{FutureObj, Spawn, SpawnError};
use futures::Future;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

/// The runtime we recommend (and provide) for using this library:
/// Tokio plus native-tls.
#[derive(Clone)]
pub struct PreferredRuntime {
    /// The (shared, owned) tokio runtime that drives our tasks.
    runtime: Arc<tokio::runtime::Runtime>,
}

impl std::fmt::Debug for PreferredRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferredRuntime").finish_non_exhaustive()
    }
}

impl PreferredRuntime {
    /// Create a new runtime backed by a current-thread Tokio executor.
    ///
    /// Tasks spawned on this runtime make progress only while some
    /// thread is inside [`PreferredRuntime::block_on`]; that is the
    /// library's "main loop".
    pub fn create() -> IoResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(PreferredRuntime {
            runtime: Arc::new(runtime),
        })
    }

    /// Run `future` to completion, driving every spawned task in the
    /// meantime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Spawn for PreferredRuntime {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        self.runtime.handle().spawn(future);
        Ok(())
    }
}

impl SleepProvider for PreferredRuntime {
    type SleepFuture = Pin<Box<tokio::time::Sleep>>;
    fn sleep(&self, duration: Duration) -> Self::SleepFuture {
        // Entering the runtime binds the sleep to our timer driver, so
        // the future may be created from any thread.
        let _guard = self.runtime.handle().enter();
        Box::pin(tokio::time::sleep(duration))
    }
}

#[async_trait]
impl TcpProvider for PreferredRuntime {
    type TcpStream = Compat<tokio::net::TcpStream>;

    async fn connect(&self, addr: &SocketAddr) -> IoResult<Self::TcpStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream.compat())
    }
}

impl<S> TlsProvider<S> for PreferredRuntime
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Connector = NativeTlsConnector<S>;
    type TlsStream = async_native_tls::TlsStream<S>;

    fn tls_connector(&self) -> Self::Connector {
        NativeTlsProvider::default().tls_connector()
    }
}

/// A TlsProvider that uses `native_tls` and works over any
/// futures-flavored stream type.
pub struct NativeTlsProvider<S = ()> {
    /// Marker to say that we don't own any values of type S.
    _phantom: PhantomData<fn(S) -> S>,
}

impl<S> Default for NativeTlsProvider<S> {
    fn default() -> Self {
        NativeTlsProvider {
            _phantom: PhantomData,
        }
    }
}

impl<S> Clone for NativeTlsProvider<S> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<S> NativeTlsProvider<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Return a connector configured for the link protocol.
    fn tls_connector(&self) -> NativeTlsConnector<S> {
        // The link protocol authenticates relays *above* the TLS
        // layer; relay "certificates" are self-signed throwaways, so
        // certificate validation must be off here.
        let connector = async_native_tls::TlsConnector::new()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .use_sni(false);
        NativeTlsConnector {
            connector,
            _phantom: PhantomData,
        }
    }
}

/// A connector object used to build TLS connections with `native_tls`.
pub struct NativeTlsConnector<S> {
    /// The inner connector object
    connector: async_native_tls::TlsConnector,
    /// Marker to say that we don't own any values of type S.
    _phantom: PhantomData<fn(S) -> S>,
}

impl<S> Unpin for NativeTlsConnector<S> {}

#[async_trait]
impl<S> TlsConnector<S> for NativeTlsConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Conn = async_native_tls::TlsStream<S>;

    async fn negotiate_unvalidated(&self, stream: S, sni_hostname: &str) -> IoResult<Self::Conn> {
        self.connector
            .connect(sni_hostname, stream)
            .await
            .map_err(|e| IoError::new(IoErrorKind::Other, e))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> CertifiedConn for async_native_tls::TlsStream<S> {
    fn peer_certificate(&self) -> IoResult<Option<Vec<u8>>> {
        let cert = self
            .peer_certificate()
            .map_err(|e| IoError::new(IoErrorKind::Other, e))?;
        match cert {
            Some(c) => {
                let der = c
                    .to_der()
                    .map_err(|e| IoError::new(IoErrorKind::Other, e))?;
                Ok(Some(der))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::SleepProviderExt;
    use futures::task::SpawnExt;

    #[test]
    fn sleep_and_spawn() {
        crate::test_with_one_runtime!(|rt| async move {
            let (tx, rx) = futures::channel::oneshot::channel();
            rt.spawn(async move {
                let _ = tx.send(17_u8);
            })
            .unwrap();
            let v = rt
                .timeout(Duration::from_secs(5), rx)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(v, 17);
        });
    }

    #[test]
    fn now_advances() {
        crate::test_with_one_runtime!(|rt| async move {
            let t1 = rt.now();
            rt.sleep(Duration::from_millis(10)).await;
            assert!(rt.now() >= t1 + Duration::from_millis(10));
        });
    }
}
