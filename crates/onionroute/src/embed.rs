//! The embedding surface: a callback-and-handle API in the style of
//! the original C library.
//!
//! This module keeps its state in a single module-private slot,
//! initialized by [`init`], so that a host application gets the
//! "implicit context" feel of a C API while the rest of the library
//! stays explicit about its state.
//!
//! The rules of the road, which mirror the callback contract of the
//! original:
//!
//! * Callbacks are invoked from library context; the byte buffers
//!   they receive are valid only for the duration of the call.
//! * Each callback exists in a v1 form (no user data) and a v2 form
//!   (with the `user_data` value registered at `open_stream`).  Both
//!   may be registered; both fire.
//! * Received data can be consumed either from the data callback
//!   (push), or by polling [`recv_stream_data`] (pull): the library
//!   feeds the pull queue through [`queue_recvd_data`] in either
//!   case.

use crate::address::TorAddr;
use crate::client::OnionRouteClient;
use crate::config::OnionRouteConfig;
use crate::status::{BootstrapStatus, LogRecord, LogSeverity};
use crate::{Error, Result};

use or_hsclient::HsDescParser;
use or_netdir::DirProvider;
use or_rtcompat::PreferredRuntime;

use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::stream::StreamExt;
use or_rtcompat::SpawnExt;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// An opaque pointer-sized value that the host associates with a
/// stream at open time, and gets back in v2 callbacks.
pub type UserData = usize;

/// An opaque handle identifying one stream on the embedding surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct StreamHandle(u64);

/// Callback fired as bootstrapping proceeds.
pub type BootstrapCallback = Box<dyn Fn(BootstrapStatus, u8) + Send + Sync>;
/// Callback fired for library log records.
pub type LogCallback = Box<dyn Fn(&LogRecord) + Send + Sync>;
/// Callback fired when a stream finishes opening (v1).
pub type StreamOpenCallbackV1 = Box<dyn Fn(StreamHandle) + Send + Sync>;
/// Callback fired when a stream finishes opening (v2).
pub type StreamOpenCallbackV2 = Box<dyn Fn(StreamHandle, UserData) + Send + Sync>;
/// Callback fired when a stream closes (v1).
pub type StreamCloseCallbackV1 = Box<dyn Fn(StreamHandle) + Send + Sync>;
/// Callback fired when a stream closes (v2).
pub type StreamCloseCallbackV2 = Box<dyn Fn(StreamHandle, UserData) + Send + Sync>;
/// Callback fired when stream data arrives (v1).
pub type StreamRecvCallbackV1 = Box<dyn Fn(StreamHandle, &[u8]) + Send + Sync>;
/// Callback fired when stream data arrives (v2).
pub type StreamRecvCallbackV2 = Box<dyn Fn(StreamHandle, UserData, &[u8]) + Send + Sync>;

/// The set of callbacks the host has registered.
#[derive(Default)]
struct Callbacks {
    /// Bootstrap progress callback.
    bootstrap: Option<BootstrapCallback>,
    /// Log sink callback.
    log: Option<LogCallback>,
    /// Stream-open callbacks.
    open_v1: Option<StreamOpenCallbackV1>,
    /// Stream-open callback with user data.
    open_v2: Option<StreamOpenCallbackV2>,
    /// Stream-close callbacks.
    close_v1: Option<StreamCloseCallbackV1>,
    /// Stream-close callback with user data.
    close_v2: Option<StreamCloseCallbackV2>,
    /// Data-received callbacks.
    recv_v1: Option<StreamRecvCallbackV1>,
    /// Data-received callback with user data.
    recv_v2: Option<StreamRecvCallbackV2>,
}

/// A command from the synchronous surface to a stream's driver task.
enum StreamCmd {
    /// Send these bytes, then flush.
    Flush(Vec<u8>),
    /// Close the stream.
    Close,
}

/// Per-stream state kept on behalf of the host.
struct StreamState {
    /// The host's opaque value for this stream.
    user_data: UserData,
    /// Bytes written but not yet flushed into cells.
    write_buf: Vec<u8>,
    /// Received bytes awaiting `recv_stream_data`.
    recv_queue: VecDeque<u8>,
    /// Set once the stream has closed.
    closed: bool,
    /// Channel to the stream's driver task.
    cmd_tx: mpsc::UnboundedSender<StreamCmd>,
}

/// State shared between the synchronous surface and the driver
/// tasks.
#[derive(Default)]
struct Shared {
    /// Registered callbacks.
    callbacks: Mutex<Callbacks>,
    /// All live streams.
    streams: Mutex<HashMap<StreamHandle, StreamState>>,
    /// Next handle to allocate.
    next_handle: AtomicU64,
    /// Current configuration, for `set_conf` to amend.
    config: Mutex<OnionRouteConfig>,
    /// Signal to make `run_main_loop` return.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The library's context, stored in [`CONTEXT`].
struct EmbedCtx {
    /// The runtime driving everything.
    runtime: PreferredRuntime,
    /// The client itself.
    client: Arc<OnionRouteClient<PreferredRuntime>>,
    /// State shared with driver tasks.
    shared: Arc<Shared>,
}

/// The single module-private context slot.
static CONTEXT: Mutex<Option<EmbedCtx>> = Mutex::new(None);

/// Run `f` with the context, or fail if the library is not
/// initialized.
fn with_ctx<T>(f: impl FnOnce(&EmbedCtx) -> Result<T>) -> Result<T> {
    let guard = CONTEXT.lock().expect("context poisoned");
    match &*guard {
        Some(ctx) => f(ctx),
        None => Err(Error::InitState),
    }
}

/// Initialize the library.
///
/// The caller provides the two external collaborators (the directory
/// provider and the descriptor parser) along with the initial
/// configuration.  Call exactly once before anything else; returns an
/// error if already initialized.
pub fn init(
    dir: Arc<dyn DirProvider>,
    parser: Arc<dyn HsDescParser>,
    config: OnionRouteConfig,
) -> Result<()> {
    let mut guard = CONTEXT.lock().expect("context poisoned");
    if guard.is_some() {
        return Err(Error::InitState);
    }
    let runtime = PreferredRuntime::create()
        .map_err(|e| Error::Bug(or_error::Bug::from_error(e, "cannot create runtime")))?;
    let client = OnionRouteClient::new(runtime.clone(), dir, parser, config.clone());
    let shared = Arc::new(Shared::default());
    *shared.config.lock().expect("config poisoned") = config;
    *guard = Some(EmbedCtx {
        runtime,
        client,
        shared,
    });
    Ok(())
}

/// Tear down the library: every circuit and channel is abandoned,
/// and a pending `run_main_loop` returns.
///
/// Idempotent: shutting down an uninitialized library is a no-op.
pub fn shutdown() -> Result<()> {
    let ctx = CONTEXT.lock().expect("context poisoned").take();
    if let Some(ctx) = ctx {
        if let Some(tx) = ctx
            .shared
            .shutdown
            .lock()
            .expect("shutdown poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }
    Ok(())
}

/// Run the library's main loop on the calling thread.
///
/// This bootstraps the client, then drives every channel, circuit,
/// and stream until [`shutdown`] is called.  All callbacks fire from
/// this thread.
pub fn run_main_loop() -> Result<()> {
    let (runtime, client, shared) = with_ctx(|ctx| {
        Ok((
            ctx.runtime.clone(),
            Arc::clone(&ctx.client),
            Arc::clone(&ctx.shared),
        ))
    })?;
    let (tx, rx) = oneshot::channel();
    *shared.shutdown.lock().expect("shutdown poisoned") = Some(tx);

    let spawner = runtime.clone();
    runtime.block_on(async move {
        // Relay bootstrap progress to the host.
        {
            let shared = Arc::clone(&shared);
            let mut events = client.bootstrap_events();
            let _ = spawner.spawn(async move {
                while let Some(status) = events.next().await {
                    let callbacks = shared.callbacks.lock().expect("callbacks poisoned");
                    if let Some(cb) = &callbacks.bootstrap {
                        cb(status, status.progress());
                    }
                }
            });
        }

        if let Err(e) = client.bootstrap().await {
            emit_log(
                &shared,
                LogSeverity::Err,
                format!("bootstrap failed: {}", e),
            );
            return Err(e);
        }
        client.launch_background_tasks()?;

        // Park until shutdown; every task runs under this block_on.
        let _ = rx.await;
        Ok(())
    })
}

/// Re-parse configuration, as the original `setconf` call did.
///
/// Takes effect at the next safe point.
pub fn set_conf(body: &str, use_defaults: bool) -> Result<()> {
    with_ctx(|ctx| {
        let new_config = {
            let mut config = ctx.shared.config.lock().expect("config poisoned");
            config.apply_text(body, use_defaults)?;
            config.clone()
        };
        ctx.client.reconfigure(new_config);
        Ok(())
    })
}

/// Register the bootstrap-progress callback.
pub fn set_bootstrap_callback(cb: BootstrapCallback) -> Result<()> {
    with_callbacks(|c| c.bootstrap = Some(cb))
}

/// Register the structured-log callback.
pub fn set_log_callback(cb: LogCallback) -> Result<()> {
    with_callbacks(|c| c.log = Some(cb))
}

/// Register the v1 stream-open callback.
pub fn set_stream_open_callback_v1(cb: StreamOpenCallbackV1) -> Result<()> {
    with_callbacks(|c| c.open_v1 = Some(cb))
}

/// Register the v2 stream-open callback.
pub fn set_stream_open_callback_v2(cb: StreamOpenCallbackV2) -> Result<()> {
    with_callbacks(|c| c.open_v2 = Some(cb))
}

/// Register the v1 stream-close callback.
pub fn set_stream_close_callback_v1(cb: StreamCloseCallbackV1) -> Result<()> {
    with_callbacks(|c| c.close_v1 = Some(cb))
}

/// Register the v2 stream-close callback.
pub fn set_stream_close_callback_v2(cb: StreamCloseCallbackV2) -> Result<()> {
    with_callbacks(|c| c.close_v2 = Some(cb))
}

/// Register the v1 data-received callback.
pub fn set_stream_data_received_callback_v1(cb: StreamRecvCallbackV1) -> Result<()> {
    with_callbacks(|c| c.recv_v1 = Some(cb))
}

/// Register the v2 data-received callback.
pub fn set_stream_data_received_callback_v2(cb: StreamRecvCallbackV2) -> Result<()> {
    with_callbacks(|c| c.recv_v2 = Some(cb))
}

/// Helper: mutate the callback set.
fn with_callbacks(f: impl FnOnce(&mut Callbacks)) -> Result<()> {
    with_ctx(|ctx| {
        let mut callbacks = ctx.shared.callbacks.lock().expect("callbacks poisoned");
        f(&mut callbacks);
        Ok(())
    })
}

/// Begin opening an anonymized stream to `addr`:`port`.
///
/// Returns a handle immediately; the stream open completes in the
/// background.  On success the open callback fires; if the stream can
/// never be opened, the close callback fires instead (and the open
/// callback never does).
pub fn open_stream(addr: &str, port: u16, user_data: UserData) -> Result<StreamHandle> {
    with_ctx(|ctx| {
        let target = TorAddr::new(addr, port)?;
        let handle = StreamHandle(ctx.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let (cmd_tx, cmd_rx) = mpsc::unbounded();
        ctx.shared.streams.lock().expect("streams poisoned").insert(
            handle,
            StreamState {
                user_data,
                write_buf: Vec::new(),
                recv_queue: VecDeque::new(),
                closed: false,
                cmd_tx,
            },
        );

        let client = Arc::clone(&ctx.client);
        let shared = Arc::clone(&ctx.shared);
        ctx.runtime
            .spawn(drive_stream(client, shared, handle, target, cmd_rx))
            .map_err(|e| Error::Bug(or_error::Bug::from_error(e, "cannot spawn stream task")))?;
        Ok(handle)
    })
}

/// Close a stream.  Idempotent: closing an unknown or already-closed
/// handle succeeds.
pub fn close_stream(handle: StreamHandle) -> Result<()> {
    with_ctx(|ctx| {
        if let Some(state) = ctx
            .shared
            .streams
            .lock()
            .expect("streams poisoned")
            .get_mut(&handle)
        {
            let _ = state.cmd_tx.unbounded_send(StreamCmd::Close);
        }
        Ok(())
    })
}

/// Append bytes to a stream's write buffer.
///
/// The bytes are not packaged into cells until `flush_stream` is
/// called.  Returns the number of bytes buffered.
pub fn write_stream(handle: StreamHandle, data: &[u8]) -> Result<usize> {
    with_ctx(|ctx| {
        let mut streams = ctx.shared.streams.lock().expect("streams poisoned");
        let state = streams.get_mut(&handle).ok_or(Error::NoSuchStream)?;
        if state.closed {
            return Err(Error::NoSuchStream);
        }
        state.write_buf.extend_from_slice(data);
        Ok(data.len())
    })
}

/// Formatted-write convenience, in the spirit of the original's
/// printf-style helper.
pub fn write_stream_fmt(handle: StreamHandle, args: std::fmt::Arguments<'_>) -> Result<usize> {
    write_stream(handle, args.to_string().as_bytes())
}

/// Package as much buffered data as possible into cells.
pub fn flush_stream(handle: StreamHandle) -> Result<()> {
    with_ctx(|ctx| {
        let mut streams = ctx.shared.streams.lock().expect("streams poisoned");
        let state = streams.get_mut(&handle).ok_or(Error::NoSuchStream)?;
        let bytes = std::mem::take(&mut state.write_buf);
        if !bytes.is_empty() {
            let _ = state.cmd_tx.unbounded_send(StreamCmd::Flush(bytes));
        }
        Ok(())
    })
}

/// Synchronously pull up to `buf.len()` received bytes from the
/// stream's queue.
///
/// Returns 0 when no data is queued (including after close); this is
/// the non-blocking replacement for a `read()` on a socket.
pub fn recv_stream_data(handle: StreamHandle, buf: &mut [u8]) -> Result<usize> {
    with_ctx(|ctx| {
        let mut streams = ctx.shared.streams.lock().expect("streams poisoned");
        let state = streams.get_mut(&handle).ok_or(Error::NoSuchStream)?;
        let n = std::cmp::min(buf.len(), state.recv_queue.len());
        for (i, b) in state.recv_queue.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    })
}

/// Append bytes to a stream's pull queue.
///
/// The library calls this itself for every received chunk; it is
/// public because the original exposed it so a host could feed the
/// queue from its own data callback.
pub fn queue_recvd_data(handle: StreamHandle, data: &[u8]) -> Result<()> {
    with_ctx(|ctx| queue_recvd_data_inner(&ctx.shared, handle, data))
}

/// Record that a stream has closed, making the handle inert.
pub fn queue_closed_stream(handle: StreamHandle) -> Result<()> {
    with_ctx(|ctx| {
        note_stream_closed(&ctx.shared, handle);
        Ok(())
    })
}

/// Drop every cached DNS answer.
pub fn clear_dns_cache_signal() -> Result<()> {
    with_ctx(|ctx| {
        ctx.client.clear_dns_cache();
        Ok(())
    })
}

/// Stop using every current circuit ("new identity").
pub fn switch_to_new_circuits() -> Result<()> {
    with_ctx(|ctx| {
        ctx.client.switch_to_new_circuits();
        Ok(())
    })
}

/// Internal: append received bytes to the pull queue.
fn queue_recvd_data_inner(shared: &Shared, handle: StreamHandle, data: &[u8]) -> Result<()> {
    let mut streams = shared.streams.lock().expect("streams poisoned");
    let state = streams.get_mut(&handle).ok_or(Error::NoSuchStream)?;
    state.recv_queue.extend(data.iter().copied());
    Ok(())
}

/// Internal: fire the close callbacks (once) and mark the stream
/// closed.
fn note_stream_closed(shared: &Shared, handle: StreamHandle) {
    let user_data = {
        let mut streams = shared.streams.lock().expect("streams poisoned");
        match streams.get_mut(&handle) {
            Some(state) if !state.closed => {
                state.closed = true;
                Some(state.user_data)
            }
            _ => None,
        }
    };
    if let Some(user_data) = user_data {
        let callbacks = shared.callbacks.lock().expect("callbacks poisoned");
        if let Some(cb) = &callbacks.close_v1 {
            cb(handle);
        }
        if let Some(cb) = &callbacks.close_v2 {
            cb(handle, user_data);
        }
    }
}

/// Internal: emit a log record to the host, if it wants them.
fn emit_log(shared: &Shared, severity: LogSeverity, message: String) {
    let callbacks = shared.callbacks.lock().expect("callbacks poisoned");
    if let Some(cb) = &callbacks.log {
        cb(&LogRecord::new(severity, message));
    }
}

/// The driver task for one stream: connect, pump bytes in both
/// directions, and report events back to the host.
async fn drive_stream(
    client: Arc<OnionRouteClient<PreferredRuntime>>,
    shared: Arc<Shared>,
    handle: StreamHandle,
    target: TorAddr,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>,
) {
    let stream = match client.connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            emit_log(
                &shared,
                LogSeverity::Warn,
                format!("stream to {} failed: {}", target, e),
            );
            // The open callback never fires for a failed stream; the
            // close callback reports its fate.
            note_stream_closed(&shared, handle);
            return;
        }
    };

    // The stream is open end-to-end: tell the host.
    {
        let user_data = shared
            .streams
            .lock()
            .expect("streams poisoned")
            .get(&handle)
            .map(|s| s.user_data);
        if let Some(user_data) = user_data {
            let callbacks = shared.callbacks.lock().expect("callbacks poisoned");
            if let Some(cb) = &callbacks.open_v1 {
                cb(handle);
            }
            if let Some(cb) = &callbacks.open_v2 {
                cb(handle, user_data);
            }
        }
    }

    let (mut reader, mut writer) = stream.split();

    // Outbound: flush commands from the host.
    let write_loop = async move {
        while let Some(cmd) = cmd_rx.next().await {
            match cmd {
                StreamCmd::Flush(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
                StreamCmd::Close => {
                    let _ = writer.close().await;
                    break;
                }
            }
        }
    };

    // Inbound: push received bytes at the host.
    let shared_r = Arc::clone(&shared);
    let read_loop = async move {
        let mut buf = [0_u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = &buf[..n];
                    let _ = queue_recvd_data_inner(&shared_r, handle, data);
                    let user_data = shared_r
                        .streams
                        .lock()
                        .expect("streams poisoned")
                        .get(&handle)
                        .map(|s| s.user_data);
                    if let Some(user_data) = user_data {
                        let callbacks = shared_r.callbacks.lock().expect("callbacks poisoned");
                        if let Some(cb) = &callbacks.recv_v1 {
                            cb(handle, data);
                        }
                        if let Some(cb) = &callbacks.recv_v2 {
                            cb(handle, user_data, data);
                        }
                    }
                }
            }
        }
    };

    futures::join!(write_loop, read_loop);
    note_stream_closed(&shared, handle);
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    // NOTE: these tests share the process-global context slot, so
    // they must not run while it is initialized; each test cleans up
    // after itself.

    #[test]
    fn uninitialized_errors() {
        // Everything (except shutdown) fails cleanly before init.
        assert!(matches!(set_conf("", false), Err(Error::InitState)));
        assert!(matches!(
            open_stream("www.example.com", 80, 0),
            Err(Error::InitState)
        ));
        assert!(matches!(
            write_stream(StreamHandle(3), b"hi"),
            Err(Error::InitState)
        ));
        assert!(shutdown().is_ok()); // idempotent no-op
    }
}
