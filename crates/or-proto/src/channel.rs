//! Code for talking directly (over a TLS connection) to a relay.
//!
//! Channels form the basis of the rest of the protocol: they are the
//! only way for two participants to talk.
//!
//! Channels are not useful directly for application requests: after
//! making a channel, it needs to get used to build circuits, and the
//! circuits are used to anonymize streams.
//!
//! To launch a channel:
//!
//!  * Create a TLS connection as an object that implements AsyncRead
//!    + AsyncWrite, and pass it to a [ChannelBuilder].  This will
//!    yield an [handshake::OutboundClientHandshake] that represents
//!    the state of the handshake.
//!  * Call [handshake::OutboundClientHandshake::connect] on the result
//!    to negotiate the rest of the handshake.  This will verify
//!    syntactic correctness of the handshake, but not its
//!    cryptographic integrity.
//!  * Call [handshake::UnverifiedChannel::check] on the result.  This
//!    finishes the checks against the expected peer.
//!  * Call [handshake::VerifiedChannel::finish] on the result. This
//!    completes the handshake and produces an open channel and
//!    Reactor.
//!  * Launch an asynchronous task to call the reactor's run() method.
//!
//! Once you have a running channel, you can create circuits on it
//! with its [Channel::new_circ] method.  See
//! [crate::circuit::PendingClientCirc] for information on how to
//! proceed from there.
//!
//! # Design
//!
//! This code splits the channel into two pieces: a "Channel" object
//! that can be used by circuits to write cells onto the channel, and
//! a "Reactor" object that runs as a task in the background, to read
//! channel cells and pass them to circuits as appropriate, and to
//! schedule outbound cells fairly across circuits.

/// The size of the channel buffer for communication between `Channel`
/// and its reactor.
pub const CHANNEL_BUFFER_SIZE: usize = 128;

pub(crate) mod circmap;
mod codec;
pub mod handshake;
mod reactor;
mod scheduler;
mod unique_id;

use crate::channel::reactor::{BoxedChannelSink, BoxedChannelStream, CtrlMsg, Reactor};
pub use crate::channel::unique_id::UniqId;
use crate::circuit;
use crate::circuit::celltypes::CreateResponse;
use crate::{Error, Result};
use or_cell::chancell::{msg::AnyChanMsg, AnyChanCell, ChanMsg, CircId};
use or_llcrypto::pk::rsa::RsaIdentity;
use std::pin::Pin;
use std::time::Duration;

use asynchronous_codec as futures_codec;
use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncRead, AsyncWrite};

use futures::{Sink, SinkExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::trace;

// reexport
use crate::channel::unique_id::CircUniqIdContext;
pub use handshake::{OutboundClientHandshake, UnverifiedChannel, VerifiedChannel};

/// Type alias: A Sink and Stream that transforms a TLS connection
/// into a cell-based communication mechanism.
type CellFrame<T> = futures_codec::Framed<T, crate::channel::codec::ChannelCodec>;

/// An estimate of how much our clock disagrees with a relay's, based
/// on its NETINFO cell.
///
/// This estimate is only made when the peer reports a nonzero
/// timestamp, and is only good to within the round-trip latency of
/// the handshake.  We use it for log warnings, nothing else.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ClockSkew {
    /// Our clock is ahead of the relay's, by the given amount.
    Fast(Duration),
    /// Our clock and the relay's agree to within our measurement
    /// tolerance.
    #[default]
    None,
    /// Our clock is behind the relay's, by the given amount.
    Slow(Duration),
}

impl ClockSkew {
    /// Smallest difference we bother reporting, in seconds; clock
    /// skews smaller than the handshake latency are noise.
    const MIN_SECS: u64 = 2;

    /// Construct a ClockSkew from a signed difference, in seconds,
    /// between our clock and the peer's.
    pub(crate) fn from_secs(secs: i64) -> Self {
        if secs >= Self::MIN_SECS as i64 {
            ClockSkew::Fast(Duration::from_secs(secs as u64))
        } else if secs <= -(Self::MIN_SECS as i64) {
            ClockSkew::Slow(Duration::from_secs((-secs) as u64))
        } else {
            ClockSkew::None
        }
    }

    /// Return true if this skew is worth warning about.
    pub fn is_skewed(&self) -> bool {
        !matches!(self, ClockSkew::None)
    }
}

/// An open client channel, ready to send and receive cells.
///
/// A channel is a direct connection to a relay, implemented using
/// TLS.
#[derive(Clone, Debug)]
pub struct Channel {
    /// The negotiated link protocol version.
    link_protocol: u16,
    /// A unique identifier for this channel.
    unique_id: UniqId,
    /// Validated RSA identity for this peer.
    peer_id: RsaIdentity,
    /// Our best guess at how wrong our clock is relative to the
    /// peer's.
    clock_skew: ClockSkew,
    /// If true, this channel is closing.
    closed: Arc<AtomicBool>,
    /// A channel used to send control messages to the Reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// A channel used to send cells to the Reactor.
    cell_tx: mpsc::Sender<AnyChanCell>,
}

impl Sink<AnyChanCell> for Channel {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.cell_tx)
            .poll_ready(cx)
            .map_err(|_| Error::ChannelClosed)
    }

    fn start_send(self: Pin<&mut Self>, cell: AnyChanCell) -> Result<()> {
        let this = self.get_mut();
        if this.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        this.check_cell(&cell)?;
        {
            use AnyChanMsg::*;
            match cell.msg() {
                Relay(_) | Padding(_) | Vpadding(_) => {} // too frequent to log.
                _ => trace!(
                    "{}: Sending {} for {}",
                    this.unique_id,
                    cell.msg().cmd(),
                    CircId::get_or_zero(cell.circid())
                ),
            }
        }

        Pin::new(&mut this.cell_tx)
            .start_send(cell)
            .map_err(|_| Error::ChannelClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.cell_tx)
            .poll_flush(cx)
            .map_err(|_| Error::ChannelClosed)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.cell_tx)
            .poll_close(cx)
            .map_err(|_| Error::ChannelClosed)
    }
}

/// Structure for building and launching a channel.
#[derive(Default)]
pub struct ChannelBuilder {
    /// If present, a description of the address we're trying to
    /// connect to, used in the NETINFO cell and log messages.
    target: Option<std::net::SocketAddr>,
}

impl ChannelBuilder {
    /// Construct a new ChannelBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the declared target address of this channel.
    ///
    /// Note that nothing enforces the correctness of this address: it
    /// doesn't have to match the real address target of the TLS
    /// stream.
    pub fn set_declared_addr(&mut self, target: std::net::SocketAddr) {
        self.target = Some(target);
    }

    /// Launch a new client handshake over a TLS stream.
    ///
    /// After calling this function, you'll need to call `connect()`
    /// on the result to start the handshake.  If that succeeds,
    /// you'll have authentication info from the relay: call `check()`
    /// on the result to check that.  Finally, to finish the
    /// handshake, call `finish()` on the result of _that_.
    pub fn launch<T>(self, tls: T) -> OutboundClientHandshake<T>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        handshake::OutboundClientHandshake::new(tls, self.target)
    }
}

impl Channel {
    /// Construct a channel and reactor.
    ///
    /// Internal method, called to finalize the channel when we've
    /// sent our netinfo cell, received the peer's netinfo cell, and
    /// we're finally ready to create circuits.
    fn new(
        link_protocol: u16,
        sink: BoxedChannelSink,
        stream: BoxedChannelStream,
        unique_id: UniqId,
        peer_id: RsaIdentity,
        clock_skew: ClockSkew,
        halflife: Duration,
    ) -> (Self, reactor::Reactor) {
        use circmap::{CircIdRange, CircMap};
        // We are the initiator, and clients have no identity of their
        // own: for the ID-range tie-break we compare as all-zero.
        let our_id = RsaIdentity::from([0_u8; 20]);
        let circmap = CircMap::new(CircIdRange::for_identities(&our_id, &peer_id));

        let (control_tx, control_rx) = mpsc::unbounded();
        let (cell_tx, cell_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let closed = Arc::new(AtomicBool::new(false));

        let channel = Channel {
            link_protocol,
            unique_id,
            peer_id,
            clock_skew,
            closed: Arc::clone(&closed),
            control: control_tx,
            cell_tx,
        };

        let reactor = Reactor::new(
            control_rx,
            cell_rx,
            stream,
            sink,
            circmap,
            unique_id,
            closed,
            CircUniqIdContext::new(),
            link_protocol,
            halflife,
        );

        (channel, reactor)
    }

    /// Return a process-unique identifier for this channel.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }

    /// Return the (legacy) RSA identity for the peer of this channel.
    pub fn peer_rsa_id(&self) -> &RsaIdentity {
        &self.peer_id
    }

    /// Return the negotiated link protocol version for this channel.
    pub fn link_protocol(&self) -> u16 {
        self.link_protocol
    }

    /// Return our estimate of the clock skew relative to this
    /// channel's peer.
    pub fn clock_skew(&self) -> ClockSkew {
        self.clock_skew
    }

    /// Return an error if this channel is somehow mismatched with the
    /// given target identity.
    pub fn check_match(&self, target: &RsaIdentity) -> Result<()> {
        if self.peer_rsa_id() != target {
            return Err(Error::ChanMismatch(format!(
                "Identity {} does not match target {}",
                self.peer_rsa_id(),
                target
            )));
        }
        Ok(())
    }

    /// Return true if this channel is closed and therefore unusable.
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Check whether a cell type is permissible to be _sent_ on an
    /// open client channel.
    fn check_cell(&self, cell: &AnyChanCell) -> Result<()> {
        use AnyChanMsg::*;
        let msg = cell.msg();
        match msg {
            Created(_) | CreatedFast(_) => Err(Error::from(or_error::internal!(
                "Can't send {} cell on client channel",
                msg.cmd()
            ))),
            Certs(_) | Versions(_) | AuthChallenge(_) | Netinfo(_) => {
                Err(Error::from(or_error::internal!(
                    "Can't send {} cell after handshake is done",
                    msg.cmd()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Transmit a single cell on a channel.
    pub async fn send_cell(&mut self, cell: AnyChanCell) -> Result<()> {
        self.send(cell).await?;

        Ok(())
    }

    /// Return a newly allocated PendingClientCirc object with a
    /// corresponding circuit reactor. A circuit ID is allocated, but
    /// no messages are sent, and no cryptography is done.
    ///
    /// To use the results of this method, call Reactor::run() in a
    /// new task, then use the methods of
    /// [crate::circuit::PendingClientCirc] to build the circuit.
    pub async fn new_circ(
        &self,
    ) -> Result<(circuit::PendingClientCirc, circuit::reactor::Reactor)> {
        if self.is_closing() {
            return Err(Error::ChannelClosed);
        }

        // TODO: blocking is risky, but so is unbounded.
        let (sender, receiver) = mpsc::channel(128);
        let (createdsender, createdreceiver) = oneshot::channel::<CreateResponse>();

        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::AllocateCircuit {
                created_sender: createdsender,
                sender,
                tx,
            })
            .map_err(|_| Error::ChannelClosed)?;
        let (id, circ_unique_id) = rx.await.map_err(|_| Error::ChannelClosed)??;

        trace!("{}: Allocated CircId {}", circ_unique_id, id);

        Ok(circuit::PendingClientCirc::new(
            id,
            self.clone(),
            createdreceiver,
            receiver,
            circ_unique_id,
        ))
    }

    /// Shut down this channel immediately, along with all circuits
    /// that are using it.
    ///
    /// Note that other references to this channel may exist.  If they
    /// do, they will stop working after you call this function.
    ///
    /// It's not necessary to call this method if you're just done
    /// with a channel: the channel should close on its own once
    /// nothing is using it any more.
    pub fn terminate(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }

    /// Tell the reactor that the circuit with the given ID has gone
    /// away.
    pub fn close_circuit(&self, circid: CircId) -> Result<()> {
        self.control
            .unbounded_send(CtrlMsg::CloseCircuit(circid))
            .map_err(|_| Error::ChannelClosed)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    // Most of this module is tested via tests that also check on the
    // reactor code; there are just a few more cases to examine here.
    #![allow(clippy::unwrap_used)]
    use super::*;
    pub(crate) use crate::channel::reactor::test::{new_reactor, CodecResult};
    use or_cell::chancell::msg;

    /// Make a new fake reactor-less channel.  For testing only,
    /// obviously.
    pub(crate) fn fake_channel() -> Channel {
        let unique_id = UniqId::new();
        Channel {
            link_protocol: 3,
            unique_id,
            peer_id: [10_u8; 20].into(),
            clock_skew: ClockSkew::None,
            closed: Arc::new(AtomicBool::new(false)),
            control: mpsc::unbounded().0,
            cell_tx: mpsc::channel(CHANNEL_BUFFER_SIZE).0,
        }
    }

    #[test]
    fn send_bad() {
        let chan = fake_channel();

        let cell = AnyChanCell::new(CircId::new(7), msg::Created::new(vec![0; 148]).into());
        let e = chan.check_cell(&cell);
        assert!(e.is_err());
        assert!(format!("{}", e.unwrap_err()).contains("Can't send CREATED cell"));

        let cell = AnyChanCell::new(None, msg::Certs::new_empty().into());
        let e = chan.check_cell(&cell);
        assert!(e.is_err());
        assert!(format!("{}", e.unwrap_err()).contains("Can't send CERTS cell"));

        let cell = AnyChanCell::new(CircId::new(5), msg::CreateFast::new(&[0_u8; 20][..]).into());
        let e = chan.check_cell(&cell);
        assert!(e.is_ok());
    }

    #[test]
    fn check_match() {
        let chan = fake_channel();

        assert!(chan.check_match(&RsaIdentity::from([10; 20])).is_ok());
        assert!(chan.check_match(&RsaIdentity::from([11; 20])).is_err());
    }

    #[test]
    fn unique_id() {
        let ch1 = fake_channel();
        let ch2 = fake_channel();
        assert_ne!(ch1.unique_id(), ch2.unique_id());
    }

    #[test]
    fn clock_skew_thresholds() {
        assert_eq!(ClockSkew::from_secs(0), ClockSkew::None);
        assert_eq!(ClockSkew::from_secs(1), ClockSkew::None);
        assert_eq!(
            ClockSkew::from_secs(60),
            ClockSkew::Fast(Duration::from_secs(60))
        );
        assert_eq!(
            ClockSkew::from_secs(-60),
            ClockSkew::Slow(Duration::from_secs(60))
        );
        assert!(ClockSkew::from_secs(-60).is_skewed());
        assert!(!ClockSkew::None.is_skewed());
    }
}
