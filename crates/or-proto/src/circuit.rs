//! Multi-hop paths over the onion-routing network.
//!
//! # Overview
//!
//! This module is for creating *circuits*: layered-crypto tunnels
//! through the network.  A circuit is built hop by hop: the first hop
//! is created with a CREATE (or CREATE_FAST) handshake on a channel,
//! and each later hop is added with an EXTEND handshake relayed
//! through the existing hops.  Once a circuit is open, streams can be
//! attached to it.
//!
//! Each circuit is driven by its own reactor task, which owns all of
//! the circuit's mutable state: the cryptographic layers, the flow
//! control windows, and the map of live streams.  The [`ClientCirc`]
//! type is a cheap cloneable handle that talks to the reactor over a
//! control queue.

pub(crate) mod celltypes;
pub(crate) mod halfcirc;
pub(crate) mod halfstream;
pub mod reactor;
pub(crate) mod sendme;
pub(crate) mod streammap;
mod unique_id;

use crate::channel::circmap::CircuitRxReceiver;
use crate::channel::Channel;
use crate::circuit::celltypes::CreateResponse;
use crate::circuit::reactor::{CircHandshake, CtrlMsg, Reactor};
use crate::crypto::cell::HopNum;
use crate::stream::{DataStream, ResolveStream, StreamParameters, StreamReader};
use crate::{Error, Result};
use or_bytes::SecretBuf;
use or_cell::chancell::CircId;
use or_cell::relaycell::msg::{AnyRelayMsg, Begin, BeginDir, Resolve, Resolved, ResolvedVal};
use or_cell::relaycell::{RelayCmd, StreamId};
use or_llcrypto::pk::rsa::RsaIdentity;

use futures::channel::{mpsc, oneshot};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

pub use unique_id::UniqId;

/// The size of the buffer for communication between a circuit and its
/// streams.
pub const STREAM_READER_BUFFER: usize = 128;

/// Description of the network's current rules for building circuits.
///
/// These are derived from the consensus parameters, possibly amended
/// by our own configuration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CircParameters {
    /// Initial value for the flow-control window on each hop of a
    /// circuit.
    pub initial_send_window: u16,
}

impl Default for CircParameters {
    fn default() -> Self {
        CircParameters {
            initial_send_window: 1000,
        }
    }
}

/// Everything we need to know to build a circuit through (or extend a
/// circuit to) a given relay.
#[derive(Clone, Debug)]
pub struct OwnedCircTarget {
    /// IPv4 address of the relay's OR port.
    addr: Ipv4Addr,
    /// The relay's OR port.
    port: u16,
    /// RSA identity fingerprint of the relay.
    rsa_identity: RsaIdentity,
    /// The relay's onion key, DER encoded.
    onion_key_der: Vec<u8>,
}

impl OwnedCircTarget {
    /// Construct a new OwnedCircTarget.
    pub fn new(addr: Ipv4Addr, port: u16, rsa_identity: RsaIdentity, onion_key_der: Vec<u8>) -> Self {
        OwnedCircTarget {
            addr,
            port,
            rsa_identity,
            onion_key_der,
        }
    }

    /// Return the address of this relay.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
    /// Return the OR port of this relay.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// Return the RSA identity of this relay.
    pub fn rsa_identity(&self) -> &RsaIdentity {
        &self.rsa_identity
    }
    /// Return the DER-encoded onion key of this relay.
    pub fn onion_key_der(&self) -> &[u8] {
        &self.onion_key_der
    }
}

/// A circuit that we have constructed over the onion-routing network.
///
/// This struct is the interface used by the rest of the code, It is
/// fairly cheaply cloneable.  None of the public methods need mutable
/// access, since they all actually communicate with the Reactor which
/// contains the primary state.
#[derive(Clone)]
pub struct ClientCirc {
    /// Number of hops on this circuit, as set up so far.
    ///
    /// (This is shared with the reactor, which is the only writer.)
    num_hops: Arc<AtomicU8>,
    /// The unique identifier of this circuit.
    unique_id: UniqId,
    /// The channel-local identifier of this circuit.
    circid: CircId,
    /// A control queue to the circuit's reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// True if the reactor is closed or closing.
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ClientCirc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCirc")
            .field("unique_id", &self.unique_id)
            .field("circid", &self.circid)
            .finish_non_exhaustive()
    }
}

impl ClientCirc {
    /// Return a process-unique identifier for this circuit.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }

    /// Return the number of hops on this circuit.
    pub fn n_hops(&self) -> usize {
        self.num_hops.load(Ordering::SeqCst) as usize
    }

    /// Return true if this circuit is closed and therefore unusable.
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Helper: return the last hop of the circuit, or an error if
    /// there is none.
    fn last_hop(&self) -> Result<HopNum> {
        let n = self.num_hops.load(Ordering::SeqCst);
        if n == 0 {
            return Err(Error::from(or_error::internal!(
                "circuit has no hops yet"
            )));
        }
        Ok((n - 1).into())
    }

    /// Extend the circuit, via the TAP handshake, to a given relay.
    pub async fn extend(&self, target: &OwnedCircTarget, params: &CircParameters) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::ExtendTap {
                target: target.clone(),
                params: params.clone(),
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)?
    }

    /// Extend the circuit by a "virtual" hop, using keys derived via
    /// the rendezvous handshake.
    ///
    /// The `seed` must be the DH shared secret from the handshake,
    /// and `kh` the 20-byte check value that the service sent
    /// alongside its public value; we verify that the key derivation
    /// matches before installing the hop.
    pub async fn extend_virtual(
        &self,
        seed: SecretBuf,
        kh: [u8; 20],
        params: &CircParameters,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::ExtendVirtual {
                seed,
                kh,
                params: params.clone(),
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)?
    }

    /// Tell the final hop of this circuit to establish a rendezvous
    /// point, using the given cookie, and wait for it to acknowledge.
    pub async fn establish_rendezvous(&self, cookie: [u8; 20]) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::EstablishRendezvous { cookie, done: tx })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)?
    }

    /// Send an INTRODUCE1 message to the final hop of this circuit
    /// (an introduction point), and wait for it to acknowledge.
    ///
    /// On success, the introduction point has relayed our request to
    /// the service; the rendezvous itself happens elsewhere.
    pub async fn send_introduce1(&self, pk_id: RsaIdentity, encrypted: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::SendIntroduce1 {
                pk_id,
                encrypted,
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)?
    }

    /// Wait for a RENDEZVOUS2 message on this circuit, and return its
    /// handshake body.
    ///
    /// The expectation is registered as soon as this function is
    /// called (not when the returned future is first polled), so a
    /// caller can start listening *before* it triggers the
    /// introduction that will make the message arrive.
    pub fn await_rendezvous2(&self) -> impl std::future::Future<Output = Result<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let send_outcome = self
            .control
            .unbounded_send(CtrlMsg::AwaitRendezvous2 { done: tx })
            .map_err(|_| Error::CircuitClosed);
        async move {
            send_outcome?;
            rx.await.map_err(|_| Error::CircuitClosed)?
        }
    }

    /// Helper: create a stream on the last hop, sending `begin_msg`
    /// to open it.
    async fn begin_stream_impl(&self, begin_msg: AnyRelayMsg) -> Result<StreamReader> {
        let hop = self.last_hop()?;
        let (sender, receiver) = mpsc::channel(STREAM_READER_BUFFER);
        let (msg_tx, msg_rx) = mpsc::channel(STREAM_READER_BUFFER);
        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::BeginStream {
                hop,
                message: begin_msg,
                sender,
                rx: msg_rx,
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        let stream_id = rx.await.map_err(|_| Error::CircuitClosed)??;

        let target = StreamTarget {
            circ: self.clone(),
            tx: msg_tx,
            hop,
            stream_id,
        };

        Ok(StreamReader::new(target, receiver))
    }

    /// Start a stream to the given address and port, using a BEGIN
    /// cell.
    ///
    /// The use of a string for the address is intentional: you should
    /// let the remote relay do the hostname lookup for you.
    ///
    /// This method waits for the exit's CONNECTED response, so when
    /// it returns successfully, the stream is open.
    pub async fn begin_stream(
        &self,
        target: &str,
        port: u16,
        parameters: StreamParameters,
    ) -> Result<DataStream> {
        let begin = Begin::new(target, port, parameters.begin_flags())
            .map_err(|e| Error::CellEncodeErr {
                object: "begin message",
                err: e,
            })?;
        let reader = self.begin_stream_impl(begin.into()).await?;
        let mut stream = DataStream::new(reader);
        stream.wait_for_connection().await?;
        Ok(stream)
    }

    /// Start a new stream to the last relay in the circuit, using a
    /// BEGIN_DIR cell.
    pub async fn begin_dir_stream(&self) -> Result<DataStream> {
        let reader = self.begin_stream_impl(BeginDir::new().into()).await?;
        let mut stream = DataStream::new(reader);
        stream.wait_for_connection().await?;
        Ok(stream)
    }

    /// Perform a DNS lookup, using a RESOLVE cell with the last relay
    /// in this circuit.
    ///
    /// Note that this function does not check for timeouts; that's
    /// the caller's responsibility.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let resolve_msg = Resolve::new(hostname);
        let resolved_msg = self.try_resolve(resolve_msg).await?;
        resolved_msg
            .into_answers()
            .into_iter()
            .filter_map(|(val, _)| match val {
                ResolvedVal::Ip(ip) => Some(Ok(ip)),
                ResolvedVal::TransientError | ResolvedVal::NontransientError => {
                    Some(Err(Error::CircProto("unsuccessful DNS lookup".into())))
                }
                _ => None,
            })
            .collect()
    }

    /// Perform a reverse DNS lookup, by sending a RESOLVE cell with
    /// the last relay on this circuit.
    pub async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>> {
        let resolve_ptr_msg = Resolve::new_reverse(&addr);
        let resolved_msg = self.try_resolve(resolve_ptr_msg).await?;
        resolved_msg
            .into_answers()
            .into_iter()
            .filter_map(|(val, _)| match val {
                ResolvedVal::Hostname(v) => Some(
                    String::from_utf8(v)
                        .map_err(|_| Error::CircProto("Resolved Hostname was not utf-8".into())),
                ),
                ResolvedVal::TransientError | ResolvedVal::NontransientError => {
                    Some(Err(Error::CircProto("unsuccessful DNS lookup".into())))
                }
                _ => None,
            })
            .collect()
    }

    /// Helper: send the resolve message, and read the resolved
    /// message from the resolve stream.
    async fn try_resolve(&self, msg: Resolve) -> Result<Resolved> {
        let reader = self.begin_stream_impl(msg.into()).await?;
        let mut resolve_stream = ResolveStream::new(reader);
        resolve_stream.read_msg().await
    }

    /// Shut down this circuit, along with all streams that are using
    /// it.  Happens asynchronously (i.e. the circuit won't necessarily
    /// be done closing immediately).
    ///
    /// Note that other references to this circuit may exist.  If they
    /// do, they will stop working after you call this function.
    ///
    /// It's not necessary to call this method if you're just done
    /// with a circuit: the circuit should close on its own once
    /// nothing is using it any more.
    pub fn terminate(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }
}

/// A circuit on which the initial hop has not yet been created.
///
/// To convert this into a real circuit, call `create_firsthop_fast()`
/// or `create_firsthop_tap()`.
pub struct PendingClientCirc {
    /// A oneshot receiver on which we'll receive a CREATED* cell, or
    /// a DESTROY cell.
    recvcreated: oneshot::Receiver<CreateResponse>,
    /// The ClientCirc object that we can expose on success.
    circ: ClientCirc,
}

impl PendingClientCirc {
    /// Instantiate a new circuit object: used from
    /// channel::Channel::new_circ().
    ///
    /// Does not send a CREATE* cell on its own.
    pub(crate) fn new(
        id: CircId,
        channel: Channel,
        createdreceiver: oneshot::Receiver<CreateResponse>,
        input: CircuitRxReceiver,
        unique_id: UniqId,
    ) -> (PendingClientCirc, Reactor) {
        let (reactor, control, closed, num_hops) = Reactor::new(channel, id, unique_id, input);

        let circuit = ClientCirc {
            num_hops,
            unique_id,
            circid: id,
            control,
            closed,
        };

        let pending = PendingClientCirc {
            recvcreated: createdreceiver,
            circ: circuit,
        };
        (pending, reactor)
    }

    /// Testing only: return the circuit ID of this pending circuit.
    pub fn peek_circid(&self) -> CircId {
        self.circ.circid
    }

    /// Use the (questionable!) CREATE_FAST handshake to connect to
    /// the first hop of this circuit.
    ///
    /// There's no authentication in CREATE_FAST, so we don't need to
    /// know whom we're connecting to: we're just trusting the channel
    /// not to be tapped.
    pub async fn create_firsthop_fast(self, params: &CircParameters) -> Result<ClientCirc> {
        let PendingClientCirc { recvcreated, circ } = self;
        let (tx, rx) = oneshot::channel();
        circ.control
            .unbounded_send(CtrlMsg::Create {
                recv_created: recvcreated,
                handshake: CircHandshake::Fast,
                params: params.clone(),
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)??;
        Ok(circ)
    }

    /// Use the TAP handshake to connect to the first hop of this
    /// circuit.
    pub async fn create_firsthop_tap(
        self,
        target: &OwnedCircTarget,
        params: &CircParameters,
    ) -> Result<ClientCirc> {
        let PendingClientCirc { recvcreated, circ } = self;
        let (tx, rx) = oneshot::channel();
        circ.control
            .unbounded_send(CtrlMsg::Create {
                recv_created: recvcreated,
                handshake: CircHandshake::Tap {
                    target: target.clone(),
                },
                params: params.clone(),
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)??;
        Ok(circ)
    }
}

/// Handle to a stream on a given circuit, used by the stream
/// implementations to send their messages and manage their lifetime.
///
/// When this object is dropped, the reactor will observe the closed
/// message queue and send an END cell if one is still appropriate.
#[derive(Clone)]
pub(crate) struct StreamTarget {
    /// The circuit that this stream is on.
    circ: ClientCirc,
    /// Channel to send cells down.
    tx: mpsc::Sender<AnyRelayMsg>,
    /// Which hop of the circuit this stream is with.
    hop: HopNum,
    /// Stream ID for this stream.
    stream_id: StreamId,
}

impl std::fmt::Debug for StreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTarget")
            .field("circ", &self.circ)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl StreamTarget {
    /// Deliver a relay message for the stream that this target
    /// corresponds to.
    pub(crate) async fn send(&mut self, msg: AnyRelayMsg) -> Result<()> {
        use futures::SinkExt;
        self.tx.send(msg).await.map_err(|_| Error::CircuitClosed)?;
        Ok(())
    }

    /// Called when a circuit-level protocol error has occurred and
    /// the circuit needs to shut down.
    pub(crate) fn protocol_error(&mut self) {
        self.circ.terminate();
    }

    /// Tell the reactor to close this stream, sending the given END
    /// message if appropriate.
    pub(crate) fn close(&self, message: or_cell::relaycell::msg::End) {
        let _ = self
            .circ
            .control
            .unbounded_send(CtrlMsg::CloseStream {
                hop: self.hop,
                stream_id: self.stream_id,
                message,
            });
    }

    /// Return the kind of relay cell commands that can arrive on this
    /// stream.
    #[allow(dead_code)]
    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Return a reference to the circuit that this stream is on.
    pub(crate) fn circuit(&self) -> &ClientCirc {
        &self.circ
    }
}

/// Return true if `cmd` is a command that may arrive at a client
/// stream once it is open.
pub(crate) fn cmd_ok_on_stream(cmd: RelayCmd) -> bool {
    matches!(
        cmd,
        RelayCmd::DATA | RelayCmd::CONNECTED | RelayCmd::END | RelayCmd::RESOLVED
    )
}
