//! Code to handle the circuit state machine: building circuits hop
//! by hop, applying the layered relay-cell cryptography in both
//! directions, dispatching inbound cells to streams, and enforcing
//! the flow-control windows.
//!
//! All of a circuit's mutable state lives here, owned by a single
//! asynchronous task; everything else talks to it over the control
//! queue.

use super::celltypes::{ClientCircChanMsg, CreateResponse};
use super::sendme::{CircRecvWindow, CircSendWindow, StreamRecvWindow, StreamSendWindow};
use super::streammap::{ShouldSendEnd, StreamEnt, StreamMap};
use super::{CircParameters, OwnedCircTarget, UniqId};
use crate::channel::circmap::CircuitRxReceiver;
use crate::channel::Channel;
use crate::crypto::cell::{
    ClientLayer, CryptInit, HopNum, InboundClientCrypt, OutboundClientCrypt, RelayCellBody,
    Tor1RelayCrypto,
};
use crate::crypto::handshake::fast::CreateFastClient;
use crate::crypto::handshake::tap::{TapClient, TapClientState};
use crate::crypto::handshake::{ClientHandshake, TapKeyGenerator};
use crate::crypto::ll::kdf::{Kdf, LegacyKdf};
use crate::util::err::ReactorError;
use crate::{Error, Result};
use or_bytes::SecretBuf;
use or_cell::chancell::msg as chanmsg;
use or_cell::chancell::{AnyChanCell, BoxedCellBody, CircId};
use or_cell::relaycell::msg as relaymsg;
use or_cell::relaycell::msg::{AnyRelayMsg, End, EndReason};
use or_cell::relaycell::{AnyRelayCell, RelayCmd, StreamId, UnparsedRelayCell};
use or_llcrypto::pk::rsa::RsaIdentity;
use or_llcrypto::util::ct;

use futures::channel::{mpsc, oneshot};
use futures::stream::StreamExt;
use futures::SinkExt;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Poll;

use tracing::{debug, trace};

/// The type of a oneshot channel used to inform reactor users of the
/// result of an operation.
pub(crate) type ReactorResultChannel<T> = oneshot::Sender<Result<T>>;

/// How many RELAY_EARLY cells may we send on a single circuit?
///
/// (Relays enforce this limit to stop "infinite circuit" attacks;
/// since only our EXTEND cells use RELAY_EARLY, we will never reach
/// it on a normal-length circuit.)
const MAX_RELAY_EARLY: u8 = 8;

/// Which handshake should be used to create the first hop of a
/// circuit?
pub(crate) enum CircHandshake {
    /// The unauthenticated CREATE_FAST handshake.
    Fast,
    /// The TAP handshake, keyed to a given target relay.
    Tap {
        /// The relay we believe we're talking to.
        target: OwnedCircTarget,
    },
}

/// A message telling the circuit reactor to do something.
pub(crate) enum CtrlMsg {
    /// Create the first hop of this circuit.
    Create {
        /// A oneshot channel on which we'll receive the creation
        /// response.
        recv_created: oneshot::Receiver<CreateResponse>,
        /// The handshake type to use for the first hop.
        handshake: CircHandshake,
        /// Parameters used for this circuit.
        params: CircParameters,
        /// Oneshot channel to notify on completion.
        done: ReactorResultChannel<()>,
    },
    /// Extend the circuit by one hop, using the TAP handshake.
    ExtendTap {
        /// The relay to extend to.
        target: OwnedCircTarget,
        /// Parameters used for this circuit.
        params: CircParameters,
        /// Oneshot channel to notify on completion.
        done: ReactorResultChannel<()>,
    },
    /// Extend the circuit by one "virtual" hop, whose keys were
    /// negotiated out of band (by the rendezvous protocol).
    ExtendVirtual {
        /// The seed (a DH shared secret) for the key derivation.
        seed: SecretBuf,
        /// The other side's claimed derivation check value.
        kh: [u8; 20],
        /// Parameters used for this circuit.
        params: CircParameters,
        /// Oneshot channel to notify on completion.
        done: ReactorResultChannel<()>,
    },
    /// Begin a stream with the provided hop in this circuit.
    BeginStream {
        /// The hop on which to begin the stream.
        hop: HopNum,
        /// The message to send to open the stream.
        message: AnyRelayMsg,
        /// A channel to send incoming cells for this stream down.
        sender: mpsc::Sender<UnparsedRelayCell>,
        /// A channel on which the stream will give us cells to send
        /// out.
        rx: mpsc::Receiver<AnyRelayMsg>,
        /// Oneshot channel to notify on completion, with the allocated
        /// stream ID.
        done: ReactorResultChannel<StreamId>,
    },
    /// Close the specified pending stream, sending the provided END
    /// message if the stream's state calls for one.
    CloseStream {
        /// The hop the stream is on.
        hop: HopNum,
        /// The ID of the stream to close.
        stream_id: StreamId,
        /// The END message to send.
        message: End,
    },
    /// Ask the final hop to serve as a rendezvous point, identified
    /// by the given cookie.
    EstablishRendezvous {
        /// The rendezvous cookie.
        cookie: [u8; 20],
        /// Oneshot channel to notify when the point is established.
        done: ReactorResultChannel<()>,
    },
    /// Send an INTRODUCE1 message to the final hop, and wait for the
    /// acknowledgment.
    SendIntroduce1 {
        /// Hash of the service key we are introducing ourselves to.
        pk_id: RsaIdentity,
        /// The encrypted introduction request.
        encrypted: Vec<u8>,
        /// Oneshot channel to notify when the request was relayed.
        done: ReactorResultChannel<()>,
    },
    /// Wait for a RENDEZVOUS2 message, and deliver its handshake
    /// body.
    AwaitRendezvous2 {
        /// Oneshot channel to notify with the handshake body.
        done: ReactorResultChannel<Vec<u8>>,
    },
    /// Shut down the reactor.
    Shutdown,
}

/// The meta-cell (stream-ID-zero reply) that the reactor is currently
/// waiting for, if any.
///
/// At most one of these can be outstanding: circuit building and the
/// rendezvous sub-protocol are strictly sequential.
enum MetaExpectation {
    /// We are waiting for an EXTENDED cell.
    Extended {
        /// The client handshake state to complete.
        state: TapClientState,
        /// Parameters for the new hop.
        params: CircParameters,
        /// Who to tell when it's done.
        done: ReactorResultChannel<()>,
    },
    /// We are waiting for a RENDEZVOUS_ESTABLISHED cell.
    RendezvousEstablished {
        /// Who to tell when it's done.
        done: ReactorResultChannel<()>,
    },
    /// We are waiting for an INTRODUCE_ACK cell.
    IntroduceAck {
        /// Who to tell when it's done.
        done: ReactorResultChannel<()>,
    },
    /// We are waiting for a RENDEZVOUS2 cell.
    Rendezvous2 {
        /// Who to tell when it's done.
        done: ReactorResultChannel<Vec<u8>>,
    },
}

/// One hop of the circuit: its stream map and flow-control windows.
///
/// (The cryptographic state for each hop lives in the crypto stacks,
/// indexed by the same hop number.)
struct CircHop {
    /// Map from stream IDs to streams.
    map: StreamMap,
    /// Window used to say how many cells we can send to this hop.
    sendwindow: CircSendWindow,
    /// Window used to say how many cells we can receive from this
    /// hop before we owe it a SENDME.
    recvwindow: CircRecvWindow,
}

impl CircHop {
    /// Create a new hop with the given initial window.
    fn new(initial_window: u16) -> Self {
        CircHop {
            map: StreamMap::new(),
            sendwindow: CircSendWindow::new(initial_window),
            recvwindow: CircRecvWindow::new(initial_window),
        }
    }
}

/// The next thing for the circuit reactor to do, as determined by a
/// single poll of its event sources.
enum Action {
    /// A control message (or the end of the control queue) arrived.
    Ctrl(Option<CtrlMsg>),
    /// A cell (or the end of the channel's delivery queue) arrived.
    Input(Option<ClientCircChanMsg>),
    /// A stream gave us a message to package, or went away.
    StreamCell {
        /// Which hop the stream is on.
        hop: HopNum,
        /// Which stream it is.
        id: StreamId,
        /// The message, or None if the stream was dropped.
        msg: Option<AnyRelayMsg>,
    },
}

/// Object to handle incoming cells and background tasks for a single
/// circuit.
///
/// This type is returned when you create a circuit; you need to spawn
/// a new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the circuit won't work."]
pub struct Reactor {
    /// Receiver for control messages from a ClientCirc.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Input stream, on which we receive cells from the channel.
    input: CircuitRxReceiver,
    /// The channel this circuit is attached to.
    channel: Channel,
    /// The channel-local ID of this circuit.
    circ_id: CircId,
    /// An identifier for logging about this reactor's circuit.
    unique_id: UniqId,
    /// The cryptographic state for handling incoming cells.
    crypto_in: InboundClientCrypt,
    /// The cryptographic state for sending outgoing cells.
    crypto_out: OutboundClientCrypt,
    /// List of hops state objects used by the reactor.
    hops: Vec<CircHop>,
    /// Shared hop count, exposed through ClientCirc.
    num_hops: Arc<AtomicU8>,
    /// Shared "closed" flag, exposed through ClientCirc.
    closed: Arc<AtomicBool>,
    /// The meta-cell we are waiting for, if any.
    meta: Option<MetaExpectation>,
    /// How many RELAY_EARLY cells we have sent so far.
    n_relay_early: u8,
}

impl Reactor {
    /// Construct a new circuit reactor, along with the control sender
    /// and the state shared with ClientCirc handles.
    pub(super) fn new(
        channel: Channel,
        circ_id: CircId,
        unique_id: UniqId,
        input: CircuitRxReceiver,
    ) -> (
        Self,
        mpsc::UnboundedSender<CtrlMsg>,
        Arc<AtomicBool>,
        Arc<AtomicU8>,
    ) {
        let (control_tx, control_rx) = mpsc::unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let num_hops = Arc::new(AtomicU8::new(0));
        let reactor = Reactor {
            control: control_rx,
            input,
            channel,
            circ_id,
            unique_id,
            crypto_in: InboundClientCrypt::new(),
            crypto_out: OutboundClientCrypt::new(),
            hops: Vec::new(),
            num_hops: Arc::clone(&num_hops),
            closed: Arc::clone(&closed),
            meta: None,
            n_relay_early: 0,
        };
        (reactor, control_tx, closed, num_hops)
    }

    /// Launch the reactor, and run until the circuit closes or we
    /// encounter an error.
    ///
    /// Once this function returns, the circuit is dead, and can't be
    /// used again.
    pub async fn run(mut self) -> Result<()> {
        trace!("{}: Running circuit reactor", self.unique_id);
        let result: Result<()> = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        debug!("{}: Circuit reactor stopped: {:?}", self.unique_id, result);
        self.closed.store(true, Ordering::SeqCst);
        // Tell every stream that the circuit has collapsed under it.
        self.shutdown_streams();
        // Release our circuit ID: the channel will send the DESTROY.
        let _ = self.channel.close_circuit(self.circ_id);
        result
    }

    /// Handle a single event from any of the reactor's sources.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        let action = {
            let control = &mut self.control;
            let input = &mut self.input;
            let hops = &mut self.hops;
            futures::future::poll_fn(move |cx| {
                if let Poll::Ready(v) = control.poll_next_unpin(cx) {
                    return Poll::Ready(Action::Ctrl(v));
                }
                if let Poll::Ready(v) = input.poll_next_unpin(cx) {
                    return Poll::Ready(Action::Input(v));
                }
                // See whether any stream has bytes for us to package,
                // but only when the flow-control windows permit
                // packaging them.  A stream whose window (or whose
                // hop's circuit-level window) is empty stays unpolled
                // until a SENDME arrives, which is itself an input
                // event.
                for (hopn, hop) in hops.iter_mut().enumerate() {
                    if hop.sendwindow.window() == 0 {
                        continue;
                    }
                    for (id, ent) in hop.map.inner().iter_mut() {
                        if let StreamEnt::Open {
                            rx, send_window, ..
                        } = ent
                        {
                            if send_window.window() == 0 {
                                continue;
                            }
                            if let Poll::Ready(msg) = rx.poll_next_unpin(cx) {
                                return Poll::Ready(Action::StreamCell {
                                    hop: (hopn as u8).into(),
                                    id: *id,
                                    msg,
                                });
                            }
                        }
                    }
                }
                Poll::Pending
            })
            .await
        };

        match action {
            Action::Ctrl(None) | Action::Ctrl(Some(CtrlMsg::Shutdown)) => {
                return Err(ReactorError::Shutdown);
            }
            Action::Ctrl(Some(msg)) => self.handle_control(msg).await?,
            Action::Input(None) => {
                // The channel has closed underneath us.
                return Err(Error::ChannelClosed.into());
            }
            Action::Input(Some(ClientCircChanMsg::Destroy(d))) => {
                // The remote end killed the circuit.
                return Err(Error::CircDestroy(d.reason()).into());
            }
            Action::Input(Some(ClientCircChanMsg::Relay(r))) => {
                self.handle_relay_cell(r).await?;
            }
            Action::StreamCell { hop, id, msg: None } => {
                // The stream object went away; close the stream,
                // sending an END if the far side still thinks it is
                // alive.
                self.close_stream(hop, id, End::new_misc()).await?;
            }
            Action::StreamCell {
                hop,
                id,
                msg: Some(msg),
            } => {
                self.package_stream_cell(hop, id, msg).await?;
            }
        }
        Ok(())
    }

    /// Handle a CtrlMsg other than Shutdown.
    async fn handle_control(&mut self, msg: CtrlMsg) -> std::result::Result<(), ReactorError> {
        match msg {
            CtrlMsg::Shutdown => panic!(), // was handled in reactor loop.
            CtrlMsg::Create {
                recv_created,
                handshake,
                params,
                done,
            } => {
                let result = self.handle_create(recv_created, handshake, &params).await;
                match result {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = done.send(Err(e.clone()));
                        // A failed create leaves the circuit useless.
                        return Err(e.into());
                    }
                }
            }
            CtrlMsg::ExtendTap {
                target,
                params,
                done,
            } => {
                // (start_extend reports target-specific errors
                // through `done`; an Err here is reactor-fatal.)
                self.start_extend(&target, params, done).await?;
            }
            CtrlMsg::ExtendVirtual {
                seed,
                kh,
                params,
                done,
            } => {
                let r = self.extend_virtual(seed, kh, &params);
                let _ = done.send(r);
            }
            CtrlMsg::BeginStream {
                hop,
                message,
                sender,
                rx,
                done,
            } => {
                let r = self.begin_stream(hop, message, sender, rx).await;
                match r {
                    Ok(id) => {
                        let _ = done.send(Ok(id));
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
            }
            CtrlMsg::CloseStream {
                hop,
                stream_id,
                message,
            } => {
                self.close_stream(hop, stream_id, message).await?;
            }
            CtrlMsg::EstablishRendezvous { cookie, done } => {
                if self.meta.is_some() {
                    let _ = done.send(Err(busy_err()));
                } else {
                    let msg = relaymsg::EstablishRendezvous::new(cookie);
                    let hop = self.last_hop_num()?;
                    self.send_relay_cell(hop, false, AnyRelayCell::new(None, msg.into()))
                        .await?;
                    self.meta = Some(MetaExpectation::RendezvousEstablished { done });
                }
            }
            CtrlMsg::SendIntroduce1 {
                pk_id,
                encrypted,
                done,
            } => {
                if self.meta.is_some() {
                    let _ = done.send(Err(busy_err()));
                } else {
                    let msg = relaymsg::Introduce1::new(pk_id, encrypted);
                    let hop = self.last_hop_num()?;
                    self.send_relay_cell(hop, false, AnyRelayCell::new(None, msg.into()))
                        .await?;
                    self.meta = Some(MetaExpectation::IntroduceAck { done });
                }
            }
            CtrlMsg::AwaitRendezvous2 { done } => {
                if self.meta.is_some() {
                    let _ = done.send(Err(busy_err()));
                } else {
                    self.meta = Some(MetaExpectation::Rendezvous2 { done });
                }
            }
        }
        Ok(())
    }

    /// Create the first hop of the circuit, and wait for the
    /// response.
    async fn handle_create(
        &mut self,
        recv_created: oneshot::Receiver<CreateResponse>,
        handshake: CircHandshake,
        params: &CircParameters,
    ) -> Result<()> {
        if !self.hops.is_empty() {
            return Err(or_error::internal!("Tried to create two first hops").into());
        }
        match handshake {
            CircHandshake::Fast => {
                let (state, cmsg) = {
                    let mut rng = rand::rng();
                    CreateFastClient::client1(&mut rng, &())?
                };
                trace!("{}: sending CREATE_FAST", self.unique_id);
                self.send_msg(chanmsg::CreateFast::new(cmsg).into()).await?;
                let reply = recv_created.await.map_err(|_| Error::CircuitClosed)?;
                let keygen = match reply {
                    CreateResponse::CreatedFast(cf) => {
                        CreateFastClient::client2(state, cf.into_handshake())?
                    }
                    CreateResponse::Destroy(d) => return Err(Error::CircDestroy(d.reason())),
                    other => {
                        return Err(Error::ChanProto(format!(
                            "Got {} in response to CREATE_FAST",
                            other
                        )))
                    }
                };
                trace!("{}: created circuit", self.unique_id);
                self.add_hop(keygen, params)
            }
            CircHandshake::Tap { target } => {
                let onion_key = or_llcrypto::pk::rsa::PublicKey::from_der(target.onion_key_der())
                    .ok_or_else(|| {
                        Error::HandshakeProto("Invalid onion key for first hop".into())
                    })?;
                let (state, cmsg) = {
                    let mut rng = rand::rng();
                    TapClient::client1(&mut rng, &onion_key)?
                };
                trace!("{}: sending CREATE", self.unique_id);
                self.send_msg(chanmsg::Create::new(cmsg).into()).await?;
                let reply = recv_created.await.map_err(|_| Error::CircuitClosed)?;
                let keygen = match reply {
                    CreateResponse::Created(c) => TapClient::client2(state, c.into_handshake())?,
                    CreateResponse::Destroy(d) => return Err(Error::CircDestroy(d.reason())),
                    other => {
                        return Err(Error::ChanProto(format!(
                            "Got {} in response to CREATE",
                            other
                        )))
                    }
                };
                trace!("{}: created circuit", self.unique_id);
                self.add_hop(keygen, params)
            }
        }
    }

    /// Begin extending the circuit to `target`, registering a
    /// meta-cell expectation for the EXTENDED reply.
    ///
    /// Errors with the *target* (a bad onion key, a busy circuit) are
    /// reported through `done`; an `Err` return from this function is
    /// reactor-fatal.
    async fn start_extend(
        &mut self,
        target: &OwnedCircTarget,
        params: CircParameters,
        done: ReactorResultChannel<()>,
    ) -> Result<()> {
        if self.meta.is_some() {
            let _ = done.send(Err(busy_err()));
            return Ok(());
        }
        if self.hops.is_empty() {
            let _ = done.send(Err(
                or_error::internal!("Can't extend a zero-hop circuit").into()
            ));
            return Ok(());
        }
        let onion_key = match or_llcrypto::pk::rsa::PublicKey::from_der(target.onion_key_der()) {
            Some(k) => k,
            None => {
                let _ = done.send(Err(Error::HandshakeProto(
                    "Invalid onion key for extend target".into(),
                )));
                return Ok(());
            }
        };
        let (state, cmsg) = {
            let mut rng = rand::rng();
            match TapClient::client1(&mut rng, &onion_key) {
                Ok(v) => v,
                Err(e) => {
                    let _ = done.send(Err(e));
                    return Ok(());
                }
            }
        };
        let extend = relaymsg::Extend::new(
            target.addr(),
            target.port(),
            cmsg,
            *target.rsa_identity(),
        );
        let hop = self.last_hop_num()?;
        trace!(
            "{}: sending EXTEND to {} via hop {}",
            self.unique_id,
            target.rsa_identity(),
            hop
        );
        // EXTEND cells are the one thing that must travel in
        // RELAY_EARLY cells.
        self.send_relay_cell(hop, true, AnyRelayCell::new(None, extend.into()))
            .await?;
        self.meta = Some(MetaExpectation::Extended {
            state,
            params,
            done,
        });
        Ok(())
    }

    /// Add a hop to this circuit whose keys were derived out of band
    /// by the rendezvous handshake.
    fn extend_virtual(
        &mut self,
        seed: SecretBuf,
        kh: [u8; 20],
        params: &CircParameters,
    ) -> Result<()> {
        let kh_expect = LegacyKdf::new(0).derive(&seed[..], 20)?;
        if !ct::bytes_eq(&kh_expect, &kh[..]) {
            return Err(Error::BadCircHandshakeAuth);
        }
        self.add_hop(TapKeyGenerator::new(seed), params)
    }

    /// Allocate a stream ID on `hop`, install the stream's channels,
    /// and send `message` to open it.
    async fn begin_stream(
        &mut self,
        hop: HopNum,
        message: AnyRelayMsg,
        sender: mpsc::Sender<UnparsedRelayCell>,
        rx: mpsc::Receiver<AnyRelayMsg>,
    ) -> Result<StreamId> {
        let hop_ent = self.hop_mut(hop)?;
        let id = hop_ent.map.add_ent(
            sender,
            rx,
            StreamSendWindow::new(500),
            StreamRecvWindow::new(500),
        )?;
        trace!("{}: allocated stream {} on hop {}", self.unique_id, id, hop);
        self.send_relay_cell(hop, false, AnyRelayCell::new(Some(id), message))
            .await?;
        Ok(id)
    }

    /// Close the stream associated with `id` on `hop`, sending
    /// `message` if the protocol calls for it.
    async fn close_stream(&mut self, hop: HopNum, id: StreamId, message: End) -> Result<()> {
        let should_send_end = self.hop_mut(hop)?.map.terminate(id)?;
        trace!(
            "{}: closing stream {}; should_send_end={:?}",
            self.unique_id,
            id,
            should_send_end
        );
        if should_send_end == ShouldSendEnd::Send {
            self.send_relay_cell(hop, false, AnyRelayCell::new(Some(id), message.into()))
                .await?;
        }
        Ok(())
    }

    /// Package a message from a stream into a relay cell, and send
    /// it, consuming flow-control windows.
    async fn package_stream_cell(
        &mut self,
        hop: HopNum,
        id: StreamId,
        msg: AnyRelayMsg,
    ) -> Result<()> {
        // Everything a stream hands us counts against the windows.
        // (Only DATA cells ever arrive here: see DataWriter.)
        {
            let hop_ent = self.hop_mut(hop)?;
            hop_ent.sendwindow.take()?;
            match hop_ent.map.get_mut(id) {
                Some(StreamEnt::Open { send_window, .. }) => send_window.take()?,
                _ => {
                    return Err(or_error::internal!(
                        "packaging a cell from a stream that isn't open"
                    )
                    .into())
                }
            }
        }
        self.send_relay_cell(hop, false, AnyRelayCell::new(Some(id), msg))
            .await
    }

    /// Handle a RELAY cell that arrived from the channel: peel the
    /// onion layers, identify the hop it came from, and dispatch.
    async fn handle_relay_cell(&mut self, cell: chanmsg::Relay) -> Result<()> {
        let mut body: RelayCellBody = cell.into_relay_body().into();
        // If nobody on the circuit recognizes the cell, it's
        // malformed (or tampered with), and the circuit must die.
        let hopnum = self.crypto_in.decrypt(&mut body)?;
        let cell = UnparsedRelayCell::from_body(BoxedCellBody::from(body));

        // Decrement the circuit-level deliver window for data cells,
        // and acknowledge with a circuit SENDME at the threshold.
        if cell.cmd() == RelayCmd::DATA {
            let send_circ_sendme = self.hop_mut(hopnum)?.recvwindow.take()?;
            if send_circ_sendme {
                self.send_relay_cell(
                    hopnum,
                    false,
                    AnyRelayCell::new(None, relaymsg::Sendme::new_empty().into()),
                )
                .await?;
                self.hop_mut(hopnum)?.recvwindow.put();
            }
        }

        match cell.stream_id() {
            Some(id) => self.handle_in_stream_cell(hopnum, id, cell).await,
            None => self.handle_meta_cell(hopnum, cell).await,
        }
    }

    /// Handle a relay cell with a nonzero stream ID.
    async fn handle_in_stream_cell(
        &mut self,
        hopnum: HopNum,
        id: StreamId,
        cell: UnparsedRelayCell,
    ) -> Result<()> {
        let cmd = cell.cmd();
        if cmd != RelayCmd::SENDME && !super::cmd_ok_on_stream(cmd) {
            return Err(Error::CircProto(format!(
                "Unexpected {} cell with a stream ID",
                cmd
            )));
        }

        /// What kind of stream entry are we delivering to?
        enum Kind {
            /// A live stream.
            Open,
            /// A stream we have sent an END on.
            HalfClosed,
            /// A stream the other side already ended.
            AfterEnd,
            /// No such stream.
            Missing,
        }
        let kind = {
            let hop = self.hop_mut(hopnum)?;
            match hop.map.get_mut(id) {
                Some(StreamEnt::Open { .. }) => Kind::Open,
                Some(StreamEnt::EndSent(_)) => Kind::HalfClosed,
                Some(StreamEnt::EndReceived) => Kind::AfterEnd,
                None => Kind::Missing,
            }
        };
        match kind {
            Kind::Missing => {
                return Err(Error::CircProto(
                    "Received cell on nonexistent stream".into(),
                ));
            }
            Kind::AfterEnd => {
                return Err(Error::CircProto(
                    "Received cell on a stream after END".into(),
                ));
            }
            Kind::HalfClosed => {
                // We sent an END, but the other side hasn't noticed;
                // validate the late cell against the stream's
                // windows.
                return self
                    .hop_mut(hopnum)?
                    .map
                    .handle_cell_on_half_closed(id, &cell);
            }
            Kind::Open => (),
        }

        // First, the synchronous part: windows and state flags.
        let (mut deliver_sink, send_stream_sendme) = {
            let hop = self.hop_mut(hopnum)?;
            match hop.map.get_mut(id) {
                Some(StreamEnt::Open {
                    sink,
                    send_window,
                    recv_window,
                    received_connected,
                    ..
                }) => match cmd {
                    RelayCmd::SENDME => {
                        // Stream-level acknowledgment; consumed here,
                        // never delivered to the stream.
                        send_window.put()?;
                        return Ok(());
                    }
                    RelayCmd::DATA => {
                        let sendme_now = recv_window.take()?;
                        if sendme_now {
                            recv_window.put();
                        }
                        (sink.clone(), sendme_now)
                    }
                    RelayCmd::CONNECTED => {
                        if *received_connected {
                            return Err(Error::CircProto(
                                "Received two CONNECTED cells on a stream".into(),
                            ));
                        }
                        *received_connected = true;
                        (sink.clone(), false)
                    }
                    _ => (sink.clone(), false),
                },
                _ => return Err(or_error::internal!("stream entry changed shape").into()),
            }
        };

        if send_stream_sendme {
            self.send_relay_cell(
                hopnum,
                false,
                AnyRelayCell::new(Some(id), relaymsg::Sendme::new_empty().into()),
            )
            .await?;
        }

        let is_ending = cmd == RelayCmd::END || cmd == RelayCmd::RESOLVED;
        if is_ending {
            self.hop_mut(hopnum)?.map.ending_msg_received(id)?;
        }

        // Now deliver the cell.  If the stream's receiver is slow,
        // this applies backpressure to the whole circuit, which is
        // what the deliver windows are bounding anyway.
        if deliver_sink.send(cell).await.is_err() {
            // The stream went away without unregistering yet; the
            // cell is dropped and will be accounted for when the
            // stream's disappearance is processed.
            if !is_ending && cmd == RelayCmd::DATA {
                if let Some(StreamEnt::Open { dropped, .. }) = self.hop_mut(hopnum)?.map.get_mut(id)
                {
                    *dropped += 1;
                }
            }
        }
        Ok(())
    }

    /// Handle a relay cell with a zero stream ID: flow control,
    /// circuit extension, and the rendezvous protocol land here.
    async fn handle_meta_cell(&mut self, hopnum: HopNum, cell: UnparsedRelayCell) -> Result<()> {
        match cell.cmd() {
            RelayCmd::SENDME => {
                // Circuit-level acknowledgment from this hop.
                self.hop_mut(hopnum)?.sendwindow.put()?;
                return Ok(());
            }
            RelayCmd::DROP => {
                // Long-range padding; nothing to do.
                return Ok(());
            }
            RelayCmd::TRUNCATED => {
                // Every hop past the one that sent this is gone.
                let reason = match cell.decode::<AnyRelayMsg>() {
                    Ok(c) => match c.into_msg() {
                        AnyRelayMsg::Truncated(t) => t.reason(),
                        _ => 0.into(),
                    },
                    Err(_) => 0.into(),
                };
                debug!(
                    "{}: circuit truncated at hop {} ({})",
                    self.unique_id,
                    hopnum,
                    reason.human_str()
                );
                return self.truncate_hops_after(hopnum);
            }
            _ => (),
        }

        // Everything else must be the meta-cell that somebody is
        // waiting for.
        match (self.meta.take(), cell.cmd()) {
            (
                Some(MetaExpectation::Extended {
                    state,
                    params,
                    done,
                }),
                RelayCmd::EXTENDED,
            ) => {
                let handshake = match decode_msg(cell)? {
                    AnyRelayMsg::Extended(e) => e.into_body(),
                    _ => return Err(Error::CircProto("malformed EXTENDED cell".into())),
                };
                let result = TapClient::client2(state, handshake)
                    .and_then(|keygen| self.add_hop(keygen, &params));
                match result {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = done.send(Err(e.clone()));
                        // A botched extend is fatal to the circuit:
                        // the new hop's crypto never got installed.
                        Err(e)
                    }
                }
            }
            (Some(MetaExpectation::RendezvousEstablished { done }), RelayCmd::RENDEZVOUS_ESTABLISHED) => {
                let _ = done.send(Ok(()));
                Ok(())
            }
            (Some(MetaExpectation::IntroduceAck { done }), RelayCmd::INTRODUCE_ACK) => {
                let ack = match decode_msg(cell)? {
                    AnyRelayMsg::IntroduceAck(a) => a,
                    _ => return Err(Error::CircProto("malformed INTRODUCE_ACK cell".into())),
                };
                if ack.success() {
                    let _ = done.send(Ok(()));
                } else {
                    let _ = done.send(Err(Error::HandshakeProto(
                        "Introduction point rejected our request".into(),
                    )));
                }
                Ok(())
            }
            (Some(MetaExpectation::Rendezvous2 { done }), RelayCmd::RENDEZVOUS2) => {
                let hs_body = match decode_msg(cell)? {
                    AnyRelayMsg::Rendezvous2(r) => r.into_handshake(),
                    _ => return Err(Error::CircProto("malformed RENDEZVOUS2 cell".into())),
                };
                let _ = done.send(Ok(hs_body));
                Ok(())
            }
            (other, cmd) => {
                self.meta = other;
                Err(Error::CircProto(format!(
                    "Unexpected {} cell on circuit",
                    cmd
                )))
            }
        }
    }

    /// Helper: remove every hop after `hopnum`, closing the streams
    /// that lived on the removed hops.
    fn truncate_hops_after(&mut self, hopnum: HopNum) -> Result<()> {
        let keep = usize::from(hopnum) + 1;
        // Dropping the hops drops the streams' sinks, which their
        // readers observe as an abrupt close.
        self.hops.truncate(keep);
        self.crypto_in.truncate(keep);
        self.crypto_out.truncate(keep);
        self.num_hops.store(keep as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Helper: return a mutable reference to the hop at `hopnum`.
    fn hop_mut(&mut self, hopnum: HopNum) -> Result<&mut CircHop> {
        self.hops
            .get_mut(usize::from(hopnum))
            .ok_or(Error::NoSuchHop)
    }

    /// Helper: return the hop number of the last hop.
    fn last_hop_num(&self) -> Result<HopNum> {
        let n = self.hops.len();
        if n == 0 {
            return Err(or_error::internal!("circuit has no hops").into());
        }
        Ok(((n - 1) as u8).into())
    }

    /// Install a new hop's cryptographic state, derived from
    /// `keygen`, and set up its stream map and windows.
    fn add_hop(&mut self, keygen: TapKeyGenerator, params: &CircParameters) -> Result<()> {
        let pair = Tor1RelayCrypto::construct(keygen)?;
        let (outbound, inbound) = pair.split_client_layer();
        self.crypto_out.add_layer(Box::new(outbound));
        self.crypto_in.add_layer(Box::new(inbound));
        self.hops.push(CircHop::new(params.initial_send_window));
        self.num_hops.store(self.hops.len() as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Encode `cell`, encrypt it for `hop`, and send it to the
    /// channel.
    ///
    /// Does not check or consume any flow-control windows; callers
    /// handle those.
    async fn send_relay_cell(
        &mut self,
        hop: HopNum,
        early: bool,
        cell: AnyRelayCell,
    ) -> Result<()> {
        let mut body: RelayCellBody = {
            let mut rng = rand::rng();
            cell.encode(&mut rng)
                .map_err(|e| Error::CellEncodeErr {
                    object: "relay cell",
                    err: e,
                })?
                .into()
        };
        self.crypto_out.encrypt(&mut body, hop)?;
        let msg = chanmsg::Relay::from_raw(*BoxedCellBody::from(body));
        let msg = if early {
            if self.n_relay_early >= MAX_RELAY_EARLY {
                return Err(or_error::internal!("too many RELAY_EARLY cells").into());
            }
            self.n_relay_early += 1;
            msg.into_early()
        } else {
            msg.into()
        };
        self.channel
            .send_cell(AnyChanCell::new(Some(self.circ_id), msg))
            .await
    }

    /// Send a message on this circuit's channel, with our circuit ID.
    async fn send_msg(&mut self, msg: chanmsg::AnyChanMsg) -> Result<()> {
        self.channel
            .send_cell(AnyChanCell::new(Some(self.circ_id), msg))
            .await
    }

    /// Tell every stream on this circuit that it has collapsed.
    fn shutdown_streams(&mut self) {
        let mut rng = rand::rng();
        for hop in self.hops.iter_mut() {
            for (id, ent) in hop.map.inner().iter_mut() {
                if let StreamEnt::Open { sink, .. } = ent {
                    let end = End::new_with_reason(EndReason::DESTROY);
                    if let Ok(body) = AnyRelayCell::new(Some(*id), end.into()).encode(&mut rng) {
                        let _ = sink.try_send(UnparsedRelayCell::from_body(body));
                    }
                }
            }
        }
        self.hops.clear();
        self.num_hops.store(0, Ordering::SeqCst);
    }
}

/// Helper: construct an error for "another operation is in
/// progress".
fn busy_err() -> Error {
    or_error::internal!("Another meta-cell operation is already in progress").into()
}

/// Helper: fully parse an unparsed relay cell, mapping decode
/// failures to protocol violations.
fn decode_msg(cell: UnparsedRelayCell) -> Result<AnyRelayMsg> {
    Ok(cell
        .decode::<AnyRelayMsg>()
        .map_err(|e| Error::CellDecodeErr {
            object: "relay cell",
            err: e,
        })?
        .into_msg())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channel::test::new_reactor;
    use crate::crypto::cell::{InboundRelayLayer, OutboundRelayLayer, RelayLayer};
    use crate::crypto::handshake::fast::CreateFastServer;
    use crate::crypto::handshake::ServerHandshake;
    use crate::stream::StreamParameters;
    use futures::executor::LocalPool;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use futures::task::LocalSpawnExt;
    use or_basic_utils::test_rng::testing_rng;
    use or_cell::chancell::msg::AnyChanMsg;

    /// The relay-side crypto state for one hop of a fake circuit.
    struct FakeHop {
        /// Fake relay's outbound (away-from-client) layer.
        fwd: crate::crypto::cell::tor1::CryptState<
            or_llcrypto::cipher::aes::Aes128Ctr,
            or_llcrypto::d::Sha1,
        >,
        /// Fake relay's inbound (towards-client) layer.
        back: crate::crypto::cell::tor1::CryptState<
            or_llcrypto::cipher::aes::Aes128Ctr,
            or_llcrypto::d::Sha1,
        >,
    }

    impl FakeHop {
        /// Decrypt and parse a cell that the client sent us.
        fn rx(&mut self, msg: AnyChanMsg) -> AnyRelayCell {
            let body = match msg {
                AnyChanMsg::Relay(r) | AnyChanMsg::RelayEarly(r) => r.into_relay_body(),
                m => panic!("expected relay cell, got {:?}", m),
            };
            let mut rb: RelayCellBody = body.into();
            assert!(self.fwd.decrypt_outbound(&mut rb));
            UnparsedRelayCell::from_body(rb.into())
                .decode::<AnyRelayMsg>()
                .unwrap()
        }

        /// Encrypt a reply towards the client.
        fn tx(&mut self, id: Option<StreamId>, msg: AnyRelayMsg) -> AnyChanMsg {
            let mut rng = testing_rng();
            let body = AnyRelayCell::new(id, msg).encode(&mut rng).unwrap();
            let mut rb: RelayCellBody = body.into();
            self.back.originate(&mut rb);
            chanmsg::Relay::from_raw(*BoxedCellBody::from(rb)).into()
        }
    }

    /// Set up a one-hop circuit over a fake channel, with reactors
    /// spawned on `spawner`.
    ///
    /// Returns the client's circuit, the fake relay's crypto, and
    /// the fake network's cell queues.
    async fn fake_circuit(
        spawner: &futures::executor::LocalSpawner,
    ) -> (
        super::super::ClientCirc,
        FakeHop,
        Option<CircId>,
        mpsc::Receiver<AnyChanCell>,
        mpsc::Sender<crate::channel::test::CodecResult>,
    ) {
        let (chan, chan_reactor, mut output, mut input) = new_reactor();
        spawner
            .spawn_local(async move {
                let _ = chan_reactor.run().await;
            })
            .unwrap();

        let (pending, circ_reactor) = chan.new_circ().await.unwrap();
        spawner
            .spawn_local(async move {
                let _ = circ_reactor.run().await;
            })
            .unwrap();

        let server = async {
            let cell = output.next().await.unwrap();
            let (circid, msg) = cell.into_circid_and_msg();
            let handshake = match msg {
                AnyChanMsg::CreateFast(cf) => cf.into_handshake(),
                m => panic!("expected CREATE_FAST, got {:?}", m),
            };
            let (keygen, reply) = {
                let mut rng = testing_rng();
                CreateFastServer::server(&mut rng, &(), handshake).unwrap()
            };
            input
                .send(Ok(AnyChanCell::new(
                    circid,
                    chanmsg::CreatedFast::new(reply).into(),
                )))
                .await
                .unwrap();
            let (fwd, back) = Tor1RelayCrypto::construct(keygen)
                .unwrap()
                .split_relay_layer();
            (FakeHop { fwd, back }, circid)
        };

        let (circ, (hop, circid)) = futures::join!(
            async { pending
                .create_firsthop_fast(&CircParameters::default())
                .await
                .unwrap() },
            server
        );
        assert_eq!(circ.n_hops(), 1);
        (circ, hop, circid, output, input)
    }

    #[test]
    fn stream_lifecycle() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        pool.run_until(async move {
            let (circ, mut hop, circid, mut output, mut input) = fake_circuit(&spawner).await;

            // The fake exit accepts one stream, echoes a reply, and
            // closes it.
            let server = async {
                // BEGIN
                let cell = output.next().await.unwrap();
                let parsed = hop.rx(cell.into_circid_and_msg().1);
                let stream_id = parsed.stream_id();
                assert!(stream_id.is_some());
                match parsed.into_msg() {
                    AnyRelayMsg::Begin(b) => {
                        assert_eq!(b.addr(), b"www.example.com");
                        assert_eq!(b.port(), 80);
                    }
                    m => panic!("expected BEGIN, got {:?}", m),
                }
                let connected =
                    hop.tx(stream_id, relaymsg::Connected::new_empty().into());
                input
                    .send(Ok(AnyChanCell::new(circid, connected)))
                    .await
                    .unwrap();

                // DATA in
                let cell = output.next().await.unwrap();
                let parsed = hop.rx(cell.into_circid_and_msg().1);
                match parsed.into_msg() {
                    AnyRelayMsg::Data(d) => assert_eq!(d.as_ref(), b"ping"),
                    m => panic!("expected DATA, got {:?}", m),
                }

                // DATA out, then a clean END.
                let data = hop.tx(
                    stream_id,
                    relaymsg::Data::new(b"pong").unwrap().into(),
                );
                input.send(Ok(AnyChanCell::new(circid, data))).await.unwrap();
                let end = hop.tx(
                    stream_id,
                    relaymsg::End::new_with_reason(EndReason::DONE).into(),
                );
                input.send(Ok(AnyChanCell::new(circid, end))).await.unwrap();
            };

            let client = async {
                let mut stream = circ
                    .begin_stream("www.example.com", 80, StreamParameters::new())
                    .await
                    .unwrap();
                stream.write_all(b"ping").await.unwrap();
                stream.flush().await.unwrap();

                let mut buf = vec![0_u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf[..], b"pong");

                // After the END, the stream reads EOF.
                let mut rest = Vec::new();
                let n = stream.read_to_end(&mut rest).await.unwrap();
                assert_eq!(n, 0);
            };

            futures::join!(client, server);
        });
    }

    #[test]
    fn flow_control_sendmes() {
        // Deliver 100 single-byte DATA cells: the client owes the
        // exit exactly two stream-level SENDMEs (at 50 and 100) and
        // one circuit-level SENDME (at 100).
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        pool.run_until(async move {
            let (circ, mut hop, circid, mut output, mut input) = fake_circuit(&spawner).await;

            let server = async {
                // Accept the stream.
                let cell = output.next().await.unwrap();
                let parsed = hop.rx(cell.into_circid_and_msg().1);
                let stream_id = parsed.stream_id();
                let connected =
                    hop.tx(stream_id, relaymsg::Connected::new_empty().into());
                input
                    .send(Ok(AnyChanCell::new(circid, connected)))
                    .await
                    .unwrap();

                // Blast 100 data cells.
                for _ in 0..100 {
                    let data = hop.tx(stream_id, relaymsg::Data::new(b"x").unwrap().into());
                    input.send(Ok(AnyChanCell::new(circid, data))).await.unwrap();
                }

                // Collect the acknowledgments.
                let mut stream_sendmes = 0;
                let mut circ_sendmes = 0;
                for _ in 0..3 {
                    let cell = output.next().await.unwrap();
                    let parsed = hop.rx(cell.into_circid_and_msg().1);
                    assert_eq!(parsed.cmd(), RelayCmd::SENDME);
                    if parsed.stream_id().is_some() {
                        stream_sendmes += 1;
                    } else {
                        circ_sendmes += 1;
                    }
                }
                assert_eq!(stream_sendmes, 2);
                assert_eq!(circ_sendmes, 1);
            };

            let client = async {
                let mut stream = circ
                    .begin_stream("example.com", 80, StreamParameters::new())
                    .await
                    .unwrap();
                let mut buf = vec![0_u8; 100];
                stream.read_exact(&mut buf).await.unwrap();
                assert!(buf.iter().all(|b| *b == b'x'));
                stream
            };

            let (_stream, ()) = futures::join!(client, server);
        });
    }

    #[test]
    fn digest_tamper_kills_circuit() {
        // Flip one byte in an inbound relay cell: the circuit must be
        // torn down with a protocol violation, and the channel must
        // emit a DESTROY.
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        pool.run_until(async move {
            let (circ, mut hop, circid, mut output, mut input) = fake_circuit(&spawner).await;

            // A tampered cell: valid crypto, then one bit flipped.
            let msg = hop.tx(None, relaymsg::Drop::new().into());
            let msg = match msg {
                AnyChanMsg::Relay(r) => {
                    let mut body = r.into_relay_body();
                    body[6] ^= 1; // within the digest field of the ciphertext
                    AnyChanMsg::Relay(chanmsg::Relay::from_raw(*body))
                }
                _ => unreachable!(),
            };
            input.send(Ok(AnyChanCell::new(circid, msg))).await.unwrap();

            // Any pending operation on the circuit now fails.
            let r = circ.await_rendezvous2().await;
            assert!(r.is_err());

            // And the channel sends a DESTROY for our circuit ID.
            let cell = output.next().await.unwrap();
            assert_eq!(cell.circid(), circid);
            assert!(matches!(cell.msg(), AnyChanMsg::Destroy(_)));
            assert!(circ.is_closing());
        });
    }

    #[test]
    fn extend_to_second_hop() {
        // Extend a one-hop circuit by a (TAP) hop, with the fake
        // relay playing both hops.
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        pool.run_until(async move {
            let (circ, mut hop1, circid, mut output, mut input) = fake_circuit(&spawner).await;

            let relay_sk = {
                let mut rng = testing_rng();
                or_llcrypto::pk::rsa::PrivateKey::generate(&mut rng, 1024).unwrap()
            };
            let target = OwnedCircTarget::new(
                "10.0.0.7".parse().unwrap(),
                9001,
                RsaIdentity::from([44; 20]),
                relay_sk.to_public_key().to_der(),
            );

            let server = async {
                // Hop 1 sees the EXTEND (in a RELAY_EARLY cell), and
                // "creates" hop 2.
                let cell = output.next().await.unwrap();
                let (_, msg) = cell.into_circid_and_msg();
                assert!(matches!(msg, AnyChanMsg::RelayEarly(_)));
                let parsed = hop1.rx(msg);
                let onionskin = match parsed.into_msg() {
                    AnyRelayMsg::Extend(e) => {
                        assert_eq!(e.port(), 9001);
                        assert_eq!(e.rsaid(), &RsaIdentity::from([44; 20]));
                        e.handshake().to_vec()
                    }
                    m => panic!("expected EXTEND, got {:?}", m),
                };
                let (keygen, reply) = {
                    use crate::crypto::handshake::tap::TapServer;
                    let mut rng = testing_rng();
                    TapServer::server(&mut rng, &relay_sk, onionskin).unwrap()
                };
                let (fwd2, back2) = Tor1RelayCrypto::construct(keygen)
                    .unwrap()
                    .split_relay_layer();
                // Hop 1 relays the EXTENDED back.
                let extended = hop1.tx(None, relaymsg::Extended::new(reply).into());
                input
                    .send(Ok(AnyChanCell::new(circid, extended)))
                    .await
                    .unwrap();
                FakeHop {
                    fwd: fwd2,
                    back: back2,
                }
            };

            let (r, mut hop2) = futures::join!(
                circ.extend(&target, &CircParameters::default()),
                server
            );
            r.unwrap();
            assert_eq!(circ.n_hops(), 2);

            // Now open a stream through both layers of crypto.
            let server2 = async {
                let cell = output.next().await.unwrap();
                let (_, msg) = cell.into_circid_and_msg();
                // Hop 1 must *not* recognize this cell...
                let body = match msg {
                    AnyChanMsg::Relay(r) => r.into_relay_body(),
                    m => panic!("expected relay cell, got {:?}", m),
                };
                let mut rb: RelayCellBody = body.into();
                assert!(!hop1.fwd.decrypt_outbound(&mut rb));
                // ...but hop 2 must.
                assert!(hop2.fwd.decrypt_outbound(&mut rb));
                let parsed = UnparsedRelayCell::from_body(rb.into())
                    .decode::<AnyRelayMsg>()
                    .unwrap();
                let stream_id = parsed.stream_id();
                assert!(matches!(parsed.msg(), AnyRelayMsg::Begin(_)));

                // The CONNECTED goes back through both layers.
                let mut rng = testing_rng();
                let body = AnyRelayCell::new(stream_id, relaymsg::Connected::new_empty().into())
                    .encode(&mut rng)
                    .unwrap();
                let mut rb: RelayCellBody = body.into();
                hop2.back.originate(&mut rb);
                hop1.back.encrypt_inbound(&mut rb);
                let connected: AnyChanMsg =
                    chanmsg::Relay::from_raw(*BoxedCellBody::from(rb)).into();
                input
                    .send(Ok(AnyChanCell::new(circid, connected)))
                    .await
                    .unwrap();
            };

            let (stream, ()) = futures::join!(
                circ.begin_stream("example.com", 443, StreamParameters::new()),
                server2
            );
            let _stream = stream.unwrap();
        });
    }
}
