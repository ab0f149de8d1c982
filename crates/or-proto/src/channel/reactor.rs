//! Code to handle incoming cells on a channel, and to schedule
//! outgoing cells fairly across its circuits.
//!
//! The role of this code is to run in a separate asynchronous task,
//! routing inbound cells to the right circuits, and flushing outbound
//! cells from the per-circuit queues in least-recently-busy order.

use super::circmap::{CircEnt, CircMap, CircuitRxSender};
use super::scheduler::{CellQueues, MAX_QUEUED_CELLS};
use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::halfcirc::HalfCirc;
use crate::util::err::ReactorError;
use crate::{Error, Result};
use or_cell::chancell::msg::{AnyChanMsg, Destroy, DestroyReason};
use or_cell::chancell::{AnyChanCell, ChanMsg, CircId};

use futures::channel::{mpsc, oneshot};
use futures::sink::Sink;
use futures::stream::{Stream, StreamExt};
use futures::SinkExt;

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// The default halflife for the per-circuit activity counters used in
/// write scheduling, used until the consensus supplies another value.
pub(super) const DEFAULT_EWMA_HALFLIFE: Duration = Duration::from_secs(30);

/// How many relay cells do we willingly receive on a circuit after
/// we've sent a DESTROY for it?
const HALF_CIRC_CELL_LIMIT: u16 = 3000;

/// A boxed trait object that can provide `AnyChanCell`s.
pub(super) type BoxedChannelStream =
    Box<dyn Stream<Item = std::result::Result<AnyChanCell, Error>> + Send + Unpin + 'static>;
/// A boxed trait object that can sink `AnyChanCell`s.
pub(super) type BoxedChannelSink =
    Box<dyn Sink<AnyChanCell, Error = Error> + Send + Unpin + 'static>;
/// The type of a oneshot channel used to inform reactor users of the
/// result of an operation.
pub(super) type ReactorResultChannel<T> = oneshot::Sender<Result<T>>;

/// A message telling the channel reactor to do something.
#[derive(Debug)]
pub(crate) enum CtrlMsg {
    /// Shut down the reactor.
    Shutdown,
    /// Tell the reactor that a given circuit has gone away.
    CloseCircuit(CircId),
    /// Allocate a new circuit in this channel's circuit map,
    /// generating an ID for it and registering senders for messages
    /// received for the circuit.
    AllocateCircuit {
        /// Channel to send the circuit's `CreateResponse` down.
        created_sender: oneshot::Sender<CreateResponse>,
        /// Channel to send other messages from this circuit down.
        sender: CircuitRxSender,
        /// Oneshot channel to send the new circuit's identifiers down.
        tx: ReactorResultChannel<(CircId, crate::circuit::UniqId)>,
    },
    /// Change the halflife used for write-scheduling fairness.
    ///
    /// The sender of these messages is responsible for eliding
    /// no-change updates.
    ConfigUpdate {
        /// New halflife for the per-circuit activity counters.
        ewma_halflife: Duration,
    },
}

/// The next thing for the reactor to do, as determined by a single
/// poll of all its event sources.
enum Action {
    /// A control message (or the end of the control queue) arrived.
    Ctrl(Option<CtrlMsg>),
    /// A cell (or the end of the TLS stream) arrived from the
    /// network.
    Input(Option<std::result::Result<AnyChanCell, Error>>),
    /// A circuit handed us a cell to queue for writing.
    Queue(Option<AnyChanCell>),
    /// The output sink can accept another queued cell.
    Flush,
}

/// Object to handle incoming cells and background tasks on a channel.
///
/// This type is returned when you finish a channel; you need to spawn
/// a new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the channel won't work."]
pub struct Reactor {
    /// A receiver for control messages from `Channel` objects.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// A receiver for cells to be sent on this reactor's sink.
    ///
    /// `Channel` objects have a sender that can send cells here.
    cells: mpsc::Receiver<AnyChanCell>,
    /// A Stream from which we can read `AnyChanCell`s.
    ///
    /// This should be backed by a TLS connection if you want it to be
    /// secure.
    input: futures::stream::Fuse<BoxedChannelStream>,
    /// A Sink to which we can write `AnyChanCell`s.
    ///
    /// This should also be backed by a TLS connection if you want it
    /// to be secure.
    output: BoxedChannelSink,
    /// The fair per-circuit queues of cells awaiting write capacity.
    queues: CellQueues,
    /// A map from circuit ID to Sinks on which we can deliver cells.
    circs: CircMap,
    /// A unique identifier for this channel.
    unique_id: super::UniqId,
    /// A shared flag to tell the frontend that this channel is
    /// closed.
    closed: Arc<AtomicBool>,
    /// Context for allocating unique circuit log identifiers.
    circ_unique_id_ctx: super::CircUniqIdContext,
    /// What link protocol is the channel using?
    #[allow(dead_code)] // We don't support protocols where this matters.
    link_protocol: u16,
}

/// Allows us to just say debug!("{}: did a thing", &self, ...)
impl fmt::Display for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.unique_id, f)
    }
}

impl Reactor {
    /// Construct a new Reactor from its parts.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        control: mpsc::UnboundedReceiver<CtrlMsg>,
        cells: mpsc::Receiver<AnyChanCell>,
        input: BoxedChannelStream,
        output: BoxedChannelSink,
        circs: CircMap,
        unique_id: super::UniqId,
        closed: Arc<AtomicBool>,
        circ_unique_id_ctx: super::CircUniqIdContext,
        link_protocol: u16,
        ewma_halflife: Duration,
    ) -> Self {
        Reactor {
            control,
            cells,
            input: input.fuse(),
            output,
            queues: CellQueues::new(ewma_halflife),
            circs,
            unique_id,
            closed,
            circ_unique_id_ctx,
            link_protocol,
        }
    }

    /// Launch the reactor, and run until the channel closes or we
    /// encounter an error.
    ///
    /// Once this function returns, the channel is dead, and can't be
    /// used again.
    pub async fn run(mut self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        trace!("{}: Running reactor", &self);
        let result: Result<()> = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        debug!("{}: Reactor stopped: {:?}", &self, result);
        self.closed.store(true, Ordering::SeqCst);
        // Dropping self.circs here drops every circuit's cell sender,
        // which is how the circuits' own reactors find out that the
        // channel died.
        result
    }

    /// Helper for run(): handles only one action.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        let action = {
            let control = &mut self.control;
            let input = &mut self.input;
            let cells = &mut self.cells;
            let output = &mut self.output;
            let queues = &mut self.queues;
            futures::future::poll_fn(move |cx| -> Poll<Result<Action>> {
                // Control messages always take precedence.
                if let Poll::Ready(v) = control.poll_next_unpin(cx) {
                    return Poll::Ready(Ok(Action::Ctrl(v)));
                }
                // Then inbound cells from the network.
                if let Poll::Ready(v) = input.poll_next_unpin(cx) {
                    return Poll::Ready(Ok(Action::Input(v)));
                }
                // If we have cells queued, see whether the network
                // can take one; otherwise drive any pending partial
                // write to completion.
                if queues.has_cells() {
                    match Pin::new(&mut *output).poll_ready(cx) {
                        Poll::Ready(Ok(())) => return Poll::Ready(Ok(Action::Flush)),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => (),
                    }
                } else if let Poll::Ready(Err(e)) = Pin::new(&mut *output).poll_flush(cx) {
                    return Poll::Ready(Err(e));
                }
                // Accept new cells from circuits only while there is
                // room in the queues: when they are full, the
                // circuits' bounded senders block, and flow control
                // propagates backwards through the tunnels.
                if queues.n_queued() < MAX_QUEUED_CELLS {
                    if let Poll::Ready(v) = cells.poll_next_unpin(cx) {
                        return Poll::Ready(Ok(Action::Queue(v)));
                    }
                }
                Poll::Pending
            })
            .await?
        };

        match action {
            Action::Ctrl(None) | Action::Ctrl(Some(CtrlMsg::Shutdown)) => {
                return Err(ReactorError::Shutdown)
            }
            Action::Ctrl(Some(ctrl)) => self.handle_control(ctrl).await?,
            Action::Input(None) => {
                // The TLS connection went away underneath us.
                return Err(Error::ChannelClosed.into());
            }
            Action::Input(Some(item)) => {
                let item = item?;
                self.handle_cell(item).await?;
            }
            Action::Queue(None) => {
                // Every sender is gone: no Channel and no circuit can
                // give us anything more to do.
                return Err(ReactorError::Shutdown);
            }
            Action::Queue(Some(cell)) => {
                self.queues.push(cell, Instant::now());
            }
            Action::Flush => {
                if let Some(cell) = self.queues.pop(Instant::now()) {
                    Pin::new(&mut self.output).start_send(cell)?;
                }
            }
        }
        Ok(()) // Run again.
    }

    /// Handle a CtrlMsg other than Shutdown.
    async fn handle_control(&mut self, msg: CtrlMsg) -> Result<()> {
        trace!("{}: reactor received {:?}", &self, msg);
        match msg {
            CtrlMsg::Shutdown => panic!(), // was handled in reactor loop.
            CtrlMsg::CloseCircuit(id) => self.outbound_destroy_circ(id)?,
            CtrlMsg::AllocateCircuit {
                created_sender,
                sender,
                tx,
            } => {
                let mut rng = rand::rng();
                let my_unique_id = self.unique_id;
                let circ_unique_id = self.circ_unique_id_ctx.next(my_unique_id);
                let ret: Result<_> = self
                    .circs
                    .add_ent(&mut rng, created_sender, sender)
                    .map(|id| (id, circ_unique_id));
                let _ = tx.send(ret); // don't care about other side going away
            }
            CtrlMsg::ConfigUpdate { ewma_halflife } => {
                self.queues.set_halflife(ewma_halflife);
            }
        }
        Ok(())
    }

    /// Helper: process a cell on a channel.  Most cell types get
    /// ignored or rejected; a few get delivered to circuits.
    async fn handle_cell(&mut self, cell: AnyChanCell) -> Result<()> {
        let (circid, msg) = cell.into_circid_and_msg();
        use AnyChanMsg::*;

        match msg {
            Relay(_) | Padding(_) | Vpadding(_) => {} // too frequent to log.
            _ => trace!(
                "{}: received {} for {}",
                &self,
                msg.cmd(),
                CircId::get_or_zero(circid)
            ),
        }

        match msg {
            // These are allowed, and need to be handled.
            Relay(_) => self.deliver_relay(circid, msg).await,

            Destroy(_) => self.deliver_destroy(circid, msg).await,

            Created(_) | CreatedFast(_) => self.deliver_created(circid, msg),

            // These are always ignored.
            Padding(_) | Vpadding(_) => Ok(()),

            // Everything else is unexpected after the handshake.
            m => Err(Error::ChanProto(format!(
                "Unexpected {} cell on open channel",
                m.cmd()
            ))),
        }
    }

    /// Give the RELAY cell `msg` to the appropriate circuit.
    async fn deliver_relay(&mut self, circid: Option<CircId>, msg: AnyChanMsg) -> Result<()> {
        let circid = circid.ok_or_else(|| Error::ChanProto("Relay cell without circuit ID".into()))?;

        match self.circs.get_mut(circid) {
            Some(CircEnt::Open(s)) => {
                // There's an open circuit; we can give it the RELAY
                // cell.
                let ccmsg = ClientCircChanMsg::try_from(msg)?;
                if s.send(ccmsg).await.is_err() {
                    // The circuit's receiver went away, so we should
                    // destroy the circuit.
                    self.outbound_destroy_circ(circid)?;
                }
                Ok(())
            }
            Some(CircEnt::Opening(_, _)) => Err(Error::ChanProto(
                "Relay cell on pending circuit before CREATED* received".into(),
            )),
            Some(CircEnt::DestroySent(hs)) => hs.receive_cell(),
            None => Err(Error::ChanProto("Relay cell on nonexistent circuit".into())),
        }
    }

    /// Handle a CREATED or CREATED_FAST cell by passing it on to the
    /// appropriate circuit, if that circuit is waiting for one.
    fn deliver_created(&mut self, circid: Option<CircId>, msg: AnyChanMsg) -> Result<()> {
        let circid =
            circid.ok_or_else(|| Error::ChanProto("'Created' cell without circuit ID".into()))?;
        let target = self.circs.advance_from_opening(circid)?;
        let created = msg.try_into()?;
        target.send(created).map_err(|_| {
            Error::from(or_error::internal!(
                "Circuit queue rejected created message. Is it closing?"
            ))
        })
    }

    /// Handle a DESTROY cell by removing the corresponding circuit
    /// from the map, and passing the destroy cell onward to the
    /// circuit.
    async fn deliver_destroy(&mut self, circid: Option<CircId>, msg: AnyChanMsg) -> Result<()> {
        let circid =
            circid.ok_or_else(|| Error::ChanProto("'Destroy' cell without circuit ID".into()))?;
        // Remove the circuit from the map: nothing more can be done
        // with it.
        let entry = self.circs.remove(circid);
        self.queues.remove_circ(circid);
        match entry {
            // If the circuit is waiting for CREATED, tell it that it
            // won't get one.
            Some(CircEnt::Opening(oneshot, _)) => {
                trace!("{}: Passing destroy to pending circuit {}", &self, circid);
                oneshot
                    .send(msg.try_into()?)
                    .map_err(|_| {
                        Error::from(or_error::internal!(
                            "pending circuit wasn't interested in destroy cell?"
                        ))
                    })
            }
            // It's an open circuit: tell it that it got a DESTROY cell.
            Some(CircEnt::Open(mut sink)) => {
                trace!("{}: Passing destroy to open circuit {}", &self, circid);
                let ccmsg = ClientCircChanMsg::try_from(msg)?;
                // The circuit might have gone away at the same time;
                // that's not an error.
                let _ = sink.send(ccmsg).await;
                Ok(())
            }
            // We've sent a destroy; we can leave this circuit removed.
            Some(CircEnt::DestroySent(_)) => Ok(()),
            // Got a DESTROY cell for a circuit we don't have.
            None => {
                trace!("{}: Destroy for nonexistent circuit {}", &self, circid);
                Err(Error::ChanProto("Destroy for nonexistent circuit".into()))
            }
        }
    }

    /// Called when a circuit goes away: sends a DESTROY cell and
    /// removes the circuit.
    ///
    /// The DESTROY bypasses the fair queues: tearing down a circuit
    /// must not wait behind that circuit's own queued traffic, which
    /// we discard.
    fn outbound_destroy_circ(&mut self, id: CircId) -> Result<()> {
        trace!("{}: Circuit {} is gone; sending DESTROY", &self, id);
        // Remove the circuit's entry from the map: nothing more can
        // be done with it.
        self.circs.destroy_sent(id, HalfCirc::new(HALF_CIRC_CELL_LIMIT));
        self.queues.remove_circ(id);
        let destroy = Destroy::new(DestroyReason::NONE).into();
        let cell = AnyChanCell::new(Some(id), destroy);
        self.queues.push_priority(cell);

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channel::{ClockSkew, UniqId};
    use futures::sink::SinkExt;
    use futures::stream::StreamExt;
    use or_cell::chancell::msg;

    pub(crate) type CodecResult = std::result::Result<AnyChanCell, Error>;

    /// Make a new reactor with mocked channels for everything.
    pub(crate) fn new_reactor() -> (
        crate::channel::Channel,
        Reactor,
        mpsc::Receiver<AnyChanCell>,
        mpsc::Sender<CodecResult>,
    ) {
        let link_protocol = 3;
        let (send1, recv1) = mpsc::channel(32);
        let (send2, recv2) = mpsc::channel(32);
        let unique_id = UniqId::new();
        let peer_id = [10_u8; 20].into();
        let send1 = send1.sink_map_err(|_| Error::ChannelClosed);
        let (chan, reactor) = crate::channel::Channel::new(
            link_protocol,
            Box::new(send1),
            Box::new(recv2),
            unique_id,
            peer_id,
            ClockSkew::None,
            Duration::from_secs(30),
        );
        (chan, reactor, recv1, send2)
    }

    // Try shutdown from inside run_once.
    #[test]
    fn shutdown() {
        futures::executor::block_on(async {
            let (chan, mut reactor, _output, _input) = new_reactor();

            chan.terminate();
            let r = reactor.run_once().await;
            assert!(matches!(r, Err(ReactorError::Shutdown)));
        });
    }

    // Try shutdown while reactor is running.
    #[test]
    fn shutdown2() {
        futures::executor::block_on(async {
            use futures::future::FutureExt;
            use futures::join;

            let (chan, reactor, _output, _input) = new_reactor();
            // Let's get the reactor running...
            let run_reactor = reactor.run().map(|x| x.is_ok()).shared();

            let rr = run_reactor.clone();

            let exit_then_check = async {
                assert!(rr.peek().is_none());
                // ... and terminate the channel while that's
                // happening.
                chan.terminate();
            };

            let (rr_s, _) = join!(run_reactor, exit_then_check);

            // Now let's see. The reactor should not _still_ be
            // running.
            assert!(rr_s);
            assert!(chan.is_closing());
        });
    }

    #[test]
    fn new_circ_closed() {
        futures::executor::block_on(async {
            let (chan, mut reactor, mut output, _input) = new_reactor();

            let (ret, reac) = futures::join!(chan.new_circ(), reactor.run_once());
            let (pending, circr) = ret.unwrap();
            assert!(reac.is_ok());

            let id = pending.peek_circid();

            let ent = reactor.circs.get_mut(id);
            assert!(matches!(ent, Some(CircEnt::Opening(_, _))));

            // Now drop the circuit, and run its reactor to
            // completion; it should tell the channel to remove the
            // circuit from the map and send a DESTROY.
            drop(pending);
            let r = circr.run().await;
            assert!(r.is_ok());

            reactor.run_once().await.unwrap(); // handle the control msg
            reactor.run_once().await.unwrap(); // flush the destroy
            let ent = reactor.circs.get_mut(id);
            assert!(matches!(ent, Some(CircEnt::DestroySent(_))));
            let cell = output.next().await.unwrap();
            assert_eq!(cell.circid(), Some(id));
            assert!(matches!(cell.msg(), AnyChanMsg::Destroy(_)));
        });
    }

    // Try incoming cells that shouldn't arrive on channels.
    #[test]
    fn bad_cells() {
        futures::executor::block_on(async {
            let (_chan, mut reactor, _output, mut input) = new_reactor();

            // shouldn't get created cells for nonexistent circuits
            let created_cell = msg::Created::new(vec![0; 148]).into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(7), created_cell)))
                .await
                .unwrap();

            let e = reactor.run_once().await.unwrap_err().unwrap_err();
            assert_eq!(
                format!("{}", e),
                "channel protocol violation: Unexpected CREATED* cell not on opening circuit"
            );

            // Can't get a relay cell on a circuit we've never heard
            // of.
            let relay_cell = msg::Relay::new(b"abc").into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(4), relay_cell)))
                .await
                .unwrap();
            let e = reactor.run_once().await.unwrap_err().unwrap_err();
            assert_eq!(
                format!("{}", e),
                "channel protocol violation: Relay cell on nonexistent circuit"
            );
        });
    }

    #[test]
    fn deliver_relay() {
        futures::executor::block_on(async {
            let (_chan, mut reactor, _output, mut input) = new_reactor();

            let (_circ_stream_7, mut circ_stream_13) = {
                let (snd1, _rcv1) = oneshot::channel();
                let (snd2, rcv2) = mpsc::channel(64);
                reactor
                    .circs
                    .put_unchecked(CircId::new(7).unwrap(), CircEnt::Opening(snd1, snd2));

                let (snd3, rcv3) = mpsc::channel(64);
                reactor
                    .circs
                    .put_unchecked(CircId::new(13).unwrap(), CircEnt::Open(snd3));

                reactor.circs.put_unchecked(
                    CircId::new(23).unwrap(),
                    CircEnt::DestroySent(HalfCirc::new(25)),
                );
                (rcv2, rcv3)
            };

            // If a relay cell is sent on an open circuit, the correct
            // circuit should get it.
            let relaycell: AnyChanMsg = msg::Relay::new(b"do you suppose").into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(13), relaycell)))
                .await
                .unwrap();
            reactor.run_once().await.unwrap();
            let got = circ_stream_13.next().await.unwrap();
            assert!(matches!(got, ClientCircChanMsg::Relay(_)));

            // If a relay cell is sent on an opening circuit, that's
            // an error.
            let relaycell: AnyChanMsg = msg::Relay::new(b"do you suppose").into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(7), relaycell)))
                .await
                .unwrap();
            let e = reactor.run_once().await.unwrap_err().unwrap_err();
            assert_eq!(
                format!("{}", e),
                "channel protocol violation: Relay cell on pending circuit before CREATED* received"
            );

            // If a relay cell is sent on a non-existent circuit,
            // that's an error.
            let relaycell: AnyChanMsg = msg::Relay::new(b"do you suppose").into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(101), relaycell)))
                .await
                .unwrap();
            let e = reactor.run_once().await.unwrap_err().unwrap_err();
            assert_eq!(
                format!("{}", e),
                "channel protocol violation: Relay cell on nonexistent circuit"
            );

            // It's fine to get a relay cell on a DestroySent circuit:
            // that happens when the other side hasn't noticed the
            // Destroy yet.

            // We can do this 25 more times according to our setup:
            for _ in 0..25 {
                let relaycell: AnyChanMsg = msg::Relay::new(b"do you suppose").into();
                input
                    .send(Ok(AnyChanCell::new(CircId::new(23), relaycell)))
                    .await
                    .unwrap();
                reactor.run_once().await.unwrap(); // should be fine.
            }

            // This one will fail.
            let relaycell: AnyChanMsg = msg::Relay::new(b"do you suppose").into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(23), relaycell)))
                .await
                .unwrap();
            let e = reactor.run_once().await.unwrap_err().unwrap_err();
            assert_eq!(
                format!("{}", e),
                "channel protocol violation: Too many cells received on destroyed circuit"
            );
        });
    }

    #[test]
    fn deliver_destroy() {
        futures::executor::block_on(async {
            let (_chan, mut reactor, _output, mut input) = new_reactor();

            let (circ_oneshot_7, mut circ_stream_13) = {
                let (snd1, rcv1) = oneshot::channel();
                let (snd2, _rcv2) = mpsc::channel(64);
                reactor
                    .circs
                    .put_unchecked(CircId::new(7).unwrap(), CircEnt::Opening(snd1, snd2));

                let (snd3, rcv3) = mpsc::channel(64);
                reactor
                    .circs
                    .put_unchecked(CircId::new(13).unwrap(), CircEnt::Open(snd3));

                reactor.circs.put_unchecked(
                    CircId::new(23).unwrap(),
                    CircEnt::DestroySent(HalfCirc::new(25)),
                );
                (rcv1, rcv3)
            };

            // Destroying an opening circuit is fine.
            let destroycell: AnyChanMsg = msg::Destroy::new(0.into()).into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(7), destroycell)))
                .await
                .unwrap();
            reactor.run_once().await.unwrap();
            let msg = circ_oneshot_7.await;
            assert!(matches!(msg, Ok(CreateResponse::Destroy(_))));

            // Destroying an open circuit is fine.
            let destroycell: AnyChanMsg = msg::Destroy::new(0.into()).into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(13), destroycell)))
                .await
                .unwrap();
            reactor.run_once().await.unwrap();
            let msg = circ_stream_13.next().await.unwrap();
            assert!(matches!(msg, ClientCircChanMsg::Destroy(_)));

            // Destroying a DestroySent circuit is fine.
            let destroycell: AnyChanMsg = msg::Destroy::new(0.into()).into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(23), destroycell)))
                .await
                .unwrap();
            reactor.run_once().await.unwrap();

            // Destroying a nonexistent circuit is an error.
            let destroycell: AnyChanMsg = msg::Destroy::new(0.into()).into();
            input
                .send(Ok(AnyChanCell::new(CircId::new(101), destroycell)))
                .await
                .unwrap();
            let e = reactor.run_once().await.unwrap_err().unwrap_err();
            assert_eq!(
                format!("{}", e),
                "channel protocol violation: Destroy for nonexistent circuit"
            );
        });
    }

    #[test]
    fn cells_flow_through() {
        // Cells sent by Channel handles reach the network via the
        // fair queues.  (Fairness itself is tested in the scheduler
        // module, where the queues can be filled without racing the
        // flush side.)
        futures::executor::block_on(async {
            let (mut chan, mut reactor, mut output, _input) = new_reactor();

            for _ in 0..4 {
                chan.send_cell(AnyChanCell::new(
                    CircId::new(0x11),
                    msg::Relay::new(b"busy").into(),
                ))
                .await
                .unwrap();
            }
            chan.send_cell(AnyChanCell::new(
                CircId::new(0x22),
                msg::Relay::new(b"quiet").into(),
            ))
            .await
            .unwrap();

            // Each cell takes one run_once to queue and one to flush.
            for _ in 0..10 {
                reactor.run_once().await.unwrap();
            }
            let mut seen_11 = 0;
            let mut seen_22 = 0;
            for _ in 0..5 {
                match CircId::get_or_zero(output.next().await.unwrap().circid()) {
                    0x11 => seen_11 += 1,
                    0x22 => seen_22 += 1,
                    _ => panic!("unexpected circuit ID"),
                }
            }
            assert_eq!((seen_11, seen_22), (4, 1));
        });
    }
}
