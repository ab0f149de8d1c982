//! Abstract implementation of a channel manager.

use crate::{Error, OwnedChanTarget, Result};

use async_trait::async_trait;
use futures::channel::oneshot;
use or_llcrypto::pk::rsa::RsaIdentity;
use std::collections::{hash_map::Entry, HashMap};
use std::sync::Mutex;
use tracing::trace;

/// Trait to describe as much of a channel as the manager needs.
///
/// (We can't use the real Channel type in unit tests, since building
/// one requires a whole handshake.)
pub(crate) trait AbstractChannel: Clone {
    /// Return true if this channel is usable: not closed or closing.
    fn is_usable(&self) -> bool;
}

impl AbstractChannel for or_proto::channel::Channel {
    fn is_usable(&self) -> bool {
        !self.is_closing()
    }
}

/// Trait for an object that knows how to build channels.
#[async_trait]
pub(crate) trait ChannelFactory {
    /// The type of channel this factory builds.
    type Channel: AbstractChannel;

    /// Construct (dial, handshake, and launch) a channel to `target`.
    async fn build_channel(&self, target: &OwnedChanTarget) -> Result<Self::Channel>;
}

/// The state of a channel (or channel attempt) within the manager's
/// map.
enum ChannelState<C> {
    /// A channel that is open for use.
    Open(C),
    /// A channel that is being built, with a list of waiters to
    /// notify when it is ready (or failed).
    Building(Vec<oneshot::Sender<Result<C>>>),
}

/// A map from relay identity to channel state.
///
/// The invariant that matters: for a given identity there is at most
/// one live channel (or in-progress attempt) at a time.
pub(crate) struct AbstractChanMgr<F: ChannelFactory> {
    /// The factory that builds our channels.
    factory: F,
    /// The map of channels themselves.
    channels: Mutex<HashMap<RsaIdentity, ChannelState<F::Channel>>>,
}

/// What to do after consulting the map for a given request.
enum Action<C> {
    /// Return this open channel.
    Return(C),
    /// Wait for the pending attempt to finish.
    Wait(oneshot::Receiver<Result<C>>),
    /// We are the ones who will launch the attempt.
    Launch,
}

impl<F: ChannelFactory> AbstractChanMgr<F> {
    /// Construct a new AbstractChanMgr with a given factory.
    pub(crate) fn new(factory: F) -> Self {
        AbstractChanMgr {
            factory,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Get a channel to `target`, launching one if needed.
    pub(crate) async fn get_or_launch(&self, target: OwnedChanTarget) -> Result<F::Channel> {
        let ident = *target.rsa_identity();

        let action = {
            let mut map = self.channels.lock().expect("channel map poisoned");
            match map.entry(ident) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    ChannelState::Open(ch) => {
                        if ch.is_usable() {
                            Action::Return(ch.clone())
                        } else {
                            // The old channel is dead; launch a
                            // replacement.
                            occupied.insert(ChannelState::Building(Vec::new()));
                            Action::Launch
                        }
                    }
                    ChannelState::Building(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Action::Wait(rx)
                    }
                },
                Entry::Vacant(vacant) => {
                    vacant.insert(ChannelState::Building(Vec::new()));
                    Action::Launch
                }
            }
        };

        match action {
            Action::Return(ch) => Ok(ch),
            Action::Wait(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::PendingFailed),
            },
            Action::Launch => {
                trace!("Launching new channel to {}", target.rsa_identity());
                let result = self.factory.build_channel(&target).await;

                // Update the map, and collect the waiters to notify.
                let waiters = {
                    let mut map = self.channels.lock().expect("channel map poisoned");
                    let old = match result {
                        Ok(ref ch) => map.insert(ident, ChannelState::Open(ch.clone())),
                        Err(_) => map.remove(&ident),
                    };
                    match old {
                        Some(ChannelState::Building(waiters)) => waiters,
                        // Somebody replaced our entry: nothing to
                        // notify.
                        _ => Vec::new(),
                    }
                };
                for waiter in waiters {
                    let outcome = match &result {
                        Ok(ch) => Ok(ch.clone()),
                        Err(_) => Err(Error::PendingFailed),
                    };
                    let _ = waiter.send(outcome);
                }

                result
            }
        }
    }

    /// Forget about every unusable channel in the map.
    pub(crate) fn remove_unusable_entries(&self) -> Result<()> {
        let mut map = self.channels.lock().expect("channel map poisoned");
        map.retain(|_, state| match state {
            ChannelState::Open(ch) => ch.is_usable(),
            ChannelState::Building(_) => true,
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A fake "channel" that records whether it's usable.
    #[derive(Clone)]
    struct FakeChannel {
        /// Identity we pretend to be connected to.
        ident: RsaIdentity,
        /// Whether the channel claims to be usable.
        usable: Arc<AtomicBool>,
    }
    impl AbstractChannel for FakeChannel {
        fn is_usable(&self) -> bool {
            self.usable.load(Ordering::SeqCst)
        }
    }

    /// A fake factory that counts its launches, and can be told to
    /// fail.
    struct FakeFactory {
        /// Number of times build_channel has been called.
        n_launches: AtomicUsize,
        /// If true, all launches fail.
        fail: AtomicBool,
    }
    #[async_trait]
    impl ChannelFactory for FakeFactory {
        type Channel = FakeChannel;
        async fn build_channel(&self, target: &OwnedChanTarget) -> Result<FakeChannel> {
            self.n_launches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::PendingFailed)
            } else {
                Ok(FakeChannel {
                    ident: *target.rsa_identity(),
                    usable: Arc::new(AtomicBool::new(true)),
                })
            }
        }
    }

    fn new_mgr() -> AbstractChanMgr<FakeFactory> {
        AbstractChanMgr::new(FakeFactory {
            n_launches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn target(b: u8) -> OwnedChanTarget {
        OwnedChanTarget::new(
            std::net::SocketAddr::from(([127, 0, 0, 1], 9001)),
            RsaIdentity::from([b; 20]),
        )
    }

    #[test]
    fn reuses_open_channels() {
        futures::executor::block_on(async {
            let mgr = new_mgr();
            let c1 = mgr.get_or_launch(target(1)).await.unwrap();
            let c2 = mgr.get_or_launch(target(1)).await.unwrap();
            assert_eq!(c1.ident, c2.ident);
            assert_eq!(mgr.factory.n_launches.load(Ordering::SeqCst), 1);

            // A different relay gets its own channel.
            let _c3 = mgr.get_or_launch(target(2)).await.unwrap();
            assert_eq!(mgr.factory.n_launches.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn replaces_dead_channels() {
        futures::executor::block_on(async {
            let mgr = new_mgr();
            let c1 = mgr.get_or_launch(target(1)).await.unwrap();
            c1.usable.store(false, Ordering::SeqCst);

            let c2 = mgr.get_or_launch(target(1)).await.unwrap();
            assert!(c2.is_usable());
            assert_eq!(mgr.factory.n_launches.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn failures_are_reported() {
        futures::executor::block_on(async {
            let mgr = new_mgr();
            mgr.factory.fail.store(true, Ordering::SeqCst);
            assert!(mgr.get_or_launch(target(1)).await.is_err());

            // The failed attempt doesn't poison the entry.
            mgr.factory.fail.store(false, Ordering::SeqCst);
            assert!(mgr.get_or_launch(target(1)).await.is_ok());
        });
    }

    #[test]
    fn removal() {
        futures::executor::block_on(async {
            let mgr = new_mgr();
            let c1 = mgr.get_or_launch(target(1)).await.unwrap();
            let _c2 = mgr.get_or_launch(target(2)).await.unwrap();
            c1.usable.store(false, Ordering::SeqCst);
            mgr.remove_unusable_entries().unwrap();
            {
                let map = mgr.channels.lock().unwrap();
                assert_eq!(map.len(), 1);
            }
        });
    }
}
