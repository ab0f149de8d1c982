//! The top-level client object.

use crate::address::{Host, TorAddr};
use crate::config::OnionRouteConfig;
use crate::status::BootstrapStatus;
use crate::{Error, Result};

use or_chanmgr::ChanMgr;
use or_circmgr::{CircMgr, TargetPort};
use or_hsclient::{HsClientConnector, HsDescParser};
use or_netdir::DirProvider;
use or_proto::circuit::ClientCirc;
use or_proto::stream::{DataStream, StreamParameters};
use or_rtcompat::{Runtime, SleepProvider, SpawnExt};

use or_cell::relaycell::msg::EndReason;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many distinct circuits we will try for a single stream before
/// giving up.
const MAX_STREAM_ATTEMPTS: usize = 3;

/// How often the background task wakes up to do its housekeeping.
const BACKGROUND_TASK_INTERVAL: Duration = Duration::from_secs(30);

/// An active client on the onion-routing network.
///
/// Once you have one of these, you can anonymously
/// [`connect`](OnionRouteClient::connect) to hosts on the Internet
/// (through exit relays), or to hidden services.
///
/// Cloning this object is cheap; all clones share state.
pub struct OnionRouteClient<R: Runtime> {
    /// The runtime we use for sleeping and spawning.
    runtime: R,
    /// The channel manager.
    chanmgr: Arc<ChanMgr<R>>,
    /// The circuit manager.
    circmgr: Arc<CircMgr<R>>,
    /// The hidden-service connector.
    hsclient: Arc<HsClientConnector<R>>,
    /// Our view of the network directory.
    dir: Arc<dyn DirProvider>,
    /// Sender side of the bootstrap status.
    status_tx: Mutex<postage::watch::Sender<BootstrapStatus>>,
    /// Receiver side of the bootstrap status, cloned out to
    /// subscribers.
    status_rx: postage::watch::Receiver<BootstrapStatus>,
    /// Cache of DNS answers resolved through exits.
    dns_cache: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl<R: Runtime> OnionRouteClient<R> {
    /// Construct a new client.
    ///
    /// The `dir` provider is the external collaborator that keeps a
    /// fresh consensus; `parser` is its counterpart for
    /// hidden-service descriptors.
    pub fn new(
        runtime: R,
        dir: Arc<dyn DirProvider>,
        parser: Arc<dyn HsDescParser>,
        config: OnionRouteConfig,
    ) -> Arc<Self> {
        let chanmgr = Arc::new(ChanMgr::new(runtime.clone()));
        let circmgr = CircMgr::new(
            runtime.clone(),
            Arc::clone(&chanmgr),
            Arc::clone(&dir),
            config.circmgr.clone(),
        );
        let hsclient = Arc::new(HsClientConnector::new(
            runtime.clone(),
            Arc::clone(&circmgr),
            Arc::clone(&dir),
            parser,
        ));
        let (status_tx, status_rx) = postage::watch::channel();

        let client = Arc::new(OnionRouteClient {
            runtime,
            chanmgr,
            circmgr,
            hsclient,
            dir,
            status_tx: Mutex::new(status_tx),
            status_rx,
            dns_cache: Mutex::new(HashMap::new()),
        });
        client.apply_auth_entries(&config);
        client
    }

    /// Install the configured HidServAuth cookies into the
    /// hidden-service connector.
    fn apply_auth_entries(&self, config: &OnionRouteConfig) {
        for entry in &config.hidserv_auth {
            match entry.hsid() {
                Ok(hsid) => self
                    .hsclient
                    .set_auth_cookie(hsid, entry.cookie.as_bytes().to_vec()),
                Err(e) => warn!("Ignoring HidServAuth entry: {}", e),
            }
        }
    }

    /// Replace the client's configuration.
    ///
    /// The change takes effect at the next safe point: existing
    /// circuits and streams are not disturbed.
    pub fn reconfigure(&self, config: OnionRouteConfig) {
        self.circmgr.reconfigure(config.circmgr.clone());
        self.apply_auth_entries(&config);
    }

    /// Return a stream of bootstrap status values.
    ///
    /// The current status is always available immediately; later
    /// values arrive as bootstrapping proceeds.
    pub fn bootstrap_events(&self) -> postage::watch::Receiver<BootstrapStatus> {
        self.status_rx.clone()
    }

    /// Return the current bootstrap status.
    pub fn status(&self) -> BootstrapStatus {
        *self.status_rx.borrow()
    }

    /// Record and publish a new bootstrap status.
    fn note_status(&self, status: BootstrapStatus) {
        debug!("Bootstrap: {} ({}%)", status, status.progress());
        let mut tx = self.status_tx.lock().expect("status poisoned");
        *tx.borrow_mut() = status;
    }

    /// Drive the client to readiness: wait for the directory
    /// provider to produce a usable consensus, then build the first
    /// preemptive circuit.
    pub async fn bootstrap(&self) -> Result<()> {
        use BootstrapStatus::*;
        self.note_status(Starting);

        // Wait for our external collaborator to give us a directory.
        self.note_status(RequestingStatus);
        let netdir = loop {
            match self.dir.netdir() {
                Some(nd) if !nd.is_expired_at(std::time::SystemTime::now()) => break nd,
                Some(_) => self.note_status(LoadingStatus),
                None => (),
            }
            self.runtime.sleep(Duration::from_millis(500)).await;
        };
        self.note_status(LoadingDescriptors);
        self.circmgr.update_network_parameters(&netdir);

        // Build the first circuit; this is what exercises the whole
        // stack end to end.
        self.note_status(ConnOr);
        self.note_status(CircuitCreate);
        self.circmgr.maintain_preemptive_circuits().await;

        self.note_status(Done);
        info!("Bootstrapped successfully");
        Ok(())
    }

    /// Launch the periodic housekeeping task: preemptive circuit
    /// maintenance, channel cleanup, and parameter refresh.
    pub fn launch_background_tasks(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.runtime
            .spawn(async move {
                loop {
                    this.runtime.sleep(BACKGROUND_TASK_INTERVAL).await;
                    let _ = this.chanmgr.remove_unusable_entries();
                    if let Some(nd) = this.dir.netdir() {
                        this.circmgr.update_network_parameters(&nd);
                    }
                    this.circmgr.maintain_preemptive_circuits().await;
                }
            })
            .map_err(|e| {
                Error::Bug(or_error::Bug::from_error(e, "unable to spawn background task"))
            })
    }

    /// Open an anonymized stream to `target`.
    ///
    /// The returned [`DataStream`] is already connected: the open has
    /// been acknowledged end to end.
    pub async fn connect(&self, target: &TorAddr) -> Result<DataStream> {
        if !self.status().is_ready() {
            return Err(Error::NotBootstrapped);
        }
        match target.host() {
            Host::Onion(hsid) => {
                let circ = self.hsclient.get_or_launch_connection(*hsid).await?;
                let stream = circ
                    .begin_stream(&target.begin_host(), target.port(), StreamParameters::new())
                    .await
                    .map_err(Error::Proto)?;
                Ok(stream)
            }
            _ => self.connect_via_exit(target).await,
        }
    }

    /// Open a stream through an exit relay, retrying (on a distinct
    /// circuit) when an exit turns us down.
    async fn connect_via_exit(&self, target: &TorAddr) -> Result<DataStream> {
        let ports = [TargetPort::new(target.port())];
        let host = target.begin_host();
        let mut last_err = Error::StreamAttachFailed;

        for attempt in 0..MAX_STREAM_ATTEMPTS {
            let circ = self.circmgr.get_or_launch_exit(&ports).await?;
            match circ
                .begin_stream(&host, target.port(), StreamParameters::new())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(or_proto::Error::EndReceived(reason)) if exit_retryable(reason) => {
                    debug!(
                        "Stream attempt {} refused by exit ({}); retrying elsewhere",
                        attempt + 1,
                        reason
                    );
                    // Don't offer this circuit to new streams: its
                    // exit doesn't do what its policy claimed.
                    self.retire_circuit_quietly(&circ);
                    last_err = Error::Proto(or_proto::Error::EndReceived(reason));
                }
                Err(e) => return Err(Error::Proto(e)),
            }
        }
        Err(last_err)
    }

    /// Remove a circuit from the reuse pool without tearing it down.
    fn retire_circuit_quietly(&self, circ: &ClientCirc) {
        self.circmgr.retire_circuit(circ);
    }

    /// Anonymously resolve `hostname` through an exit relay.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        if !self.status().is_ready() {
            return Err(Error::NotBootstrapped);
        }
        if let Some(cached) = self
            .dns_cache
            .lock()
            .expect("dns cache poisoned")
            .get(hostname)
        {
            return Ok(cached.clone());
        }
        let circ = self.circmgr.get_or_launch_exit(&[]).await?;
        let answers = circ.resolve(hostname).await.map_err(Error::Proto)?;
        self.dns_cache
            .lock()
            .expect("dns cache poisoned")
            .insert(hostname.to_string(), answers.clone());
        Ok(answers)
    }

    /// Drop every cached DNS answer.
    pub fn clear_dns_cache(&self) {
        self.dns_cache.lock().expect("dns cache poisoned").clear();
    }

    /// Stop using every current circuit: new streams get new
    /// circuits, existing streams are undisturbed.
    pub fn switch_to_new_circuits(&self) {
        self.circmgr.retire_all_circuits();
        self.hsclient.retire_all_circuits();
        self.clear_dns_cache();
    }
}

/// Return true if a stream refused with `reason` is worth retrying
/// through a different exit.
fn exit_retryable(reason: EndReason) -> bool {
    matches!(
        reason,
        EndReason::EXITPOLICY | EndReason::HIBERNATING | EndReason::RESOURCELIMIT
    )
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn retryable_reasons() {
        assert!(exit_retryable(EndReason::EXITPOLICY));
        assert!(exit_retryable(EndReason::HIBERNATING));
        assert!(!exit_retryable(EndReason::DONE));
        assert!(!exit_retryable(EndReason::DESTROY));
    }
}
