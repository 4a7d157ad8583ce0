//! Discovery Controller
//!
//! Drives the transport lifecycle and routes inbound transport events to the
//! TXT correlator, the peer registry and the restart watchdog.
//!
//! All state lives on one event-processing task: control commands, transport
//! events, request retries and watchdog fires are serialized through a single
//! inbox, so none of it needs locking.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, TransportError};
use crate::name::normalize;
use crate::peer::Peer;
use crate::radio::RadioControl;
use crate::registry::{PeerList, PeerRegistry};
use crate::storage::PeerStore;
use crate::transport::{
    ChannelHandle, DeviceInfo, DiscoveryFilter, EventSink, RequestKind, Transport, TransportEvent,
};
use crate::txt::TxtRecordCorrelator;
use crate::watchdog::RestartWatchdog;

/// Controller lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// `start` has not been called yet
    Uninitialized,
    /// The device has no peer-to-peer transport; every operation is a no-op
    Unsupported,
    /// Transport channel obtained, not discovering
    Ready,
    /// Listeners registered, filter installed, discover request issued
    Discovering,
}

/// Commands sent to the controller loop through a [`DiscoveryHandle`]
#[derive(Debug)]
pub enum Command {
    Start,
    StartServiceDiscovery,
    Stop,
    StopDiscovery,
    Status(oneshot::Sender<ControllerStatus>),
    /// Disarm the watchdog, remove the filter and end the loop
    Shutdown,
}

/// Snapshot of controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: DiscoveryState,
    pub watchdog_armed: bool,
    pub filter_installed: bool,
    pub radio_restarts: u64,
    pub pending_metadata: usize,
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Command(Command),
    Transport(TransportEvent),
    Retry(RequestKind),
}

enum Step {
    Inbox(Option<Inbound>),
    WatchdogFired,
}

/// Cloneable front end of a running controller.
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl DiscoveryHandle {
    pub fn start(&self) -> Result<(), DiscoveryError> {
        self.command(Command::Start)
    }

    pub fn start_service_discovery(&self) -> Result<(), DiscoveryError> {
        self.command(Command::StartServiceDiscovery)
    }

    pub fn stop(&self) -> Result<(), DiscoveryError> {
        self.command(Command::Stop)
    }

    pub fn stop_discovery(&self) -> Result<(), DiscoveryError> {
        self.command(Command::StopDiscovery)
    }

    pub fn shutdown(&self) -> Result<(), DiscoveryError> {
        self.command(Command::Shutdown)
    }

    /// Resolves once every message sent before it has been handled.
    pub async fn status(&self) -> Result<ControllerStatus, DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Status(reply))?;
        rx.await.map_err(|_| DiscoveryError::Closed)
    }

    /// Listener end for hosts that feed transport events by hand.
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.tx.clone())
    }

    fn command(&self, command: Command) -> Result<(), DiscoveryError> {
        self.tx
            .send(Inbound::Command(command))
            .map_err(|_| DiscoveryError::Closed)
    }
}

pub struct DiscoveryController<T, R, L, S> {
    config: DiscoveryConfig,
    transport: T,
    radio: R,
    registry: PeerRegistry<L, S>,
    correlator: TxtRecordCorrelator,
    watchdog: RestartWatchdog,
    state: DiscoveryState,
    channel: Option<ChannelHandle>,
    active_filter: Option<DiscoveryFilter>,
    listeners_registered: bool,
    /// Failed attempts per request kind since its last success
    failures: HashMap<RequestKind, u32>,
    radio_restarts: u64,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    /// None once taken by `run`
    inbox_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
}

impl<T, R, L, S> DiscoveryController<T, R, L, S>
where
    T: Transport,
    R: RadioControl,
    L: PeerList,
    S: PeerStore,
{
    pub fn new(
        config: DiscoveryConfig,
        transport: T,
        radio: R,
        registry: PeerRegistry<L, S>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let correlator = TxtRecordCorrelator::new(
            config.metadata_ttl(),
            &config.secondary_address_key,
            &config.interests_key,
        );
        let watchdog = RestartWatchdog::new(config.watchdog_period());

        Self {
            config,
            transport,
            radio,
            registry,
            correlator,
            watchdog,
            state: DiscoveryState::Uninitialized,
            channel: None,
            active_filter: None,
            listeners_registered: false,
            failures: HashMap::new(),
            radio_restarts: 0,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
        }
    }

    pub fn handle(&self) -> DiscoveryHandle {
        DiscoveryHandle {
            tx: self.inbox_tx.clone(),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn registry(&self) -> &PeerRegistry<L, S> {
        &self.registry
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state: self.state,
            watchdog_armed: self.watchdog.is_armed(),
            filter_installed: self.active_filter.is_some(),
            radio_restarts: self.radio_restarts,
            pending_metadata: self.correlator.pending_len(),
        }
    }

    /// Initializes the transport. A device without peer-to-peer support
    /// leaves the controller inert rather than failing.
    pub fn start(&mut self) {
        if self.state != DiscoveryState::Uninitialized {
            debug!(state = ?self.state, "Discovery already started");
            return;
        }

        match self.transport.initialize() {
            Ok(channel) => {
                info!(channel = channel.0, "Peer-to-peer transport initialized");
                self.channel = Some(channel);
                self.state = DiscoveryState::Ready;
            }
            Err(e) => {
                info!(error = %e, "This device does not support peer-to-peer discovery");
                self.state = DiscoveryState::Unsupported;
            }
        }
    }

    /// Arms the watchdog, registers listeners, installs the discovery filter
    /// and issues a discover request.
    pub fn start_service_discovery(&mut self) -> Result<(), DiscoveryError> {
        let channel = match (self.state, self.channel) {
            (DiscoveryState::Uninitialized, _) => return Err(DiscoveryError::NotStarted),
            (DiscoveryState::Unsupported, _) => {
                debug!("Ignoring discovery request, transport unsupported");
                return Ok(());
            }
            (_, Some(channel)) => channel,
            (_, None) => return Err(DiscoveryError::NotStarted),
        };

        self.watchdog.arm();

        if !self.listeners_registered {
            self.transport
                .set_listeners(channel, EventSink::new(self.inbox_tx.clone()));
            self.listeners_registered = true;
        }

        if self.active_filter.is_none() {
            let filter = DiscoveryFilter {
                service_type: self.config.service_type.clone(),
            };
            // Explicit requests start a fresh retry budget.
            self.failures.remove(&RequestKind::AddFilter);
            self.transport.add_discovery_filter(channel, &filter);
            self.active_filter = Some(filter);
        }

        self.failures.remove(&RequestKind::Discover);
        self.transport.discover(channel);
        self.state = DiscoveryState::Discovering;
        Ok(())
    }

    /// Removes the discovery filter if one is installed. The watchdog and any
    /// buffered TXT records are left alone.
    pub fn stop_discovery(&mut self) {
        if let (Some(channel), Some(filter)) = (self.channel, self.active_filter.take()) {
            info!(service_type = %filter.service_type, "Removing discovery filter");
            self.transport.remove_discovery_filter(channel, &filter);
        }
        self.failures.clear();
        if self.state == DiscoveryState::Discovering {
            self.state = DiscoveryState::Ready;
        }
    }

    pub fn stop(&mut self) {
        self.stop_discovery();
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RequestCompleted { request, result } => {
                self.on_request_completed(request, result)
            }
            _ if self.state != DiscoveryState::Discovering => {
                debug!(state = ?self.state, "Ignoring transport event outside discovery");
            }
            TransportEvent::MetadataRecord {
                domain_name,
                fields,
                device,
            } => {
                debug!(domain = %domain_name, device = %device.name, "TXT record available");
                self.correlator.on_metadata_record(&fields, &device);
            }
            TransportEvent::ServiceFound {
                instance_name,
                registration_type,
                device,
            } => {
                self.on_service_found(&instance_name, &registration_type, &device);
            }
        }
    }

    /// Fire-time action of the watchdog: switch the radio off so the
    /// platform brings it back up with a fresh P2P stack.
    pub fn on_watchdog_fired(&mut self) {
        self.radio_restarts += 1;
        error!(
            restarts = self.radio_restarts,
            "No service found within the watchdog period, restarting Wi-Fi"
        );
        // Errors are already logged by the radio.
        let _ = self.radio.set_radio_enabled(false);
    }

    pub fn shutdown(&mut self) {
        info!("Discovery: shutting down");
        self.watchdog.disarm();
        self.stop_discovery();
    }

    /// Run the event-processing loop until a `Shutdown` command arrives.
    pub async fn run(mut self) -> Result<(), DiscoveryError> {
        let mut inbox = self
            .inbox_rx
            .take()
            .ok_or(DiscoveryError::AlreadyRunning)?;

        loop {
            let step = tokio::select! {
                biased;
                message = inbox.recv() => Step::Inbox(message),
                _ = self.watchdog.fired() => Step::WatchdogFired,
            };

            match step {
                Step::Inbox(Some(Inbound::Command(Command::Shutdown))) | Step::Inbox(None) => {
                    self.shutdown();
                    return Ok(());
                }
                Step::Inbox(Some(message)) => self.dispatch(message),
                Step::WatchdogFired => self.on_watchdog_fired(),
            }
        }
    }

    fn dispatch(&mut self, message: Inbound) {
        match message {
            Inbound::Command(command) => match command {
                Command::Start => self.start(),
                Command::StartServiceDiscovery => {
                    if let Err(e) = self.start_service_discovery() {
                        warn!(error = %e, "Cannot start service discovery");
                    }
                }
                Command::Stop => self.stop(),
                Command::StopDiscovery => self.stop_discovery(),
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown => self.shutdown(),
            },
            Inbound::Transport(event) => self.handle_event(event),
            Inbound::Retry(request) => self.on_retry(request),
        }
    }

    fn on_service_found(&mut self, instance_name: &str, registration_type: &str, device: &DeviceInfo) {
        self.watchdog.disarm();

        if !registration_type.contains(&self.config.service_tag) {
            info!(
                instance = instance_name,
                registration_type, "Other device type found"
            );
            return;
        }

        let clean_name = normalize(&device.name);
        let correlator = &mut self.correlator;

        let peer = match self.registry.resolve(&clean_name, &device.address) {
            None => {
                let mut peer = Peer::new(&clean_name, instance_name, &device.address);
                correlator.consume_if_matches(&mut peer, &device.name);
                info!(peer = %peer, "Found new NSense device");
                self.registry.upsert_new(peer.clone());
                peer
            }
            Some(index) => {
                let updated = self.registry.update(index, &mut |peer| {
                    if correlator.consume_if_matches(peer, &device.name) {
                        debug!(peer = %peer.display_name, "TXT record merged into known peer");
                    }
                    peer.touch();
                });
                match updated {
                    Some(peer) => peer,
                    None => {
                        warn!(index, "Resolved peer vanished from the list");
                        return;
                    }
                }
            }
        };

        // Persistence failures are logged by the registry and never stop discovery.
        let _ = self.registry.persist(&peer);
    }

    fn on_request_completed(&mut self, request: RequestKind, result: Result<(), TransportError>) {
        match result {
            Ok(()) => {
                info!(%request, "Request accepted");
                self.failures.remove(&request);
            }
            Err(e) => {
                let attempts = self.failures.entry(request).or_insert(0);
                *attempts += 1;
                let attempt = *attempts;

                if self.state != DiscoveryState::Discovering {
                    warn!(%request, error = %e, "Request failed after discovery stopped");
                } else if attempt > self.config.max_request_retries {
                    error!(%request, error = %e, attempts = attempt, "Request failed, giving up");
                } else {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        %request,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    let tx = self.inbox_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Inbound::Retry(request));
                    });
                }
            }
        }
    }

    fn on_retry(&mut self, request: RequestKind) {
        let Some(channel) = self.channel else {
            return;
        };
        if self.state != DiscoveryState::Discovering {
            debug!(%request, "Dropping retry, discovery stopped");
            return;
        }

        match request {
            RequestKind::AddFilter => {
                if let Some(filter) = &self.active_filter {
                    self.transport.add_discovery_filter(channel, filter);
                }
            }
            RequestKind::Discover => self.transport.discover(channel),
        }
    }
}
