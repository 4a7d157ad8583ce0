pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod name;
pub mod peer;
pub mod radio;
pub mod registry;
pub mod state;
pub mod storage;
pub mod transport;
pub mod txt;
pub mod watchdog;

use std::error::Error;
use std::path::PathBuf;

pub use config::DiscoveryConfig;
pub use controller::{ControllerStatus, DiscoveryController, DiscoveryHandle, DiscoveryState};
pub use discovery::{Advertisement, MdnsTransport};
pub use error::DiscoveryError;
pub use peer::Peer;
pub use registry::{PeerList, PeerRegistry};
pub use state::SharedPeers;
pub use storage::{JsonPeerStore, MemoryPeerStore, PeerStore};
pub use transport::{EventSink, Transport, TransportEvent};

use radio::CommandRadio;

const DEFAULT_PEERS_FILE: &str = "nsense-peers.json";

/// Runs discovery against the local network until Ctrl-C.
pub async fn run(
    config: DiscoveryConfig,
    advert: Option<Advertisement>,
) -> Result<(), Box<dyn Error>> {
    let peers_file = config
        .peers_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PEERS_FILE));
    let store = JsonPeerStore::load(&peers_file)?;

    // Peers from earlier sessions show up in the list right away.
    let peers = SharedPeers::from_peers(store.known_peers());

    let mut transport = MdnsTransport::new(&[
        config.secondary_address_key.as_str(),
        config.interests_key.as_str(),
    ]);
    if let Some(advert) = &advert {
        advertise(&mut transport, &config, advert);
    }

    let radio = CommandRadio::new(
        config.radio_off_command.clone(),
        config.radio_on_command.clone(),
    );
    let registry = PeerRegistry::new(peers.clone(), store);
    let controller = DiscoveryController::new(config, transport, radio, registry);
    let handle = controller.handle();
    let event_loop = tokio::spawn(controller.run());

    // Stand-in for the UI: re-read the list whenever it changes.
    let mut changes = peers.subscribe();
    let viewer = peers.clone();
    let ui = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let snapshot = viewer.get_peers();
            tracing::info!(count = snapshot.len(), "Peer list updated");
            for peer in &snapshot {
                tracing::info!(peer = %peer, "Known peer");
            }
        }
    });

    handle.start()?;
    handle.start_service_discovery()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, stopping discovery");

    handle.shutdown()?;
    event_loop.await??;
    ui.abort();
    Ok(())
}

/// Registers this device's advertisement. Failures are logged and leave
/// discovery running without one; the controller reports an unusable
/// transport on its own.
fn advertise(
    transport: &mut MdnsTransport,
    config: &DiscoveryConfig,
    advert: &Advertisement,
) -> bool {
    if let Err(e) = transport.initialize() {
        tracing::warn!(error = %e, "Transport unavailable, not advertising this device");
        return false;
    }
    match transport.register(
        &config.service_type,
        advert,
        &config.secondary_address_key,
        &config.interests_key,
    ) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Failed to advertise this device");
            false
        }
    }
}
