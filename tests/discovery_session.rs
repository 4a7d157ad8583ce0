//! End-to-end discovery sessions driven through the controller's event loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nsense_discovery::error::{RadioError, TransportError};
use nsense_discovery::radio::RadioControl;
use nsense_discovery::transport::{ChannelHandle, DeviceInfo, DiscoveryFilter, RequestKind};
use nsense_discovery::{
    DiscoveryConfig, DiscoveryController, DiscoveryHandle, DiscoveryState, EventSink,
    MemoryPeerStore, PeerRegistry, SharedPeers, Transport, TransportEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    SetListeners,
    AddFilter(String),
    RemoveFilter(String),
    Discover,
}

/// Transport that records calls and answers requests from a script.
#[derive(Clone, Default)]
struct ScriptedTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    sink: Arc<Mutex<Option<EventSink>>>,
    /// Number of discover requests to reject before accepting.
    reject_discover: Arc<Mutex<u32>>,
}

impl ScriptedTransport {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn sink(&self) -> EventSink {
        self.sink.lock().unwrap().clone().expect("listeners not registered")
    }
}

impl Transport for ScriptedTransport {
    fn initialize(&mut self) -> Result<ChannelHandle, TransportError> {
        Ok(ChannelHandle(7))
    }

    fn set_listeners(&mut self, _channel: ChannelHandle, sink: EventSink) {
        self.calls.lock().unwrap().push(Call::SetListeners);
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn add_discovery_filter(&mut self, _channel: ChannelHandle, filter: &DiscoveryFilter) {
        self.calls
            .lock()
            .unwrap()
            .push(Call::AddFilter(filter.service_type.clone()));
        self.sink().complete(RequestKind::AddFilter, Ok(()));
    }

    fn remove_discovery_filter(&mut self, _channel: ChannelHandle, filter: &DiscoveryFilter) {
        self.calls
            .lock()
            .unwrap()
            .push(Call::RemoveFilter(filter.service_type.clone()));
    }

    fn discover(&mut self, _channel: ChannelHandle) {
        self.calls.lock().unwrap().push(Call::Discover);
        let result = {
            let mut remaining = self.reject_discover.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                Err(TransportError::Rejected {
                    request: RequestKind::Discover,
                    reason: "busy".to_string(),
                })
            } else {
                Ok(())
            }
        };
        self.sink().complete(RequestKind::Discover, result);
    }
}

#[derive(Clone, Default)]
struct RecordingRadio {
    switches: Arc<Mutex<Vec<bool>>>,
}

impl RecordingRadio {
    fn restarts(&self) -> usize {
        self.switches.lock().unwrap().iter().filter(|on| !**on).count()
    }
}

impl RadioControl for RecordingRadio {
    fn set_radio_enabled(&mut self, enabled: bool) -> Result<(), RadioError> {
        self.switches.lock().unwrap().push(enabled);
        Ok(())
    }
}

struct Session {
    handle: DiscoveryHandle,
    transport: ScriptedTransport,
    radio: RecordingRadio,
    peers: SharedPeers,
    store: MemoryPeerStore,
    task: tokio::task::JoinHandle<Result<(), nsense_discovery::DiscoveryError>>,
}

fn spawn_session(transport: ScriptedTransport) -> Session {
    let radio = RecordingRadio::default();
    let peers = SharedPeers::new();
    let store = MemoryPeerStore::default();

    let controller = DiscoveryController::new(
        DiscoveryConfig::default(),
        transport.clone(),
        radio.clone(),
        PeerRegistry::new(peers.clone(), store.clone()),
    );
    let handle = controller.handle();
    let task = tokio::spawn(controller.run());

    Session {
        handle,
        transport,
        radio,
        peers,
        store,
        task,
    }
}

async fn discovering_session() -> Session {
    let session = spawn_session(ScriptedTransport::default());
    session.handle.start().unwrap();
    session.handle.start_service_discovery().unwrap();
    let status = session.handle.status().await.unwrap();
    assert_eq!(status.state, DiscoveryState::Discovering);
    session
}

fn service_found(raw_name: &str, address: &str) -> TransportEvent {
    TransportEvent::ServiceFound {
        instance_name: format!("nsense-{raw_name}"),
        registration_type: "_nsense._tcp.local.".to_string(),
        device: DeviceInfo {
            name: raw_name.to_string(),
            address: address.to_string(),
        },
    }
}

fn txt_record(raw_name: &str, btmac: &str, interests: &str) -> TransportEvent {
    TransportEvent::MetadataRecord {
        domain_name: "nsense._nsense._tcp.local.".to_string(),
        fields: HashMap::from([
            ("btmac".to_string(), btmac.to_string()),
            ("interests".to_string(), interests.to_string()),
        ]),
        device: DeviceInfo {
            name: raw_name.to_string(),
            address: String::new(),
        },
    }
}

#[tokio::test]
async fn start_service_discovery_sets_up_the_transport() {
    let session = discovering_session().await;

    assert_eq!(
        session.transport.calls(),
        vec![
            Call::SetListeners,
            Call::AddFilter("_nsense._tcp.local.".to_string()),
            Call::Discover,
        ]
    );
    let status = session.handle.status().await.unwrap();
    assert!(status.watchdog_armed);
    assert!(status.filter_installed);
}

#[tokio::test]
async fn equal_names_produce_a_single_peer() {
    let session = discovering_session().await;
    let sink = session.transport.sink();

    sink.send(service_found("[Phone] Alice", "aa:aa:aa:aa:aa:01"));
    sink.send(service_found("ALICE", "aa:aa:aa:aa:aa:02"));
    session.handle.status().await.unwrap();

    let peers = session.peers.get_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].display_name, "Alice");
    assert_eq!(peers[0].transport_address, "aa:aa:aa:aa:aa:01");
}

#[tokio::test]
async fn equal_addresses_produce_a_single_peer() {
    let session = discovering_session().await;
    let sink = session.transport.sink();

    sink.send(service_found("Alice", "AA:AA:AA:AA:AA:01"));
    sink.send(service_found("Bob", "aa:aa:aa:aa:aa:01"));
    session.handle.status().await.unwrap();

    let peers = session.peers.get_peers();
    assert_eq!(peers.len(), 1);
    // Identity fields of the first announcement are kept.
    assert_eq!(peers[0].display_name, "Alice");
    assert_eq!(session.store.len(), 1);
    assert_eq!(session.store.writes(), 2);
}

#[tokio::test]
async fn txt_record_before_announcement_is_merged() {
    let session = discovering_session().await;
    let sink = session.transport.sink();

    sink.send(txt_record("Alice", "11:22:33:44:55:66", "music;chess"));
    sink.send(service_found("Alice", "aa:aa"));
    session.handle.status().await.unwrap();

    let peers = session.peers.get_peers();
    assert_eq!(peers[0].secondary_address, "11:22:33:44:55:66");
    assert_eq!(peers[0].interests, "music;chess");

    let stored = session.store.get("aa:aa").unwrap();
    assert_eq!(stored.secondary_address, "11:22:33:44:55:66");
    assert_eq!(session.handle.status().await.unwrap().pending_metadata, 0);
}

#[tokio::test]
async fn txt_record_for_another_device_is_not_merged() {
    let session = discovering_session().await;
    let sink = session.transport.sink();

    sink.send(txt_record("Bob", "11:22:33:44:55:66", "chess"));
    sink.send(service_found("Alice", "aa:aa"));
    session.handle.status().await.unwrap();

    let alice = &session.peers.get_peers()[0];
    assert!(alice.secondary_address.is_empty());
    assert!(alice.interests.is_empty());
    assert_eq!(session.handle.status().await.unwrap().pending_metadata, 1);
}

#[tokio::test]
async fn interleaved_devices_do_not_cross_contaminate() {
    let session = discovering_session().await;
    let sink = session.transport.sink();

    sink.send(txt_record("Alice", "a-bt", "art"));
    sink.send(txt_record("Bob", "b-bt", "chess"));
    sink.send(service_found("Bob", "bb:bb"));
    sink.send(service_found("Alice", "aa:aa"));
    session.handle.status().await.unwrap();

    let peers = session.peers.get_peers();
    let bob = peers.iter().find(|p| p.display_name == "Bob").unwrap();
    let alice = peers.iter().find(|p| p.display_name == "Alice").unwrap();
    assert_eq!(bob.secondary_address, "b-bt");
    assert_eq!(alice.secondary_address, "a-bt");
    assert_eq!(alice.interests, "art");
}

#[tokio::test]
async fn later_txt_record_refines_known_peer() {
    let session = discovering_session().await;
    let sink = session.transport.sink();

    sink.send(txt_record("Alice", "bt-1", "art"));
    sink.send(service_found("Alice", "aa:aa"));
    sink.send(txt_record("Alice", "bt-2", ""));
    sink.send(service_found("Alice", "aa:aa"));
    session.handle.status().await.unwrap();

    let peers = session.peers.get_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].secondary_address, "bt-2");
    // Last write wins, an absent field overwrites with empty.
    assert_eq!(peers[0].interests, "");
}

#[tokio::test]
async fn consumer_is_signalled_on_growth() {
    let session = discovering_session().await;
    let mut changes = session.peers.subscribe();

    session.transport.sink().send(service_found("Alice", "aa:aa"));
    changes.changed().await.unwrap();

    assert_eq!(session.peers.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn service_found_disarms_the_watchdog() {
    let session = discovering_session().await;

    session.transport.sink().send(service_found("Alice", "aa:aa"));
    session.handle.status().await.unwrap();

    tokio::time::sleep(Duration::from_secs(600)).await;

    let status = session.handle.status().await.unwrap();
    assert!(!status.watchdog_armed);
    assert_eq!(session.radio.restarts(), 0);
}

#[tokio::test(start_paused = true)]
async fn silence_restarts_the_radio_every_period() {
    let session = discovering_session().await;

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(session.radio.restarts(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(session.radio.restarts(), 2);

    let status = session.handle.status().await.unwrap();
    assert!(status.watchdog_armed);
    assert_eq!(status.radio_restarts, 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_start_does_not_reset_the_watchdog() {
    let session = discovering_session().await;

    tokio::time::sleep(Duration::from_secs(100)).await;
    session.handle.start_service_discovery().unwrap();
    session.handle.status().await.unwrap();

    // Still fires at 120s from the first arm, not 220s.
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(session.radio.restarts(), 1);
}

#[tokio::test(start_paused = true)]
async fn watchdog_rearms_on_next_discovery_after_a_find() {
    let session = discovering_session().await;

    session.transport.sink().send(service_found("Alice", "aa:aa"));
    session.handle.start_service_discovery().unwrap();
    assert!(session.handle.status().await.unwrap().watchdog_armed);

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(session.radio.restarts(), 1);
}

#[tokio::test]
async fn stop_discovery_twice_removes_the_filter_once() {
    let session = discovering_session().await;

    session.handle.stop_discovery().unwrap();
    session.handle.stop_discovery().unwrap();
    let status = session.handle.status().await.unwrap();

    assert_eq!(status.state, DiscoveryState::Ready);
    assert!(!status.filter_installed);
    assert_eq!(
        session
            .transport
            .count(&Call::RemoveFilter("_nsense._tcp.local.".to_string())),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_discover_is_retried_with_backoff() {
    let transport = ScriptedTransport::default();
    *transport.reject_discover.lock().unwrap() = 2;
    let session = spawn_session(transport);
    session.handle.start().unwrap();
    session.handle.start_service_discovery().unwrap();
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 1);

    // First retry after 1s, second after a further 2s.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 2);

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 3);

    tokio::time::sleep(Duration::from_secs(30)).await;
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 3);
}

#[tokio::test(start_paused = true)]
async fn retries_give_up_after_the_limit() {
    let transport = ScriptedTransport::default();
    *transport.reject_discover.lock().unwrap() = 100;
    let session = spawn_session(transport);
    session.handle.start().unwrap();
    session.handle.start_service_discovery().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    session.handle.status().await.unwrap();

    // Initial request plus three retries.
    assert_eq!(session.transport.count(&Call::Discover), 4);
}

#[tokio::test(start_paused = true)]
async fn restarting_discovery_resets_the_retry_budget() {
    let transport = ScriptedTransport::default();
    *transport.reject_discover.lock().unwrap() = 100;
    let session = spawn_session(transport);
    session.handle.start().unwrap();
    session.handle.start_service_discovery().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 4);

    session.handle.start_service_discovery().unwrap();
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 5);

    // The rejected restart is retried instead of giving up at once.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 6);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_once_discovery_is_stopped() {
    let transport = ScriptedTransport::default();
    *transport.reject_discover.lock().unwrap() = 1;
    let session = spawn_session(transport);
    session.handle.start().unwrap();
    session.handle.start_service_discovery().unwrap();
    session.handle.stop_discovery().unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    session.handle.status().await.unwrap();
    assert_eq!(session.transport.count(&Call::Discover), 1);
}

#[tokio::test]
async fn shutdown_ends_the_loop_and_removes_the_filter() {
    let session = discovering_session().await;

    session.handle.shutdown().unwrap();
    session.task.await.unwrap().unwrap();

    assert_eq!(
        session
            .transport
            .count(&Call::RemoveFilter("_nsense._tcp.local.".to_string())),
        1
    );
    assert!(session.handle.status().await.is_err());
}
