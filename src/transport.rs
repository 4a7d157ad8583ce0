use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;

use crate::controller::Inbound;
use crate::error::TransportError;

/// Handle to an initialized transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Standing request telling the transport which service type to search for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub service_type: String,
}

/// Asynchronous requests whose outcome is reported back as a
/// [`TransportEvent::RequestCompleted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    AddFilter,
    Discover,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::AddFilter => f.write_str("add-filter"),
            RequestKind::Discover => f.write_str("discover"),
        }
    }
}

/// Device descriptor attached to inbound events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Raw advertised name, vendor decoration included.
    pub name: String,
    /// Peer-to-peer transport address. May be empty on TXT record events.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ServiceFound {
        instance_name: String,
        registration_type: String,
        device: DeviceInfo,
    },
    MetadataRecord {
        domain_name: String,
        fields: HashMap<String, String>,
        device: DeviceInfo,
    },
    RequestCompleted {
        request: RequestKind,
        result: Result<(), TransportError>,
    },
}

/// Listener end handed to a transport. Every event lands on the controller's
/// event-processing loop in arrival order.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { tx }
    }

    /// Returns false once the controller loop has gone away.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(Inbound::Transport(event)).is_ok()
    }

    pub fn complete(&self, request: RequestKind, result: Result<(), TransportError>) -> bool {
        self.send(TransportEvent::RequestCompleted { request, result })
    }
}

/// A local wireless peer-to-peer service discovery capability.
///
/// Calls never block; outcomes of `add_discovery_filter` and `discover` are
/// delivered through the sink registered with `set_listeners`.
pub trait Transport: Send {
    fn initialize(&mut self) -> Result<ChannelHandle, TransportError>;

    fn set_listeners(&mut self, channel: ChannelHandle, sink: EventSink);

    fn add_discovery_filter(&mut self, channel: ChannelHandle, filter: &DiscoveryFilter);

    fn remove_discovery_filter(&mut self, channel: ChannelHandle, filter: &DiscoveryFilter);

    fn discover(&mut self, channel: ChannelHandle);
}
