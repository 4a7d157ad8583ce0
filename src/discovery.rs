use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::name::eq_fold;
use crate::transport::{
    ChannelHandle, DeviceInfo, DiscoveryFilter, EventSink, RequestKind, Transport, TransportEvent,
};

/// TXT key carrying the advertised device name.
pub const NAME_KEY: &str = "dn";
/// TXT key carrying the peer-to-peer transport address.
pub const ADDRESS_KEY: &str = "p2p";

/// What this device advertises about itself.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub device_name: String,
    pub transport_address: String,
    pub secondary_address: String,
    pub interests: String,
    pub port: u16,
}

/// DNS-SD over multicast DNS, standing in for the Wi-Fi P2P service
/// discovery framework on hosts that have a LAN instead.
pub struct MdnsTransport {
    daemon: Option<ServiceDaemon>,
    sink: Option<EventSink>,
    filter: Option<String>,
    browser: Option<JoinHandle<()>>,
    // Fullname of our own advertisement, shared with the browse task.
    registered_service: Arc<Mutex<Option<String>>>,
    txt_keys: Vec<String>,
}

impl MdnsTransport {
    /// `txt_keys` are the metadata keys forwarded in TXT record events.
    pub fn new(txt_keys: &[&str]) -> Self {
        Self {
            daemon: None,
            sink: None,
            filter: None,
            browser: None,
            registered_service: Arc::new(Mutex::new(None)),
            txt_keys: txt_keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Advertises this device under `service_type`, replacing any earlier
    /// advertisement.
    pub fn register(
        &mut self,
        service_type: &str,
        advert: &Advertisement,
        secondary_address_key: &str,
        interests_key: &str,
    ) -> Result<(), TransportError> {
        let daemon = self.daemon.as_ref().ok_or(TransportError::Unsupported)?;

        let previous = lock(&self.registered_service).take();
        if let Some(fullname) = previous {
            tracing::info!(fullname = %fullname, "Unregistering old service");
            let _ = daemon.unregister(&fullname);
        }

        let ip = local_ip().map_err(|e| TransportError::Daemon(e.to_string()))?;

        let instance = advert.transport_address.replace(':', "");
        let m_hostname = format!("{}.local.", instance);

        let properties = [
            (NAME_KEY, advert.device_name.as_str()),
            (ADDRESS_KEY, advert.transport_address.as_str()),
            (secondary_address_key, advert.secondary_address.as_str()),
            (interests_key, advert.interests.as_str()),
        ];

        let service_info = ServiceInfo::new(
            service_type,
            &instance,
            &m_hostname,
            &ip.to_string(),
            advert.port,
            &properties[..],
        )
        .map_err(|e| TransportError::Daemon(e.to_string()))?;

        let fullname = service_info.get_fullname().to_string();

        daemon
            .register(service_info)
            .map_err(|e| TransportError::Daemon(e.to_string()))?;
        tracing::info!(
            device = %advert.device_name,
            fullname = %fullname,
            ip = %ip,
            port = advert.port,
            "Registered service"
        );

        *lock(&self.registered_service) = Some(fullname);
        Ok(())
    }

    /// Fullname of the advertisement currently registered by this transport.
    pub fn registered_service(&self) -> Option<String> {
        lock(&self.registered_service).clone()
    }

    fn stop_browsing(&mut self) {
        if let Some(task) = self.browser.take() {
            task.abort();
        }
    }
}

impl Transport for MdnsTransport {
    fn initialize(&mut self) -> Result<ChannelHandle, TransportError> {
        if self.daemon.is_none() {
            let daemon = ServiceDaemon::new().map_err(|e| {
                tracing::warn!(error = %e, "Failed to create mDNS daemon");
                TransportError::Unsupported
            })?;
            self.daemon = Some(daemon);
        }
        Ok(ChannelHandle(1))
    }

    fn set_listeners(&mut self, _channel: ChannelHandle, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn add_discovery_filter(&mut self, _channel: ChannelHandle, filter: &DiscoveryFilter) {
        self.filter = Some(filter.service_type.clone());
        if let Some(sink) = &self.sink {
            sink.complete(RequestKind::AddFilter, Ok(()));
        }
    }

    fn remove_discovery_filter(&mut self, _channel: ChannelHandle, filter: &DiscoveryFilter) {
        self.stop_browsing();
        if let Some(daemon) = &self.daemon {
            if let Err(e) = daemon.stop_browse(&filter.service_type) {
                tracing::debug!(
                    service_type = %filter.service_type,
                    error = %e,
                    "stop_browse failed"
                );
            }
        }
        self.filter = None;
    }

    fn discover(&mut self, _channel: ChannelHandle) {
        let Some(sink) = self.sink.clone() else {
            tracing::warn!("Discover requested before listeners were registered");
            return;
        };

        let result = match (&self.daemon, &self.filter) {
            (None, _) => Err(TransportError::Unsupported),
            (_, None) => Err(TransportError::Rejected {
                request: RequestKind::Discover,
                reason: "no discovery filter installed".to_string(),
            }),
            (Some(_), Some(_)) if self.browser.as_ref().is_some_and(|t| !t.is_finished()) => {
                Ok(())
            }
            (Some(daemon), Some(service_type)) => match daemon.browse(service_type) {
                Ok(receiver) => {
                    let service_type = service_type.clone();
                    let txt_keys = self.txt_keys.clone();
                    let own_service = Arc::clone(&self.registered_service);
                    let events = sink.clone();
                    self.browser = Some(tokio::spawn(async move {
                        while let Ok(event) = receiver.recv_async().await {
                            match event {
                                ServiceEvent::ServiceResolved(info) => {
                                    let fullname = info.get_fullname();
                                    if is_registered(&own_service, fullname) {
                                        tracing::trace!(fullname, "Skipping own advertisement");
                                        continue;
                                    }
                                    let mut properties = HashMap::new();
                                    for key in [NAME_KEY, ADDRESS_KEY]
                                        .into_iter()
                                        .chain(txt_keys.iter().map(String::as_str))
                                    {
                                        if let Some(value) = info.get_property_val_str(key) {
                                            properties.insert(key.to_string(), value.to_string());
                                        }
                                    }
                                    let resolved = resolved_events(
                                        &service_type,
                                        fullname,
                                        info.get_hostname(),
                                        properties,
                                    );
                                    for event in resolved {
                                        if !events.send(event) {
                                            return;
                                        }
                                    }
                                }
                                other => tracing::trace!(event = ?other, "mDNS event"),
                            }
                        }
                    }));
                    Ok(())
                }
                Err(e) => Err(TransportError::Rejected {
                    request: RequestKind::Discover,
                    reason: e.to_string(),
                }),
            },
        };

        sink.complete(RequestKind::Discover, result);
    }
}

impl Drop for MdnsTransport {
    fn drop(&mut self) {
        self.stop_browsing();
        let registered = lock(&self.registered_service).take();
        if let (Some(daemon), Some(fullname)) = (&self.daemon, registered) {
            tracing::info!(fullname = %fullname, "Unregistering service");
            // The daemon thread sends the goodbye packet on its own.
            if let Err(e) = daemon.unregister(&fullname) {
                tracing::error!(fullname = %fullname, error = %e, "Failed to unregister service");
            }
        }
    }
}

fn lock(shared: &Mutex<Option<String>>) -> std::sync::MutexGuard<'_, Option<String>> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_registered(own_service: &Mutex<Option<String>>, fullname: &str) -> bool {
    is_own_advertisement(fullname, lock(own_service).as_deref())
}

/// Whether a resolved `fullname` is this host's own advertisement. DNS
/// names compare without regard to case.
pub fn is_own_advertisement(fullname: &str, registered: Option<&str>) -> bool {
    registered.is_some_and(|own| eq_fold(own, fullname))
}

/// Splits one resolved DNS-SD service into the TXT record event and the
/// service-found event the Wi-Fi P2P framework would have delivered.
pub fn resolved_events(
    service_type: &str,
    fullname: &str,
    hostname: &str,
    mut properties: HashMap<String, String>,
) -> [TransportEvent; 2] {
    let (instance_name, registration_type) = match fullname
        .strip_suffix(service_type)
        .and_then(|prefix| prefix.strip_suffix('.'))
    {
        Some(instance) => (instance.to_string(), service_type.to_string()),
        None => match fullname.split_once('.') {
            Some((instance, rest)) => (instance.to_string(), rest.to_string()),
            None => (fullname.to_string(), String::new()),
        },
    };

    let host = hostname.trim_end_matches('.').trim_end_matches(".local");
    let name = properties
        .remove(NAME_KEY)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| host.to_string());
    let address = properties
        .remove(ADDRESS_KEY)
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| host.to_string());

    let device = DeviceInfo { name, address };
    [
        TransportEvent::MetadataRecord {
            domain_name: fullname.to_string(),
            fields: properties,
            device: device.clone(),
        },
        TransportEvent::ServiceFound {
            instance_name,
            registration_type,
            device,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "_nsense._tcp.local.";

    fn advert() -> Advertisement {
        Advertisement {
            device_name: "Alice".to_string(),
            transport_address: "02:11:22:33:44:55".to_string(),
            secondary_address: String::new(),
            interests: "chess".to_string(),
            port: 5353,
        }
    }

    #[test]
    fn own_advertisement_is_recognized_ignoring_case() {
        let own = Some("021122334455._nsense._tcp.local.");
        assert!(is_own_advertisement("021122334455._NSENSE._tcp.local.", own));
        assert!(!is_own_advertisement("aabbccddeeff._nsense._tcp.local.", own));
        assert!(!is_own_advertisement("021122334455._nsense._tcp.local.", None));
    }

    #[test]
    fn registered_service_is_skipped_by_the_browser() {
        let mut transport = MdnsTransport::new(&["btmac", "interests"]);
        let own = "021122334455._nsense._tcp.local.";
        assert!(!is_registered(&transport.registered_service, own));

        if transport.initialize().is_err()
            || transport.register(TYPE, &advert(), "btmac", "interests").is_err()
        {
            return; // no multicast-capable interface here
        }
        let fullname = transport.registered_service().unwrap();
        assert_eq!(fullname, own);
        assert!(is_registered(&transport.registered_service, &fullname));
        let other = "aabbccddeeff._nsense._tcp.local.";
        assert!(!is_registered(&transport.registered_service, other));
    }

    #[test]
    fn dropping_a_registered_transport_does_not_block() {
        let mut transport = MdnsTransport::new(&["btmac", "interests"]);
        if transport.initialize().is_err()
            || transport.register(TYPE, &advert(), "btmac", "interests").is_err()
        {
            return; // no multicast-capable interface here
        }

        let started = std::time::Instant::now();
        drop(transport);
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn splits_resolved_service_into_txt_then_found() {
        let properties = HashMap::from([
            (NAME_KEY.to_string(), "[Phone] Alice".to_string()),
            (ADDRESS_KEY.to_string(), "02:11:22:33:44:55".to_string()),
            ("btmac".to_string(), "AA:BB:CC:DD:EE:FF".to_string()),
            ("interests".to_string(), "chess".to_string()),
        ]);

        let [txt, found] = resolved_events(
            TYPE,
            "021122334455._nsense._tcp.local.",
            "021122334455.local.",
            properties,
        );

        match txt {
            TransportEvent::MetadataRecord { fields, device, .. } => {
                assert_eq!(device.name, "[Phone] Alice");
                assert_eq!(fields.get("btmac").unwrap(), "AA:BB:CC:DD:EE:FF");
                assert_eq!(fields.get("interests").unwrap(), "chess");
                assert!(!fields.contains_key(NAME_KEY));
            }
            other => panic!("expected TXT record, got {other:?}"),
        }
        match found {
            TransportEvent::ServiceFound {
                instance_name,
                registration_type,
                device,
            } => {
                assert_eq!(instance_name, "021122334455");
                assert_eq!(registration_type, TYPE);
                assert_eq!(device.address, "02:11:22:33:44:55");
            }
            other => panic!("expected service found, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_hostname_without_txt_identity() {
        let [_, found] = resolved_events(
            TYPE,
            "printer._ipp._tcp.local.",
            "office-printer.local.",
            HashMap::new(),
        );

        match found {
            TransportEvent::ServiceFound {
                instance_name,
                registration_type,
                device,
            } => {
                assert_eq!(instance_name, "printer");
                assert_eq!(registration_type, "_ipp._tcp.local.");
                assert_eq!(device.name, "office-printer");
                assert_eq!(device.address, "office-printer");
            }
            other => panic!("expected service found, got {other:?}"),
        }
    }
}
