use std::time::{SystemTime, UNIX_EPOCH};

use crate::name::fold_case;

/// A nearby device running NSense.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    /// Advertised name with vendor decoration stripped.
    pub display_name: String,
    /// Instance name from the service announcement.
    pub discovery_id: String,
    /// Peer-to-peer hardware address, the stable identity anchor.
    pub transport_address: String,
    /// Secondary radio (Bluetooth) address, only learned from a TXT record.
    #[serde(default)]
    pub secondary_address: String,
    #[serde(default)]
    pub interests: String,
    /// Address of the device that sent the correlated TXT record.
    #[serde(default)]
    pub access_point_address: String,
    #[serde(default)]
    pub last_seen: u64, // unix seconds of the last service-found event
}

impl Peer {
    pub fn new(display_name: &str, discovery_id: &str, transport_address: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            discovery_id: discovery_id.to_string(),
            transport_address: transport_address.to_string(),
            last_seen: unix_now(),
            ..Default::default()
        }
    }

    /// Key under which the peer is persisted.
    pub fn storage_key(&self) -> String {
        fold_case(&self.transport_address)
    }

    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) p2p={} bt={} interests={}",
            self.display_name,
            self.discovery_id,
            self.transport_address,
            self.secondary_address,
            self.interests
        )
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
