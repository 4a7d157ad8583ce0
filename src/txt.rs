//! Correlation of TXT metadata records with service announcements.
//!
//! The transport reports the TXT record and the service announcement of the
//! same device as two independent events, in no guaranteed order. Records
//! are buffered per raw advertised name until the matching announcement
//! arrives or they grow older than the configured lifetime.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::name::fold_case;
use crate::peer::Peer;
use crate::transport::DeviceInfo;

/// Metadata carried by the most recent TXT record from one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMetadataRecord {
    pub source_name: String,
    pub source_address: String,
    pub secondary_address: String,
    pub interests: String,
    received_at: Instant,
}

pub struct TxtRecordCorrelator {
    pending: HashMap<String, PendingMetadataRecord>,
    ttl: Duration,
    secondary_address_key: String,
    interests_key: String,
}

impl TxtRecordCorrelator {
    pub fn new(ttl: Duration, secondary_address_key: &str, interests_key: &str) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
            secondary_address_key: secondary_address_key.to_string(),
            interests_key: interests_key.to_string(),
        }
    }

    /// Buffers a TXT record, replacing any earlier record from the same device.
    pub fn on_metadata_record(&mut self, fields: &HashMap<String, String>, device: &DeviceInfo) {
        let now = Instant::now();
        self.evict_expired(now);

        let secondary_address = self.field(fields, &self.secondary_address_key, &device.name);
        let interests = self.field(fields, &self.interests_key, &device.name);

        let record = PendingMetadataRecord {
            source_name: device.name.clone(),
            source_address: device.address.clone(),
            secondary_address,
            interests,
            received_at: now,
        };
        self.pending.insert(fold_case(&device.name), record);
    }

    /// Copies the buffered record for `raw_name` into `peer` and drops it.
    ///
    /// Returns false when nothing (or only an expired record) is buffered for
    /// that name; records of other devices are left in place.
    pub fn consume_if_matches(&mut self, peer: &mut Peer, raw_name: &str) -> bool {
        let key = fold_case(raw_name);
        let Some(record) = self.pending.remove(&key) else {
            return false;
        };

        if record.received_at.elapsed() > self.ttl {
            debug!(device = raw_name, "Discarding stale TXT record");
            return false;
        }

        peer.secondary_address = record.secondary_address;
        peer.interests = record.interests;
        if !record.source_address.is_empty() {
            peer.access_point_address = record.source_address;
        }
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, raw_name: &str) -> Option<&PendingMetadataRecord> {
        self.pending.get(&fold_case(raw_name))
    }

    fn field(&self, fields: &HashMap<String, String>, key: &str, device: &str) -> String {
        match fields.get(key).filter(|value| !value.is_empty()) {
            Some(value) => {
                info!(device, key, value = %value, "TXT field received");
                value.clone()
            }
            None => {
                warn!(device, key, "TXT field not received");
                String::new()
            }
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.pending
            .retain(|_, record| now.saturating_duration_since(record.received_at) <= ttl);
    }
}
