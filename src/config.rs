use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const SERVICE_TAG: &str = "_nsense._tcp";
pub const SERVICE_TYPE: &str = "_nsense._tcp.local.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Tag an announcement's registration type must contain to be ours.
    pub service_tag: String,
    /// DNS-SD service type browsed and advertised.
    pub service_type: String,
    pub watchdog_period_ms: u64,
    /// How long a TXT record waits for its service announcement.
    pub metadata_ttl_ms: u64,
    pub max_request_retries: u32,
    pub retry_base_delay_ms: u64,
    pub secondary_address_key: String,
    pub interests_key: String,
    pub peers_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub radio_off_command: Vec<String>,
    pub radio_on_command: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_tag: SERVICE_TAG.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            watchdog_period_ms: 120_000,
            metadata_ttl_ms: 15_000,
            max_request_retries: 3,
            retry_base_delay_ms: 1_000,
            secondary_address_key: "btmac".to_string(),
            interests_key: "interests".to_string(),
            peers_file: None,
            log_dir: None,
            radio_off_command: ["nmcli", "radio", "wifi", "off"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            radio_on_command: ["nmcli", "radio", "wifi", "on"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DiscoveryConfig {
    /// Reads a JSON config file. Fields left out keep their defaults and a
    /// missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_millis(self.metadata_ttl_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}
