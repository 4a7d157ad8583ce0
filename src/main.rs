use std::path::PathBuf;

use clap::Parser;
use nsense_discovery::{logging, Advertisement, DiscoveryConfig};

#[derive(Parser, Debug)]
#[command(name = "nsense-discovery", about = "Discover nearby NSense devices")]
struct Cli {
    /// JSON config file
    #[arg(short, long, default_value = "nsense.json")]
    config: PathBuf,

    /// Where discovered peers are stored
    #[arg(long)]
    peers_file: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Watchdog period in milliseconds
    #[arg(long)]
    watchdog_ms: Option<u64>,

    /// Advertise this device under the given name
    #[arg(long)]
    name: Option<String>,

    /// Bluetooth address to advertise
    #[arg(long, default_value = "")]
    bt_mac: String,

    /// Interest tags to advertise
    #[arg(long, default_value = "")]
    interests: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = DiscoveryConfig::load(&cli.config)?;
    if cli.peers_file.is_some() {
        config.peers_file = cli.peers_file;
    }
    if cli.log_dir.is_some() {
        config.log_dir = cli.log_dir;
    }
    if let Some(ms) = cli.watchdog_ms {
        config.watchdog_period_ms = ms;
    }

    let log_level = if cli.verbose { "debug" } else { "info" };
    let _guard = logging::init_logging(log_level, config.log_dir.as_deref());

    let advert = cli.name.map(|device_name| {
        let system_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "nsense".to_string());
        Advertisement {
            device_name,
            // Hosts without a P2P interface advertise a per-run identifier.
            transport_address: format!("{}-{}", system_hostname, uuid::Uuid::new_v4().simple()),
            secondary_address: cli.bt_mac,
            interests: cli.interests,
            // Nothing listens here; the SRV record just needs a port.
            port: 5353,
        }
    });

    nsense_discovery::run(config, advert).await
}
