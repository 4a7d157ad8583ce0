use std::path::PathBuf;

use crate::transport::RequestKind;

/// Failures reported by a peer-discovery transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer-to-peer transport is not supported on this device")]
    Unsupported,
    #[error("{request} request rejected: {reason}")]
    Rejected { request: RequestKind, reason: String },
    #[error("discovery daemon error: {0}")]
    Daemon(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize peers: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("no radio command configured")]
    NotConfigured,
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}")]
    ExitStatus { program: String, status: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery controller has not been started")]
    NotStarted,
    #[error("discovery event loop is already running")]
    AlreadyRunning,
    #[error("discovery event loop has shut down")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Radio(#[from] RadioError),
}
