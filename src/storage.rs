use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::name::fold_case;
use crate::peer::Peer;

/// Durable peer repository, one record per peer keyed by transport address.
pub trait PeerStore: Send {
    fn upsert(&mut self, peer: &Peer) -> Result<(), StoreError>;
}

/// Stores peers as a pretty-printed JSON map of address -> peer.
pub struct JsonPeerStore {
    path: PathBuf,
    peers: HashMap<String, Peer>,
}

impl JsonPeerStore {
    /// Opens the repository at `path`. A missing file is an empty repository.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                peers: HashMap::new(),
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let peers: HashMap<String, Peer> = serde_json::from_str(&content)?;
        tracing::info!(count = peers.len(), path = %path.display(), "Loaded known peers");

        Ok(Self { path, peers })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn known_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        peers
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(&self.peers)?;
        fs::write(&self.path, json).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "Saved known peers");
        Ok(())
    }
}

impl PeerStore for JsonPeerStore {
    fn upsert(&mut self, peer: &Peer) -> Result<(), StoreError> {
        self.peers.insert(peer.storage_key(), peer.clone());
        self.save()
    }
}

/// In-memory repository; clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryPeerStore {
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryPeerStore {
    pub fn get(&self, transport_address: &str) -> Option<Peer> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(&fold_case(transport_address)).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upserts received, including overwrites.
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PeerStore for MemoryPeerStore {
    fn upsert(&mut self, peer: &Peer) -> Result<(), StoreError> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.storage_key(), peer.clone());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
