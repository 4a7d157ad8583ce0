use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::peer::Peer;
use crate::registry::PeerList;

/// Peer list owned by the UI side and shared with the discovery loop.
///
/// Discovery only appends and mutates in place. Every change bumps a
/// generation counter that consumers can watch to know when to re-read.
#[derive(Clone)]
pub struct SharedPeers {
    peers: Arc<Mutex<Vec<Peer>>>,
    generation: Arc<watch::Sender<u64>>,
}

impl SharedPeers {
    pub fn new() -> Self {
        Self::from_peers(Vec::new())
    }

    pub fn from_peers(peers: Vec<Peer>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            peers: Arc::new(Mutex::new(peers)),
            generation: Arc::new(generation),
        }
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receiver that changes whenever the list grows or an entry is updated.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Peer>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl Default for SharedPeers {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerList for SharedPeers {
    fn find(&self, matches: &dyn Fn(&Peer) -> bool) -> Option<usize> {
        self.lock().iter().position(|peer| matches(peer))
    }

    fn append(&mut self, peer: Peer) -> usize {
        let index = {
            let mut peers = self.lock();
            peers.push(peer);
            peers.len() - 1
        };
        self.bump();
        index
    }

    fn modify(&mut self, index: usize, apply: &mut dyn FnMut(&mut Peer)) -> Option<Peer> {
        let updated = {
            let mut peers = self.lock();
            let peer = peers.get_mut(index)?;
            apply(peer);
            peer.clone()
        };
        self.bump();
        Some(updated)
    }
}
