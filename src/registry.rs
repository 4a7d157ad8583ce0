//! Deduplication of discovered peers.

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::name::eq_fold;
use crate::peer::Peer;
use crate::storage::PeerStore;

/// Consumer-facing peer collection. Discovery resolves against it, appends
/// new peers and mutates existing ones in place; it never removes or reorders.
pub trait PeerList: Send {
    /// Index of the first peer, in list order, that `matches` accepts.
    fn find(&self, matches: &dyn Fn(&Peer) -> bool) -> Option<usize>;

    fn append(&mut self, peer: Peer) -> usize;

    /// Applies `apply` to the peer at `index`, returning the updated peer.
    fn modify(&mut self, index: usize, apply: &mut dyn FnMut(&mut Peer)) -> Option<Peer>;
}

impl PeerList for Vec<Peer> {
    fn find(&self, matches: &dyn Fn(&Peer) -> bool) -> Option<usize> {
        self.iter().position(|peer| matches(peer))
    }

    fn append(&mut self, peer: Peer) -> usize {
        self.push(peer);
        self.len() - 1
    }

    fn modify(&mut self, index: usize, apply: &mut dyn FnMut(&mut Peer)) -> Option<Peer> {
        let peer = self.get_mut(index)?;
        apply(peer);
        Some(peer.clone())
    }
}

/// Two announcements describe the same device when their normalized names
/// or their transport addresses are equal, ignoring case.
pub fn is_same_device(peer: &Peer, clean_name: &str, transport_address: &str) -> bool {
    eq_fold(&peer.display_name, clean_name) || eq_fold(&peer.transport_address, transport_address)
}

pub struct PeerRegistry<L, S> {
    peers: L,
    store: S,
}

impl<L: PeerList, S: PeerStore> PeerRegistry<L, S> {
    pub fn new(peers: L, store: S) -> Self {
        Self { peers, store }
    }

    /// First peer in list order matching by name or address.
    pub fn resolve(&self, clean_name: &str, transport_address: &str) -> Option<usize> {
        self.peers
            .find(&|peer| is_same_device(peer, clean_name, transport_address))
    }

    /// Appends a peer. Callers resolve first; no uniqueness check happens here.
    pub fn upsert_new(&mut self, peer: Peer) -> usize {
        debug!(peer = %peer, "Adding new peer");
        self.peers.append(peer)
    }

    pub fn update(&mut self, index: usize, apply: &mut dyn FnMut(&mut Peer)) -> Option<Peer> {
        self.peers.modify(index, apply)
    }

    /// Writes the peer through to the repository.
    pub fn persist(&mut self, peer: &Peer) -> Result<(), StoreError> {
        self.store.upsert(peer).inspect_err(|e| {
            warn!(peer = %peer.display_name, error = %e, "Failed to persist peer");
        })
    }

    pub fn peers(&self) -> &L {
        &self.peers
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
