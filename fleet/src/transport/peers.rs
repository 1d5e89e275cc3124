//! Current / stale peer bookkeeping.

use crate::address::NodeAddress;

/// Peers a socket should be connected to, and peers waiting to be torn down.
///
/// A peer is never in both lists: [`add`](Self::add) pulls it out of `stale`
/// and [`mark_stale`](Self::mark_stale) only moves peers that are current.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    current: Vec<NodeAddress>,
    stale: Vec<NodeAddress>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `peer` was already current.
    pub fn add(&mut self, peer: NodeAddress) -> bool {
        self.stale.retain(|p| p != &peer);
        if self.current.contains(&peer) {
            return false;
        }
        self.current.push(peer);
        true
    }

    /// Move a current peer to `stale`. Unknown peers are ignored.
    pub fn mark_stale(&mut self, peer: &NodeAddress) -> bool {
        let Some(pos) = self.current.iter().position(|p| p == peer) else {
            return false;
        };
        let peer = self.current.remove(pos);
        self.stale.push(peer);
        true
    }

    /// Move every current peer to `stale`.
    pub fn mark_all_stale(&mut self) {
        let current = std::mem::take(&mut self.current);
        self.stale.extend(current);
    }

    /// Drain the stale list for teardown.
    pub fn take_stale(&mut self) -> Vec<NodeAddress> {
        std::mem::take(&mut self.stale)
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.stale.clear();
    }

    pub fn current(&self) -> &[NodeAddress] {
        &self.current
    }

    pub fn stale(&self) -> &[NodeAddress] {
        &self.stale
    }

    pub fn is_current(&self, peer: &NodeAddress) -> bool {
        self.current.contains(peer)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
