use std::collections::HashMap;

use tracing::trace;

use crate::{
    error::{Error, Result},
    type_aliases::PeerHandle,
};

/// What the transfer layer knows about a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    addr: PeerHandle,
    // Outstanding transfers linked to this peer. The only aggregate load
    // signal per peer.
    transfer_counter: u32,
    // How many times the peer was found to have sent data that failed
    // verification.
    corrupt_counter: u32,
}

impl PeerInfo {
    pub fn addr(&self) -> PeerHandle {
        self.addr
    }

    pub fn transfer_counter(&self) -> u32 {
        self.transfer_counter
    }

    pub fn corrupt_counter(&self) -> u32 {
        self.corrupt_counter
    }
}

/// Registry resolving peer handles to their [`PeerInfo`].
///
/// Transfers never own peers, they hold a [`PeerHandle`] and go through the
/// registry to account for themselves.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerHandle, PeerInfo>,
}

impl PeerRegistry {
    pub fn register(&mut self, addr: PeerHandle) -> Result<()> {
        if self.peers.contains_key(&addr) {
            return Err(Error::BugPeerAlreadyRegistered(addr));
        }
        trace!(peer = %addr, "registered peer");
        self.peers.insert(
            addr,
            PeerInfo {
                addr,
                transfer_counter: 0,
                corrupt_counter: 0,
            },
        );
        Ok(())
    }

    /// Forget a peer. All of its transfers must have been released before.
    pub fn unregister(&mut self, addr: PeerHandle) -> Result<PeerInfo> {
        let info = self.peers.get(&addr).ok_or(Error::BugPeerNotFound(addr))?;
        if info.transfer_counter != 0 {
            return Err(Error::Internal(
                "unregistering a peer that still has outstanding transfers",
            ));
        }
        self.peers.remove(&addr).ok_or(Error::BugPeerNotFound(addr))
    }

    pub fn get(&self, addr: PeerHandle) -> Option<&PeerInfo> {
        self.peers.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn transfer_counter(&self, addr: PeerHandle) -> u32 {
        self.peers
            .get(&addr)
            .map(|p| p.transfer_counter)
            .unwrap_or_default()
    }

    pub(crate) fn inc_transfers(&mut self, addr: PeerHandle) -> Result<()> {
        let p = self
            .peers
            .get_mut(&addr)
            .ok_or(Error::BugPeerNotFound(addr))?;
        p.transfer_counter += 1;
        Ok(())
    }

    pub(crate) fn dec_transfers(&mut self, addr: PeerHandle) -> Result<()> {
        let p = self
            .peers
            .get_mut(&addr)
            .ok_or(Error::BugPeerNotFound(addr))?;
        p.transfer_counter = p
            .transfer_counter
            .checked_sub(1)
            .ok_or(Error::Internal("peer transfer counter underflow"))?;
        Ok(())
    }

    /// Peers that already disconnected are ignored.
    pub(crate) fn mark_corrupt(&mut self, addr: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&addr) {
            p.corrupt_counter += 1;
        }
    }
}
