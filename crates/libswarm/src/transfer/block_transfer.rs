use slotmap::SlotMap;
use swarm_core::Piece;
use tracing::trace;

use crate::{
    clock::Timestamp,
    error::{Error, Result},
    peer_info::PeerRegistry,
    type_aliases::PeerHandle,
};

slotmap::new_key_type! {
    /// Stable handle to a [`BlockTransfer`]. Outlives the block it was
    /// created for: once the block goes away the transfer becomes invalid but
    /// stays addressable until its peer lets go of it.
    pub struct TransferKey;
}

/// Position of a block inside the transfer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub chunk: u32,
    pub block: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Leader,
    NotLeader,
    /// Sent bytes that disagree with the leader. Kept only so the peer's
    /// outstanding bytes can be tracked and discarded.
    Erased,
}

/// One peer's attempt to download one block.
#[derive(Debug, Clone)]
pub struct BlockTransfer {
    peer: PeerHandle,
    // Whether the peer's transfer counter still accounts for this record.
    linked: bool,
    block: Option<BlockRef>,
    piece: Piece,
    state: TransferState,
    request_time: Timestamp,
    position: u32,
    stall: u32,
    failed_index: Option<usize>,
}

impl BlockTransfer {
    pub fn peer(&self) -> PeerHandle {
        self.peer
    }

    /// The block this transfer belongs to, `None` once invalidated.
    pub fn block(&self) -> Option<BlockRef> {
        self.block
    }

    pub fn piece(&self) -> Piece {
        self.piece
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn request_time(&self) -> Timestamp {
        self.request_time
    }

    /// Bytes received so far, relative to the block start.
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn stall(&self) -> u32 {
        self.stall
    }

    pub fn failed_index(&self) -> Option<usize> {
        self.failed_index
    }

    pub fn is_valid(&self) -> bool {
        self.block.is_some()
    }

    pub fn is_queued(&self) -> bool {
        self.state == TransferState::Queued
    }

    pub fn is_leader(&self) -> bool {
        self.state == TransferState::Leader
    }

    pub fn is_not_leader(&self) -> bool {
        self.state == TransferState::NotLeader
    }

    pub fn is_erased(&self) -> bool {
        self.state == TransferState::Erased
    }

    pub fn is_finished(&self) -> bool {
        self.position == self.piece.length
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Counts toward its block's not-stalled total.
    pub(crate) fn is_active(&self) -> bool {
        !self.is_erased() && self.stall == 0
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    pub(crate) fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    pub(crate) fn set_stall(&mut self, stall: u32) {
        self.stall = stall;
    }

    pub(crate) fn set_failed_index(&mut self, idx: Option<usize>) {
        self.failed_index = idx;
    }

    pub(crate) fn invalidate(&mut self) {
        self.block = None;
    }
}

/// Owner of every [`BlockTransfer`], plus the peer registry the transfers
/// account against. Creating a transfer links it to its peer, destroying it
/// unlinks it, so counters can't drift.
#[derive(Debug, Default)]
pub struct TransferArena {
    slots: SlotMap<TransferKey, BlockTransfer>,
    peers: PeerRegistry,
}

impl TransferArena {
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry {
        &mut self.peers
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: TransferKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&self, key: TransferKey) -> Result<&BlockTransfer> {
        self.slots.get(key).ok_or(Error::BugTransferNotFound)
    }

    pub(crate) fn get_mut(&mut self, key: TransferKey) -> Result<&mut BlockTransfer> {
        self.slots.get_mut(key).ok_or(Error::BugTransferNotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransferKey, &BlockTransfer)> {
        self.slots.iter()
    }

    pub(crate) fn create(
        &mut self,
        peer: PeerHandle,
        block: BlockRef,
        piece: Piece,
        now: Timestamp,
    ) -> Result<TransferKey> {
        self.peers.inc_transfers(peer)?;
        let key = self.slots.insert(BlockTransfer {
            peer,
            linked: true,
            block: Some(block),
            piece,
            state: TransferState::Queued,
            request_time: now,
            position: 0,
            stall: 0,
            failed_index: None,
        });
        trace!(peer = %peer, %piece, ?key, "created transfer");
        Ok(key)
    }

    /// Drop the peer's claim on the transfer. The record itself stays.
    pub(crate) fn unlink(&mut self, key: TransferKey) -> Result<()> {
        let t = self.slots.get_mut(key).ok_or(Error::BugTransferNotFound)?;
        if t.linked {
            t.linked = false;
            let peer = t.peer;
            self.peers.dec_transfers(peer)?;
        }
        Ok(())
    }

    pub(crate) fn destroy(&mut self, key: TransferKey) -> Result<()> {
        self.unlink(key)?;
        self.slots.remove(key);
        Ok(())
    }

    /// Detach a transfer from its block. Transfers nobody holds anymore are
    /// destroyed right away, the rest linger as orphans until released.
    pub(crate) fn invalidate(&mut self, key: TransferKey) -> Result<()> {
        let t = self.get_mut(key)?;
        t.invalidate();
        if !t.linked {
            self.slots.remove(key);
        }
        Ok(())
    }
}
