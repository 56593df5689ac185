use serde::{Deserialize, Serialize};
use swarm_core::Piece;
use tracing::trace;

use crate::{
    clock::Timestamp,
    error::Result,
    peer_chunks::PeerChunks,
    priority::Priority,
    transfer::{BlockList, TransferKey, TransferList, TransferListOptions},
    type_aliases::PeerHandle,
};

/// Where new chunks come from when nothing in progress suits a peer.
pub trait ChunkSource {
    /// A wanted chunk the peer has that isn't being downloaded yet.
    fn find_chunk(&mut self, peer: &PeerChunks, high_priority: bool) -> Option<u32>;

    fn chunk_size(&self, index: u32) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegatorOptions {
    /// Hand out blocks other peers are already downloading when nothing else
    /// is left.
    pub aggressive: bool,

    /// In aggressive mode, how many non-stalled transfers a block may already
    /// have.
    pub max_duplicate_transfers: u32,
}

impl Default for DelegatorOptions {
    fn default() -> Self {
        Self {
            aggressive: false,
            max_duplicate_transfers: 4,
        }
    }
}

/// Decides which block a peer should request next.
#[derive(Debug)]
pub struct Delegator {
    transfers: TransferList,
    options: DelegatorOptions,
    block_size: u32,
}

impl Delegator {
    pub fn new(options: DelegatorOptions, transfer_options: TransferListOptions, block_size: u32) -> Self {
        Self {
            transfers: TransferList::new(transfer_options),
            options,
            block_size,
        }
    }

    pub fn transfers(&self) -> &TransferList {
        &self.transfers
    }

    pub fn transfers_mut(&mut self) -> &mut TransferList {
        &mut self.transfers
    }

    pub fn options(&self) -> &DelegatorOptions {
        &self.options
    }

    pub fn set_aggressive(&mut self, value: bool) {
        self.options.aggressive = value;
    }

    /// Grant the peer a block. `affinity` is the chunk the peer was last
    /// downloading. `None` means there's nothing for this peer right now.
    pub fn delegate<S: ChunkSource + ?Sized>(
        &mut self,
        source: &mut S,
        peer: &PeerChunks,
        affinity: Option<u32>,
        now: Timestamp,
    ) -> Result<Option<TransferKey>> {
        let Some((index, block)) = self.select(source, peer, affinity)? else {
            return Ok(None);
        };
        trace!(peer = %peer.peer(), index, block, "delegated block");
        self.transfers
            .insert_transfer(index, block, peer.peer(), now)
            .map(Some)
    }

    fn select<S: ChunkSource + ?Sized>(
        &mut self,
        source: &mut S,
        peer: &PeerChunks,
        affinity: Option<u32>,
    ) -> Result<Option<(u32, u32)>> {
        let addr = peer.peer();

        if let Some(list) = affinity.and_then(|index| self.transfers.find(index)) {
            if let Some(block) = self.delegate_piece(list, addr) {
                return Ok(Some((list.index(), block)));
            }
        }

        // Seeders are interchangeable, share their chunks between them.
        if peer.is_seeder() {
            for list in self.transfers.iter().filter(|l| l.by_seeder()) {
                if let Some(block) = self.delegate_piece(list, addr) {
                    return Ok(Some((list.index(), block)));
                }
            }
            for high in [true, false] {
                if let Some(found) = self.new_chunk(source, peer, high)? {
                    return Ok(Some(found));
                }
            }
        }

        if let Some(found) = self.resume(peer, Priority::High) {
            return Ok(Some(found));
        }
        if let Some(found) = self.new_chunk(source, peer, true)? {
            return Ok(Some(found));
        }
        if let Some(found) = self.resume(peer, Priority::Normal) {
            return Ok(Some(found));
        }
        if let Some(found) = self.new_chunk(source, peer, false)? {
            return Ok(Some(found));
        }

        if !self.options.aggressive {
            return Ok(None);
        }
        Ok(self.delegate_aggressive(peer))
    }

    /// A block of `list` nobody is actively downloading. Untouched blocks
    /// first, otherwise the first one the peer hasn't tried yet.
    fn delegate_piece(&self, list: &BlockList, peer: PeerHandle) -> Option<u32> {
        let mut candidate = None;
        for (idx, block) in list.blocks().iter().enumerate() {
            if block.is_finished() || !block.is_stalled() {
                continue;
            }
            if block.size_all() == 0 {
                return Some(idx as u32);
            }
            if candidate.is_none() && block.find(self.transfers.arena(), peer).is_none() {
                candidate = Some(idx as u32);
            }
        }
        candidate
    }

    fn resume(&self, peer: &PeerChunks, priority: Priority) -> Option<(u32, u32)> {
        self.transfers
            .iter()
            .filter(|l| l.priority() == priority && peer.has(l.index()))
            .find_map(|l| {
                self.delegate_piece(l, peer.peer())
                    .map(|block| (l.index(), block))
            })
    }

    fn new_chunk<S: ChunkSource + ?Sized>(
        &mut self,
        source: &mut S,
        peer: &PeerChunks,
        high_priority: bool,
    ) -> Result<Option<(u32, u32)>> {
        let Some(index) = source.find_chunk(peer, high_priority) else {
            return Ok(None);
        };
        let size = source.chunk_size(index);
        let list = self
            .transfers
            .insert(Piece::new(index, 0, size), self.block_size)?;
        list.set_by_seeder(peer.is_seeder());
        list.set_priority(if high_priority {
            Priority::High
        } else {
            Priority::Normal
        });
        if list.size() == 0 {
            return Ok(None);
        }
        Ok(Some((index, 0)))
    }

    /// Least duplicated unfinished block the peer isn't already on.
    fn delegate_aggressive(&self, peer: &PeerChunks) -> Option<(u32, u32)> {
        let arena = self.transfers.arena();
        let mut overlapped = self.options.max_duplicate_transfers + 1;
        let mut best = None;
        for list in self.transfers.iter() {
            if list.priority() == Priority::Off || !peer.has(list.index()) {
                continue;
            }
            for (idx, block) in list.blocks().iter().enumerate() {
                if block.is_finished()
                    || block.size_not_stalled() >= overlapped
                    || block.find(arena, peer.peer()).is_some()
                {
                    continue;
                }
                overlapped = block.size_not_stalled();
                best = Some((list.index(), idx as u32));
            }
        }
        best
    }
}
