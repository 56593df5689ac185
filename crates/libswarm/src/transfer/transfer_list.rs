use std::{
    collections::{BTreeSet, VecDeque},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use swarm_core::Piece;
use tracing::{debug, trace, warn};

use crate::{
    clock::Timestamp,
    error::{Error, Result},
    peer_info::PeerRegistry,
    type_aliases::PeerHandle,
};

use super::{
    ChunkBuffer,
    block_failed::BlockFailed,
    block_list::BlockList,
    block_transfer::{BlockRef, BlockTransfer, TransferArena, TransferKey, TransferState},
};

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferListOptions {
    /// How long verified chunks stay in the completed log.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub completed_retention: Duration,

    /// The log is only pruned once its oldest entry is this old.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub completed_prune_interval: Duration,
}

impl Default for TransferListOptions {
    fn default() -> Self {
        Self {
            completed_retention: Duration::from_secs(30 * 60),
            completed_prune_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// State changes the owner of the list has to react to. Drained with
/// [`TransferList::take_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// A chunk started downloading.
    Queued(u32),
    /// Every block of the chunk is in, it should be hashed.
    Completed(u32),
    /// The peer sent data that didn't match the verified chunk.
    Corrupt(PeerHandle),
    /// The chunk was dropped before it could be verified.
    Canceled(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The leader wrote the bytes into the chunk.
    Progress,
    /// A follower sent bytes identical to what the leader already wrote.
    Matched,
    /// A follower got past the leader and took over.
    LeaderChanged,
    /// The block is complete. `chunk_finished` is set when it was the last
    /// one of its chunk.
    BlockFinished { chunk_finished: bool },
    /// The bytes disagree with the leader's, the transfer is erased.
    Dissimilar,
    /// Nothing to do with the bytes, the transfer is detached or erased.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFailedOutcome {
    /// The chunk now holds the most popular version of every block and was
    /// reported completed again.
    RetriedMostPopular,
    /// Every block was reopened.
    Redownload,
}

/// Chunks currently being downloaded, at most one [`BlockList`] per chunk.
///
/// Lists are kept in insertion order and looked up linearly, there are only as
/// many as there are chunks in flight.
#[derive(Debug, Default)]
pub struct TransferList {
    lists: Vec<BlockList>,
    arena: TransferArena,
    options: TransferListOptions,
    succeeded_count: u32,
    failed_count: u32,
    completed_list: VecDeque<(Timestamp, u32)>,
    events: Vec<TransferEvent>,
}

fn find_entry<B: ChunkBuffer + ?Sized>(
    failed: &BlockFailed,
    chunk: &B,
    offset: u32,
) -> Result<Option<usize>> {
    for (idx, e) in failed.entries().iter().enumerate() {
        if chunk.compare_at(offset, e.data())? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

impl TransferList {
    pub fn new(options: TransferListOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockList> {
        self.lists.iter()
    }

    pub fn find(&self, index: u32) -> Option<&BlockList> {
        self.lists.iter().find(|l| l.index() == index)
    }

    pub fn find_mut(&mut self, index: u32) -> Option<&mut BlockList> {
        self.lists.iter_mut().find(|l| l.index() == index)
    }

    fn position(&self, index: u32) -> Result<usize> {
        self.lists
            .iter()
            .position(|l| l.index() == index)
            .ok_or(Error::BugChunkNotFound(index))
    }

    pub fn arena(&self) -> &TransferArena {
        &self.arena
    }

    pub fn peers(&self) -> &PeerRegistry {
        self.arena.peers()
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry {
        self.arena.peers_mut()
    }

    pub fn transfer(&self, key: TransferKey) -> Result<&BlockTransfer> {
        self.arena.get(key)
    }

    pub fn succeeded_count(&self) -> u32 {
        self.succeeded_count
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// `(when, index)` of recently verified chunks, oldest first.
    pub fn completed_list(&self) -> &VecDeque<(Timestamp, u32)> {
        &self.completed_list
    }

    pub fn take_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start downloading a chunk. `piece` covers the whole chunk.
    pub fn insert(&mut self, piece: Piece, block_size: u32) -> Result<&mut BlockList> {
        if self.find(piece.index).is_some() {
            return Err(Error::BugDuplicateChunk(piece.index));
        }
        debug!(index = piece.index, length = piece.length, "chunk queued");
        self.lists.push(BlockList::new(piece, block_size));
        self.events.push(TransferEvent::Queued(piece.index));
        let last = self.lists.len() - 1;
        Ok(&mut self.lists[last])
    }

    /// Drop a chunk that is still downloading.
    pub fn erase_index(&mut self, index: u32) -> Result<()> {
        let pos = self.position(index)?;
        let mut list = self.lists.remove(pos);
        list.clear(&mut self.arena)?;
        debug!(index, "chunk canceled");
        self.events.push(TransferEvent::Canceled(index));
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        for mut list in std::mem::take(&mut self.lists) {
            list.clear(&mut self.arena)?;
            self.events.push(TransferEvent::Canceled(list.index()));
        }
        Ok(())
    }

    pub(crate) fn insert_transfer(
        &mut self,
        index: u32,
        block: u32,
        peer: PeerHandle,
        now: Timestamp,
    ) -> Result<TransferKey> {
        let pos = self.position(index)?;
        self.lists[pos].block_mut(block)?.insert(
            &mut self.arena,
            peer,
            BlockRef {
                chunk: index,
                block,
            },
            now,
        )
    }

    fn valid_block(&self, key: TransferKey) -> Result<(usize, BlockRef)> {
        let at = self.arena.get(key)?.block().ok_or(Error::BugTransferInvalid)?;
        Ok((self.position(at.chunk)?, at))
    }

    /// The peer started sending data for a queued transfer. Returns whether
    /// it leads the block.
    pub fn transfering(&mut self, key: TransferKey) -> Result<bool> {
        let (pos, at) = self.valid_block(key)?;
        self.lists[pos]
            .block_mut(at.block)?
            .transfering(&mut self.arena, key)
    }

    /// The peer hasn't delivered anything for a while.
    ///
    /// Detached transfers and finished ones are no longer counted by any
    /// block, stalling them does nothing.
    pub fn stalled(&mut self, key: TransferKey) -> Result<()> {
        let t = self.arena.get(key)?;
        if !t.is_valid() || !t.is_linked() {
            return Ok(());
        }
        let (pos, at) = self.valid_block(key)?;
        self.lists[pos]
            .block_mut(at.block)?
            .stalled(&mut self.arena, key)
    }

    /// The peer gives up the transfer: canceled, choked or disconnected.
    ///
    /// Detached transfers are destroyed. The finished transfer of a completed
    /// block was already released by [`TransferList::finished`], releasing it
    /// again does nothing.
    pub fn release(&mut self, key: TransferKey) -> Result<()> {
        let t = self.arena.get(key)?;
        let Some(at) = t.block() else {
            return self.arena.destroy(key);
        };
        if !t.is_linked() {
            return Ok(());
        }
        let pos = self.position(at.chunk)?;
        self.lists[pos]
            .block_mut(at.block)?
            .erase(&mut self.arena, key)
    }

    /// Release every transfer the peer holds. Returns how many there were.
    pub fn release_peer(&mut self, peer: PeerHandle) -> Result<usize> {
        let keys: Vec<TransferKey> = self
            .arena
            .iter()
            .filter(|(_, t)| t.peer() == peer && t.is_linked())
            .map(|(k, _)| k)
            .collect();
        for k in keys.iter() {
            self.release(*k)?;
        }
        trace!(peer = %peer, count = keys.len(), "released peer transfers");
        Ok(keys.len())
    }

    /// Feed bytes received for `key` into the block's state machine. Writes
    /// to `chunk` when the transfer leads.
    pub fn receive<B: ChunkBuffer + ?Sized>(
        &mut self,
        key: TransferKey,
        data: &[u8],
        chunk: &mut B,
    ) -> Result<ReceiveOutcome> {
        let t = self.arena.get(key)?;
        let piece = t.piece();
        let position = t.position();
        let received = position.saturating_add(data.len() as u32);
        if received > piece.length {
            return Err(Error::PeerOverflow {
                peer: t.peer(),
                piece,
                received,
            });
        }
        let was_queued = t.is_queued();
        let Some(at) = t.block() else {
            self.arena.get_mut(key)?.set_position(received);
            return Ok(ReceiveOutcome::Discarded);
        };

        let pos = self.position(at.chunk)?;
        let list = &mut self.lists[pos];
        let offset = piece.offset - list.piece().offset;
        let block = list.block_mut(at.block)?;
        if was_queued {
            block.transfering(&mut self.arena, key)?;
        }
        block.unstall(&mut self.arena, key)?;

        match self.arena.get(key)?.state() {
            TransferState::Queued => Err(Error::BugTransferNotQueued),
            TransferState::Erased => {
                self.arena.get_mut(key)?.set_position(received);
                Ok(ReceiveOutcome::Discarded)
            }
            TransferState::Leader => {
                chunk.write_at(offset + position, data)?;
                self.arena.get_mut(key)?.set_position(received);
                if received == piece.length {
                    let chunk_finished = self.finished(key)?;
                    return Ok(ReceiveOutcome::BlockFinished { chunk_finished });
                }
                Ok(ReceiveOutcome::Progress)
            }
            TransferState::NotLeader => {
                let leader_position = match block.leader() {
                    Some(l) => self.arena.get(l)?.position(),
                    None => 0,
                };
                let overlap = leader_position
                    .saturating_sub(position)
                    .min(data.len() as u32);
                if overlap > 0 && !chunk.compare_at(offset + position, &data[..overlap as usize])? {
                    block.transfer_dissimilar(&mut self.arena, key)?;
                    self.arena.get_mut(key)?.set_position(received);
                    return Ok(ReceiveOutcome::Dissimilar);
                }
                if overlap as usize == data.len() {
                    self.arena.get_mut(key)?.set_position(received);
                    return Ok(ReceiveOutcome::Matched);
                }

                block.change_leader(&mut self.arena, key)?;
                trace!(%piece, position = position + overlap, "follower overtook leader");
                chunk.write_at(offset + position + overlap, &data[overlap as usize..])?;
                self.arena.get_mut(key)?.set_position(received);
                if received == piece.length {
                    let chunk_finished = self.finished(key)?;
                    return Ok(ReceiveOutcome::BlockFinished { chunk_finished });
                }
                Ok(ReceiveOutcome::LeaderChanged)
            }
        }
    }

    /// The leading transfer received its whole block. Returns whether the
    /// chunk is now complete, in which case [`TransferEvent::Completed`] fires.
    pub fn finished(&mut self, key: TransferKey) -> Result<bool> {
        let (pos, at) = self.valid_block(key)?;
        let list = &mut self.lists[pos];
        list.block_mut(at.block)?.completed(&mut self.arena, key)?;
        list.inc_finished()?;
        if list.is_all_finished() {
            debug!(index = list.index(), "all blocks finished");
            self.events.push(TransferEvent::Completed(list.index()));
            return Ok(true);
        }
        Ok(false)
    }

    fn ensure_all_finished(&self, pos: usize) -> Result<()> {
        let list = &self.lists[pos];
        if !list.is_all_finished() || list.blocks().iter().any(|b| !b.is_finished()) {
            return Err(Error::Internal(
                "hash result for a chunk with unfinished blocks",
            ));
        }
        Ok(())
    }

    /// The chunk passed verification. Peers whose earlier data disagrees
    /// with it are reported, then the list is dropped.
    pub fn hash_succeeded<B: ChunkBuffer + ?Sized>(
        &mut self,
        index: u32,
        chunk: &B,
        now: Timestamp,
    ) -> Result<()> {
        let pos = self.position(index)?;
        self.ensure_all_finished(pos)?;
        if self.lists[pos].failed() != 0 {
            self.mark_failed_peers(pos, chunk)?;
        }

        self.completed_list.push_back((now, index));
        self.prune_completed(now);
        self.succeeded_count += 1;

        let mut list = self.lists.remove(pos);
        list.clear(&mut self.arena)?;
        debug!(index, "chunk verified");
        Ok(())
    }

    /// The chunk failed verification.
    ///
    /// The first time around, the bytes of every block are recorded. If that
    /// shows a block whose most popular version isn't what the chunk holds,
    /// the chunk is rewritten with the most popular versions and reported
    /// completed again. Otherwise every block is downloaded again.
    pub fn hash_failed<B: ChunkBuffer + ?Sized>(
        &mut self,
        index: u32,
        chunk: &mut B,
    ) -> Result<HashFailedOutcome> {
        let pos = self.position(index)?;
        self.ensure_all_finished(pos)?;
        self.failed_count += 1;

        if self.lists[pos].attempt() == 0 {
            let promoted = self.update_failed(index, &*chunk)?;
            if promoted > 0 {
                self.lists[pos].set_attempt(1);
                self.retry_most_popular(pos, chunk)?;
                debug!(index, promoted, "chunk failed, retrying with most popular data");
                return Ok(HashFailedOutcome::RetriedMostPopular);
            }
        }

        self.lists[pos].do_all_failed(&mut self.arena)?;
        debug!(index, "chunk failed, downloading again");
        Ok(HashFailedOutcome::Redownload)
    }

    /// Record the current bytes of every block of the chunk. Returns the
    /// number of blocks whose most popular version differs from the bytes
    /// held now.
    pub fn update_failed<B: ChunkBuffer + ?Sized>(&mut self, index: u32, chunk: &B) -> Result<u32> {
        let pos = self.position(index)?;
        let list = &mut self.lists[pos];
        list.inc_failed();
        let chunk_offset = list.piece().offset;

        let mut promoted = 0;
        for block in list.blocks_mut() {
            let piece = block.piece();
            let offset = piece.offset - chunk_offset;
            let failed = block.failed_list_mut().get_or_insert_with(BlockFailed::default);
            let idx = match find_entry(failed, chunk, offset)? {
                Some(idx) => {
                    failed.inc(idx);
                    idx
                }
                None => {
                    let mut data = vec![0u8; piece.length as usize];
                    chunk.read_at(offset, &mut data)?;
                    failed.push(data.into_boxed_slice())
                }
            };
            failed.set_current(Some(idx));
            if failed.most_popular() != Some(idx) {
                promoted += 1;
            }
            if let Some(leader) = block.leader() {
                self.arena.get_mut(leader)?.set_failed_index(Some(idx));
            }
        }
        Ok(promoted)
    }

    fn retry_most_popular<B: ChunkBuffer + ?Sized>(&mut self, pos: usize, chunk: &mut B) -> Result<()> {
        let list = &mut self.lists[pos];
        let chunk_offset = list.piece().offset;
        for block in list.blocks_mut() {
            let piece = block.piece();
            let failed = block
                .failed_list_mut()
                .as_mut()
                .ok_or(Error::BugNoFailedData(piece))?;
            let best = failed.most_popular().ok_or(Error::BugNoFailedData(piece))?;
            if failed.current() == Some(best) {
                continue;
            }
            let entry = failed.get(best).ok_or(Error::BugNoFailedData(piece))?;
            chunk.write_at(piece.offset - chunk_offset, entry.data())?;
            failed.set_current(Some(best));
        }
        self.events.push(TransferEvent::Completed(list.index()));
        Ok(())
    }

    fn mark_failed_peers<B: ChunkBuffer + ?Sized>(&mut self, pos: usize, chunk: &B) -> Result<()> {
        let mut bad = BTreeSet::new();
        let list = &mut self.lists[pos];
        let chunk_offset = list.piece().offset;
        for block in list.blocks_mut() {
            let offset = block.piece().offset - chunk_offset;
            let Some(failed) = block.failed_list_mut().as_mut() else {
                continue;
            };
            let current = find_entry(failed, chunk, offset)?;
            failed.set_current(current);

            for k in block.transfers().iter().chain(block.retired()) {
                let t = self.arena.get(*k)?;
                if let Some(idx) = t.failed_index() {
                    if Some(idx) != current {
                        bad.insert(t.peer());
                    }
                }
            }
        }

        let index = list.index();
        for peer in bad {
            warn!(index, peer = %peer, "peer sent corrupt data");
            self.arena.peers_mut().mark_corrupt(peer);
            self.events.push(TransferEvent::Corrupt(peer));
        }
        Ok(())
    }

    fn prune_completed(&mut self, now: Timestamp) {
        let Some((oldest, _)) = self.completed_list.front() else {
            return;
        };
        if now.since(*oldest) < self.options.completed_prune_interval {
            return;
        }
        let cutoff = now.saturating_sub(self.options.completed_retention);
        while self
            .completed_list
            .front()
            .map(|(ts, _)| *ts < cutoff)
            .unwrap_or(false)
        {
            self.completed_list.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    const BLOCK: u32 = 4;

    fn peer(id: u8) -> PeerHandle {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 0, id)), 51413)
    }

    fn list_with_peers(peers: u8) -> TransferList {
        let mut tl = TransferList::default();
        for id in 1..=peers {
            tl.peers_mut().register(peer(id)).unwrap();
        }
        tl
    }

    fn download_block(
        tl: &mut TransferList,
        chunk: &mut Vec<u8>,
        index: u32,
        block: u32,
        p: PeerHandle,
        data: &[u8],
    ) -> ReceiveOutcome {
        let key = tl.insert_transfer(index, block, p, Timestamp::default()).unwrap();
        tl.receive(key, data, chunk).unwrap()
    }

    #[test]
    fn test_insert_twice() {
        let mut tl = list_with_peers(0);
        tl.insert(Piece::new(3, 0, 8), BLOCK).unwrap();
        assert!(matches!(
            tl.insert(Piece::new(3, 0, 8), BLOCK),
            Err(Error::BugDuplicateChunk(3))
        ));
        assert_eq!(tl.take_events(), vec![TransferEvent::Queued(3)]);
    }

    #[test]
    fn test_completed_fires_once() {
        let mut tl = list_with_peers(1);
        let mut chunk = vec![0u8; 8];
        tl.insert(Piece::new(0, 0, 8), BLOCK).unwrap();
        tl.take_events();

        assert_eq!(
            download_block(&mut tl, &mut chunk, 0, 0, peer(1), &[1, 2, 3, 4]),
            ReceiveOutcome::BlockFinished {
                chunk_finished: false
            }
        );
        assert!(tl.take_events().is_empty());
        assert_eq!(
            download_block(&mut tl, &mut chunk, 0, 1, peer(1), &[5, 6, 7, 8]),
            ReceiveOutcome::BlockFinished {
                chunk_finished: true
            }
        );
        assert_eq!(tl.take_events(), vec![TransferEvent::Completed(0)]);
        assert_eq!(chunk, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(tl.peers().transfer_counter(peer(1)), 0);

        // The list stays until the hash result is in.
        assert!(tl.find(0).is_some());
        tl.hash_succeeded(0, &chunk, Timestamp::from_secs(10)).unwrap();
        assert!(tl.find(0).is_none());
        assert!(tl.arena().is_empty());
        assert_eq!(tl.succeeded_count(), 1);

        tl.insert(Piece::new(0, 0, 8), BLOCK).unwrap();
    }

    #[test]
    fn test_follower_matches_then_overtakes() {
        let mut tl = list_with_peers(2);
        let mut chunk = vec![0u8; 4];
        tl.insert(Piece::new(0, 0, 4), BLOCK).unwrap();
        let t1 = tl.insert_transfer(0, 0, peer(1), Timestamp::default()).unwrap();
        let t2 = tl.insert_transfer(0, 0, peer(2), Timestamp::default()).unwrap();

        assert_eq!(tl.receive(t1, &[9, 9], &mut chunk).unwrap(), ReceiveOutcome::Progress);
        assert_eq!(tl.receive(t2, &[9], &mut chunk).unwrap(), ReceiveOutcome::Matched);
        assert_eq!(
            tl.receive(t2, &[9, 7], &mut chunk).unwrap(),
            ReceiveOutcome::LeaderChanged
        );
        assert!(tl.transfer(t2).unwrap().is_leader());
        assert!(tl.transfer(t1).unwrap().is_not_leader());
        assert_eq!(&chunk[..3], &[9, 9, 7]);

        // The old leader is now behind and its bytes no longer match.
        assert_eq!(tl.receive(t1, &[8], &mut chunk).unwrap(), ReceiveOutcome::Dissimilar);
        assert!(tl.transfer(t1).unwrap().is_erased());
        assert_eq!(tl.receive(t1, &[1], &mut chunk).unwrap(), ReceiveOutcome::Discarded);
        assert_eq!(chunk[3], 0);
    }

    #[test]
    fn test_overflow() {
        let mut tl = list_with_peers(1);
        let mut chunk = vec![0u8; 4];
        tl.insert(Piece::new(0, 0, 4), BLOCK).unwrap();
        let t = tl.insert_transfer(0, 0, peer(1), Timestamp::default()).unwrap();
        assert!(matches!(
            tl.receive(t, &[0; 5], &mut chunk),
            Err(Error::PeerOverflow { received: 5, .. })
        ));
    }

    #[test]
    fn test_erase_index_orphans_transfers() {
        let mut tl = list_with_peers(1);
        let mut chunk = vec![0u8; 4];
        tl.insert(Piece::new(2, 0, 4), BLOCK).unwrap();
        let t = tl.insert_transfer(2, 0, peer(1), Timestamp::default()).unwrap();
        tl.take_events();

        tl.erase_index(2).unwrap();
        assert_eq!(tl.take_events(), vec![TransferEvent::Canceled(2)]);
        assert!(!tl.transfer(t).unwrap().is_valid());
        assert_eq!(tl.peers().transfer_counter(peer(1)), 1);

        assert_eq!(tl.receive(t, &[1, 2], &mut chunk).unwrap(), ReceiveOutcome::Discarded);
        assert_eq!(tl.release_peer(peer(1)).unwrap(), 1);
        assert_eq!(tl.peers().transfer_counter(peer(1)), 0);
        assert!(tl.arena().is_empty());
    }

    #[test]
    fn test_stall_detached_and_finished_transfers() {
        let mut tl = list_with_peers(2);
        let mut chunk = vec![0u8; 8];
        tl.insert(Piece::new(0, 0, 8), BLOCK).unwrap();
        let t1 = tl.insert_transfer(0, 0, peer(1), Timestamp::default()).unwrap();
        let t2 = tl.insert_transfer(0, 1, peer(2), Timestamp::default()).unwrap();

        tl.stalled(t2).unwrap();
        tl.stalled(t2).unwrap();
        assert_eq!(tl.transfer(t2).unwrap().stall(), 2);
        assert_eq!(tl.find(0).unwrap().block(1).unwrap().size_not_stalled(), 0);

        // The finished leader is off the block's books.
        tl.receive(t1, &[1, 2, 3, 4], &mut chunk).unwrap();
        tl.stalled(t1).unwrap();
        assert_eq!(tl.find(0).unwrap().block(0).unwrap().size_not_stalled(), 0);

        tl.erase_index(0).unwrap();
        tl.stalled(t2).unwrap();
        tl.release(t2).unwrap();
        assert!(tl.transfer(t2).is_err());
        assert_eq!(tl.peers().transfer_counter(peer(2)), 0);
    }

    #[test]
    fn test_redownload_after_inconclusive_failure() {
        let mut tl = list_with_peers(1);
        let mut chunk = vec![0u8; 4];
        tl.insert(Piece::new(0, 0, 4), BLOCK).unwrap();
        download_block(&mut tl, &mut chunk, 0, 0, peer(1), &[1, 1, 1, 1]);

        assert_eq!(
            tl.hash_failed(0, &mut chunk).unwrap(),
            HashFailedOutcome::Redownload
        );
        let list = tl.find(0).unwrap();
        assert_eq!(list.finished(), 0);
        assert_eq!(list.failed(), 1);
        assert!(!list.blocks()[0].is_finished());
        assert_eq!(tl.failed_count(), 1);

        // Same peer may try again.
        download_block(&mut tl, &mut chunk, 0, 0, peer(1), &[2, 2, 2, 2]);
        tl.hash_succeeded(0, &chunk, Timestamp::default()).unwrap();
        assert_eq!(
            tl.take_events(),
            vec![
                TransferEvent::Queued(0),
                TransferEvent::Completed(0),
                TransferEvent::Completed(0),
                TransferEvent::Corrupt(peer(1)),
            ]
        );
        assert_eq!(tl.peers().get(peer(1)).unwrap().corrupt_counter(), 1);
    }

    #[test]
    fn test_completed_log_pruning() {
        let options = TransferListOptions::default();
        let mut tl = TransferList::new(options);
        let chunk = vec![0u8; 4];
        let complete = |tl: &mut TransferList, index: u32, at: Timestamp| {
            tl.peers_mut().register(peer(1)).unwrap();
            tl.insert(Piece::new(index, 0, 4), BLOCK).unwrap();
            let key = tl.insert_transfer(index, 0, peer(1), at).unwrap();
            let mut c = chunk.clone();
            tl.receive(key, &[0; 4], &mut c).unwrap();
            tl.hash_succeeded(index, &c, at).unwrap();
            tl.peers_mut().unregister(peer(1)).unwrap();
        };

        complete(&mut tl, 0, Timestamp::from_secs(0));
        complete(&mut tl, 1, Timestamp::from_secs(40 * 60));
        assert_eq!(tl.completed_list().len(), 2);
        complete(&mut tl, 2, Timestamp::from_secs(61 * 60));
        // Index 0 is past retention once pruning kicks in, index 1 is not.
        assert_eq!(
            tl.completed_list().iter().map(|(_, i)| *i).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
