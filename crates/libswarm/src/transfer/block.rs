use swarm_core::Piece;
use tracing::{debug, trace};

use crate::{
    clock::Timestamp,
    error::{Error, Result},
    type_aliases::PeerHandle,
};

use super::{
    block_failed::BlockFailed,
    block_transfer::{BlockRef, TransferArena, TransferKey, TransferState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Incomplete,
    Completed,
}

/// A block of a chunk and every transfer that targets it.
///
/// The block doesn't own its transfers, the [`TransferArena`] does. Every
/// mutating method takes the arena so transfer records and the block's lists
/// change together.
#[derive(Debug)]
pub struct Block {
    piece: Piece,
    state: BlockState,
    queued: Vec<TransferKey>,
    transfers: Vec<TransferKey>,
    // Finishers of earlier rounds that failed verification. Kept to find out
    // who sent bad data once the chunk finally passes.
    retired: Vec<TransferKey>,
    leader: Option<TransferKey>,
    not_stalled: u32,
    failed: Option<BlockFailed>,
}

impl Block {
    pub fn new(piece: Piece) -> Self {
        Self {
            piece,
            state: BlockState::Incomplete,
            queued: Vec::new(),
            transfers: Vec::new(),
            retired: Vec::new(),
            leader: None,
            not_stalled: 0,
            failed: None,
        }
    }

    pub fn piece(&self) -> Piece {
        self.piece
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == BlockState::Completed
    }

    pub fn is_stalled(&self) -> bool {
        self.not_stalled == 0
    }

    pub fn size_all(&self) -> usize {
        self.queued.len() + self.transfers.len()
    }

    pub fn size_not_stalled(&self) -> u32 {
        self.not_stalled
    }

    pub fn queued(&self) -> &[TransferKey] {
        &self.queued
    }

    pub fn transfers(&self) -> &[TransferKey] {
        &self.transfers
    }

    pub fn retired(&self) -> &[TransferKey] {
        &self.retired
    }

    pub fn leader(&self) -> Option<TransferKey> {
        self.leader
    }

    pub fn failed_list(&self) -> Option<&BlockFailed> {
        self.failed.as_ref()
    }

    pub(crate) fn failed_list_mut(&mut self) -> &mut Option<BlockFailed> {
        &mut self.failed
    }

    /// The transfer `peer` has in this block, queued or active, erased
    /// included.
    pub fn find(&self, arena: &TransferArena, peer: PeerHandle) -> Option<TransferKey> {
        self.queued
            .iter()
            .chain(self.transfers.iter())
            .copied()
            .find(|k| arena.get(*k).map(|t| t.peer() == peer).unwrap_or(false))
    }

    pub(crate) fn insert(
        &mut self,
        arena: &mut TransferArena,
        peer: PeerHandle,
        at: BlockRef,
        now: Timestamp,
    ) -> Result<TransferKey> {
        if self.find(arena, peer).is_some() {
            return Err(Error::BugDuplicateTransfer {
                peer,
                piece: self.piece,
            });
        }
        let key = arena.create(peer, at, self.piece, now)?;
        self.queued.push(key);
        self.not_stalled += 1;
        Ok(key)
    }

    /// The first bytes of a queued transfer arrived. Returns whether it became
    /// the leader.
    pub(crate) fn transfering(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<bool> {
        let pos = self
            .queued
            .iter()
            .position(|k| *k == key)
            .ok_or(Error::BugTransferNotQueued)?;
        if !arena.get(key)?.is_queued() {
            return Err(Error::BugTransferNotQueued);
        }
        self.queued.remove(pos);
        self.transfers.push(key);

        let t = arena.get_mut(key)?;
        if self.leader.is_none() {
            t.set_state(TransferState::Leader);
            self.leader = Some(key);
            Ok(true)
        } else {
            t.set_state(TransferState::NotLeader);
            Ok(false)
        }
    }

    /// Remove a transfer that isn't the finished leader and destroy it. If it
    /// was leading, the non-leader furthest ahead takes over.
    pub(crate) fn erase(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<()> {
        let t = arena.get(key)?;
        let was_active = t.is_active();
        match t.state() {
            TransferState::Queued => {
                let pos = self
                    .queued
                    .iter()
                    .position(|k| *k == key)
                    .ok_or(Error::BugTransferNotFound)?;
                self.queued.remove(pos);
            }
            TransferState::Erased => {
                self.remove_active(key)?;
            }
            TransferState::Leader | TransferState::NotLeader => {
                if self.is_finished() {
                    return Err(Error::BugBlockFinished(self.piece));
                }
                self.remove_active(key)?;
                if self.leader == Some(key) {
                    self.leader = None;
                    self.promote(arena)?;
                }
            }
        }
        if was_active {
            self.dec_not_stalled()?;
        }
        arena.destroy(key)
    }

    fn remove_active(&mut self, key: TransferKey) -> Result<()> {
        let pos = self
            .transfers
            .iter()
            .position(|k| *k == key)
            .ok_or(Error::BugTransferNotFound)?;
        self.transfers.remove(pos);
        Ok(())
    }

    fn promote(&mut self, arena: &mut TransferArena) -> Result<()> {
        let mut best: Option<(TransferKey, u32)> = None;
        for k in self.transfers.iter().copied() {
            let t = arena.get(k)?;
            if !t.is_not_leader() {
                continue;
            }
            if best.map(|(_, p)| t.position() > p).unwrap_or(true) {
                best = Some((k, t.position()));
            }
        }
        if let Some((k, position)) = best {
            arena.get_mut(k)?.set_state(TransferState::Leader);
            self.leader = Some(k);
            debug!(piece = %self.piece, position, "promoted new leader");
        }
        Ok(())
    }

    /// Non-leader whose bytes disagree with the leader's.
    pub(crate) fn transfer_dissimilar(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<()> {
        if self.leader == Some(key) {
            return Err(Error::BugAlreadyLeader);
        }
        let t = arena.get_mut(key)?;
        if !t.is_not_leader() {
            return Err(Error::BugNotLeader);
        }
        let was_active = t.is_active();
        t.set_state(TransferState::Erased);
        if was_active {
            self.dec_not_stalled()?;
        }
        trace!(piece = %self.piece, peer = %t.peer(), "transfer is dissimilar");
        Ok(())
    }

    pub(crate) fn change_leader(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<()> {
        if self.leader == Some(key) {
            return Err(Error::BugAlreadyLeader);
        }
        if self.is_finished() {
            return Err(Error::BugBlockFinished(self.piece));
        }
        if !self.transfers.contains(&key) {
            return Err(Error::BugTransferNotFound);
        }
        if let Some(old) = self.leader {
            arena.get_mut(old)?.set_state(TransferState::NotLeader);
        }
        arena.get_mut(key)?.set_state(TransferState::Leader);
        self.leader = Some(key);
        Ok(())
    }

    pub(crate) fn stalled(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<()> {
        let t = arena.get_mut(key)?;
        if !t.is_linked() {
            return Ok(());
        }
        let was_active = t.is_active();
        t.set_stall(t.stall() + 1);
        if was_active {
            self.dec_not_stalled()?;
        }
        Ok(())
    }

    /// Data arrived, the transfer is no longer stalled.
    pub(crate) fn unstall(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<()> {
        let t = arena.get_mut(key)?;
        if t.stall() == 0 {
            return Ok(());
        }
        let was_active = t.is_active();
        t.set_stall(0);
        if !was_active && t.is_active() {
            self.not_stalled += 1;
        }
        Ok(())
    }

    /// The leader delivered the whole block. Every other transfer is detached
    /// and the leader alone stays on record.
    pub(crate) fn completed(&mut self, arena: &mut TransferArena, key: TransferKey) -> Result<()> {
        if self.is_finished() {
            return Err(Error::BugBlockFinished(self.piece));
        }
        let t = arena.get(key)?;
        if !t.is_valid() {
            return Err(Error::BugTransferInvalid);
        }
        if self.leader != Some(key) || !t.is_leader() {
            return Err(Error::BugNotLeader);
        }
        if !t.is_finished() {
            return Err(Error::BugTransferNotFinished(self.piece));
        }

        let others: Vec<TransferKey> = self
            .queued
            .drain(..)
            .chain(self.transfers.drain(..))
            .filter(|k| *k != key)
            .collect();
        for k in others {
            arena.invalidate(k)?;
        }
        self.transfers.push(key);
        self.not_stalled = 0;
        self.state = BlockState::Completed;
        arena.unlink(key)?;
        Ok(())
    }

    /// Reopen a finished block after its chunk failed verification. The
    /// finisher is retired and a new round can start.
    pub(crate) fn failed_leader(&mut self, arena: &mut TransferArena) -> Result<()> {
        if !self.is_finished() {
            return Err(Error::BugBlockNotFinished(self.piece));
        }
        self.leader = None;
        for k in self.transfers.drain(..) {
            arena.get_mut(k)?.set_state(TransferState::NotLeader);
            self.retired.push(k);
        }
        self.state = BlockState::Incomplete;
        self.not_stalled = 0;
        if let Some(f) = self.failed.as_mut() {
            f.set_current(None);
        }
        Ok(())
    }

    /// Detach everything, the block is going away.
    pub(crate) fn clear(&mut self, arena: &mut TransferArena) -> Result<()> {
        for k in self
            .queued
            .drain(..)
            .chain(self.transfers.drain(..))
            .chain(self.retired.drain(..))
        {
            arena.invalidate(k)?;
        }
        self.leader = None;
        self.not_stalled = 0;
        Ok(())
    }

    fn dec_not_stalled(&mut self) -> Result<()> {
        self.not_stalled = self
            .not_stalled
            .checked_sub(1)
            .ok_or(Error::Internal("block not-stalled counter underflow"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    fn peer(id: u8) -> PeerHandle {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, id)), 6881)
    }

    fn setup(peers: u8) -> (TransferArena, Block, BlockRef) {
        let mut arena = TransferArena::default();
        for id in 1..=peers {
            arena.peers_mut().register(peer(id)).unwrap();
        }
        let block = Block::new(Piece::new(0, 0, 16384));
        (arena, block, BlockRef { chunk: 0, block: 0 })
    }

    #[test]
    fn test_first_transfering_becomes_leader() {
        let (mut arena, mut b, at) = setup(2);
        let t1 = b.insert(&mut arena, peer(1), at, Timestamp::default()).unwrap();
        let t2 = b.insert(&mut arena, peer(2), at, Timestamp::default()).unwrap();
        assert_eq!(b.size_not_stalled(), 2);

        assert!(b.transfering(&mut arena, t1).unwrap());
        assert!(!b.transfering(&mut arena, t2).unwrap());
        assert_eq!(b.leader(), Some(t1));
        assert!(matches!(
            b.transfering(&mut arena, t2),
            Err(Error::BugTransferNotQueued)
        ));
    }

    #[test]
    fn test_duplicate_peer() {
        let (mut arena, mut b, at) = setup(1);
        b.insert(&mut arena, peer(1), at, Timestamp::default()).unwrap();
        assert!(matches!(
            b.insert(&mut arena, peer(1), at, Timestamp::default()),
            Err(Error::BugDuplicateTransfer { .. })
        ));
        assert_eq!(arena.peers().transfer_counter(peer(1)), 1);
    }

    #[test]
    fn test_erase_leader_promotes_furthest() {
        let (mut arena, mut b, at) = setup(3);
        let keys: Vec<_> = (1..=3)
            .map(|id| b.insert(&mut arena, peer(id), at, Timestamp::default()).unwrap())
            .collect();
        for k in &keys {
            b.transfering(&mut arena, *k).unwrap();
        }
        arena.get_mut(keys[0]).unwrap().set_position(8192);
        arena.get_mut(keys[1]).unwrap().set_position(2048);
        arena.get_mut(keys[2]).unwrap().set_position(4096);

        b.erase(&mut arena, keys[0]).unwrap();
        assert_eq!(b.leader(), Some(keys[2]));
        assert!(arena.get(keys[2]).unwrap().is_leader());
        assert_eq!(arena.get(keys[2]).unwrap().position(), 4096);
        assert!(!arena.contains(keys[0]));
        assert_eq!(arena.peers().transfer_counter(peer(1)), 0);
        assert_eq!(b.size_not_stalled(), 2);
    }

    #[test]
    fn test_stall_accounting() {
        let (mut arena, mut b, at) = setup(2);
        let t1 = b.insert(&mut arena, peer(1), at, Timestamp::default()).unwrap();
        let t2 = b.insert(&mut arena, peer(2), at, Timestamp::default()).unwrap();
        b.stalled(&mut arena, t1).unwrap();
        b.stalled(&mut arena, t1).unwrap();
        assert_eq!(b.size_not_stalled(), 1);
        b.stalled(&mut arena, t2).unwrap();
        assert!(b.is_stalled());

        b.unstall(&mut arena, t1).unwrap();
        assert_eq!(b.size_not_stalled(), 1);

        // Dissimilar transfers stop counting.
        b.transfering(&mut arena, t1).unwrap();
        b.transfering(&mut arena, t2).unwrap();
        b.unstall(&mut arena, t2).unwrap();
        assert_eq!(b.size_not_stalled(), 2);
        b.transfer_dissimilar(&mut arena, t2).unwrap();
        assert_eq!(b.size_not_stalled(), 1);
        b.erase(&mut arena, t2).unwrap();
        assert_eq!(b.size_not_stalled(), 1);
    }

    #[test]
    fn test_completed_detaches_others() {
        let (mut arena, mut b, at) = setup(3);
        let t1 = b.insert(&mut arena, peer(1), at, Timestamp::default()).unwrap();
        let t2 = b.insert(&mut arena, peer(2), at, Timestamp::default()).unwrap();
        let t3 = b.insert(&mut arena, peer(3), at, Timestamp::default()).unwrap();
        b.transfering(&mut arena, t1).unwrap();
        b.transfering(&mut arena, t2).unwrap();

        assert!(matches!(b.completed(&mut arena, t2), Err(Error::BugNotLeader)));
        assert!(matches!(
            b.completed(&mut arena, t1),
            Err(Error::BugTransferNotFinished(_))
        ));

        arena.get_mut(t1).unwrap().set_position(16384);
        b.completed(&mut arena, t1).unwrap();
        assert!(b.is_finished());
        assert_eq!(b.transfers(), &[t1]);
        assert!(b.queued().is_empty());
        assert!(!arena.get(t2).unwrap().is_valid());
        assert!(!arena.get(t3).unwrap().is_valid());
        // Finisher is no longer charged to its peer.
        assert_eq!(arena.peers().transfer_counter(peer(1)), 0);
        assert_eq!(arena.peers().transfer_counter(peer(2)), 1);
        assert!(matches!(
            b.erase(&mut arena, t1),
            Err(Error::BugBlockFinished(_))
        ));
    }

    #[test]
    fn test_failed_leader_reopens() {
        let (mut arena, mut b, at) = setup(2);
        let t1 = b.insert(&mut arena, peer(1), at, Timestamp::default()).unwrap();
        assert!(b.failed_leader(&mut arena).is_err());
        b.transfering(&mut arena, t1).unwrap();
        arena.get_mut(t1).unwrap().set_position(16384);
        b.completed(&mut arena, t1).unwrap();

        b.failed_leader(&mut arena).unwrap();
        assert!(!b.is_finished());
        assert_eq!(b.leader(), None);
        assert_eq!(b.retired(), &[t1]);
        assert!(b.find(&arena, peer(1)).is_none());

        b.clear(&mut arena).unwrap();
        assert!(arena.is_empty());
    }
}
