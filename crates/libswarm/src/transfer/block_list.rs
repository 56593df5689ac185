use swarm_core::{Piece, lengths::split_blocks};

use crate::{
    error::{Error, Result},
    priority::Priority,
};

use super::{block::Block, block_transfer::TransferArena};

/// All blocks of one chunk being downloaded.
#[derive(Debug)]
pub struct BlockList {
    piece: Piece,
    priority: Priority,
    finished: u32,
    // Failed verification rounds whose data was captured.
    failed: u32,
    // Retries with the most popular data. Only one is ever attempted.
    attempt: u32,
    by_seeder: bool,
    blocks: Vec<Block>,
}

impl BlockList {
    pub fn new(piece: Piece, block_size: u32) -> Self {
        Self {
            piece,
            priority: Priority::Off,
            finished: 0,
            failed: 0,
            attempt: 0,
            by_seeder: false,
            blocks: split_blocks(piece, block_size).map(Block::new).collect(),
        }
    }

    pub fn index(&self) -> u32 {
        self.piece.index
    }

    pub fn piece(&self) -> Piece {
        self.piece
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn by_seeder(&self) -> bool {
        self.by_seeder
    }

    pub fn set_by_seeder(&mut self, value: bool) {
        self.by_seeder = value;
    }

    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn finished(&self) -> u32 {
        self.finished
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_all_finished(&self) -> bool {
        self.finished as usize == self.blocks.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, idx: u32) -> Option<&Block> {
        self.blocks.get(idx as usize)
    }

    pub(crate) fn block_mut(&mut self, idx: u32) -> Result<&mut Block> {
        self.blocks
            .get_mut(idx as usize)
            .ok_or(Error::Internal("block index out of range"))
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    pub(crate) fn inc_finished(&mut self) -> Result<()> {
        self.finished += 1;
        if self.finished as usize > self.blocks.len() {
            return Err(Error::BugFinishedOverflow {
                index: self.index(),
                finished: self.finished,
                size: self.blocks.len() as u32,
            });
        }
        Ok(())
    }

    pub(crate) fn inc_failed(&mut self) {
        self.failed += 1;
    }

    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Reopen every block for a fresh download round.
    pub(crate) fn do_all_failed(&mut self, arena: &mut TransferArena) -> Result<()> {
        self.finished = 0;
        self.attempt = 0;
        for b in self.blocks.iter_mut() {
            b.failed_leader(arena)?;
        }
        Ok(())
    }

    pub(crate) fn clear(&mut self, arena: &mut TransferArena) -> Result<()> {
        for b in self.blocks.iter_mut() {
            b.clear(arena)?;
        }
        Ok(())
    }
}
