// Bookkeeping for chunks being downloaded.
//
// A TransferList holds one BlockList per chunk in flight. A BlockList tiles its
// chunk with Blocks, and every Block tracks the BlockTransfers peers have on
// it. Several peers may download the same block: the first to stream bytes
// leads and writes into the chunk, the others follow and must send identical
// bytes. Transfer records live in a slotmap arena so blocks, lists and peer
// connections can refer to them by key.

mod block;
mod block_failed;
mod block_list;
mod block_transfer;
mod transfer_list;

pub use block::{Block, BlockState};
pub use block_failed::{BlockFailed, FailedEntry};
pub use block_list::BlockList;
pub use block_transfer::{BlockRef, BlockTransfer, TransferArena, TransferKey, TransferState};
pub use transfer_list::{
    HashFailedOutcome, ReceiveOutcome, TransferEvent, TransferList, TransferListOptions,
};

use crate::error::{Error, Result};

/// Random access to the bytes of one chunk.
///
/// Implemented by mapped [`Chunk`](crate::storage::Chunk)s and by plain byte
/// vectors.
pub trait ChunkBuffer {
    fn chunk_size(&self) -> u32;
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<()>;
    fn compare_at(&self, offset: u32, data: &[u8]) -> Result<bool>;
}

fn buffer_range(len: usize, offset: u32, size: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(size)
        .filter(|end| *end <= len)
        .ok_or(Error::Internal("chunk buffer access out of range"))?;
    Ok(start..end)
}

impl ChunkBuffer for Vec<u8> {
    fn chunk_size(&self) -> u32 {
        self.len() as u32
    }

    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let r = buffer_range(self.len(), offset, buf.len())?;
        buf.copy_from_slice(&self[r]);
        Ok(())
    }

    fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let r = buffer_range(self.len(), offset, data.len())?;
        self[r].copy_from_slice(data);
        Ok(())
    }

    fn compare_at(&self, offset: u32, data: &[u8]) -> Result<bool> {
        let r = buffer_range(self.len(), offset, data.len())?;
        Ok(&self[r] == data)
    }
}
