use sha1w::{ISha1, Sha1};
use swarm_core::hash_id::Id20;

use crate::{
    error::{Error, Result},
    storage::ChunkHandle,
};

/// Incremental SHA-1 of a pinned chunk.
pub struct HashChunk {
    handle: ChunkHandle,
    hasher: Sha1,
    position: u32,
}

impl std::fmt::Debug for HashChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashChunk")
            .field("index", &self.handle.index())
            .field("position", &self.position)
            .finish()
    }
}

impl HashChunk {
    /// The handle must be loaded and blocking so nobody writes while hashing.
    pub fn new(handle: ChunkHandle) -> Result<Self> {
        if !handle.is_blocking() || !handle.is_loaded() {
            return Err(Error::BugChunkNotBlocking(handle.index()));
        }
        Ok(Self {
            handle,
            hasher: Sha1::new(),
            position: 0,
        })
    }

    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    pub fn handle(&self) -> &ChunkHandle {
        &self.handle
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn remaining(&self) -> u32 {
        self.handle.read().size() - self.position
    }

    /// Hash up to `length` more bytes. Unless `force` is set, stops at the
    /// first byte that isn't resident in memory. Returns true once the whole
    /// chunk is hashed.
    pub fn perform(&mut self, length: u32, force: bool) -> bool {
        let chunk = self.handle.read();
        let mut length = length.min(chunk.size() - self.position);
        if !force {
            length = length.min(chunk.incore_length(self.position));
        }
        for s in chunk.slices(self.position, length) {
            self.hasher.update(s);
        }
        self.position += length;
        self.position == chunk.size()
    }

    /// Gives the handle back along with the digest of what was hashed.
    pub fn finish(self) -> (ChunkHandle, Id20) {
        (self.handle, Id20::new(self.hasher.finish()))
    }

    pub(crate) fn into_handle(self) -> ChunkHandle {
        self.handle
    }
}
