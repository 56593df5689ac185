use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::{
    clock::Timestamp,
    error::{Error, Result},
};

use super::{ChunkStorage, chunk::Chunk, chunk_manager::ChunkManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetFlags {
    pub writable: bool,
    /// Excludes new writers until released. Taken for hashing.
    pub blocking: bool,
}

impl GetFlags {
    pub const READ: GetFlags = GetFlags {
        writable: false,
        blocking: false,
    };
    pub const WRITE: GetFlags = GetFlags {
        writable: true,
        blocking: false,
    };
    pub const BLOCKING: GetFlags = GetFlags {
        writable: false,
        blocking: true,
    };

    pub const fn with_blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync every released dirty chunk.
    All,
    /// Only those not modified within the manager's sync timeout.
    Timeout,
}

/// Per index state of a [`ChunkList`].
#[derive(Debug, Default)]
pub struct ChunkListNode {
    chunk: Option<Arc<RwLock<Chunk>>>,
    // Read-only mappings replaced by a writable one, still held by readers.
    superseded: Vec<Arc<RwLock<Chunk>>>,
    references: u32,
    writable: u32,
    blocking: u32,
    // Written through a handle since the last sync.
    dirty: bool,
    queued: bool,
    time_modified: Timestamp,
    time_preloaded: Timestamp,
}

impl ChunkListNode {
    pub fn is_loaded(&self) -> bool {
        self.chunk.is_some()
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn writable(&self) -> u32 {
        self.writable
    }

    pub fn blocking(&self) -> u32 {
        self.blocking
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn time_modified(&self) -> Timestamp {
        self.time_modified
    }

    pub fn time_preloaded(&self) -> Timestamp {
        self.time_preloaded
    }
}

/// A reference to a loaded chunk. Must be given back to the [`ChunkList`] it
/// came from with [`ChunkList::release`].
#[derive(Debug)]
pub struct ChunkHandle {
    index: u32,
    chunk: Arc<RwLock<Chunk>>,
    writable: bool,
    blocking: bool,
}

impl ChunkHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_loaded(&self) -> bool {
        self.chunk.read().is_valid()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Chunk> {
        self.chunk.read()
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Chunk>> {
        if !self.writable {
            return Err(Error::Internal("writing through a read-only chunk handle"));
        }
        Ok(self.chunk.write())
    }
}

/// Loaded chunks of one download, reference counted per index.
///
/// A chunk is mapped on first use and stays loaded while referenced. When the
/// last handle goes away a chunk that was written to is queued for syncing,
/// others are dropped right away.
pub struct ChunkList {
    storage: Arc<dyn ChunkStorage>,
    manager: Arc<ChunkManager>,
    nodes: Vec<ChunkListNode>,
    queue: Vec<u32>,
}

impl std::fmt::Debug for ChunkList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkList")
            .field("loaded", &self.nodes.iter().filter(|n| n.is_loaded()).count())
            .field("queue", &self.queue)
            .finish()
    }
}

impl ChunkList {
    pub fn new(storage: Arc<dyn ChunkStorage>, manager: Arc<ChunkManager>) -> Self {
        let size = storage.lengths().total_chunks() as usize;
        Self {
            storage,
            manager,
            nodes: (0..size).map(|_| ChunkListNode::default()).collect(),
            queue: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: u32) -> Option<&ChunkListNode> {
        self.nodes.get(index as usize)
    }

    pub fn sync_queue(&self) -> &[u32] {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }

    pub fn get(&mut self, index: u32, flags: GetFlags, now: Timestamp) -> Result<ChunkHandle> {
        let lengths = *self.storage.lengths();
        let vidx = lengths
            .validate_chunk_index(index)
            .ok_or(Error::BugIndexOutOfRange(index))?;
        let node = &mut self.nodes[index as usize];
        if flags.writable && node.blocking > 0 {
            return Err(Error::ChunkBlocked(index));
        }

        let needs_upgrade = match node.chunk.as_ref() {
            None => None,
            Some(c) => Some(flags.writable && !c.read().is_writable()),
        };
        let chunk = match (needs_upgrade, node.chunk.as_ref()) {
            (None, _) | (_, None) => {
                let size = lengths.chunk_length(vidx);
                if !self.manager.allocate(size) {
                    return Err(Error::OutOfMemory);
                }
                let chunk = match self.storage.create_chunk(vidx, flags.writable) {
                    Ok(c) => c,
                    Err(e) => {
                        self.manager.deallocate(size);
                        return Err(Error::Storage(e));
                    }
                };
                trace!(index, writable = flags.writable, "loaded chunk");
                node.time_preloaded = now;
                let chunk = Arc::new(RwLock::new(chunk));
                node.chunk = Some(chunk.clone());
                chunk
            }
            (Some(true), Some(old)) => {
                // Readers keep their mapping, new handles get a writable one.
                let size = lengths.chunk_length(vidx);
                if !self.manager.allocate(size) {
                    return Err(Error::OutOfMemory);
                }
                let chunk = match self.storage.create_chunk(vidx, true) {
                    Ok(c) => c,
                    Err(e) => {
                        self.manager.deallocate(size);
                        return Err(Error::Storage(e));
                    }
                };
                trace!(index, "upgraded chunk to writable");
                node.superseded.push(old.clone());
                let chunk = Arc::new(RwLock::new(chunk));
                node.chunk = Some(chunk.clone());
                chunk
            }
            (Some(false), Some(c)) => c.clone(),
        };

        node.references += 1;
        if flags.writable {
            node.writable += 1;
            node.time_modified = now;
        }
        if flags.blocking {
            node.blocking += 1;
        }
        Ok(ChunkHandle {
            index,
            chunk,
            writable: flags.writable,
            blocking: flags.blocking,
        })
    }

    pub fn release(&mut self, handle: ChunkHandle) -> Result<()> {
        let ChunkHandle {
            index,
            chunk,
            writable,
            blocking,
        } = handle;
        drop(chunk);
        let size = self.chunk_size(index);
        let node = self
            .nodes
            .get_mut(index as usize)
            .ok_or(Error::BugInvalidChunkHandle)?;
        if node.chunk.is_none() || node.references == 0 {
            return Err(Error::BugInvalidChunkHandle);
        }
        node.references -= 1;
        if writable {
            node.writable = node
                .writable
                .checked_sub(1)
                .ok_or(Error::BugInvalidChunkHandle)?;
            node.dirty = true;
        }
        if blocking {
            node.blocking = node
                .blocking
                .checked_sub(1)
                .ok_or(Error::BugInvalidChunkHandle)?;
        }

        // Superseded mappings nobody reads anymore go back to the budget.
        let manager = &self.manager;
        node.superseded.retain(|c| {
            let held = Arc::strong_count(c) > 1;
            if !held {
                manager.deallocate(size);
            }
            held
        });

        if node.references == 0 {
            if node.dirty {
                if !node.queued {
                    node.queued = true;
                    self.queue.push(index);
                }
            } else {
                self.clear_chunk(index);
            }
        }
        Ok(())
    }

    fn chunk_size(&self, index: u32) -> u32 {
        let lengths = self.storage.lengths();
        lengths
            .validate_chunk_index(index)
            .map(|vidx| lengths.chunk_length(vidx))
            .unwrap_or_default()
    }

    fn clear_chunk(&mut self, index: u32) {
        let size = self.chunk_size(index);
        let Some(node) = self.nodes.get_mut(index as usize) else {
            return;
        };
        for _ in node.superseded.drain(..) {
            self.manager.deallocate(size);
        }
        if node.chunk.take().is_some() {
            self.manager.deallocate(size);
            trace!(index, "unloaded chunk");
        }
        node.dirty = false;
        node.time_preloaded = Timestamp::default();
    }

    /// Sync and unload queued chunks nobody holds. Returns how many were
    /// synced.
    pub fn sync_chunks(&mut self, mode: SyncMode, now: Timestamp) -> Result<usize> {
        let timeout = self.manager.options().sync_timeout;
        let queue = std::mem::take(&mut self.queue);
        let mut keep = Vec::new();
        let mut synced = 0;

        for (pos, index) in queue.iter().copied().enumerate() {
            let node = &mut self.nodes[index as usize];
            if node.references > 0 {
                // Back in use, queued again on release.
                node.queued = false;
                continue;
            }
            if mode == SyncMode::Timeout && now.since(node.time_modified) < timeout {
                keep.push(index);
                continue;
            }
            if let Some(chunk) = node.chunk.as_ref() {
                if let Err(e) = self.storage.sync_chunk(&chunk.read()) {
                    keep.extend_from_slice(&queue[pos..]);
                    self.queue = keep;
                    return Err(Error::Storage(e));
                }
            }
            node.queued = false;
            self.clear_chunk(index);
            synced += 1;
        }

        self.queue = keep;
        if synced > 0 {
            debug!(synced, queued = self.queue.len(), "synced chunks");
        }
        Ok(synced)
    }
}

impl Drop for ChunkList {
    fn drop(&mut self) {
        if let Err(e) = self.sync_chunks(SyncMode::All, Timestamp::now()) {
            warn!("error syncing chunks: {e:#}");
        }
        for index in 0..self.nodes.len() as u32 {
            self.clear_chunk(index);
        }
    }
}
