use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use super::{DownloadId, hash_chunk::HashChunk};

pub(crate) struct HashEntry {
    pub id: DownloadId,
    pub chunk: HashChunk,
}

#[derive(Default)]
struct State {
    queue: VecDeque<HashEntry>,
    shutdown: bool,
}

/// Worker side FIFO of chunks waiting to be hashed.
#[derive(Default)]
pub(crate) struct HashCheckQueue {
    state: Mutex<State>,
    cond: Condvar,
}

impl HashCheckQueue {
    pub fn push_back(&self, entry: HashEntry) {
        self.state.lock().queue.push_back(entry);
        self.cond.notify_one();
    }

    /// Take back an entry the worker hasn't started on.
    pub fn remove(&self, id: DownloadId, index: u32) -> Option<HashChunk> {
        let mut g = self.state.lock();
        let pos = g
            .queue
            .iter()
            .position(|e| e.id == id && e.chunk.index() == index)?;
        g.queue.remove(pos).map(|e| e.chunk)
    }

    #[cfg(test)]
    pub fn is_waiting(&self, id: DownloadId, index: u32) -> bool {
        self.state
            .lock()
            .queue
            .iter()
            .any(|e| e.id == id && e.chunk.index() == index)
    }

    /// Blocks until there's an entry. `None` once shut down.
    pub fn pop(&self) -> Option<HashEntry> {
        let mut g = self.state.lock();
        loop {
            if g.shutdown {
                return None;
            }
            if let Some(e) = g.queue.pop_front() {
                return Some(e);
            }
            self.cond.wait(&mut g);
        }
    }

    /// Wake the worker and make it exit. Pending entries are dropped.
    pub fn shutdown(&self) {
        let mut g = self.state.lock();
        g.shutdown = true;
        g.queue.clear();
        drop(g);
        self.cond.notify_all();
    }
}
