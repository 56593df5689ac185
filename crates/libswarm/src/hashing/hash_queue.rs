use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use swarm_core::hash_id::Id20;
use tokio::sync::Notify;
use tracing::{debug, error_span, trace};

use crate::{
    error::{Error, Result},
    storage::ChunkHandle,
};

use super::{
    DownloadId,
    hash_check_queue::{HashCheckQueue, HashEntry},
    hash_chunk::HashChunk,
};

// Bytes hashed per step on the worker.
const HASH_STEP: u32 = 1 << 20;

/// A hashed (or canceled) chunk, back on the network thread.
#[derive(Debug)]
pub struct HashDone {
    pub id: DownloadId,
    pub index: u32,
    pub handle: ChunkHandle,
    /// `None` when the hash was canceled with [`HashQueue::remove`].
    pub digest: Option<Id20>,
}

struct Shared {
    check: HashCheckQueue,
    done: Mutex<VecDeque<HashDone>>,
    done_cond: Condvar,
    notify: Notify,
}

/// Hashes chunks on a dedicated thread.
///
/// Results pile up until the network thread collects them with
/// [`HashQueue::work`] or [`HashQueue::work_for`]; [`HashQueue::notify`]
/// fires whenever a new one lands.
pub struct HashQueue {
    shared: Arc<Shared>,
    pending: Mutex<HashSet<(DownloadId, u32)>>,
    worker: Option<JoinHandle<()>>,
}

impl HashQueue {
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            check: HashCheckQueue::default(),
            done: Mutex::new(VecDeque::new()),
            done_cond: Condvar::new(),
            notify: Notify::new(),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("hash-worker".to_owned())
                .spawn(move || error_span!("hash_worker").in_scope(|| run_worker(&shared)))
                .map_err(Error::SpawnWorker)?
        };
        Ok(Self {
            shared,
            pending: Mutex::new(HashSet::new()),
            worker: Some(worker),
        })
    }

    /// Signaled every time a result is ready.
    pub fn notify(&self) -> &Notify {
        &self.shared.notify
    }

    /// Chunks queued or being hashed.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_queued(&self, id: DownloadId, index: u32) -> bool {
        self.pending.lock().contains(&(id, index))
    }

    /// Queue a blocking handle for hashing.
    pub fn push_back(&self, id: DownloadId, handle: ChunkHandle) -> Result<()> {
        let index = handle.index();
        let mut pending = self.pending.lock();
        if pending.contains(&(id, index)) {
            return Err(Error::BugAlreadyHashing(index));
        }
        let chunk = HashChunk::new(handle)?;
        pending.insert((id, index));
        self.shared.check.push_back(HashEntry { id, chunk });
        trace!(id, index, "queued chunk for hashing");
        Ok(())
    }

    /// Every result ready so far.
    pub fn work(&self) -> Vec<HashDone> {
        let done: Vec<HashDone> = self.shared.done.lock().drain(..).collect();
        let mut pending = self.pending.lock();
        for d in done.iter() {
            pending.remove(&(d.id, d.index));
        }
        done
    }

    /// Results ready for one download, the rest stay queued.
    pub fn work_for(&self, id: DownloadId) -> Vec<HashDone> {
        let mut g = self.shared.done.lock();
        let (mine, rest): (VecDeque<_>, VecDeque<_>) = g.drain(..).partition(|d| d.id == id);
        *g = rest;
        drop(g);
        let mut pending = self.pending.lock();
        for d in mine.iter() {
            pending.remove(&(d.id, d.index));
        }
        mine.into()
    }

    /// Cancel hashing a chunk and get its handle back, with no digest.
    ///
    /// If the worker already started on it this waits for it to finish.
    pub fn remove(&self, id: DownloadId, index: u32) -> Result<Option<HashDone>> {
        if !self.pending.lock().remove(&(id, index)) {
            return Ok(None);
        }
        if let Some(chunk) = self.shared.check.remove(id, index) {
            trace!(id, index, "canceled queued hash");
            return Ok(Some(HashDone {
                id,
                index,
                handle: chunk.into_handle(),
                digest: None,
            }));
        }

        let mut done = self.shared.done.lock();
        loop {
            if let Some(pos) = done.iter().position(|d| d.id == id && d.index == index) {
                let mut d = done.remove(pos).ok_or(Error::Internal("hash result vanished"))?;
                d.digest = None;
                trace!(id, index, "canceled running hash");
                return Ok(Some(d));
            }
            if self.worker.as_ref().is_none_or(|w| w.is_finished()) {
                return Err(Error::HashWorkerGone);
            }
            self.shared
                .done_cond
                .wait_for(&mut done, Duration::from_millis(10));
        }
    }

    /// Cancel everything queued for a download.
    pub fn remove_all(&self, id: DownloadId) -> Result<Vec<HashDone>> {
        let indices: Vec<u32> = self
            .pending
            .lock()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, index)| *index)
            .collect();
        let mut removed = Vec::with_capacity(indices.len());
        for index in indices {
            removed.extend(self.remove(id, index)?);
        }
        Ok(removed)
    }
}

impl Drop for HashQueue {
    fn drop(&mut self) {
        self.shared.check.shutdown();
        if let Some(w) = self.worker.take() {
            if w.join().is_err() {
                debug!("hash worker panicked");
            }
        }
    }
}

fn run_worker(shared: &Shared) {
    debug!("started");
    while let Some(HashEntry { id, mut chunk }) = shared.check.pop() {
        let index = chunk.index();
        while !chunk.perform(HASH_STEP, true) {}
        let (handle, digest) = chunk.finish();
        trace!(id, index, %digest, "hashed chunk");
        shared.done.lock().push_back(HashDone {
            id,
            index,
            handle,
            digest: Some(digest),
        });
        shared.done_cond.notify_all();
        shared.notify.notify_one();
    }
    debug!("stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sha1w::{ISha1, Sha1};
    use swarm_core::lengths::Lengths;

    use super::*;
    use crate::{
        clock::Timestamp,
        storage::{ChunkList, ChunkManager, GetFlags, InMemoryStorage},
    };

    fn list(content: &[u8], chunk_len: u32) -> ChunkList {
        let lengths = Lengths::new(content.len() as u64, chunk_len, Some(chunk_len)).unwrap();
        let storage = Arc::new(InMemoryStorage::with_content(lengths, content).unwrap());
        ChunkList::new(storage, Arc::new(ChunkManager::default()))
    }

    fn wait_for(q: &HashQueue, id: DownloadId, count: usize) -> Vec<HashDone> {
        let mut done = Vec::new();
        for _ in 0..500 {
            done.extend(q.work_for(id));
            if done.len() >= count {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done
    }

    #[test]
    fn test_hash_chunks() {
        let content: Vec<u8> = (0..64u8).collect();
        let mut cl = list(&content, 16);
        let q = HashQueue::new().unwrap();
        for index in 0..4 {
            let h = cl.get(index, GetFlags::BLOCKING, Timestamp::default()).unwrap();
            q.push_back(7, h).unwrap();
        }

        let mut done = wait_for(&q, 7, 4);
        assert_eq!(done.len(), 4);
        assert!(q.is_empty());
        done.sort_by_key(|d| d.index);
        for d in done {
            let start = d.index as usize * 16;
            let expected = Id20::new(Sha1::digest([&content[start..start + 16]]));
            assert_eq!(d.digest, Some(expected));
            cl.release(d.handle).unwrap();
        }
    }

    #[test]
    fn test_duplicate_push() {
        let mut cl = list(&[0u8; 32], 16);
        let q = HashQueue::new().unwrap();
        let a = cl.get(0, GetFlags::BLOCKING, Timestamp::default()).unwrap();
        let b = cl.get(0, GetFlags::BLOCKING, Timestamp::default()).unwrap();
        q.push_back(1, a).unwrap();
        assert!(matches!(q.push_back(1, b), Err(Error::BugAlreadyHashing(0))));
    }

    #[test]
    fn test_remove_returns_handle_without_digest() {
        let mut cl = list(&[9u8; 64], 16);
        let q = HashQueue::new().unwrap();
        for index in 0..4 {
            let h = cl.get(index, GetFlags::BLOCKING, Timestamp::default()).unwrap();
            q.push_back(3, h).unwrap();
        }
        // Whether it was still queued or already running, it comes back
        // canceled.
        let removed = q.remove(3, 2).unwrap().unwrap();
        assert_eq!(removed.index, 2);
        assert_eq!(removed.digest, None);
        assert!(!q.is_queued(3, 2));
        assert!(q.remove(3, 2).unwrap().is_none());
        cl.release(removed.handle).unwrap();

        let rest = wait_for(&q, 3, 3);
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|d| d.index != 2 && d.digest.is_some()));
        for d in rest {
            cl.release(d.handle).unwrap();
        }
    }

    #[test]
    fn test_remove_waits_for_running_hash() {
        const LEN: u32 = 16 << 20;
        let content = vec![3u8; LEN as usize];
        let mut cl = list(&content, LEN);
        let q = HashQueue::new().unwrap();
        q.push_back(5, cl.get(0, GetFlags::BLOCKING, Timestamp::default()).unwrap())
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while q.shared.check.is_waiting(5, 0) && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        // Picked up by the worker, not hashed yet.
        assert!(!q.shared.check.is_waiting(5, 0));
        assert!(q.shared.done.lock().is_empty());
        assert!(q.is_queued(5, 0));

        let removed = q.remove(5, 0).unwrap().unwrap();
        assert_eq!(removed.index, 0);
        assert_eq!(removed.digest, None);
        assert!(q.is_empty());
        assert!(q.shared.done.lock().is_empty());
        assert!(q.work_for(5).is_empty());
        cl.release(removed.handle).unwrap();
    }

    #[tokio::test]
    async fn test_notified_when_done() {
        let mut cl = list(&[5u8; 16], 16);
        let q = HashQueue::new().unwrap();
        q.push_back(4, cl.get(0, GetFlags::BLOCKING, Timestamp::default()).unwrap())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), q.notify().notified())
            .await
            .unwrap();
        let done = q.work();
        assert_eq!(done.len(), 1);
        cl.release(done.into_iter().next().unwrap().handle).unwrap();
    }

    #[test]
    fn test_work_for_keeps_other_downloads() {
        let mut a = list(&[1u8; 16], 16);
        let mut b = list(&[2u8; 16], 16);
        let q = HashQueue::new().unwrap();
        q.push_back(1, a.get(0, GetFlags::BLOCKING, Timestamp::default()).unwrap())
            .unwrap();
        q.push_back(2, b.get(0, GetFlags::BLOCKING, Timestamp::default()).unwrap())
            .unwrap();

        let first = wait_for(&q, 1, 1);
        assert_eq!(first.len(), 1);
        assert!(q.is_queued(2, 0));
        let second = wait_for(&q, 2, 1);
        assert_eq!(second.len(), 1);
        a.release(first.into_iter().next().unwrap().handle).unwrap();
        b.release(second.into_iter().next().unwrap().handle).unwrap();
    }
}
