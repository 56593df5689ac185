use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use swarm_core::{Id20, Piece, constants::BLOCK_SIZE, lengths::Lengths};
use tracing::{debug, trace, warn};

use crate::{
    chunk_selector::ChunkSelector,
    chunk_statistics::ChunkStatistics,
    clock::Timestamp,
    delegator::{ChunkSource, Delegator, DelegatorOptions},
    error::{Error, Result},
    hashing::{DownloadId, HashDone, HashQueue},
    peer_chunks::PeerChunks,
    priority::PriorityRanges,
    storage::{ChunkHandle, ChunkList, ChunkManager, ChunkStorage, GetFlags, SyncMode},
    transfer::{HashFailedOutcome, ReceiveOutcome, TransferEvent, TransferKey, TransferListOptions},
    type_aliases::{BF, PeerHandle, bitfield_with_len},
};

// Chunks hashed at once while checking existing data.
const INITIAL_CHECK_BATCH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    pub block_size: u32,

    /// Download chunks in order instead of from a rotating position.
    pub sequential: bool,

    /// Pick the rarest among this many candidate chunks.
    pub selector_queue_size: usize,

    #[serde(flatten)]
    pub delegator: DelegatorOptions,

    pub transfers: TransferListOptions,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            sequential: false,
            selector_queue_size: 1,
            delegator: DelegatorOptions::default(),
            transfers: TransferListOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    /// The chunk was downloaded and verified.
    ChunkCompleted(u32),
    ChunkFailed {
        index: u32,
        outcome: HashFailedOutcome,
    },
    CorruptPeer(PeerHandle),
    /// Existing data was checked, `completed` chunks were already there.
    CheckFinished { completed: u32 },
    /// Every chunk is verified.
    Finished,
}

struct InitialCheck {
    next: u32,
    outstanding: u32,
    have: BF,
}

struct SelectorSource<'a> {
    selector: &'a mut ChunkSelector,
    statistics: &'a ChunkStatistics,
    lengths: &'a Lengths,
}

impl ChunkSource for SelectorSource<'_> {
    fn find_chunk(&mut self, peer: &PeerChunks, high_priority: bool) -> Option<u32> {
        self.selector.find(peer, high_priority, self.statistics)
    }

    fn chunk_size(&self, index: u32) -> u32 {
        self.lengths
            .validate_chunk_index(index)
            .map(|i| self.lengths.chunk_length(i))
            .unwrap_or_default()
    }
}

/// One torrent's download, driven from the network thread.
///
/// Peers are announced with [`Download::peer_connected`], blocks are handed
/// out with [`Download::request_block`] and the bytes fed back with
/// [`Download::receive_block`]. Finished chunks go to the shared
/// [`HashQueue`]; call [`Download::poll_hashes`] when it signals.
pub struct Download {
    id: DownloadId,
    lengths: Lengths,
    hashes: Vec<Id20>,
    statistics: ChunkStatistics,
    selector: ChunkSelector,
    delegator: Delegator,
    chunk_list: ChunkList,
    hash_queue: Arc<HashQueue>,
    peers: HashMap<PeerHandle, PeerChunks>,
    // Writable handles of chunks being downloaded.
    writing: HashMap<u32, ChunkHandle>,
    initial_check: Option<InitialCheck>,
    events: Vec<DownloadEvent>,
}

impl Download {
    pub fn new(
        id: DownloadId,
        options: DownloadOptions,
        hashes: Vec<Id20>,
        storage: Arc<dyn ChunkStorage>,
        manager: Arc<ChunkManager>,
        hash_queue: Arc<HashQueue>,
    ) -> Result<Self> {
        let lengths = *storage.lengths();
        if hashes.len() != lengths.total_chunks() as usize {
            return Err(Error::Internal("expected one hash per chunk"));
        }
        let block_size = Lengths::new(
            lengths.total_length(),
            lengths.default_chunk_length(),
            Some(options.block_size),
        )?
        .block_length();

        let size = lengths.total_chunks();
        let mut selector = ChunkSelector::new(size);
        selector.set_sequential(options.sequential);
        selector.set_queue_size(options.selector_queue_size);

        debug!(id, chunks = size, block_size, "created download");
        Ok(Self {
            id,
            lengths,
            hashes,
            statistics: ChunkStatistics::new(size as usize),
            selector,
            delegator: Delegator::new(options.delegator, options.transfers, block_size),
            chunk_list: ChunkList::new(storage, manager),
            hash_queue,
            peers: HashMap::new(),
            writing: HashMap::new(),
            initial_check: None,
            events: Vec::new(),
        })
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn delegator(&self) -> &Delegator {
        &self.delegator
    }

    pub fn selector(&self) -> &ChunkSelector {
        &self.selector
    }

    pub fn statistics(&self) -> &ChunkStatistics {
        &self.statistics
    }

    pub fn chunk_list(&self) -> &ChunkList {
        &self.chunk_list
    }

    pub fn completed_chunks(&self) -> &BF {
        self.selector.completed()
    }

    pub fn is_finished(&self) -> bool {
        self.selector.completed().all()
    }

    pub fn is_checking(&self) -> bool {
        self.initial_check.is_some()
    }

    pub fn set_aggressive(&mut self, value: bool) {
        self.delegator.set_aggressive(value);
    }

    pub fn take_events(&mut self) -> Vec<DownloadEvent> {
        std::mem::take(&mut self.events)
    }

    /// Returns whether the peer has anything we want.
    pub fn peer_connected(&mut self, peer: PeerHandle, bitfield: Option<BF>) -> Result<bool> {
        let size = self.lengths.total_chunks() as usize;
        self.delegator.transfers_mut().peers_mut().register(peer)?;
        let mut pc = match bitfield {
            Some(bf) => PeerChunks::with_bitfield(peer, bf, size),
            None => PeerChunks::new(peer, size),
        };
        self.statistics.received_connect(&mut pc)?;
        let interested = self.selector.is_interested(&pc);
        self.peers.insert(peer, pc);
        Ok(interested)
    }

    /// The peer announced a chunk. Returns whether that chunk is wanted.
    ///
    /// An index past the last chunk is the peer's fault: the error is
    /// recoverable by dropping the peer and leaves the download untouched.
    pub fn peer_have(&mut self, peer: PeerHandle, index: u32) -> Result<bool> {
        let pc = self.peers.get_mut(&peer).ok_or(Error::BugPeerNotFound(peer))?;
        if self.lengths.validate_chunk_index(index).is_none() {
            return Err(Error::PeerInvalidChunk { peer, index });
        }
        self.statistics.received_have_chunk(pc, index)?;
        Ok(self.selector.received_have_chunk(index))
    }

    pub fn peer_disconnected(&mut self, peer: PeerHandle) -> Result<()> {
        let mut pc = self.peers.remove(&peer).ok_or(Error::BugPeerNotFound(peer))?;
        let released = self.delegator.transfers_mut().release_peer(peer)?;
        self.statistics.received_disconnect(&mut pc);
        let info = self.delegator.transfers_mut().peers_mut().unregister(peer)?;
        debug!(%peer, released, corrupt = info.corrupt_counter(), "peer disconnected");
        self.dispatch_events(Timestamp::default())
    }

    /// A block for the peer to request, as a chunk relative piece.
    pub fn request_block(
        &mut self,
        peer: PeerHandle,
        affinity: Option<u32>,
        now: Timestamp,
    ) -> Result<Option<(TransferKey, Piece)>> {
        if self.initial_check.is_some() {
            return Ok(None);
        }
        let pc = self.peers.get(&peer).ok_or(Error::BugPeerNotFound(peer))?;
        let mut source = SelectorSource {
            selector: &mut self.selector,
            statistics: &self.statistics,
            lengths: &self.lengths,
        };
        let key = self.delegator.delegate(&mut source, pc, affinity, now)?;
        self.dispatch_events(now)?;
        let Some(key) = key else {
            return Ok(None);
        };
        let piece = self.delegator.transfers().transfer(key)?.piece();
        Ok(Some((key, piece)))
    }

    /// Bytes arrived for a requested block.
    pub fn receive_block(
        &mut self,
        key: TransferKey,
        data: &[u8],
        now: Timestamp,
    ) -> Result<ReceiveOutcome> {
        let transfers = self.delegator.transfers_mut();
        let Some(at) = transfers.transfer(key)?.block() else {
            return transfers.receive(key, data, &mut Vec::new());
        };

        let handle = match self.writing.entry(at.chunk) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(self.chunk_list.get(at.chunk, GetFlags::WRITE, now)?)
            }
        };
        let outcome = {
            let mut chunk = handle.write()?;
            self.delegator
                .transfers_mut()
                .receive(key, data, &mut *chunk)?
        };
        if outcome == ReceiveOutcome::Dissimilar {
            debug!(piece = %self.delegator.transfers().transfer(key)?.piece(), "dissimilar data");
        }
        self.dispatch_events(now)?;
        Ok(outcome)
    }

    /// The peer won't deliver the block: it was canceled or choked.
    pub fn cancel(&mut self, key: TransferKey) -> Result<()> {
        self.delegator.transfers_mut().release(key)?;
        self.dispatch_events(Timestamp::default())
    }

    pub fn stalled(&mut self, key: TransferKey) -> Result<()> {
        self.delegator.transfers_mut().stalled(key)
    }

    pub fn set_priorities(&mut self, priorities: PriorityRanges) {
        let transfers = self.delegator.transfers_mut();
        let indices: Vec<u32> = transfers.iter().map(|l| l.index()).collect();
        for index in indices {
            if let Some(list) = transfers.find_mut(index) {
                list.set_priority(priorities.priority_of(index));
            }
        }
        self.selector.update_priorities(priorities);
    }

    /// Stop downloading a chunk and forget what was received.
    pub fn abort_chunk(&mut self, index: u32) -> Result<()> {
        self.delegator.transfers_mut().erase_index(index)?;
        self.dispatch_events(Timestamp::default())
    }

    /// Hash every chunk present on disk before downloading anything. Progress
    /// is made through [`Download::poll_hashes`].
    pub fn initial_check(&mut self, now: Timestamp) -> Result<()> {
        if self.initial_check.is_some() || !self.delegator.transfers().is_empty() {
            return Err(Error::Internal("initial check while downloading"));
        }
        self.initial_check = Some(InitialCheck {
            next: 0,
            outstanding: 0,
            have: bitfield_with_len(self.lengths.total_chunks() as usize),
        });
        self.pump_initial_check(now)
    }

    fn pump_initial_check(&mut self, now: Timestamp) -> Result<()> {
        let total = self.lengths.total_chunks();
        let Some(check) = self.initial_check.as_mut() else {
            return Ok(());
        };
        while check.outstanding < INITIAL_CHECK_BATCH && check.next < total {
            let handle = self.chunk_list.get(check.next, GetFlags::BLOCKING, now)?;
            self.hash_queue.push_back(self.id, handle)?;
            check.next += 1;
            check.outstanding += 1;
        }
        if check.next == total && check.outstanding == 0 {
            let completed = check.have.count_ones() as u32;
            self.selector.initialize(&check.have);
            self.initial_check = None;
            debug!(completed, "initial check finished");
            self.events.push(DownloadEvent::CheckFinished { completed });
            if self.is_finished() {
                self.events.push(DownloadEvent::Finished);
            }
        }
        Ok(())
    }

    /// Handle hash results for this download. Returns how many there were.
    pub fn poll_hashes(&mut self, now: Timestamp) -> Result<usize> {
        let done = self.hash_queue.work_for(self.id);
        let count = done.len();
        for d in done {
            self.hash_done(d, now)?;
        }
        Ok(count)
    }

    fn hash_done(&mut self, done: HashDone, now: Timestamp) -> Result<()> {
        let HashDone {
            index,
            handle,
            digest,
            ..
        } = done;
        let expected = self
            .hashes
            .get(index as usize)
            .copied()
            .ok_or(Error::BugIndexOutOfRange(index))?;

        if let Some(check) = self.initial_check.as_mut() {
            check.outstanding = check.outstanding.saturating_sub(1);
            if digest == Some(expected) {
                check.have.set(index as usize, true);
            }
            self.chunk_list.release(handle)?;
            return self.pump_initial_check(now);
        }

        let Some(digest) = digest else {
            return self.chunk_list.release(handle);
        };

        if digest == expected {
            let result = self
                .delegator
                .transfers_mut()
                .hash_succeeded(index, &*handle.read(), now);
            self.chunk_list.release(handle)?;
            result?;
            self.selector.mark_completed(index)?;
            // Culprits found while verifying are reported before completion.
            self.dispatch_events(now)?;
            debug!(index, "chunk completed");
            self.events.push(DownloadEvent::ChunkCompleted(index));
            if self.is_finished() {
                self.events.push(DownloadEvent::Finished);
            }
        } else {
            let result = match handle.write() {
                Ok(mut chunk) => self.delegator.transfers_mut().hash_failed(index, &mut *chunk),
                Err(e) => Err(e),
            };
            self.chunk_list.release(handle)?;
            let outcome = result?;
            self.dispatch_events(now)?;
            debug!(index, ?outcome, "chunk failed verification");
            self.events.push(DownloadEvent::ChunkFailed { index, outcome });
        }
        Ok(())
    }

    fn dispatch_events(&mut self, now: Timestamp) -> Result<()> {
        // Handling an event may produce more.
        loop {
            let events = self.delegator.transfers_mut().take_events();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.on_transfer_event(event, now)?;
            }
        }
    }

    fn on_transfer_event(&mut self, event: TransferEvent, now: Timestamp) -> Result<()> {
        trace!(?event, "transfer event");
        match event {
            TransferEvent::Queued(index) => self.selector.using_index(index),
            TransferEvent::Canceled(index) => {
                self.selector.not_using_index(index)?;
                if let Some(h) = self.writing.remove(&index) {
                    self.chunk_list.release(h)?;
                }
                if let Some(d) = self.hash_queue.remove(self.id, index)? {
                    self.chunk_list.release(d.handle)?;
                }
                Ok(())
            }
            TransferEvent::Completed(index) => {
                let handle = self
                    .chunk_list
                    .get(index, GetFlags::WRITE.with_blocking(), now)?;
                if let Some(h) = self.writing.remove(&index) {
                    self.chunk_list.release(h)?;
                }
                self.hash_queue.push_back(self.id, handle)
            }
            TransferEvent::Corrupt(peer) => {
                self.events.push(DownloadEvent::CorruptPeer(peer));
                Ok(())
            }
        }
    }

    /// Periodic housekeeping: sync released chunks, all of them when short on
    /// memory. Returns how many were synced.
    pub fn tick(&mut self, now: Timestamp) -> Result<usize> {
        let mode = if self.chunk_list.manager().is_over_budget() {
            debug!(
                usage = self.chunk_list.manager().memory_usage(),
                "chunk memory over budget, syncing everything"
            );
            SyncMode::All
        } else {
            SyncMode::Timeout
        };
        self.chunk_list.sync_chunks(mode, now)
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        match self.hash_queue.remove_all(self.id) {
            Ok(removed) => {
                for d in removed {
                    let _ = self.chunk_list.release(d.handle);
                }
            }
            Err(e) => warn!(id = self.id, "error canceling hashes: {e:#}"),
        }
        for (_, h) in self.writing.drain() {
            let _ = self.chunk_list.release(h);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;
    use crate::storage::InMemoryStorage;

    #[test]
    fn test_options_from_json() {
        let o: DownloadOptions = serde_json::from_str(
            r#"{"aggressive": true, "sequential": true, "transfers": {"completed_retention": 60}}"#,
        )
        .unwrap();
        assert!(o.delegator.aggressive);
        assert_eq!(o.delegator.max_duplicate_transfers, 4);
        assert!(o.sequential);
        assert_eq!(o.block_size, BLOCK_SIZE);
        assert_eq!(o.transfers.completed_retention.as_secs(), 60);
    }

    #[test]
    fn test_hash_count_checked() {
        let lengths = Lengths::new(64, 32, Some(16)).unwrap();
        let storage = Arc::new(InMemoryStorage::with_content(lengths, &[0u8; 64]).unwrap());
        let r = Download::new(
            0,
            DownloadOptions::default(),
            vec![Id20::default()],
            storage,
            Arc::new(ChunkManager::default()),
            Arc::new(HashQueue::new().unwrap()),
        );
        assert!(matches!(r, Err(Error::Internal(_))));
    }

    fn download(chunks: u64) -> Download {
        let lengths = Lengths::new(chunks * 32, 32, Some(16)).unwrap();
        let storage = Arc::new(
            InMemoryStorage::with_content(lengths, &vec![0u8; chunks as usize * 32]).unwrap(),
        );
        Download::new(
            0,
            DownloadOptions {
                block_size: 16,
                ..Default::default()
            },
            vec![Id20::default(); chunks as usize],
            storage,
            Arc::new(ChunkManager::default()),
            Arc::new(HashQueue::new().unwrap()),
        )
        .unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_have_out_of_range_is_peer_error() {
        let mut d = download(4);
        let peer = addr(1);
        d.peer_connected(peer, None).unwrap();
        assert!(matches!(
            d.peer_have(peer, 4),
            Err(Error::PeerInvalidChunk { index: 4, .. })
        ));
        assert_eq!(d.statistics().accounted(), 0);

        // The download carries on with the same peer.
        assert!(d.peer_have(peer, 3).unwrap());
        assert!(d.request_block(peer, None, Timestamp::default()).unwrap().is_some());
        d.peer_disconnected(peer).unwrap();
    }

    #[test]
    fn test_stall_and_cancel_after_abort() {
        let mut d = download(2);
        let peer = addr(2);
        d.peer_connected(peer, Some(BF::repeat(true, 2))).unwrap();
        let now = Timestamp::from_secs(1);

        let (key, piece) = d.request_block(peer, None, now).unwrap().unwrap();
        d.stalled(key).unwrap();
        d.abort_chunk(piece.index).unwrap();
        d.stalled(key).unwrap();
        d.cancel(key).unwrap();
        assert!(d.delegator().transfers().arena().is_empty());
        assert_eq!(d.delegator().transfers().peers().transfer_counter(peer), 0);

        // A finished transfer can still be reported stalled.
        let (key, _) = d.request_block(peer, None, now).unwrap().unwrap();
        d.receive_block(key, &[0; 16], now).unwrap();
        d.stalled(key).unwrap();
        d.peer_disconnected(peer).unwrap();
    }

    #[test]
    fn test_unknown_peer() {
        let lengths = Lengths::new(64, 32, Some(16)).unwrap();
        let storage = Arc::new(InMemoryStorage::with_content(lengths, &[0u8; 64]).unwrap());
        let mut d = Download::new(
            0,
            DownloadOptions {
                block_size: 16,
                ..Default::default()
            },
            vec![Id20::default(); 2],
            storage,
            Arc::new(ChunkManager::default()),
            Arc::new(HashQueue::new().unwrap()),
        )
        .unwrap();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        assert!(matches!(
            d.request_block(peer, None, Timestamp::default()),
            Err(Error::BugPeerNotFound(_))
        ));
        assert!(!d.peer_connected(peer, None).unwrap());
        assert!(d.peer_have(peer, 1).unwrap());
        assert_eq!(d.statistics().rarity(1), 1);
        d.peer_disconnected(peer).unwrap();
        assert_eq!(d.statistics().accounted(), 0);
    }
}
