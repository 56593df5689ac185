use tracing::debug;

use crate::{
    chunk_statistics::ChunkStatistics,
    error::{Error, Result},
    peer_chunks::PeerChunks,
    priority::{Priority, PriorityRanges, Ranges},
    type_aliases::{BF, bitfield_with_len},
};

/// Picks the next chunk to start downloading.
///
/// Candidates are wanted chunks that are neither completed nor in progress.
/// The scan starts at a rotating position so late chunks don't starve, or at
/// zero in sequential mode. With a `queue_size` above one, the rarest of the
/// first `queue_size` candidates wins.
#[derive(Debug, Clone)]
pub struct ChunkSelector {
    completed: BF,
    in_progress: BF,
    // Not completed and not in progress.
    untouched: BF,
    priorities: PriorityRanges,
    position: Option<u32>,
    sequential: bool,
    queue_size: usize,
}

impl ChunkSelector {
    pub fn new(size: u32) -> Self {
        let mut s = Self {
            completed: bitfield_with_len(size as usize),
            in_progress: bitfield_with_len(size as usize),
            untouched: BF::repeat(true, size as usize),
            priorities: PriorityRanges::all_normal(size),
            position: None,
            sequential: false,
            queue_size: 1,
        };
        s.position = s.next_wanted(0);
        s
    }

    /// Start from chunks already present on disk.
    pub fn initialize(&mut self, completed: &BF) {
        self.completed.fill(false);
        let len = self.completed.len();
        for idx in completed.iter_ones().filter(|i| *i < len) {
            self.completed.set(idx, true);
        }
        self.update_untouched();
    }

    pub fn size(&self) -> u32 {
        self.completed.len() as u32
    }

    pub fn completed(&self) -> &BF {
        &self.completed
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.completed
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn priorities(&self) -> &PriorityRanges {
        &self.priorities
    }

    pub fn set_sequential(&mut self, value: bool) {
        self.sequential = value;
    }

    pub fn set_queue_size(&mut self, size: usize) {
        self.queue_size = size.max(1);
    }

    pub fn position(&self) -> Option<u32> {
        self.position
    }

    pub fn update_priorities(&mut self, priorities: PriorityRanges) {
        self.priorities = priorities;
        self.update_untouched();
    }

    fn update_untouched(&mut self) {
        self.untouched = self
            .completed
            .iter()
            .by_vals()
            .zip(self.in_progress.iter().by_vals())
            .map(|(done, used)| !(done || used))
            .collect();
        self.position = self.next_wanted(0);
        debug!(
            wanted = self.untouched.count_ones(),
            position = ?self.position,
            "chunk selection updated"
        );
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.untouched.len() {
            return Err(Error::BugIndexOutOfRange(index));
        }
        Ok(())
    }

    /// Whether the chunk should still be downloaded.
    pub fn is_wanted(&self, index: u32) -> bool {
        self.untouched
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
            && self.priorities.is_wanted(index)
    }

    fn wanted_in(&self, ranges: &Ranges, begin: u32, end: u32) -> impl Iterator<Item = u32> {
        ranges
            .iter_within(begin, end)
            .flat_map(move |(b, e)| {
                self.untouched[b as usize..e as usize]
                    .iter_ones()
                    .map(move |i| b + i as u32)
            })
    }

    fn next_wanted(&self, from: u32) -> Option<u32> {
        let size = self.size();
        let from = from.min(size);
        let scan = |ranges: &Ranges| {
            self.wanted_in(ranges, from, size)
                .next()
                .or_else(|| self.wanted_in(ranges, 0, from).next())
        };
        let high = scan(&self.priorities.high);
        let normal = scan(&self.priorities.normal);
        // Nearest to `from` going forward, wrapping.
        [high, normal]
            .into_iter()
            .flatten()
            .min_by_key(|i| if *i >= from { *i - from } else { *i + size - from })
    }

    fn advance_position(&mut self) {
        self.position = self.position.and_then(|p| self.next_wanted(p + 1));
    }

    /// A chunk to start for the peer, `None` if it has nothing we want.
    pub fn find(
        &mut self,
        peer: &PeerChunks,
        high_priority: bool,
        stats: &ChunkStatistics,
    ) -> Option<u32> {
        let position = self.position?;
        let size = self.size();
        let start = if self.sequential { 0 } else { position };
        let ranges = if high_priority {
            &self.priorities.high
        } else {
            &self.priorities.normal
        };

        let found = self
            .wanted_in(ranges, start, size)
            .chain(self.wanted_in(ranges, 0, start))
            .filter(|i| peer.has(*i))
            .take(self.queue_size)
            .enumerate()
            .min_by_key(|(order, i)| (stats.rarity(*i), *order))
            .map(|(_, i)| i);

        if found.is_some() && !self.sequential {
            self.advance_position();
        }
        found
    }

    pub fn using_index(&mut self, index: u32) -> Result<()> {
        self.check_index(index)?;
        if self.in_progress[index as usize] {
            return Err(Error::BugIndexAlreadyUsed(index));
        }
        self.in_progress.set(index as usize, true);
        self.untouched.set(index as usize, false);
        if self.position == Some(index) {
            self.advance_position();
        }
        Ok(())
    }

    pub fn not_using_index(&mut self, index: u32) -> Result<()> {
        self.check_index(index)?;
        if !self.in_progress[index as usize] {
            return Err(Error::BugIndexNotUsed(index));
        }
        self.in_progress.set(index as usize, false);
        if !self.completed[index as usize] {
            self.untouched.set(index as usize, true);
            if self.position.is_none() && self.priorities.is_wanted(index) {
                self.position = Some(index);
            }
        }
        Ok(())
    }

    /// The chunk passed verification.
    pub fn mark_completed(&mut self, index: u32) -> Result<()> {
        self.check_index(index)?;
        self.completed.set(index as usize, true);
        self.in_progress.set(index as usize, false);
        self.untouched.set(index as usize, false);
        if self.position == Some(index) {
            self.advance_position();
        }
        Ok(())
    }

    /// The peer announced a chunk. Returns whether that makes it interesting.
    pub fn received_have_chunk(&self, index: u32) -> bool {
        self.is_wanted(index)
    }

    /// Whether the peer has anything we want.
    pub fn is_interested(&self, peer: &PeerChunks) -> bool {
        [Priority::High, Priority::Normal]
            .into_iter()
            .filter_map(|p| self.priorities.get(p))
            .any(|r| {
                self.wanted_in(r, 0, self.size())
                    .any(|i| peer.has(i))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    fn seeder(size: usize) -> PeerChunks {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        PeerChunks::with_bitfield(addr, BF::repeat(true, size), size)
    }

    #[test]
    fn test_round_robin() {
        let mut s = ChunkSelector::new(4);
        let stats = ChunkStatistics::new(4);
        let p = seeder(4);
        assert_eq!(s.find(&p, false, &stats), Some(0));
        // Not marked as used yet, but the position moved on.
        assert_eq!(s.find(&p, false, &stats), Some(1));
        s.using_index(2).unwrap();
        assert_eq!(s.find(&p, false, &stats), Some(3));
        assert_eq!(s.find(&p, false, &stats), Some(0));
        assert!(matches!(s.using_index(2), Err(Error::BugIndexAlreadyUsed(2))));
    }

    #[test]
    fn test_sequential() {
        let mut s = ChunkSelector::new(4);
        s.set_sequential(true);
        let stats = ChunkStatistics::new(4);
        let p = seeder(4);
        assert_eq!(s.find(&p, false, &stats), Some(0));
        assert_eq!(s.find(&p, false, &stats), Some(0));
        s.using_index(0).unwrap();
        s.mark_completed(1).unwrap();
        assert_eq!(s.find(&p, false, &stats), Some(2));

        s.not_using_index(0).unwrap();
        assert_eq!(s.find(&p, false, &stats), Some(0));
        assert!(matches!(s.not_using_index(0), Err(Error::BugIndexNotUsed(0))));
    }

    #[test]
    fn test_priorities() {
        let mut s = ChunkSelector::new(10);
        let stats = ChunkStatistics::new(10);
        let mut prio = PriorityRanges::default();
        prio.set(0, 5, Priority::Normal);
        prio.set(7, 8, Priority::High);
        s.update_priorities(prio);

        let p = seeder(10);
        assert_eq!(s.find(&p, true, &stats), Some(7));
        assert!(!s.is_wanted(9));
        assert!(s.is_wanted(3));
        s.using_index(7).unwrap();
        assert_eq!(s.find(&p, true, &stats), None);
    }

    #[test]
    fn test_rarest_within_window() {
        let mut s = ChunkSelector::new(4);
        s.set_sequential(true);
        s.set_queue_size(3);
        let mut stats = ChunkStatistics::new(4);
        let mut common = PeerChunks::with_bitfield(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 1),
            [true, false, true, true].into_iter().collect(),
            4,
        );
        stats.received_connect(&mut common).unwrap();

        let p = seeder(4);
        assert_eq!(s.find(&p, false, &stats), Some(1));
    }

    #[test]
    fn test_peer_without_wanted_chunks() {
        let mut s = ChunkSelector::new(2);
        let stats = ChunkStatistics::new(2);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        let mut p = PeerChunks::new(addr, 2);
        assert!(!s.is_interested(&p));
        assert_eq!(s.find(&p, false, &stats), None);
        p.set(1);
        assert!(s.is_interested(&p));
        s.mark_completed(1).unwrap();
        assert!(!s.received_have_chunk(1));
        assert!(!s.is_interested(&p));
    }

    #[test]
    fn test_initialize_from_existing() {
        let mut s = ChunkSelector::new(4);
        let stats = ChunkStatistics::new(4);
        // Bits past the torrent's chunk count are ignored.
        let have: BF = [true, false, true, false, true].into_iter().collect();
        s.initialize(&have);
        assert_eq!(s.completed().iter_ones().collect::<Vec<_>>(), vec![0, 2]);
        assert!(!s.is_wanted(0));
        assert!(s.is_wanted(3));
        assert_eq!(s.position(), Some(1));

        let p = seeder(4);
        assert_eq!(s.find(&p, false, &stats), Some(1));
        assert_eq!(s.find(&p, false, &stats), Some(3));
    }
}
