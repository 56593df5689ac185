use tracing::trace;

use crate::{
    error::{Error, Result},
    peer_chunks::PeerChunks,
};

/// Past this many tracked partial peers, new ones aren't added to the per
/// chunk counters.
pub const MAX_ACCOUNTED: u32 = 255;

/// How many peers have each chunk.
///
/// Seeders only bump `complete`. Partial peers are counted per chunk, up to
/// [`MAX_ACCOUNTED`] of them. A peer with nothing yet costs nothing to track,
/// so it is always taken.
#[derive(Debug, Clone, Default)]
pub struct ChunkStatistics {
    rarity: Vec<u8>,
    complete: u32,
    accounted: u32,
}

impl ChunkStatistics {
    pub fn new(size: usize) -> Self {
        Self {
            rarity: vec![0; size],
            complete: 0,
            accounted: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.rarity.len()
    }

    pub fn complete(&self) -> u32 {
        self.complete
    }

    pub fn accounted(&self) -> u32 {
        self.accounted
    }

    /// Tracked partial peers having the chunk.
    pub fn rarity(&self, index: u32) -> u8 {
        self.rarity.get(index as usize).copied().unwrap_or_default()
    }

    /// Everyone known to have the chunk, seeders included.
    pub fn availability(&self, index: u32) -> u32 {
        self.rarity(index) as u32 + self.complete
    }

    fn should_add(&self) -> bool {
        self.accounted < MAX_ACCOUNTED
    }

    fn add_bitfield(&mut self, pc: &PeerChunks) {
        for idx in pc.bitfield().iter_ones() {
            if let Some(r) = self.rarity.get_mut(idx) {
                *r = r.saturating_add(1);
            }
        }
    }

    fn remove_bitfield(&mut self, pc: &PeerChunks) {
        for idx in pc.bitfield().iter_ones() {
            if let Some(r) = self.rarity.get_mut(idx) {
                *r = r.saturating_sub(1);
            }
        }
    }

    pub fn received_connect(&mut self, pc: &mut PeerChunks) -> Result<()> {
        if pc.using_counter() {
            return Err(Error::Internal("peer is already counted in chunk statistics"));
        }
        if pc.is_seeder() {
            pc.set_using_counter(true);
            self.complete += 1;
        } else if !pc.is_empty() && self.should_add() {
            pc.set_using_counter(true);
            self.accounted += 1;
            self.add_bitfield(pc);
        }
        trace!(peer = %pc.peer(), counted = pc.using_counter(), "peer connected");
        Ok(())
    }

    pub fn received_disconnect(&mut self, pc: &mut PeerChunks) {
        if !pc.using_counter() {
            return;
        }
        pc.set_using_counter(false);
        if pc.is_seeder() {
            self.complete = self.complete.saturating_sub(1);
        } else {
            self.accounted = self.accounted.saturating_sub(1);
            self.remove_bitfield(pc);
        }
    }

    /// The peer announced a new chunk. Sets the bit in its bitfield.
    pub fn received_have_chunk(&mut self, pc: &mut PeerChunks, index: u32) -> Result<()> {
        if index as usize >= pc.size() {
            return Err(Error::BugIndexOutOfRange(index));
        }
        if pc.has(index) {
            return Ok(());
        }
        // An empty peer was free to track until now.
        if pc.is_empty() && !pc.using_counter() && self.should_add() {
            pc.set_using_counter(true);
            self.accounted += 1;
        }
        pc.set(index);

        if pc.using_counter() {
            if let Some(r) = self.rarity.get_mut(index as usize) {
                *r = r.saturating_add(1);
            }
            if pc.is_seeder() {
                // Turned into a seeder, move it to the complete counter.
                self.complete += 1;
                self.accounted = self.accounted.saturating_sub(1);
                self.remove_bitfield(pc);
            }
        } else if pc.is_seeder() {
            pc.set_using_counter(true);
            self.complete += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;
    use crate::type_aliases::BF;

    fn pc(bits: &[bool]) -> PeerChunks {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        let bf: BF = bits.iter().copied().collect();
        PeerChunks::with_bitfield(addr, bf, bits.len())
    }

    #[test]
    fn test_empty_peer_is_free() {
        let mut stats = ChunkStatistics::new(4);
        let mut p = pc(&[false; 4]);
        stats.received_connect(&mut p).unwrap();
        assert_eq!(stats.accounted(), 0);
        assert!(!p.using_counter());

        // Its first HAVE starts the accounting.
        stats.received_have_chunk(&mut p, 2).unwrap();
        assert_eq!(stats.accounted(), 1);
        assert_eq!(stats.rarity(2), 1);

        stats.received_disconnect(&mut p);
        assert_eq!(stats.accounted(), 0);
        assert_eq!(stats.rarity(2), 0);
    }

    #[test]
    fn test_partial_peer_becomes_seeder() {
        let mut stats = ChunkStatistics::new(3);
        let mut p = pc(&[true, false, true]);
        stats.received_connect(&mut p).unwrap();
        assert_eq!(stats.accounted(), 1);
        assert_eq!(
            (0..3).map(|i| stats.rarity(i)).collect::<Vec<_>>(),
            vec![1, 0, 1]
        );

        stats.received_have_chunk(&mut p, 1).unwrap();
        assert_eq!(stats.complete(), 1);
        assert_eq!(stats.accounted(), 0);
        assert_eq!(
            (0..3).map(|i| stats.rarity(i)).collect::<Vec<_>>(),
            vec![0, 0, 0]
        );
        assert_eq!(stats.availability(1), 1);

        stats.received_disconnect(&mut p);
        assert_eq!(stats.complete(), 0);
    }

    #[test]
    fn test_accounting_cap() {
        let mut stats = ChunkStatistics::new(2);
        let mut peers: Vec<_> = (0..MAX_ACCOUNTED + 1).map(|_| pc(&[true, false])).collect();
        for p in peers.iter_mut() {
            stats.received_connect(p).unwrap();
        }
        assert_eq!(stats.accounted(), MAX_ACCOUNTED);
        assert_eq!(stats.rarity(0), 255);
        assert!(!peers.last().unwrap().using_counter());
        assert!(stats.received_have_chunk(&mut peers[0], 2).is_err());
    }
}
