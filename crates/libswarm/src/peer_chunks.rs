use crate::type_aliases::{BF, PeerHandle, bitfield_with_len};

/// The chunks a peer advertised, plus the bookkeeping [`ChunkStatistics`]
/// needs to undo its accounting when the peer leaves.
///
/// [`ChunkStatistics`]: crate::chunk_statistics::ChunkStatistics
#[derive(Debug, Clone)]
pub struct PeerChunks {
    peer: PeerHandle,
    bitfield: BF,
    using_counter: bool,
}

impl PeerChunks {
    pub fn new(peer: PeerHandle, size: usize) -> Self {
        Self {
            peer,
            bitfield: bitfield_with_len(size),
            using_counter: false,
        }
    }

    /// `bitfield` is resized to `size` bits, extra bits sent by the peer are
    /// dropped.
    pub fn with_bitfield(peer: PeerHandle, mut bitfield: BF, size: usize) -> Self {
        bitfield.resize(size, false);
        Self {
            peer,
            bitfield,
            using_counter: false,
        }
    }

    pub fn peer(&self) -> PeerHandle {
        self.peer
    }

    pub fn bitfield(&self) -> &BF {
        &self.bitfield
    }

    pub fn size(&self) -> usize {
        self.bitfield.len()
    }

    pub fn has(&self, index: u32) -> bool {
        self.bitfield
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn is_seeder(&self) -> bool {
        !self.bitfield.is_empty() && self.bitfield.all()
    }

    pub fn is_empty(&self) -> bool {
        self.bitfield.not_any()
    }

    pub(crate) fn set(&mut self, index: u32) {
        if let Some(mut b) = self.bitfield.get_mut(index as usize) {
            *b = true;
        }
    }

    pub(crate) fn using_counter(&self) -> bool {
        self.using_counter
    }

    pub(crate) fn set_using_counter(&mut self, value: bool) {
        self.using_counter = value;
    }
}
