use crate::{Error, Piece, constants::BLOCK_SIZE};

const fn is_power_of_two(x: u64) -> bool {
    (x != 0) && ((x & (x - 1)) == 0)
}

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

pub const fn last_element_size_u64(total: u64, element_size: u64) -> u64 {
    let rem = total % element_size;
    if rem == 0 {
        return element_size;
    }
    rem
}

/// Geometry of a torrent: how its bytes split into chunks (the unit that gets
/// hashed) and chunks into blocks (the unit a peer request asks for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    block_length: u32,
    total_length: u64,
    chunk_length: u32,
    last_chunk_id: u32,
    last_chunk_length: u32,
    max_blocks_per_chunk: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidChunkIndex(u32);

impl std::fmt::Display for ValidChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidChunkIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl Lengths {
    pub fn new(
        total_length: u64,
        chunk_length: u32,
        block_length: Option<u32>,
    ) -> Result<Self, Error> {
        let block_length = block_length.unwrap_or(BLOCK_SIZE);
        if !is_power_of_two(block_length as u64) {
            return Err(Error::BlockLengthNotPowerOfTwo(block_length));
        }
        if block_length > chunk_length {
            return Err(Error::BlockLongerThanChunk {
                block_length,
                chunk_length,
            });
        }
        if total_length == 0 {
            return Err(Error::ZeroLength);
        }
        let total_chunks = ceil_div_u64(total_length, chunk_length as u64) as u32;
        Ok(Self {
            block_length,
            chunk_length,
            total_length,
            max_blocks_per_chunk: ceil_div_u64(chunk_length as u64, block_length as u64) as u32,
            last_chunk_id: total_chunks - 1,
            last_chunk_length: last_element_size_u64(total_length, chunk_length as u64) as u32,
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn validate_chunk_index(&self, index: u32) -> Option<ValidChunkIndex> {
        if index > self.last_chunk_id {
            return None;
        }
        Some(ValidChunkIndex(index))
    }
    pub fn try_chunk_index(&self, index: u32) -> Result<ValidChunkIndex, Error> {
        self.validate_chunk_index(index)
            .ok_or(Error::InvalidChunkIndex(index))
    }
    pub const fn default_chunk_length(&self) -> u32 {
        self.chunk_length
    }
    pub const fn block_length(&self) -> u32 {
        self.block_length
    }
    pub const fn last_chunk_id(&self) -> ValidChunkIndex {
        ValidChunkIndex(self.last_chunk_id)
    }
    pub const fn total_chunks(&self) -> u32 {
        self.last_chunk_id + 1
    }
    pub const fn chunk_length(&self, index: ValidChunkIndex) -> u32 {
        if index.0 == self.last_chunk_id {
            return self.last_chunk_length;
        }
        self.chunk_length
    }
    pub const fn chunk_offset(&self, index: ValidChunkIndex) -> u64 {
        index.0 as u64 * self.chunk_length as u64
    }

    /// The whole-chunk range.
    pub const fn chunk_piece(&self, index: ValidChunkIndex) -> Piece {
        Piece::new(index.0, 0, self.chunk_length(index))
    }

    pub const fn blocks_per_chunk(&self, index: ValidChunkIndex) -> u32 {
        if index.0 == self.last_chunk_id {
            return self.last_chunk_length.div_ceil(self.block_length);
        }
        self.max_blocks_per_chunk
    }

    pub fn block_piece(&self, index: ValidChunkIndex, block: u32) -> Option<Piece> {
        if block >= self.blocks_per_chunk(index) {
            return None;
        }
        let offset = block * self.block_length;
        let length = std::cmp::min(self.block_length, self.chunk_length(index) - offset);
        Some(Piece::new(index.0, offset, length))
    }

    pub fn iter_chunk_pieces(&self) -> impl Iterator<Item = Piece> + use<> {
        let this = *self;
        (0..self.total_chunks()).map(move |idx| this.chunk_piece(ValidChunkIndex(idx)))
    }

    pub fn iter_block_pieces(&self, index: ValidChunkIndex) -> impl Iterator<Item = Piece> + use<> {
        split_blocks(self.chunk_piece(index), self.block_length)
    }
}

/// Split `piece` into consecutive blocks of `block_size` bytes, the last one
/// possibly shorter.
pub fn split_blocks(piece: Piece, block_size: u32) -> impl Iterator<Item = Piece> {
    let end = piece.end();
    (0u32..)
        .map(move |i| piece.offset + i * block_size)
        .take_while(move |offset| *offset < end)
        .map(move |offset| Piece::new(piece.index, offset, std::cmp::min(block_size, end - offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        Lengths::new(1174243328, 262144, None).unwrap()
    }

    #[test]
    fn test_total_chunks() {
        let l = make_lengths();
        assert_eq!(l.total_chunks(), 4480);
    }

    #[test]
    fn test_total_chunks_2() {
        let l = Lengths::new(4148166656, 2097152, None).unwrap();
        assert_eq!(l.total_chunks(), 1978);
    }

    #[test]
    fn test_chunk_length() {
        let l = make_lengths();
        let p = l.validate_chunk_index(4479).unwrap();

        assert_eq!(l.chunk_length(l.validate_chunk_index(0).unwrap()), 262144);
        assert_eq!(l.chunk_length(p), 100352);
        assert!(l.validate_chunk_index(4480).is_none());
    }

    #[test]
    fn test_blocks_in_chunk() {
        let l = make_lengths();
        let p = l.validate_chunk_index(4479).unwrap();

        assert_eq!(l.blocks_per_chunk(l.validate_chunk_index(0).unwrap()), 16);
        assert_eq!(l.blocks_per_chunk(p), 7);
    }

    #[test]
    fn test_block_pieces_of_last_chunk() {
        let l = make_lengths();
        let p = l.validate_chunk_index(4479).unwrap();

        let blocks: Vec<_> = l.iter_block_pieces(p).collect();
        assert_eq!(blocks.len(), 7);
        assert_eq!(blocks[0], Piece::new(4479, 0, 16384));
        assert_eq!(blocks[6], Piece::new(4479, 98304, 2048));
        assert_eq!(l.block_piece(p, 6), Some(blocks[6]));
        assert_eq!(l.block_piece(p, 7), None);
    }

    #[test]
    fn test_bad_lengths() {
        assert!(matches!(
            Lengths::new(0, 262144, None),
            Err(Error::ZeroLength)
        ));
        assert!(matches!(
            Lengths::new(100, 16384, Some(1000)),
            Err(Error::BlockLengthNotPowerOfTwo(1000))
        ));
        assert!(matches!(
            Lengths::new(100, 8192, None),
            Err(Error::BlockLongerThanChunk { .. })
        ));
    }
}
