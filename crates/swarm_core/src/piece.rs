use serde::{Deserialize, Serialize};

use crate::constants::INVALID_INDEX;

/// A byte range inside a chunk: `length` bytes starting `offset` bytes into
/// chunk `index`. A whole chunk is described with offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

impl Default for Piece {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Piece {
    pub const fn new(index: u32, offset: u32, length: u32) -> Self {
        Self {
            index,
            offset,
            length,
        }
    }

    pub const fn invalid() -> Self {
        Self::new(INVALID_INDEX, 0, 0)
    }

    pub const fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }

    /// One past the last byte, relative to the chunk start.
    pub const fn end(&self) -> u32 {
        self.offset + self.length
    }
}

impl std::fmt::Display for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.index, self.offset, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_invalid() {
        assert!(!Piece::default().is_valid());
        assert!(Piece::new(0, 0, 16384).is_valid());
    }
}
