/// Size of a block, the unit a single peer request asks for.
pub const BLOCK_SIZE: u32 = 16384;

/// Marker for "no chunk".
pub const INVALID_INDEX: u32 = u32::MAX;
