#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("torrent with 0 length is useless")]
    ZeroLength,
    #[error("block length {0} is not a power of 2")]
    BlockLengthNotPowerOfTwo(u32),
    #[error("block length {block_length} should be <= chunk length {chunk_length}")]
    BlockLongerThanChunk { block_length: u32, chunk_length: u32 },
    #[error("invalid chunk index {0}")]
    InvalidChunkIndex(u32),
    #[error("expected a hex string of length {0}")]
    BadHexLength(usize),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}
