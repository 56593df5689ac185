// Chunk verification off the network thread.

mod hash_check_queue;
mod hash_chunk;
mod hash_queue;

pub use hash_chunk::HashChunk;
pub use hash_queue::{HashDone, HashQueue};

/// Tells apart the downloads sharing a [`HashQueue`].
pub type DownloadId = usize;
