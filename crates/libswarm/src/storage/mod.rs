// Chunk memory.
//
// Storage backends hand out Chunks: the bytes of one chunk, split in one part
// per file it overlaps. ChunkList keeps them reference counted per index and
// ChunkManager enforces a global memory budget across downloads.

mod chunk;
mod chunk_list;
mod chunk_manager;
mod chunk_part;
mod inmemory;
mod mmap;

use std::path::PathBuf;

use swarm_core::lengths::{Lengths, ValidChunkIndex};

pub use chunk::Chunk;
pub use chunk_list::{ChunkHandle, ChunkList, ChunkListNode, GetFlags, SyncMode};
pub use chunk_manager::{ChunkManager, ChunkManagerOptions};
pub use chunk_part::{ChunkPart, MemoryRegion};
pub use inmemory::InMemoryStorage;
pub use mmap::MmapStorage;

/// A file of the torrent and where it sits in the concatenated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub relative_filename: PathBuf,
    pub offset_in_torrent: u64,
    pub len: u64,
}

impl FileInfo {
    /// Lay files out back to back, in order.
    pub fn layout(files: impl IntoIterator<Item = (PathBuf, u64)>) -> Vec<FileInfo> {
        let mut offset = 0;
        files
            .into_iter()
            .map(|(relative_filename, len)| {
                let fi = FileInfo {
                    relative_filename,
                    offset_in_torrent: offset,
                    len,
                };
                offset += len;
                fi
            })
            .collect()
    }
}

/// Where a chunk intersects a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileRange {
    pub file_index: usize,
    pub file_offset: u64,
    pub chunk_position: u32,
    pub len: u32,
}

pub(crate) fn chunk_file_ranges(
    files: &[FileInfo],
    lengths: &Lengths,
    index: ValidChunkIndex,
) -> Vec<FileRange> {
    let start = lengths.chunk_offset(index);
    let end = start + lengths.chunk_length(index) as u64;
    files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.len > 0 && f.offset_in_torrent < end && f.offset_in_torrent + f.len > start)
        .map(|(file_index, f)| {
            let from = start.max(f.offset_in_torrent);
            let to = end.min(f.offset_in_torrent + f.len);
            FileRange {
                file_index,
                file_offset: from - f.offset_in_torrent,
                chunk_position: (from - start) as u32,
                len: (to - from) as u32,
            }
        })
        .collect()
}

/// Source of chunk memory for a download.
pub trait ChunkStorage: Send + Sync {
    fn lengths(&self) -> &Lengths;

    /// Map the chunk. Read-only chunks can't be written through.
    fn create_chunk(&self, index: ValidChunkIndex, writable: bool) -> anyhow::Result<Chunk>;

    /// Make the chunk's modifications durable.
    fn sync_chunk(&self, chunk: &Chunk) -> anyhow::Result<()>;
}
