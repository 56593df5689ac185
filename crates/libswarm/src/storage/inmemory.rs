use std::path::PathBuf;

use anyhow::Context;
use parking_lot::Mutex;
use swarm_core::lengths::{Lengths, ValidChunkIndex};

use super::{
    ChunkStorage, FileInfo,
    chunk::Chunk,
    chunk_file_ranges,
    chunk_part::{ChunkPart, MemoryRegion},
};

/// Files kept in memory. Chunks are copies, changes land on
/// [`ChunkStorage::sync_chunk`].
pub struct InMemoryStorage {
    lengths: Lengths,
    files: Vec<FileInfo>,
    data: Mutex<Vec<Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new(lengths: Lengths, files: Vec<FileInfo>) -> anyhow::Result<Self> {
        let total: u64 = files.iter().map(|f| f.len).sum();
        if total != lengths.total_length() {
            anyhow::bail!(
                "file lengths add up to {total}, expected {}",
                lengths.total_length()
            );
        }
        let data = files
            .iter()
            .map(|f| Ok(vec![0u8; usize::try_from(f.len)?]))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            lengths,
            files,
            data: Mutex::new(data),
        })
    }

    /// A single file holding `content`.
    pub fn with_content(lengths: Lengths, content: &[u8]) -> anyhow::Result<Self> {
        let storage = Self::new(
            lengths,
            FileInfo::layout([(PathBuf::from("data"), content.len() as u64)]),
        )?;
        storage.data.lock()[0].copy_from_slice(content);
        Ok(storage)
    }

    /// Copy of the current content of a file.
    pub fn file_content(&self, file_index: usize) -> Option<Vec<u8>> {
        self.data.lock().get(file_index).cloned()
    }
}

impl ChunkStorage for InMemoryStorage {
    fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    fn create_chunk(&self, index: ValidChunkIndex, writable: bool) -> anyhow::Result<Chunk> {
        let g = self.data.lock();
        let parts = chunk_file_ranges(&self.files, &self.lengths, index)
            .into_iter()
            .map(|r| {
                let file = g.get(r.file_index).context("no such file")?;
                let start = usize::try_from(r.file_offset)?;
                let bytes = file
                    .get(start..start + r.len as usize)
                    .context("bug: file range out of bounds")?;
                let region = if writable {
                    MemoryRegion::Buffer(bytes.into())
                } else {
                    let mut anon = memmap2::MmapOptions::new().len(bytes.len()).map_anon()?;
                    anon.copy_from_slice(bytes);
                    MemoryRegion::ReadOnly(anon.make_read_only()?)
                };
                Ok(ChunkPart::new(region, r.chunk_position, r.file_index, r.file_offset))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Chunk::new(index.get(), parts)?)
    }

    fn sync_chunk(&self, chunk: &Chunk) -> anyhow::Result<()> {
        let mut g = self.data.lock();
        for part in chunk.parts().iter().filter(|p| p.region().is_writable()) {
            let file = g.get_mut(part.file_index()).context("no such file")?;
            let start = usize::try_from(part.file_offset())?;
            file.get_mut(start..start + part.len() as usize)
                .context("bug: file range out of bounds")?
                .copy_from_slice(part.region().as_slice());
        }
        Ok(())
    }
}
