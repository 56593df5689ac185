use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;
use memmap2::MmapOptions;
use swarm_core::lengths::{Lengths, ValidChunkIndex};
use tracing::debug;

use super::{
    ChunkStorage, FileInfo,
    chunk::Chunk,
    chunk_file_ranges,
    chunk_part::{ChunkPart, MemoryRegion},
};

/// Chunks mapped straight from the files on disk.
pub struct MmapStorage {
    output_folder: PathBuf,
    lengths: Lengths,
    files: Vec<FileInfo>,
    opened: Vec<File>,
}

impl MmapStorage {
    /// Open (creating if needed) every file under `output_folder` and size it.
    pub fn new(output_folder: impl Into<PathBuf>, lengths: Lengths, files: Vec<FileInfo>) -> anyhow::Result<Self> {
        let output_folder = output_folder.into();
        let total: u64 = files.iter().map(|f| f.len).sum();
        if total != lengths.total_length() {
            anyhow::bail!(
                "file lengths add up to {total}, expected {}",
                lengths.total_length()
            );
        }

        let mut opened = Vec::with_capacity(files.len());
        for fi in files.iter() {
            let full_path = output_folder.join(&fi.relative_filename);
            std::fs::create_dir_all(full_path.parent().context("bug: no parent")?)
                .with_context(|| format!("error creating directory for {full_path:?}"))?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&full_path)
                .with_context(|| format!("error opening {full_path:?} in read/write mode"))?;
            file.set_len(fi.len)
                .with_context(|| format!("mmap storage: error setting length of {full_path:?}"))?;
            opened.push(file);
        }
        debug!(folder = ?output_folder, files = files.len(), "opened mmap storage");

        Ok(Self {
            output_folder,
            lengths,
            files,
            opened,
        })
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }
}

impl ChunkStorage for MmapStorage {
    fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    fn create_chunk(&self, index: ValidChunkIndex, writable: bool) -> anyhow::Result<Chunk> {
        let parts = chunk_file_ranges(&self.files, &self.lengths, index)
            .into_iter()
            .map(|r| {
                let file = self.opened.get(r.file_index).context("no such file")?;
                let mut opts = MmapOptions::new();
                opts.offset(r.file_offset).len(r.len as usize);
                // SAFETY: the files are owned by this storage and only ever
                // accessed through mappings.
                let region = if writable {
                    MemoryRegion::Mmap(
                        unsafe { opts.map_mut(file) }
                            .with_context(|| format!("error mapping chunk {index}"))?,
                    )
                } else {
                    MemoryRegion::ReadOnly(
                        unsafe { opts.map(file) }
                            .with_context(|| format!("error mapping chunk {index}"))?,
                    )
                };
                Ok(ChunkPart::new(region, r.chunk_position, r.file_index, r.file_offset))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Chunk::new(index.get(), parts)?)
    }

    fn sync_chunk(&self, chunk: &Chunk) -> anyhow::Result<()> {
        chunk
            .sync()
            .with_context(|| format!("error flushing chunk {}", chunk.index()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_through_mapping() {
        let dir = tempfile::TempDir::new().unwrap();
        let files = FileInfo::layout([
            (PathBuf::from("a.bin"), 5000),
            (PathBuf::from("sub/b.bin"), 3000),
        ]);
        let lengths = Lengths::new(8000, 4096, Some(1024)).unwrap();
        let storage = MmapStorage::new(dir.path(), lengths, files).unwrap();

        let idx = lengths.try_chunk_index(1).unwrap();
        let mut chunk = storage.create_chunk(idx, true).unwrap();
        assert_eq!(chunk.size(), 8000 - 4096);
        assert_eq!(chunk.parts().len(), 2);
        chunk.from_buffer(&vec![7u8; chunk.size() as usize], 0).unwrap();
        storage.sync_chunk(&chunk).unwrap();
        drop(chunk);

        let a = std::fs::read(dir.path().join("a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("sub/b.bin")).unwrap();
        assert!(a[..4096].iter().all(|v| *v == 0));
        assert!(a[4096..].iter().all(|v| *v == 7));
        assert!(b.iter().all(|v| *v == 7));

        let ro = storage.create_chunk(idx, false).unwrap();
        assert!(!ro.is_writable());
        assert!(ro.compare_buffer(&[7u8; 10], 900).unwrap());
    }

    #[test]
    fn test_length_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let files = FileInfo::layout([(PathBuf::from("a.bin"), 10)]);
        let lengths = Lengths::new(20, 16, Some(8)).unwrap();
        assert!(MmapStorage::new(dir.path(), lengths, files).is_err());
    }
}
