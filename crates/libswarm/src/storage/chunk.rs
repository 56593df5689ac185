use crate::{
    error::{Error, Result},
    transfer::ChunkBuffer,
};

use super::chunk_part::ChunkPart;

/// The bytes of one chunk, as one part per file the chunk spans.
#[derive(Debug)]
pub struct Chunk {
    index: u32,
    parts: Vec<ChunkPart>,
    size: u32,
}

impl Chunk {
    /// `parts` must be ordered and contiguous, starting at offset 0.
    pub fn new(index: u32, parts: Vec<ChunkPart>) -> Result<Self> {
        let mut size = 0;
        for p in parts.iter() {
            if p.position() != size {
                return Err(Error::Internal("chunk parts are not contiguous"));
            }
            size = p.end();
        }
        Ok(Self { index, parts, size })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn parts(&self) -> &[ChunkPart] {
        &self.parts
    }

    pub fn is_valid(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.parts.iter().all(|p| p.region().is_writable())
    }

    /// Index of the part holding byte `offset`.
    pub fn at_position(&self, offset: u32) -> Option<usize> {
        let idx = self.parts.partition_point(|p| p.end() <= offset);
        (idx < self.parts.len()).then_some(idx)
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<()> {
        let end = offset as u64 + len as u64;
        if end > self.size as u64 {
            return Err(Error::Internal("chunk access out of range"));
        }
        Ok(())
    }

    /// The byte slices covering `[offset, offset + len)`, in order.
    pub fn slices(&self, offset: u32, len: u32) -> impl Iterator<Item = &[u8]> {
        let end = offset.saturating_add(len).min(self.size);
        self.parts
            .iter()
            .filter(move |p| p.end() > offset && p.position() < end)
            .map(move |p| {
                let from = offset.max(p.position()) - p.position();
                let to = end.min(p.end()) - p.position();
                &p.region().as_slice()[from as usize..to as usize]
            })
    }

    pub fn to_buffer(&self, buf: &mut [u8], offset: u32) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let mut written = 0;
        for s in self.slices(offset, buf.len() as u32) {
            buf[written..written + s.len()].copy_from_slice(s);
            written += s.len();
        }
        Ok(())
    }

    pub fn from_buffer(&mut self, data: &[u8], offset: u32) -> Result<()> {
        self.check_range(offset, data.len())?;
        let end = offset + data.len() as u32;
        for p in self.parts.iter_mut() {
            if p.end() <= offset || p.position() >= end {
                continue;
            }
            let from = offset.max(p.position());
            let to = end.min(p.end());
            let position = p.position();
            let dst = p
                .region_mut()
                .as_mut_slice()
                .ok_or(Error::Internal("writing to a read-only chunk"))?;
            dst[(from - position) as usize..(to - position) as usize]
                .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
        }
        Ok(())
    }

    pub fn compare_buffer(&self, data: &[u8], offset: u32) -> Result<bool> {
        self.check_range(offset, data.len())?;
        let mut pos = 0;
        for s in self.slices(offset, data.len() as u32) {
            if s != &data[pos..pos + s.len()] {
                return Ok(false);
            }
            pos += s.len();
        }
        Ok(true)
    }

    /// Contiguous bytes from `offset` that can be read without touching the
    /// disk.
    pub fn incore_length(&self, offset: u32) -> u32 {
        let Some(first) = self.at_position(offset) else {
            return 0;
        };
        let mut length = 0;
        let mut offset = offset;
        for p in self.parts[first..].iter() {
            let local = (offset - p.position()) as usize;
            let incore = p.region().incore_length(local) as u32;
            length += incore;
            offset += incore;
            if offset < p.end() {
                break;
            }
        }
        length
    }

    pub fn sync(&self) -> std::io::Result<()> {
        for p in self.parts.iter() {
            p.region().flush()?;
        }
        Ok(())
    }
}

impl ChunkBuffer for Chunk {
    fn chunk_size(&self) -> u32 {
        self.size
    }

    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.to_buffer(buf, offset)
    }

    fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.from_buffer(data, offset)
    }

    fn compare_at(&self, offset: u32, data: &[u8]) -> Result<bool> {
        self.compare_buffer(data, offset)
    }
}
