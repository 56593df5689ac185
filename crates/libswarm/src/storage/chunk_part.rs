use memmap2::{Mmap, MmapMut};

/// Backing memory of a [`ChunkPart`].
pub enum MemoryRegion {
    Mmap(MmapMut),
    ReadOnly(Mmap),
    Buffer(Box<[u8]>),
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, len) = match self {
            MemoryRegion::Mmap(m) => ("mmap", m.len()),
            MemoryRegion::ReadOnly(m) => ("mmap-ro", m.len()),
            MemoryRegion::Buffer(b) => ("buffer", b.len()),
        };
        write!(f, "{kind}[{len}]")
    }
}

impl MemoryRegion {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            MemoryRegion::Mmap(m) => &m[..],
            MemoryRegion::ReadOnly(m) => &m[..],
            MemoryRegion::Buffer(b) => &b[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            MemoryRegion::Mmap(m) => Some(&mut m[..]),
            MemoryRegion::ReadOnly(_) => None,
            MemoryRegion::Buffer(b) => Some(&mut b[..]),
        }
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, MemoryRegion::ReadOnly(_))
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match self {
            MemoryRegion::Mmap(m) => m.flush(),
            MemoryRegion::ReadOnly(_) | MemoryRegion::Buffer(_) => Ok(()),
        }
    }

    /// Bytes from `offset` on that are resident in memory without a page
    /// fault, counted in whole pages and clamped to the region.
    pub fn incore_length(&self, offset: usize) -> usize {
        let len = self.len();
        if offset >= len {
            return 0;
        }
        match self {
            MemoryRegion::Buffer(_) => len - offset,
            MemoryRegion::Mmap(_) | MemoryRegion::ReadOnly(_) => {
                resident_bytes(&self.as_slice()[offset..])
            }
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(unix)]
fn resident_bytes(data: &[u8]) -> usize {
    if data.is_empty() {
        return 0;
    }
    let page = page_size();
    let start = data.as_ptr() as usize;
    let end = start + data.len();
    let aligned_start = start & !(page - 1);
    let pages = (end - aligned_start).div_ceil(page);
    let mut vec = vec![0u8; pages];

    // SAFETY: the range lies within a live mapping, `vec` holds one byte per
    // page of it.
    let ret = unsafe {
        libc::mincore(
            aligned_start as *mut libc::c_void,
            end - aligned_start,
            vec.as_mut_ptr().cast(),
        )
    };
    if ret != 0 {
        // Can't tell, let the reader fault the pages in.
        return data.len();
    }
    let resident_pages = vec.iter().take_while(|v| *v & 1 != 0).count();
    (aligned_start + resident_pages * page).min(end).saturating_sub(start)
}

#[cfg(not(unix))]
fn resident_bytes(data: &[u8]) -> usize {
    data.len()
}

/// A contiguous piece of a chunk living in a single file.
#[derive(Debug)]
pub struct ChunkPart {
    region: MemoryRegion,
    // Offset of the part inside the chunk.
    position: u32,
    file_index: usize,
    file_offset: u64,
}

impl ChunkPart {
    pub fn new(region: MemoryRegion, position: u32, file_index: usize, file_offset: u64) -> Self {
        Self {
            region,
            position,
            file_index,
            file_offset,
        }
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub(crate) fn region_mut(&mut self) -> &mut MemoryRegion {
        &mut self.region
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn len(&self) -> u32 {
        self.region.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn end(&self) -> u32 {
        self.position + self.len()
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_region() {
        let mut r = MemoryRegion::Buffer(vec![0u8; 10].into_boxed_slice());
        assert!(r.is_writable());
        assert_eq!(r.incore_length(4), 6);
        assert_eq!(r.incore_length(10), 0);
        r.as_mut_slice().unwrap()[0] = 1;
        assert_eq!(r.as_slice()[0], 1);
    }

    #[test]
    fn test_anon_mmap_is_resident_after_touch() {
        let mut m = memmap2::MmapOptions::new().len(3 * 4096).map_anon().unwrap();
        m.fill(1);
        let r = MemoryRegion::Mmap(m);
        assert_eq!(r.incore_length(100), 3 * 4096 - 100);
    }
}
