/// One distinct version of a block's bytes seen across failed hash checks.
#[derive(Debug, Clone)]
pub struct FailedEntry {
    data: Box<[u8]>,
    count: u32,
}

impl FailedEntry {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// How many failed rounds produced exactly these bytes.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Every version of a block that was part of a chunk failing verification.
#[derive(Debug, Clone, Default)]
pub struct BlockFailed {
    entries: Vec<FailedEntry>,
    current: Option<usize>,
}

impl BlockFailed {
    pub fn entries(&self) -> &[FailedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&FailedEntry> {
        self.entries.get(idx)
    }

    /// The version currently sitting in the chunk, if known.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub(crate) fn set_current(&mut self, idx: Option<usize>) {
        self.current = idx;
    }

    pub(crate) fn push(&mut self, data: Box<[u8]>) -> usize {
        self.entries.push(FailedEntry { data, count: 1 });
        self.entries.len() - 1
    }

    pub(crate) fn inc(&mut self, idx: usize) {
        if let Some(e) = self.entries.get_mut(idx) {
            e.count += 1;
        }
    }

    /// Entry with the most votes. Ties go to the current version, then to the
    /// oldest entry.
    pub fn most_popular(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, e) in self.entries.iter().enumerate() {
            best = match best {
                None => Some(idx),
                Some(b) => {
                    let bc = self.entries[b].count;
                    if e.count > bc || (e.count == bc && self.current == Some(idx)) {
                        Some(idx)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_popular() {
        let mut f = BlockFailed::default();
        assert_eq!(f.most_popular(), None);

        let a = f.push(vec![1u8; 4].into());
        let b = f.push(vec![2u8; 4].into());
        assert_eq!(f.most_popular(), Some(a));

        f.set_current(Some(b));
        assert_eq!(f.most_popular(), Some(b));

        f.inc(a);
        assert_eq!(f.most_popular(), Some(a));
        assert_eq!(f.get(a).unwrap().count(), 2);
    }
}
