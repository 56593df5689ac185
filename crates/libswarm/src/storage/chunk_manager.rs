use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::debug;

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkManagerOptions {
    /// Upper bound on mapped chunk memory across every download.
    pub max_memory_usage: u64,

    /// Released writable chunks older than this are synced on a timed sync
    /// pass.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub sync_timeout: Duration,
}

impl Default for ChunkManagerOptions {
    fn default() -> Self {
        Self {
            max_memory_usage: 512 * 1024 * 1024,
            sync_timeout: Duration::from_secs(600),
        }
    }
}

/// Process wide accounting of chunk memory. Shared by every [`ChunkList`].
///
/// [`ChunkList`]: super::ChunkList
#[derive(Debug, Default)]
pub struct ChunkManager {
    options: ChunkManagerOptions,
    memory_usage: AtomicU64,
    memory_block_count: AtomicU64,
}

impl ChunkManager {
    pub fn new(options: ChunkManagerOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn options(&self) -> &ChunkManagerOptions {
        &self.options
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn memory_block_count(&self) -> u64 {
        self.memory_block_count.load(Ordering::Relaxed)
    }

    /// Reserve `size` bytes. Fails once the budget would be exceeded.
    pub fn allocate(&self, size: u32) -> bool {
        let size = size as u64;
        let result = self
            .memory_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(size)?;
                (next <= self.options.max_memory_usage).then_some(next)
            });
        match result {
            Ok(_) => {
                self.memory_block_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(used) => {
                debug!(used, size, "chunk memory budget exhausted");
                false
            }
        }
    }

    pub fn deallocate(&self, size: u32) {
        let size = size as u64;
        let _ = self
            .memory_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(size))
            });
        let _ = self
            .memory_block_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            });
    }

    /// Usage is above `percent` of the budget.
    pub fn is_over(&self, percent: u64) -> bool {
        self.memory_usage() > self.options.max_memory_usage / 100 * percent
    }

    pub fn is_over_budget(&self) -> bool {
        self.is_over(85)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget() {
        let m = ChunkManager::new(ChunkManagerOptions {
            max_memory_usage: 100,
            ..Default::default()
        });
        assert!(m.allocate(60));
        assert!(!m.allocate(50));
        assert!(m.allocate(30));
        assert_eq!(m.memory_usage(), 90);
        assert_eq!(m.memory_block_count(), 2);
        assert!(m.is_over_budget());

        m.deallocate(60);
        assert_eq!(m.memory_usage(), 30);
        assert!(!m.is_over_budget());
    }

    #[test]
    fn test_options_from_json() {
        let o: ChunkManagerOptions =
            serde_json::from_str(r#"{"max_memory_usage": 1024, "sync_timeout": 5}"#).unwrap();
        assert_eq!(o.max_memory_usage, 1024);
        assert_eq!(o.sync_timeout, Duration::from_secs(5));
    }
}
