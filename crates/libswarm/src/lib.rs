//! Block delegation, transfer tracking and chunk verification for BitTorrent
//! downloads.
//!
//! The starting point is [`Download`]: it hands out blocks to peers through
//! the [`Delegator`], tracks every request in a [`TransferList`], writes the
//! received bytes into memory mapped chunks and verifies finished chunks on a
//! [`HashQueue`] worker thread.
//!
//! Everything except hashing runs on the caller's thread. Time is passed in
//! explicitly as a [`Timestamp`].

pub mod chunk_selector;
pub mod chunk_statistics;
pub mod clock;
pub mod delegator;
mod download;
mod error;
pub mod hashing;
pub mod peer_chunks;
pub mod peer_info;
pub mod priority;
pub mod storage;
pub mod transfer;
mod type_aliases;

pub use chunk_selector::ChunkSelector;
pub use chunk_statistics::ChunkStatistics;
pub use clock::Timestamp;
pub use delegator::{ChunkSource, Delegator, DelegatorOptions};
pub use download::{Download, DownloadEvent, DownloadOptions};
pub use error::{Error, Result};
pub use hashing::{DownloadId, HashDone, HashQueue};
pub use peer_chunks::PeerChunks;
pub use priority::{Priority, PriorityRanges, Ranges};
pub use transfer::{TransferKey, TransferList, TransferListOptions};
pub use type_aliases::{BF, PeerHandle};

pub use swarm_core::{Id20, Piece, lengths::Lengths};
