use swarm_core::Piece;

use crate::type_aliases::PeerHandle;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // Invariant violations. These mean the caller broke a precondition and the
    // download state can't be trusted anymore; the owner should abort it.
    #[error("bug: peer {peer} already has a transfer in block {piece}")]
    BugDuplicateTransfer { peer: PeerHandle, piece: Piece },
    #[error("bug: chunk {0} is already being transferred")]
    BugDuplicateChunk(u32),
    #[error("bug: chunk {0} is not being transferred")]
    BugChunkNotFound(u32),
    #[error("bug: transfer no longer exists")]
    BugTransferNotFound,
    #[error("bug: transfer is not attached to a block")]
    BugTransferInvalid,
    #[error("bug: transfer is not queued")]
    BugTransferNotQueued,
    #[error("bug: transfer is not the leader")]
    BugNotLeader,
    #[error("bug: transfer is already the leader")]
    BugAlreadyLeader,
    #[error("bug: transfer of block {0} is not finished")]
    BugTransferNotFinished(Piece),
    #[error("bug: block {0} is already finished")]
    BugBlockFinished(Piece),
    #[error("bug: block {0} is not finished")]
    BugBlockNotFinished(Piece),
    #[error("bug: finished count {finished} exceeds block count {size} in chunk {index}")]
    BugFinishedOverflow { index: u32, finished: u32, size: u32 },
    #[error("bug: block {0} has no stored failed data")]
    BugNoFailedData(Piece),
    #[error("bug: peer {0} is not registered")]
    BugPeerNotFound(PeerHandle),
    #[error("bug: peer {0} is already registered")]
    BugPeerAlreadyRegistered(PeerHandle),
    #[error("bug: chunk index {0} out of range")]
    BugIndexOutOfRange(u32),
    #[error("bug: chunk {0} already selected")]
    BugIndexAlreadyUsed(u32),
    #[error("bug: chunk {0} was not selected")]
    BugIndexNotUsed(u32),
    #[error("bug: chunk handle is not valid")]
    BugInvalidChunkHandle,
    #[error("bug: chunk handle {0} must be loaded and blocking to be hashed")]
    BugChunkNotBlocking(u32),
    #[error("bug: chunk {0} is already queued for hashing")]
    BugAlreadyHashing(u32),
    #[error("bug: {0}")]
    Internal(&'static str),

    // Peer misbehavior, recoverable by dropping the peer.
    #[error("peer {peer} sent {received} bytes past the end of block {piece}")]
    PeerOverflow {
        peer: PeerHandle,
        piece: Piece,
        received: u32,
    },
    #[error("peer {peer} announced chunk {index}, out of range")]
    PeerInvalidChunk { peer: PeerHandle, index: u32 },

    // Resource problems.
    #[error("chunk memory budget exhausted")]
    OutOfMemory,
    #[error("chunk {0} is blocked for hashing and can't be written")]
    ChunkBlocked(u32),
    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("hash worker is gone")]
    HashWorkerGone,
    #[error("error spawning hash worker")]
    SpawnWorker(#[source] std::io::Error),

    #[error(transparent)]
    Core(#[from] swarm_core::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
