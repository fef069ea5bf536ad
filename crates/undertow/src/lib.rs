//!
//! The core of a bittorrent engine: it owns in-flight pieces and reconciles
//! conflicting block data from misbehaving peers, balances upload/download
//! unchoke slots across all active downloads, talks to multi-tier tracker
//! lists over HTTP and UDP, and classifies non-blocking socket I/O outcomes.
//!
//! File I/O backends, metainfo parsing, piece selection and the hashing
//! worker are external collaborators: they appear here as traits
//! ([`PieceBuffer`], [`TransferEvents`], [`ChokeHooks`]) and channels.
//!

mod block_list;
mod choke_group;
mod choke_queue;
mod error;
mod resource_manager;
mod stream_ops;
mod transfer_list;

pub use error::{Error, ErrorKind, Result};

pub use block_list::{Block, BlockList, BlockTransfer, FailedVariants};
pub use choke_group::ChokeGroup;
pub use choke_queue::{
    ChokeHooks, ChokeQueue, DownloadId, Heuristics, PeerCandidate, TransferDirection,
};
pub use resource_manager::{
    DownloadHandle, DownloadPeers, MAX_PRIORITY, MAX_UNCHOKED_LIMIT, ResourceEntry,
    ResourceManager,
};
pub use stream_ops::{IoVerdict, RawStream, classify, read_classified, write_classified};
pub use transfer_list::{
    CompletedEntry, PieceBuffer, TransferEvents, TransferList, TransferListStats,
};

pub use undertow_core::hash_id::Id20;
pub use undertow_core::lengths::{BlockSpan, Lengths};
pub use undertow_core::peer_id::generate_peer_id;
pub use undertow_trackers as trackers;

/// The cargo version of undertow.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
