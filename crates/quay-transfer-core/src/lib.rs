#![forbid(unsafe_code)]
#![warn(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Transfer model and per-file chunk mapping.
//!
//! Layout: `model` (priorities, stats, limits, metadata DTOs), `bitset.rs`
//! (verified-chunk record), `media.rs` (preview classification), `file.rs`
//! (chunk mapper), `monitor.rs` (per-file observers), `transfer.rs`
//! (the transfer aggregate owned by the scheduler).

pub mod bitset;
pub mod error;
pub mod file;
pub mod media;
pub mod model;
pub mod monitor;
pub mod transfer;

pub use bitset::ChunkBitSet;
pub use error::{TransferError, TransferResult};
pub use file::TorrentFile;
pub use media::MediaKind;
pub use model::{
    FileEntry, FilePriority, PreviewSizes, SeedLimits, TrackerTier, TransferMetadata,
    TransferStats,
};
pub use monitor::{EventMonitor, FileMonitor};
pub use quay_events::{InfoHash, TransferState};
pub use transfer::Transfer;
