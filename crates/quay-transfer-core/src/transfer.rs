//! The transfer aggregate owned by the scheduler registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quay_events::{InfoHash, TransferState};
use tracing::debug;

use crate::bitset::ChunkBitSet;
use crate::error::{TransferError, TransferResult};
use crate::file::TorrentFile;
use crate::model::{
    FilePriority, PreviewSizes, SeedLimits, TrackerTier, TransferMetadata, TransferStats,
};
use crate::monitor::FileMonitor;

/// One transfer: identity, run state, aggregate counters and its files.
#[derive(Debug, Clone)]
pub struct Transfer {
    info_hash: InfoHash,
    name: String,
    data_dir: PathBuf,
    chunk_size: u64,
    chunk_count: u32,
    total_bytes: u64,
    files: Vec<TorrentFile>,
    state: TransferState,
    priority: i32,
    auto_queued: bool,
    checking_data: bool,
    stats: TransferStats,
    seed_limits: Option<SeedLimits>,
    trackers: Vec<TrackerTier>,
}

impl Transfer {
    /// Build a stopped transfer from validated metadata.
    ///
    /// File offsets are the running sum of the preceding file sizes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidGeometry`] for an empty payload, a zero
    /// chunk size, or sizes that do not fit the chunk index space.
    pub fn from_metadata(info_hash: InfoHash, metadata: TransferMetadata) -> TransferResult<Self> {
        if metadata.chunk_size == 0 {
            return Err(TransferError::InvalidGeometry {
                reason: "chunk size must be positive",
            });
        }
        if metadata.files.is_empty() {
            return Err(TransferError::InvalidGeometry {
                reason: "transfer has no files",
            });
        }

        let mut files = Vec::with_capacity(metadata.files.len());
        let mut offset: u64 = 0;
        for (index, entry) in metadata.files.into_iter().enumerate() {
            let index = u32::try_from(index).map_err(|_| TransferError::InvalidGeometry {
                reason: "too many files",
            })?;
            let file = TorrentFile::new(
                index,
                entry.path,
                offset,
                entry.size_bytes,
                metadata.chunk_size,
            )?;
            offset = offset
                .checked_add(entry.size_bytes)
                .ok_or(TransferError::InvalidGeometry {
                    reason: "payload size overflows",
                })?;
            files.push(file);
        }
        if offset == 0 {
            return Err(TransferError::InvalidGeometry {
                reason: "transfer payload is empty",
            });
        }
        let chunk_count = u32::try_from(offset.div_ceil(metadata.chunk_size)).map_err(|_| {
            TransferError::InvalidGeometry {
                reason: "chunk index exceeds 32 bits",
            }
        })?;

        Ok(Self {
            info_hash,
            name: metadata.name,
            data_dir: metadata.data_dir,
            chunk_size: metadata.chunk_size,
            chunk_count,
            total_bytes: offset,
            files,
            state: TransferState::Stopped,
            priority: metadata.priority,
            auto_queued: false,
            checking_data: false,
            stats: TransferStats::default(),
            seed_limits: metadata.seed_limits,
            trackers: metadata.trackers,
        })
    }

    /// Content-derived identifier.
    #[must_use]
    pub const fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory probed for free space.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Global chunk size in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks in the payload.
    #[must_use]
    pub const fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Payload size in bytes.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Files in index order.
    #[must_use]
    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    /// File at `index`, if any.
    #[must_use]
    pub fn file(&self, index: u32) -> Option<&TorrentFile> {
        self.files.get(usize::try_from(index).ok()?)
    }

    /// Current run state.
    #[must_use]
    pub const fn state(&self) -> TransferState {
        self.state
    }

    /// Overwrite the run state; the scheduler is the only caller.
    pub fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    /// Whether the transfer is downloading or seeding.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Whether every wanted chunk is present.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.stats.completed
    }

    /// Queue priority; higher values are admitted first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Change the queue priority. Callers must re-order the queue afterwards.
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    /// Whether the scheduler may start and stop the transfer on its own.
    #[must_use]
    pub const fn is_auto_queued(&self) -> bool {
        self.auto_queued
    }

    /// Mark the transfer as automatically managed or user controlled.
    pub fn set_auto_queued(&mut self, auto_queued: bool) {
        self.auto_queued = auto_queued;
    }

    /// Whether the runtime is verifying on-disk data.
    #[must_use]
    pub const fn is_checking_data(&self) -> bool {
        self.checking_data
    }

    /// Record whether a data check is in progress.
    pub fn set_checking_data(&mut self, checking: bool) {
        self.checking_data = checking;
    }

    /// Latest counters from the runtime.
    #[must_use]
    pub const fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Replace the runtime counters.
    pub fn set_stats(&mut self, stats: TransferStats) {
        self.stats = stats;
    }

    /// Per-transfer seeding limits, if configured.
    #[must_use]
    pub const fn seed_limits(&self) -> Option<&SeedLimits> {
        self.seed_limits.as_ref()
    }

    /// Override the per-transfer seeding limits.
    pub fn set_seed_limits(&mut self, limits: Option<SeedLimits>) {
        self.seed_limits = limits;
    }

    /// Uploaded / downloaded byte ratio.
    #[must_use]
    pub fn share_ratio(&self) -> f64 {
        self.stats.share_ratio()
    }

    /// Accumulated seeding time.
    #[must_use]
    pub const fn seed_time(&self) -> Duration {
        self.stats.seed_time
    }

    /// Bytes still needed on disk; files that are not wanted do not count.
    #[must_use]
    pub fn bytes_left(&self) -> u64 {
        if self.stats.completed {
            return 0;
        }
        self.files.iter().map(TorrentFile::bytes_missing).sum()
    }

    fn effective_limits<'a>(&'a self, defaults: Option<&'a SeedLimits>) -> Option<&'a SeedLimits> {
        self.seed_limits.as_ref().or(defaults)
    }

    /// Whether a completed transfer has reached its share-ratio limit.
    ///
    /// The transfer's own limits take precedence over `defaults`.
    #[must_use]
    pub fn is_over_ratio_limit(&self, defaults: Option<&SeedLimits>) -> bool {
        if !self.stats.completed {
            return false;
        }
        self.effective_limits(defaults)
            .and_then(|limits| limits.max_share_ratio)
            .is_some_and(|limit| limit > 0.0 && self.share_ratio() >= limit)
    }

    /// Whether a completed transfer has seeded for its configured time.
    #[must_use]
    pub fn is_over_seed_time_limit(&self, defaults: Option<&SeedLimits>) -> bool {
        if !self.stats.completed {
            return false;
        }
        self.effective_limits(defaults)
            .and_then(SeedLimits::max_seed_time)
            .is_some_and(|limit| !limit.is_zero() && self.stats.seed_time >= limit)
    }

    /// Announce tiers in preference order.
    #[must_use]
    pub fn trackers(&self) -> &[TrackerTier] {
        &self.trackers
    }

    /// Every announce URL, deduplicated, in tier order.
    #[must_use]
    pub fn tracker_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = Vec::new();
        for url in self.trackers.iter().flat_map(|tier| tier.urls.iter()) {
            if !urls.contains(&url.as_str()) {
                urls.push(url.as_str());
            }
        }
        urls
    }

    /// Append the URLs of `tier` not already known as a new tier.
    ///
    /// Returns how many URLs were added.
    pub fn merge_trackers(&mut self, tier: &TrackerTier) -> usize {
        let mut fresh: Vec<String> = Vec::new();
        for url in &tier.urls {
            let known = self.trackers.iter().any(|t| t.urls.contains(url));
            if !known && !fresh.contains(url) {
                fresh.push(url.clone());
            }
        }
        let added = fresh.len();
        if added > 0 {
            self.trackers.push(TrackerTier { urls: fresh });
        }
        added
    }

    fn file_mut(&mut self, index: u32) -> TransferResult<&mut TorrentFile> {
        let file_count = self.files.len();
        usize::try_from(index)
            .ok()
            .and_then(|slot| self.files.get_mut(slot))
            .ok_or(TransferError::FileIndexOutOfRange { index, file_count })
    }

    /// Change one file's download priority.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::FileIndexOutOfRange`] for an unknown index.
    pub fn set_file_priority(
        &mut self,
        index: u32,
        priority: FilePriority,
        monitor: &dyn FileMonitor,
    ) -> TransferResult<()> {
        self.file_mut(index)?.set_priority(priority, monitor);
        Ok(())
    }

    /// Toggle one file's do-not-download flag.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::FileIndexOutOfRange`] for an unknown index.
    pub fn set_file_excluded(
        &mut self,
        index: u32,
        excluded: bool,
        monitor: &dyn FileMonitor,
    ) -> TransferResult<()> {
        self.file_mut(index)?.set_excluded(excluded, monitor);
        Ok(())
    }

    /// Recompute every file from a fresh snapshot of verified chunks.
    ///
    /// Returns whether every chunk of every wanted file is present.
    pub fn on_chunks_verified(
        &mut self,
        bitset: &ChunkBitSet,
        preview: &PreviewSizes,
        monitor: &dyn FileMonitor,
    ) -> bool {
        if bitset.len() < self.chunk_count {
            debug!(
                info_hash = %self.info_hash,
                expected = self.chunk_count,
                actual = bitset.len(),
                "bitset shorter than transfer; missing chunks count as absent"
            );
        }
        let mut wanted_complete = true;
        for file in &mut self.files {
            let window = file.preview_window_chunks(preview);
            file.recompute_from_bitset(bitset, window, monitor);
            if file.priority().is_wanted() && !file.is_complete() {
                wanted_complete = false;
            }
        }
        wanted_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileEntry;

    struct Silent;

    impl FileMonitor for Silent {
        fn priority_changed(&self, _: &TorrentFile, _: FilePriority, _: FilePriority) {}
        fn percentage_changed(&self, _: &TorrentFile, _: f64) {}
        fn preview_changed(&self, _: &TorrentFile, _: bool) {}
    }

    fn metadata(sizes: &[u64]) -> TransferMetadata {
        TransferMetadata {
            name: "sample".into(),
            data_dir: PathBuf::from("/srv/data"),
            chunk_size: 16,
            files: sizes
                .iter()
                .enumerate()
                .map(|(i, size)| FileEntry {
                    path: format!("file-{i}.bin"),
                    size_bytes: *size,
                })
                .collect(),
            trackers: vec![TrackerTier::new(["udp://a.example:80"])],
            seed_limits: None,
            priority: 0,
        }
    }

    fn transfer(sizes: &[u64]) -> Transfer {
        Transfer::from_metadata(InfoHash::new([1; 20]), metadata(sizes)).expect("valid metadata")
    }

    #[test]
    fn files_are_laid_out_back_to_back() {
        let transfer = transfer(&[20, 30, 14]);
        assert_eq!(transfer.total_bytes(), 64);
        assert_eq!(transfer.chunk_count(), 4);
        let offsets: Vec<_> = transfer.files().iter().map(TorrentFile::byte_offset).collect();
        assert_eq!(offsets, vec![0, 20, 50]);
        let second = transfer.file(1).expect("second file");
        assert_eq!((second.first_chunk(), second.last_chunk()), (1, 3));
        assert_eq!(transfer.state(), TransferState::Stopped);
    }

    #[test]
    fn rejects_empty_payloads() {
        let hash = InfoHash::new([1; 20]);
        assert!(Transfer::from_metadata(hash, metadata(&[])).is_err());
        assert!(Transfer::from_metadata(hash, metadata(&[0, 0])).is_err());
        let mut zero_chunk = metadata(&[10]);
        zero_chunk.chunk_size = 0;
        assert!(Transfer::from_metadata(hash, zero_chunk).is_err());
    }

    #[test]
    fn bytes_left_ignores_unwanted_files() {
        let mut transfer = transfer(&[32, 32]);
        assert_eq!(transfer.bytes_left(), 64);
        transfer
            .set_file_excluded(1, true, &Silent)
            .expect("file exists");
        assert_eq!(transfer.bytes_left(), 32);
        transfer.set_stats(TransferStats {
            completed: true,
            ..TransferStats::default()
        });
        assert_eq!(transfer.bytes_left(), 0);
    }

    #[test]
    fn unknown_file_index_is_reported() {
        let mut transfer = transfer(&[32]);
        assert_eq!(
            transfer.set_file_priority(4, FilePriority::FIRST, &Silent),
            Err(TransferError::FileIndexOutOfRange {
                index: 4,
                file_count: 1
            })
        );
    }

    #[test]
    fn seed_limits_prefer_transfer_overrides() {
        let mut transfer = transfer(&[32]);
        transfer.set_stats(TransferStats {
            bytes_downloaded: 100,
            bytes_uploaded: 150,
            completed: true,
            seed_time: Duration::from_secs(60),
        });
        let defaults = SeedLimits {
            max_share_ratio: Some(1.0),
            max_seed_time_secs: Some(120),
        };
        assert!(transfer.is_over_ratio_limit(Some(&defaults)));
        assert!(!transfer.is_over_seed_time_limit(Some(&defaults)));

        transfer.set_seed_limits(Some(SeedLimits {
            max_share_ratio: Some(2.0),
            max_seed_time_secs: Some(30),
        }));
        assert!(!transfer.is_over_ratio_limit(Some(&defaults)));
        assert!(transfer.is_over_seed_time_limit(Some(&defaults)));
        assert!(!transfer.is_over_ratio_limit(None));
    }

    #[test]
    fn incomplete_transfers_never_hit_seed_limits() {
        let mut transfer = transfer(&[32]);
        transfer.set_stats(TransferStats {
            bytes_downloaded: 10,
            bytes_uploaded: 100,
            completed: false,
            seed_time: Duration::from_secs(600),
        });
        let limits = SeedLimits {
            max_share_ratio: Some(1.0),
            max_seed_time_secs: Some(1),
        };
        assert!(!transfer.is_over_ratio_limit(Some(&limits)));
        assert!(!transfer.is_over_seed_time_limit(Some(&limits)));
    }

    #[test]
    fn merge_trackers_deduplicates() {
        let mut transfer = transfer(&[32]);
        let added = transfer.merge_trackers(&TrackerTier::new([
            "udp://a.example:80",
            "http://b.example/announce",
            "http://b.example/announce",
        ]));
        assert_eq!(added, 1);
        assert_eq!(transfer.trackers().len(), 2);
        assert_eq!(
            transfer.tracker_urls(),
            vec!["udp://a.example:80", "http://b.example/announce"]
        );
        assert_eq!(
            transfer.merge_trackers(&TrackerTier::new(["udp://a.example:80"])),
            0
        );
    }

    #[test]
    fn verified_chunks_update_every_file() {
        let mut transfer = transfer(&[20, 30, 14]);
        let mut bitset = ChunkBitSet::new(4);
        bitset.set(0, true);
        bitset.set(1, true);
        assert!(!transfer.on_chunks_verified(&bitset, &PreviewSizes::default(), &Silent));
        let counts: Vec<_> = transfer
            .files()
            .iter()
            .map(TorrentFile::downloaded_chunks)
            .collect();
        assert_eq!(counts, vec![2, 1, 0]);

        transfer
            .set_file_excluded(1, true, &Silent)
            .expect("file exists");
        transfer
            .set_file_excluded(2, true, &Silent)
            .expect("file exists");
        assert!(transfer.on_chunks_verified(&bitset, &PreviewSizes::default(), &Silent));
    }

    #[test]
    fn trailing_empty_file_does_not_block_completion() {
        let mut transfer = transfer(&[16, 0]);
        assert_eq!(transfer.chunk_count(), 1);
        let empty = transfer.file(1).expect("empty file");
        assert_eq!((empty.first_chunk(), empty.last_chunk()), (1, 1));

        let bitset = ChunkBitSet::with_all_set(1);
        assert!(transfer.on_chunks_verified(&bitset, &PreviewSizes::default(), &Silent));
        let empty = transfer.file(1).expect("empty file");
        assert!((empty.download_percentage() - 100.0).abs() < f64::EPSILON);
        assert_eq!(transfer.bytes_left(), 0);
    }
}
