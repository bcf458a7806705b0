//! Per-file chunk mapping.
//!
//! # Design
//! - Geometry is derived once from the global chunk size and never changes.
//! - Completion is always recounted from the authoritative bitset, never
//!   incremented, so the cached count cannot drift from the storage engine.
//! - Percentage and preview notifications are edge-triggered.

use once_cell::sync::OnceCell;

use crate::bitset::ChunkBitSet;
use crate::error::{TransferError, TransferResult};
use crate::media::MediaKind;
use crate::model::{FilePriority, PreviewSizes, to_f64};
use crate::monitor::FileMonitor;

/// One logical output file of a transfer, addressed in chunk coordinates.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    index: u32,
    path: String,
    byte_offset: u64,
    byte_size: u64,
    chunk_size: u64,
    first_chunk: u32,
    first_chunk_offset: u64,
    last_chunk: u32,
    last_chunk_size: u64,
    priority: FilePriority,
    previous_priority: Option<FilePriority>,
    downloaded_chunks: u32,
    preview: bool,
    media: OnceCell<MediaKind>,
}

impl TorrentFile {
    /// Map the byte range `[byte_offset, byte_offset + byte_size)` of the
    /// payload onto chunks of `chunk_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidGeometry`] when the chunk size is zero,
    /// the range overflows, or a chunk index does not fit in 32 bits.
    pub fn new(
        index: u32,
        path: impl Into<String>,
        byte_offset: u64,
        byte_size: u64,
        chunk_size: u64,
    ) -> TransferResult<Self> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidGeometry {
                reason: "chunk size must be positive",
            });
        }
        let end = byte_offset
            .checked_add(byte_size)
            .ok_or(TransferError::InvalidGeometry {
                reason: "file range overflows",
            })?;

        let first_chunk = chunk_index(byte_offset / chunk_size)?;
        let first_chunk_offset = byte_offset % chunk_size;
        let last_chunk = if byte_size > 0 {
            chunk_index((end - 1) / chunk_size)?
        } else {
            first_chunk
        };
        let last_chunk_size = end - u64::from(last_chunk) * chunk_size;

        Ok(Self {
            index,
            path: path.into(),
            byte_offset,
            byte_size,
            chunk_size,
            first_chunk,
            first_chunk_offset,
            last_chunk,
            last_chunk_size,
            priority: FilePriority::NORMAL,
            previous_priority: None,
            downloaded_chunks: 0,
            preview: false,
            media: OnceCell::new(),
        })
    }

    /// Index of the file within the transfer.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Relative path inside the payload.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Offset of the file's first byte within the payload.
    #[must_use]
    pub const fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    /// File length in bytes.
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Global chunk size the geometry was derived from.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// First chunk holding bytes of this file.
    #[must_use]
    pub const fn first_chunk(&self) -> u32 {
        self.first_chunk
    }

    /// Offset of the file's first byte inside its first chunk.
    #[must_use]
    pub const fn first_chunk_offset(&self) -> u64 {
        self.first_chunk_offset
    }

    /// Last chunk holding bytes of this file.
    #[must_use]
    pub const fn last_chunk(&self) -> u32 {
        self.last_chunk
    }

    /// Bytes of the last chunk up to and including the file's end.
    #[must_use]
    pub const fn last_chunk_size(&self) -> u64 {
        self.last_chunk_size
    }

    /// Number of chunks the file touches.
    #[must_use]
    pub const fn chunk_count(&self) -> u32 {
        self.last_chunk - self.first_chunk + 1
    }

    /// Whether `chunk` lies in `[first_chunk, last_chunk]`.
    #[must_use]
    pub const fn contains_chunk(&self, chunk: u32) -> bool {
        chunk >= self.first_chunk && chunk <= self.last_chunk
    }

    /// Current download priority.
    #[must_use]
    pub const fn priority(&self) -> FilePriority {
        self.priority
    }

    /// Priority held before the most recent change.
    #[must_use]
    pub const fn previous_priority(&self) -> Option<FilePriority> {
        self.previous_priority
    }

    /// Chunks of this file present in the last bitset seen.
    #[must_use]
    pub const fn downloaded_chunks(&self) -> u32 {
        self.downloaded_chunks
    }

    /// Whether every chunk of the file is present. Zero-byte files always are.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.byte_size == 0 || self.downloaded_chunks >= self.chunk_count()
    }

    /// Whether enough leading chunks are present for playback.
    #[must_use]
    pub const fn is_preview_eligible(&self) -> bool {
        self.preview
    }

    /// File-local byte offset at which `chunk`'s share of the file begins.
    ///
    /// Only meaningful for chunks in `[first_chunk, last_chunk]`; callers
    /// clamp before asking.
    #[must_use]
    pub fn file_relative_offset(&self, chunk: u32) -> u64 {
        let delta = u64::from(chunk.saturating_sub(self.first_chunk));
        if self.first_chunk_offset == 0 {
            delta * self.chunk_size
        } else if delta == 0 {
            0
        } else {
            (delta - 1) * self.chunk_size + (self.chunk_size - self.first_chunk_offset)
        }
    }

    /// Content class of the file, computed once from its path.
    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        *self.media.get_or_init(|| MediaKind::classify(&self.path))
    }

    /// Whether the file is audio or video.
    #[must_use]
    pub fn is_media(&self) -> bool {
        self.media_kind().is_media()
    }

    /// Leading chunks that must be present before a preview is possible.
    ///
    /// Zero for non-media files and one for files inside a single chunk.
    #[must_use]
    pub fn preview_window_chunks(&self, sizes: &PreviewSizes) -> u32 {
        let bytes = match self.media_kind() {
            MediaKind::Audio => sizes.audio_bytes,
            MediaKind::Video => sizes.video_bytes,
            MediaKind::Other => return 0,
        };
        let count = self.chunk_count();
        if count == 1 {
            return 1;
        }
        let needed = bytes.div_ceil(self.chunk_size).max(1);
        u32::try_from(needed).unwrap_or(u32::MAX).min(count)
    }

    /// Completion in percent; excluded files report zero and zero-byte files
    /// report 100.
    #[must_use]
    pub fn download_percentage(&self) -> f64 {
        if self.priority.is_excluded() {
            return 0.0;
        }
        if self.byte_size == 0 {
            return 100.0;
        }
        to_f64(u64::from(self.downloaded_chunks)) / to_f64(u64::from(self.chunk_count())) * 100.0
    }

    /// Estimated bytes still to be written for this file.
    #[must_use]
    pub fn bytes_missing(&self) -> u64 {
        if !self.priority.is_wanted() {
            return 0;
        }
        let missing = u64::from(self.chunk_count() - self.downloaded_chunks.min(self.chunk_count()));
        (missing * self.chunk_size).min(self.byte_size)
    }

    /// Change the download priority, notifying `monitor`.
    ///
    /// Entering the excluded tier remembers the current priority; every
    /// change is reported through `priority_changed`. Percentage is re-reported
    /// whenever achievable completion depends on the change (entering or
    /// leaving the excluded tier, or touching the seed-only tier).
    pub fn set_priority(&mut self, priority: FilePriority, monitor: &dyn FileMonitor) {
        if priority == self.priority {
            return;
        }
        let previous = self.priority;
        self.previous_priority = Some(previous);
        self.priority = priority;
        monitor.priority_changed(self, priority, previous);

        if priority.is_excluded()
            || previous.is_excluded()
            || previous.is_only_seed()
            || priority.is_only_seed()
        {
            monitor.percentage_changed(self, self.download_percentage());
        }
    }

    /// Toggle the do-not-download flag.
    ///
    /// Clearing it restores the priority held before exclusion, or
    /// [`FilePriority::NORMAL`] when none is known.
    pub fn set_excluded(&mut self, excluded: bool, monitor: &dyn FileMonitor) {
        if excluded {
            self.set_priority(FilePriority::EXCLUDED, monitor);
        } else if self.priority.is_excluded() {
            let restored = self
                .previous_priority
                .filter(|priority| !priority.is_excluded())
                .unwrap_or(FilePriority::NORMAL);
            self.set_priority(restored, monitor);
        }
    }

    /// Recount present chunks and preview eligibility from a bitset snapshot.
    ///
    /// `preview_window` is the number of leading chunks that must be present
    /// (see [`Self::preview_window_chunks`]).
    pub fn recompute_from_bitset(
        &mut self,
        bitset: &ChunkBitSet,
        preview_window: u32,
        monitor: &dyn FileMonitor,
    ) {
        let previous_count = self.downloaded_chunks;
        let previous_preview = self.preview;

        // A zero-byte file owns no data; its nominal chunk may lie past the
        // end of the payload.
        let has_data = self.byte_size > 0;
        let window_end = self.first_chunk.saturating_add(preview_window);
        let mut count = 0;
        let mut window_complete = true;
        for chunk in (self.first_chunk..=self.last_chunk).filter(|_| has_data) {
            if bitset.get(chunk) {
                count += 1;
            } else if chunk < window_end {
                window_complete = false;
            }
        }

        self.downloaded_chunks = count;
        self.preview = has_data && self.is_media() && window_complete;

        if self.downloaded_chunks != previous_count {
            monitor.percentage_changed(self, self.download_percentage());
        }
        if self.preview != previous_preview {
            monitor.preview_changed(self, self.preview);
        }
    }
}

fn chunk_index(value: u64) -> TransferResult<u32> {
    u32::try_from(value).map_err(|_| TransferError::InvalidGeometry {
        reason: "chunk index exceeds 32 bits",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    enum Notice {
        Priority(FilePriority, FilePriority),
        Percentage(f64),
        Preview(bool),
    }

    #[derive(Default)]
    struct Recorder {
        notices: RefCell<Vec<Notice>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Notice> {
            self.notices.borrow_mut().drain(..).collect()
        }

        fn priority_count(&self) -> usize {
            self.notices
                .borrow()
                .iter()
                .filter(|notice| matches!(notice, Notice::Priority(..)))
                .count()
        }
    }

    impl FileMonitor for Recorder {
        fn priority_changed(&self, _: &TorrentFile, priority: FilePriority, previous: FilePriority) {
            self.notices
                .borrow_mut()
                .push(Notice::Priority(priority, previous));
        }

        fn percentage_changed(&self, _: &TorrentFile, percent: f64) {
            self.notices.borrow_mut().push(Notice::Percentage(percent));
        }

        fn preview_changed(&self, _: &TorrentFile, preview: bool) {
            self.notices.borrow_mut().push(Notice::Preview(preview));
        }
    }

    fn file(path: &str, offset: u64, size: u64, chunk_size: u64) -> TorrentFile {
        TorrentFile::new(0, path, offset, size, chunk_size).expect("valid geometry")
    }

    #[test]
    fn geometry_for_unaligned_file() {
        let file = file("data.bin", 20, 30, 16);
        assert_eq!(file.first_chunk(), 1);
        assert_eq!(file.first_chunk_offset(), 4);
        assert_eq!(file.last_chunk(), 3);
        assert_eq!(file.last_chunk_size(), 2);
        assert_eq!(file.chunk_count(), 3);
        assert_eq!(file.file_relative_offset(1), 0);
        assert_eq!(file.file_relative_offset(2), 12);
        assert_eq!(file.file_relative_offset(3), 28);
    }

    #[test]
    fn geometry_for_aligned_file() {
        let file = file("data.bin", 32, 40, 16);
        assert_eq!(file.first_chunk(), 2);
        assert_eq!(file.first_chunk_offset(), 0);
        assert_eq!(file.last_chunk(), 4);
        assert_eq!(file.last_chunk_size(), 8);
        assert_eq!(file.file_relative_offset(2), 0);
        assert_eq!(file.file_relative_offset(3), 16);
        assert_eq!(file.file_relative_offset(4), 32);
    }

    #[test]
    fn geometry_for_empty_file() {
        let file = file("empty", 40, 0, 16);
        assert_eq!(file.first_chunk(), 2);
        assert_eq!(file.last_chunk(), 2);
        assert_eq!(file.last_chunk_size(), 8);
        assert_eq!(file.chunk_count(), 1);
    }

    #[test]
    fn empty_file_is_complete_without_chunks() {
        let recorder = Recorder::default();
        let mut file = file("empty.mp4", 16, 0, 16);
        assert!(file.is_complete());
        assert!((file.download_percentage() - 100.0).abs() < f64::EPSILON);
        assert_eq!(file.bytes_missing(), 0);

        file.recompute_from_bitset(&ChunkBitSet::with_all_set(1), 1, &recorder);
        assert_eq!(file.downloaded_chunks(), 0);
        assert!(!file.is_preview_eligible());
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn offsets_are_monotonic_and_stay_inside_the_file() {
        for chunk_size in [1_u64, 3, 16, 64] {
            for offset in 0..70 {
                for size in 1..70 {
                    let file = file("f", offset, size, chunk_size);
                    let mut last = 0;
                    for chunk in file.first_chunk()..=file.last_chunk() {
                        let relative = file.file_relative_offset(chunk);
                        assert!(relative >= last);
                        assert!(relative < size);
                        assert_eq!(
                            file.byte_offset() + relative,
                            (u64::from(chunk) * chunk_size).max(file.byte_offset())
                        );
                        last = relative;
                    }
                }
            }
        }
    }

    #[test]
    fn rejects_invalid_geometry() {
        assert!(matches!(
            TorrentFile::new(0, "f", 0, 1, 0),
            Err(TransferError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            TorrentFile::new(0, "f", u64::MAX, 2, 16),
            Err(TransferError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            TorrentFile::new(0, "f", 0, u64::MAX, 1),
            Err(TransferError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn exclusion_round_trip_reports_two_priority_changes() {
        let recorder = Recorder::default();
        let mut file = file("a.bin", 0, 64, 16);
        file.set_priority(FilePriority::FIRST, &recorder);
        recorder.take();

        file.set_priority(FilePriority::EXCLUDED, &recorder);
        assert_eq!(file.priority(), FilePriority::EXCLUDED);
        assert_eq!(file.previous_priority(), Some(FilePriority::FIRST));
        file.set_priority(FilePriority::FIRST, &recorder);

        assert_eq!(file.priority(), FilePriority::FIRST);
        assert_eq!(recorder.priority_count(), 2);
        assert_eq!(
            recorder.take(),
            vec![
                Notice::Priority(FilePriority::EXCLUDED, FilePriority::FIRST),
                Notice::Percentage(0.0),
                Notice::Priority(FilePriority::FIRST, FilePriority::EXCLUDED),
                Notice::Percentage(0.0),
            ]
        );
    }

    #[test]
    fn set_excluded_restores_previous_priority() {
        let recorder = Recorder::default();
        let mut file = file("a.bin", 0, 64, 16);
        file.set_priority(FilePriority::LAST, &recorder);
        file.set_excluded(true, &recorder);
        file.set_excluded(true, &recorder);
        file.set_excluded(false, &recorder);
        assert_eq!(file.priority(), FilePriority::LAST);
        assert_eq!(recorder.priority_count(), 3);

        file.set_excluded(false, &recorder);
        assert_eq!(recorder.priority_count(), 3);
    }

    #[test]
    fn unchanged_priority_is_silent() {
        let recorder = Recorder::default();
        let mut file = file("a.bin", 0, 64, 16);
        file.set_priority(FilePriority::NORMAL, &recorder);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn seed_only_transitions_refresh_percentage() {
        let recorder = Recorder::default();
        let mut file = file("a.bin", 0, 64, 16);
        file.set_priority(FilePriority::ONLY_SEED, &recorder);
        file.set_priority(FilePriority::FIRST, &recorder);
        file.set_priority(FilePriority::LAST, &recorder);
        assert_eq!(
            recorder.take(),
            vec![
                Notice::Priority(FilePriority::ONLY_SEED, FilePriority::NORMAL),
                Notice::Percentage(0.0),
                Notice::Priority(FilePriority::FIRST, FilePriority::ONLY_SEED),
                Notice::Percentage(0.0),
                Notice::Priority(FilePriority::LAST, FilePriority::FIRST),
            ]
        );
    }

    #[test]
    fn recompute_counts_only_the_file_range() {
        let recorder = Recorder::default();
        let mut file = file("a.bin", 20, 30, 16);
        let mut bitset = ChunkBitSet::new(5);
        for chunk in [0, 1, 3, 4] {
            bitset.set(chunk, true);
        }
        file.recompute_from_bitset(&bitset, 0, &recorder);
        assert_eq!(file.downloaded_chunks(), 2);
        let notices = recorder.take();
        assert_eq!(notices.len(), 1);
        match notices[0] {
            Notice::Percentage(percent) => assert!((percent - 200.0 / 3.0).abs() < 1e-9),
            ref other => panic!("unexpected notice {other:?}"),
        }
    }

    #[test]
    fn recompute_is_edge_triggered() {
        let recorder = Recorder::default();
        let mut file = file("movie.mkv", 0, 64, 16);
        let mut bitset = ChunkBitSet::new(4);
        bitset.set(0, true);
        bitset.set(1, true);

        file.recompute_from_bitset(&bitset, 2, &recorder);
        assert_eq!(
            recorder.take(),
            vec![Notice::Percentage(50.0), Notice::Preview(true)]
        );

        file.recompute_from_bitset(&bitset, 2, &recorder);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn preview_requires_media_and_leading_chunks() {
        let recorder = Recorder::default();
        let mut bitset = ChunkBitSet::new(4);
        bitset.set(0, true);
        bitset.set(2, true);

        let mut video = file("movie.mkv", 0, 64, 16);
        video.recompute_from_bitset(&bitset, 2, &recorder);
        assert!(!video.is_preview_eligible());

        bitset.set(1, true);
        video.recompute_from_bitset(&bitset, 2, &recorder);
        assert!(video.is_preview_eligible());

        let mut document = file("notes.pdf", 0, 64, 16);
        document.recompute_from_bitset(&ChunkBitSet::with_all_set(4), 2, &recorder);
        assert!(!document.is_preview_eligible());
    }

    #[test]
    fn preview_window_depends_on_media_kind() {
        let sizes = PreviewSizes {
            audio_bytes: 20,
            video_bytes: 40,
        };
        assert_eq!(file("a.mp3", 0, 160, 16).preview_window_chunks(&sizes), 2);
        assert_eq!(file("v.mp4", 0, 160, 16).preview_window_chunks(&sizes), 3);
        assert_eq!(file("v.mp4", 0, 32, 16).preview_window_chunks(&sizes), 2);
        assert_eq!(file("v.mp4", 0, 10, 16).preview_window_chunks(&sizes), 1);
        assert_eq!(file("t.txt", 0, 160, 16).preview_window_chunks(&sizes), 0);
    }

    #[test]
    fn missing_bytes_follow_priority_and_progress() {
        let recorder = Recorder::default();
        let mut file = file("a.bin", 0, 50, 16);
        assert_eq!(file.bytes_missing(), 50);

        let mut bitset = ChunkBitSet::new(4);
        bitset.set(0, true);
        bitset.set(1, true);
        file.recompute_from_bitset(&bitset, 0, &recorder);
        assert_eq!(file.bytes_missing(), 32);

        file.set_priority(FilePriority::ONLY_SEED, &recorder);
        assert_eq!(file.bytes_missing(), 0);
    }
}
