//! Core transfer domain types and DTOs shared across the workspace.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Download priority of a single file.
///
/// The scale is an ordered integer. Zero is reserved as the "excluded"
/// sentinel; the named tiers below are conventions, and any other value is
/// accepted and ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilePriority(i8);

impl FilePriority {
    /// Do not download the file.
    pub const EXCLUDED: Self = Self(0);
    /// Never download, but upload whatever chunks happen to be present.
    pub const ONLY_SEED: Self = Self(1);
    /// Fetch after everything else.
    pub const LAST: Self = Self(2);
    /// Baseline priority.
    pub const NORMAL: Self = Self(4);
    /// Fetch before normal files.
    pub const FIRST: Self = Self(6);
    /// Highest tier, used while a preview is being assembled.
    pub const PREVIEW: Self = Self(7);

    /// Wrap a raw priority value.
    #[must_use]
    pub const fn new(value: i8) -> Self {
        Self(value)
    }

    /// Raw priority value.
    #[must_use]
    pub const fn value(self) -> i8 {
        self.0
    }

    /// Whether this is the "do not download" sentinel.
    #[must_use]
    pub const fn is_excluded(self) -> bool {
        self.0 == Self::EXCLUDED.0
    }

    /// Whether this is the seed-only tier.
    #[must_use]
    pub const fn is_only_seed(self) -> bool {
        self.0 == Self::ONLY_SEED.0
    }

    /// Whether chunks of a file at this priority should be fetched.
    #[must_use]
    pub const fn is_wanted(self) -> bool {
        !self.is_excluded() && !self.is_only_seed()
    }
}

impl Default for FilePriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Leading bytes of a media file that must be present before preview.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewSizes {
    /// Bytes required for audio files.
    pub audio_bytes: u64,
    /// Bytes required for video files.
    pub video_bytes: u64,
}

impl Default for PreviewSizes {
    fn default() -> Self {
        Self {
            audio_bytes: 256 * 1024,
            video_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Seeding limits after which a transfer is stopped or re-queued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SeedLimits {
    /// Share ratio (uploaded / downloaded) at which seeding ends.
    #[serde(default)]
    pub max_share_ratio: Option<f64>,
    /// Accumulated seeding time, in seconds, at which seeding ends.
    #[serde(default)]
    pub max_seed_time_secs: Option<u64>,
}

impl SeedLimits {
    /// Whether neither limit is configured.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_share_ratio.is_none() && self.max_seed_time_secs.is_none()
    }

    /// Seeding time limit as a duration.
    #[must_use]
    pub fn max_seed_time(&self) -> Option<Duration> {
        self.max_seed_time_secs.map(Duration::from_secs)
    }
}

/// One tier of tracker announce URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TrackerTier {
    /// Announce URLs in preference order.
    #[serde(default)]
    pub urls: Vec<String>,
}

impl TrackerTier {
    /// Build a tier from URLs.
    #[must_use]
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

/// Aggregate counters reported by the transfer runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Payload bytes downloaded over the transfer's lifetime.
    pub bytes_downloaded: u64,
    /// Payload bytes uploaded over the transfer's lifetime.
    pub bytes_uploaded: u64,
    /// Whether every wanted chunk is present.
    pub completed: bool,
    /// Accumulated time spent seeding.
    #[serde(default)]
    pub seed_time: Duration,
}

impl TransferStats {
    /// Uploaded / downloaded byte ratio; zero before anything was downloaded.
    #[must_use]
    pub fn share_ratio(&self) -> f64 {
        if self.bytes_downloaded == 0 {
            0.0
        } else {
            to_f64(self.bytes_uploaded) / to_f64(self.bytes_downloaded)
        }
    }
}

/// One file entry of a transfer's metadata, in payload order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path inside the payload.
    pub path: String,
    /// File length in bytes.
    pub size_bytes: u64,
}

/// Validated metadata needed to construct a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Display name.
    pub name: String,
    /// Directory the payload is written to; probed for free space.
    pub data_dir: PathBuf,
    /// Global chunk size in bytes.
    pub chunk_size: u64,
    /// Files in payload order; offsets are the running sum of sizes.
    pub files: Vec<FileEntry>,
    /// Announce tiers.
    #[serde(default)]
    pub trackers: Vec<TrackerTier>,
    /// Per-transfer seeding limits, overriding scheduler defaults.
    #[serde(default)]
    pub seed_limits: Option<SeedLimits>,
    /// Relative queue priority; higher values are admitted first.
    #[serde(default)]
    pub priority: i32,
}

pub(crate) const fn to_f64(value: u64) -> f64 {
    #[expect(
        clippy::cast_precision_loss,
        reason = "u64 to f64 conversion is required for ratio and percentage reporting"
    )]
    {
        value as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_scale_is_ordered() {
        assert!(FilePriority::EXCLUDED < FilePriority::ONLY_SEED);
        assert!(FilePriority::LAST < FilePriority::NORMAL);
        assert!(FilePriority::NORMAL < FilePriority::FIRST);
        assert_eq!(FilePriority::default(), FilePriority::NORMAL);
        assert!(FilePriority::new(0).is_excluded());
        assert!(!FilePriority::ONLY_SEED.is_wanted());
        assert!(FilePriority::new(5).is_wanted());
    }

    #[test]
    fn priority_serializes_as_integer() {
        let json = serde_json::to_string(&FilePriority::FIRST).expect("serialize");
        assert_eq!(json, "6");
    }

    #[test]
    fn share_ratio_handles_zero_download() {
        let fresh = TransferStats::default();
        assert!(fresh.share_ratio().abs() < f64::EPSILON);

        let seeded = TransferStats {
            bytes_downloaded: 100,
            bytes_uploaded: 250,
            ..TransferStats::default()
        };
        assert!((seeded.share_ratio() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn seed_limits_helpers() {
        assert!(SeedLimits::default().is_unlimited());
        let limits = SeedLimits {
            max_share_ratio: None,
            max_seed_time_secs: Some(90),
        };
        assert_eq!(limits.max_seed_time(), Some(Duration::from_secs(90)));
        assert!(!limits.is_unlimited());
    }
}
