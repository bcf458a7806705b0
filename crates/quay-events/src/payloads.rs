//! Event payload types carried across the scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::InfoHashParseError;

/// Identifier assigned to each event emitted by the scheduler.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Length in bytes of a v1 info hash.
pub const INFO_HASH_LEN: usize = 20;

/// Content-derived identity of a transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; INFO_HASH_LEN]);

impl InfoHash {
    /// Wrap raw hash bytes.
    #[must_use]
    pub const fn new(bytes: [u8; INFO_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; INFO_HASH_LEN] {
        &self.0
    }

    /// Lowercase hexadecimal rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl FromStr for InfoHash {
    type Err = InfoHashParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(value).map_err(|source| InfoHashParseError::InvalidHex { source })?;
        let actual = bytes.len();
        let array: [u8; INFO_HASH_LEN] =
            bytes
                .try_into()
                .map_err(|_| InfoHashParseError::InvalidLength {
                    expected: INFO_HASH_LEN,
                    actual,
                })?;
        Ok(Self(array))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Run state of a transfer as driven by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Not running and not waiting for admission.
    #[default]
    Stopped,
    /// Waiting for an admission pass to start it.
    Queued,
    /// Running and fetching payload data.
    Downloading,
    /// Running with all wanted data present, uploading to peers.
    Seeding,
}

impl TransferState {
    /// Whether the transfer is active in either direction.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Downloading | Self::Seeding)
    }

    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
        }
    }
}

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A transfer was registered with the scheduler.
    TransferAdded {
        /// Identifier of the added transfer.
        info_hash: InfoHash,
        /// Display name from the transfer metadata.
        name: String,
    },
    /// A transfer left the registry.
    TransferRemoved {
        /// Identifier of the removed transfer.
        info_hash: InfoHash,
    },
    /// A transfer finished downloading its wanted data.
    TransferFinished {
        /// Identifier of the finished transfer.
        info_hash: InfoHash,
    },
    /// A transfer moved to a new run state.
    StateChanged {
        /// Identifier of the transfer.
        info_hash: InfoHash,
        /// New run state.
        state: TransferState,
    },
    /// Queueing was refused because the share-ratio limit is already reached.
    QueuingNotPossible {
        /// Identifier of the refused transfer.
        info_hash: InfoHash,
    },
    /// Free space on the transfer's target volume is running low.
    LowDiskSpace {
        /// Identifier of the affected transfer.
        info_hash: InfoHash,
        /// Whether the transfer was stopped because of it.
        stopped: bool,
    },
    /// The registry was re-sorted by priority.
    QueueOrdered,
    /// The global pause switch flipped.
    PauseStateChanged {
        /// New pause state.
        paused: bool,
    },
    /// A file's download priority changed.
    FilePriorityChanged {
        /// Owning transfer.
        info_hash: InfoHash,
        /// File index within the transfer.
        file_index: u32,
        /// Priority after the change.
        priority: i8,
        /// Priority before the change.
        previous: i8,
    },
    /// A file's completion percentage changed.
    FilePercentageChanged {
        /// Owning transfer.
        info_hash: InfoHash,
        /// File index within the transfer.
        file_index: u32,
        /// Completion in the range 0-100.
        percent: f64,
    },
    /// A media file became (or stopped being) previewable.
    FilePreviewChanged {
        /// Owning transfer.
        info_hash: InfoHash,
        /// File index within the transfer.
        file_index: u32,
        /// Whether enough leading chunks are present for playback.
        preview: bool,
    },
    /// Scheduler configuration was changed.
    SettingsChanged {
        /// Description of the applied change.
        description: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for subscribers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TransferAdded { .. } => "transfer_added",
            Self::TransferRemoved { .. } => "transfer_removed",
            Self::TransferFinished { .. } => "transfer_finished",
            Self::StateChanged { .. } => "state_changed",
            Self::QueuingNotPossible { .. } => "queuing_not_possible",
            Self::LowDiskSpace { .. } => "low_disk_space",
            Self::QueueOrdered => "queue_ordered",
            Self::PauseStateChanged { .. } => "pause_state_changed",
            Self::FilePriorityChanged { .. } => "file_priority_changed",
            Self::FilePercentageChanged { .. } => "file_percentage_changed",
            Self::FilePreviewChanged { .. } => "file_preview_changed",
            Self::SettingsChanged { .. } => "settings_changed",
        }
    }

    /// Transfer the event refers to, when it concerns a single transfer.
    #[must_use]
    pub const fn info_hash(&self) -> Option<InfoHash> {
        match self {
            Self::TransferAdded { info_hash, .. }
            | Self::TransferRemoved { info_hash }
            | Self::TransferFinished { info_hash }
            | Self::StateChanged { info_hash, .. }
            | Self::QueuingNotPossible { info_hash }
            | Self::LowDiskSpace { info_hash, .. }
            | Self::FilePriorityChanged { info_hash, .. }
            | Self::FilePercentageChanged { info_hash, .. }
            | Self::FilePreviewChanged { info_hash, .. } => Some(*info_hash),
            Self::QueueOrdered | Self::PauseStateChanged { .. } | Self::SettingsChanged { .. } => {
                None
            }
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}
