//! Media classification used to decide preview eligibility.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Coarse content class of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Playable audio.
    Audio,
    /// Playable video.
    Video,
    /// Anything else.
    Other,
}

const AUDIO_EXTENSIONS: &[&str] = &[
    "aac", "aiff", "ape", "flac", "m4a", "mka", "mp2", "mp3", "mpc", "oga", "ogg", "opus", "wav",
    "wma",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "3gp", "avi", "divx", "flv", "m2ts", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "ogm", "ogv",
    "ts", "vob", "webm", "wmv",
];

impl MediaKind {
    /// Classify a path by its extension, case-insensitively.
    #[must_use]
    pub fn classify(path: &str) -> Self {
        let Some(extension) = Path::new(path).extension().and_then(|ext| ext.to_str()) else {
            return Self::Other;
        };
        let extension = extension.to_ascii_lowercase();
        if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            Self::Audio
        } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            Self::Video
        } else {
            Self::Other
        }
    }

    /// Whether the class supports preview playback.
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}
