//! Observers for per-file changes.

use quay_events::{Event, EventBus, InfoHash};

use crate::file::TorrentFile;
use crate::model::FilePriority;

/// Receives per-file notifications from the chunk mapper.
///
/// Implementations are called synchronously, before the mutating call
/// returns.
pub trait FileMonitor {
    /// The file's download priority changed from `previous` to `priority`.
    fn priority_changed(&self, file: &TorrentFile, priority: FilePriority, previous: FilePriority);

    /// The file's completion percentage changed.
    fn percentage_changed(&self, file: &TorrentFile, percent: f64);

    /// The file's preview eligibility flipped.
    fn preview_changed(&self, file: &TorrentFile, preview: bool);
}

/// Forwards file notifications onto the shared event bus.
#[derive(Clone)]
pub struct EventMonitor {
    bus: EventBus,
    info_hash: InfoHash,
}

impl EventMonitor {
    /// Monitor publishing on behalf of the transfer identified by `info_hash`.
    #[must_use]
    pub const fn new(bus: EventBus, info_hash: InfoHash) -> Self {
        Self { bus, info_hash }
    }
}

impl FileMonitor for EventMonitor {
    fn priority_changed(&self, file: &TorrentFile, priority: FilePriority, previous: FilePriority) {
        self.bus.send(Event::FilePriorityChanged {
            info_hash: self.info_hash,
            file_index: file.index(),
            priority: priority.value(),
            previous: previous.value(),
        });
    }

    fn percentage_changed(&self, file: &TorrentFile, percent: f64) {
        self.bus.send(Event::FilePercentageChanged {
            info_hash: self.info_hash,
            file_index: file.index(),
            percent,
        });
    }

    fn preview_changed(&self, file: &TorrentFile, preview: bool) {
        self.bus.send(Event::FilePreviewChanged {
            info_hash: self.info_hash,
            file_index: file.index(),
            preview,
        });
    }
}
