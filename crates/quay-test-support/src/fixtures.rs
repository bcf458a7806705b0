//! Transfers, policies and a wired-up scheduler for integration tests.

use std::sync::Arc;
use std::time::Duration;

use quay_events::{Event, EventBus, InfoHash};
use quay_scheduler::{DiskProbe, QueuePolicy, Scheduler, TransferBackend};
use quay_transfer_core::{FileEntry, TrackerTier, Transfer, TransferMetadata, TransferStats};

use crate::mocks::{FixedDiskProbe, RecordingBackend};

/// Replay capacity large enough to hold every event a test emits.
pub const TEST_REPLAY_CAPACITY: usize = 4096;

/// Deterministic identifier derived from one byte.
#[must_use]
pub const fn info_hash(id: u8) -> InfoHash {
    InfoHash::new([id; 20])
}

/// Metadata for a transfer made of files of the given sizes.
#[must_use]
pub fn metadata(name: &str, chunk_size: u64, file_sizes: &[u64]) -> TransferMetadata {
    TransferMetadata {
        name: name.to_owned(),
        data_dir: format!("/srv/quay/{name}").into(),
        chunk_size,
        files: file_sizes
            .iter()
            .enumerate()
            .map(|(index, size)| FileEntry {
                path: format!("{name}/file-{index}.bin"),
                size_bytes: *size,
            })
            .collect(),
        trackers: vec![TrackerTier::new([format!("udp://tracker.{name}.test:6969")])],
        seed_limits: None,
        priority: 0,
    }
}

/// Single-file download of 1 MiB in 16 KiB chunks.
///
/// # Panics
///
/// Never for these constant inputs.
#[must_use]
pub fn download(id: u8, priority: i32) -> Transfer {
    let mut meta = metadata(&format!("t{id}"), 16 * 1024, &[1024 * 1024]);
    meta.priority = priority;
    Transfer::from_metadata(info_hash(id), meta).expect("fixture metadata is valid")
}

/// Completed transfer with the given uploaded/downloaded byte counts.
#[must_use]
pub fn seed(id: u8, priority: i32, downloaded: u64, uploaded: u64) -> Transfer {
    let mut transfer = download(id, priority);
    transfer.set_stats(TransferStats {
        bytes_downloaded: downloaded,
        bytes_uploaded: uploaded,
        completed: true,
        seed_time: Duration::ZERO,
    });
    transfer
}

/// Policy with the given quotas and everything else at defaults.
#[must_use]
pub fn policy(max_downloads: u32, max_seeds: u32) -> QueuePolicy {
    QueuePolicy {
        max_downloads,
        max_seeds,
        ..QueuePolicy::default()
    }
}

/// Scheduler wired to recording collaborators.
pub struct Harness {
    /// Scheduler under test.
    pub scheduler: Scheduler,
    /// Runtime stand-in.
    pub backend: Arc<RecordingBackend>,
    /// Free-space stand-in, reporting plenty by default.
    pub disk: Arc<FixedDiskProbe>,
    /// Bus the scheduler publishes on.
    pub events: EventBus,
}

impl Harness {
    /// Harness whose announces settle immediately.
    #[must_use]
    pub fn new(policy: QueuePolicy) -> Self {
        Self::with_backend(policy, RecordingBackend::new())
    }

    /// Harness around a specific backend.
    #[must_use]
    pub fn with_backend(policy: QueuePolicy, backend: RecordingBackend) -> Self {
        let backend = Arc::new(backend);
        let disk = Arc::new(FixedDiskProbe::new(u64::MAX));
        let events = EventBus::with_capacity(TEST_REPLAY_CAPACITY);
        let scheduler = Scheduler::new(
            policy,
            events.clone(),
            Arc::clone(&backend) as Arc<dyn TransferBackend>,
            Arc::clone(&disk) as Arc<dyn DiskProbe>,
        );
        Self {
            scheduler,
            backend,
            disk,
            events,
        }
    }

    /// Every event published so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events
            .backlog_since(0)
            .into_iter()
            .map(|envelope| envelope.event)
            .collect()
    }

    /// Events published so far that satisfy `predicate`.
    #[must_use]
    pub fn events_matching(&self, predicate: impl Fn(&Event) -> bool) -> Vec<Event> {
        self.events().into_iter().filter(|event| predicate(event)).collect()
    }
}
