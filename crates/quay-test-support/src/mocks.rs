//! Recording collaborators for scheduler and chunk-mapping tests.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use quay_events::InfoHash;
use quay_scheduler::{BarrierToken, DiskProbe, ShutdownBarrier, TransferBackend};
use quay_transfer_core::{FileMonitor, FilePriority, TorrentFile};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call observed by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `start` was requested.
    Start(InfoHash),
    /// `stop` was requested.
    Stop(InfoHash),
    /// A "stopped" announce was fired.
    AnnounceStopped(BarrierToken),
}

/// Transfer runtime that records every call.
///
/// Announces settle immediately unless the backend was built with
/// [`RecordingBackend::holding_announces`].
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    failing: Mutex<HashSet<InfoHash>>,
    hold_announces: bool,
    held: Mutex<Vec<(BarrierToken, ShutdownBarrier)>>,
}

impl RecordingBackend {
    /// Backend whose announces settle as soon as they are fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that parks announces until [`Self::settle_announces`].
    #[must_use]
    pub fn holding_announces() -> Self {
        Self {
            hold_announces: true,
            ..Self::default()
        }
    }

    /// Make every `start` and `stop` for `info_hash` fail.
    pub fn fail_for(&self, info_hash: InfoHash) {
        lock(&self.failing).insert(info_hash);
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Identifiers passed to `start`, in order.
    #[must_use]
    pub fn starts(&self) -> Vec<InfoHash> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Start(info_hash) => Some(info_hash),
                _ => None,
            })
            .collect()
    }

    /// Identifiers passed to `stop`, in order.
    #[must_use]
    pub fn stops(&self) -> Vec<InfoHash> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Stop(info_hash) => Some(info_hash),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    /// Complete every parked announce. Returns how many settled.
    pub fn settle_announces(&self) -> usize {
        let held = std::mem::take(&mut *lock(&self.held));
        for (token, barrier) in &held {
            barrier.complete(token);
        }
        held.len()
    }

    fn record(&self, call: BackendCall, info_hash: &InfoHash) -> Result<()> {
        lock(&self.calls).push(call);
        if lock(&self.failing).contains(info_hash) {
            return Err(anyhow!("runtime rejected {info_hash}"));
        }
        Ok(())
    }
}

impl TransferBackend for RecordingBackend {
    fn start(&self, info_hash: &InfoHash) -> Result<()> {
        self.record(BackendCall::Start(*info_hash), info_hash)
    }

    fn stop(&self, info_hash: &InfoHash) -> Result<()> {
        self.record(BackendCall::Stop(*info_hash), info_hash)
    }

    fn announce_stopped(&self, token: BarrierToken, barrier: ShutdownBarrier) {
        lock(&self.calls).push(BackendCall::AnnounceStopped(token.clone()));
        if self.hold_announces {
            lock(&self.held).push((token, barrier));
        } else {
            barrier.complete(&token);
        }
    }
}

/// Free-space probe returning a settable value.
#[derive(Debug)]
pub struct FixedDiskProbe {
    free: AtomicU64,
    failing: AtomicBool,
    probes: AtomicU64,
}

impl FixedDiskProbe {
    /// Probe reporting `free` bytes.
    #[must_use]
    pub const fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
            failing: AtomicBool::new(false),
            probes: AtomicU64::new(0),
        }
    }

    /// Change the reported free space.
    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }

    /// Make subsequent probes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of probes served.
    #[must_use]
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

impl DiskProbe for FixedDiskProbe {
    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("probe unavailable"));
        }
        Ok(self.free.load(Ordering::SeqCst))
    }
}

/// One notification observed by [`RecordingMonitor`].
#[derive(Debug, Clone, PartialEq)]
pub enum FileNotice {
    /// Priority changed.
    Priority {
        /// File index.
        index: u32,
        /// New priority.
        priority: FilePriority,
        /// Priority before the change.
        previous: FilePriority,
    },
    /// Completion percentage changed.
    Percentage {
        /// File index.
        index: u32,
        /// New percentage.
        percent: f64,
    },
    /// Preview eligibility flipped.
    Preview {
        /// File index.
        index: u32,
        /// New eligibility.
        preview: bool,
    },
}

/// File monitor that records every notification.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    notices: Mutex<Vec<FileNotice>>,
}

impl RecordingMonitor {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification so far, in order.
    #[must_use]
    pub fn notices(&self) -> Vec<FileNotice> {
        lock(&self.notices).clone()
    }

    /// Percentages reported for `index`, in order.
    #[must_use]
    pub fn percentages(&self, index: u32) -> Vec<f64> {
        lock(&self.notices)
            .iter()
            .filter_map(|notice| match notice {
                FileNotice::Percentage { index: i, percent } if *i == index => Some(*percent),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded notifications.
    pub fn clear(&self) {
        lock(&self.notices).clear();
    }
}

impl FileMonitor for RecordingMonitor {
    fn priority_changed(&self, file: &TorrentFile, priority: FilePriority, previous: FilePriority) {
        lock(&self.notices).push(FileNotice::Priority {
            index: file.index(),
            priority,
            previous,
        });
    }

    fn percentage_changed(&self, file: &TorrentFile, percent: f64) {
        lock(&self.notices).push(FileNotice::Percentage {
            index: file.index(),
            percent,
        });
    }

    fn preview_changed(&self, file: &TorrentFile, preview: bool) {
        lock(&self.notices).push(FileNotice::Preview {
            index: file.index(),
            preview,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_backend_still_records_calls() {
        let backend = RecordingBackend::new();
        let hash = InfoHash::new([4; 20]);
        backend.fail_for(hash);
        assert!(backend.start(&hash).is_err());
        assert_eq!(backend.starts(), vec![hash]);
    }

    #[test]
    fn held_announces_settle_on_demand() {
        let backend = RecordingBackend::holding_announces();
        let barrier = ShutdownBarrier::new();
        let token = BarrierToken::new(InfoHash::new([1; 20]), "udp://t");
        assert!(barrier.register(token.clone()));
        backend.announce_stopped(token, barrier.clone());
        assert_eq!(barrier.pending(), 1);
        assert_eq!(backend.settle_announces(), 1);
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn disk_probe_reports_and_fails_on_demand() {
        let probe = FixedDiskProbe::new(10);
        assert_eq!(probe.free_space(Path::new("/")).expect("probe"), 10);
        probe.set_failing(true);
        assert!(probe.free_space(Path::new("/")).is_err());
        assert_eq!(probe.probes(), 2);
    }
}
