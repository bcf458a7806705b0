//! Admission control and run-state transitions.
//!
//! # Design
//! - One `Scheduler` owns the registry; callers serialise access (the
//!   service actor drains commands one at a time).
//! - Refusals are [`StartOutcome`] values; only unknown or duplicate
//!   transfers, data-check conflicts and collaborator failures are errors.
//! - Every notification is on the event bus before the triggering call returns.
//! - Automatically managed transfers (`auto_queued`) are started and stopped by
//!   admission passes; user-controlled ones count toward quotas but are never
//!   stopped by them.

use std::collections::HashSet;
use std::sync::Arc;

use quay_events::{Event, EventBus, InfoHash, TransferState};
use quay_telemetry::Metrics;
use quay_transfer_core::{
    ChunkBitSet, EventMonitor, FilePriority, TrackerTier, Transfer, TransferStats,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{DiskProbe, TransferBackend};
use crate::barrier::{BarrierToken, ShutdownBarrier};
use crate::config::{QueuePolicy, normalize_policy};
use crate::error::{SchedulerError, SchedulerResult};
use crate::queue::QueueList;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// The transfer is now downloading or seeding.
    Started,
    /// The transfer was already running; nothing changed.
    AlreadyRunning,
    /// The share-ratio limit is already reached; starting would stop it again.
    QueuedForSeedingNotPossible,
    /// The target volume is below the free-space floor.
    InsufficientDiskSpace,
    /// The runtime is verifying on-disk data.
    BusyCheckingData,
    /// Automatic starts are blocked by quotas or the global pause.
    LimitsReached,
}

impl StartOutcome {
    /// Render the outcome as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyRunning => "already_running",
            Self::QueuedForSeedingNotPossible => "queued_for_seeding_not_possible",
            Self::InsufficientDiskSpace => "insufficient_disk_space",
            Self::BusyCheckingData => "busy_checking_data",
            Self::LimitsReached => "limits_reached",
        }
    }
}

/// Result of toggling a transfer's queue membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOutcome {
    /// A stopped transfer now waits for admission.
    Queued,
    /// A queued transfer was taken out of the queue.
    Dequeued,
    /// A running transfer is now managed by admission passes.
    Managed,
    /// The share-ratio limit is already reached.
    NotPossible,
}

/// Selects transfers for bulk operations and counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFilter {
    /// Completed transfers.
    Seeds,
    /// Incomplete transfers.
    Downloads,
    /// Everything.
    All,
}

impl QueueFilter {
    /// Whether `transfer` is selected.
    #[must_use]
    pub const fn matches(self, transfer: &Transfer) -> bool {
        match self {
            Self::Seeds => transfer.is_completed(),
            Self::Downloads => !transfer.is_completed(),
            Self::All => true,
        }
    }
}

/// How a newly added transfer enters the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddMode {
    /// Start immediately as a user-controlled transfer.
    Start,
    /// Queue for automatic admission.
    Queue,
    /// Register only.
    Stopped,
}

/// Occupancy of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Transfers in the downloading state.
    pub running_downloads: usize,
    /// Transfers in the seeding state.
    pub running_seeds: usize,
    /// Transfers waiting for admission.
    pub queued: usize,
    /// Registered transfers.
    pub total: usize,
}

/// What one admission pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionReport {
    /// Queued transfers promoted to running.
    pub started: usize,
    /// Managed transfers stopped because they exceeded a quota.
    pub stopped: usize,
    /// Collaborator calls that failed during the pass.
    pub failed: usize,
}

/// Verdict of a free-space probe for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiskVerdict {
    Enough,
    BelowRemaining,
    BelowFloor,
}

/// Owns every known transfer and decides which of them run.
pub struct Scheduler {
    pub(crate) registry: QueueList,
    pub(crate) user_paused: HashSet<InfoHash>,
    pub(crate) suspended: Vec<InfoHash>,
    pub(crate) low_disk_notified: HashSet<InfoHash>,
    pub(crate) policy: QueuePolicy,
    pub(crate) paused: bool,
    pub(crate) exiting: bool,
    events: EventBus,
    backend: Arc<dyn TransferBackend>,
    disk: Arc<dyn DiskProbe>,
    pub(crate) metrics: Option<Metrics>,
}

fn has_room(max: u32, running: usize) -> bool {
    max == 0 || u64::try_from(running).is_ok_and(|running| running < u64::from(max))
}

fn backend_error(
    operation: &'static str,
    info_hash: InfoHash,
    source: anyhow::Error,
) -> SchedulerError {
    SchedulerError::Backend {
        operation,
        info_hash,
        source: source.into(),
    }
}

impl Scheduler {
    /// Build an empty scheduler. The policy is normalised first.
    #[must_use]
    pub fn new(
        policy: QueuePolicy,
        events: EventBus,
        backend: Arc<dyn TransferBackend>,
        disk: Arc<dyn DiskProbe>,
    ) -> Self {
        let effective = normalize_policy(&policy);
        for warning in &effective.warnings {
            warn!(%warning, "queue policy normalised");
        }
        Self {
            registry: QueueList::new(),
            user_paused: HashSet::new(),
            suspended: Vec::new(),
            low_disk_notified: HashSet::new(),
            policy: effective.policy,
            paused: false,
            exiting: false,
            events,
            backend,
            disk,
            metrics: None,
        }
    }

    /// Record gauges and counters in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        metrics.set_paused(self.paused);
        self.metrics = Some(metrics);
        self.refresh_gauges();
        self
    }

    /// Bus the scheduler publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Whether the global pause switch is engaged.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the transfer was explicitly stopped by a user.
    #[must_use]
    pub fn is_user_paused(&self, info_hash: &InfoHash) -> bool {
        self.user_paused.contains(info_hash)
    }

    // ---- registry ------------------------------------------------------

    /// Register a transfer at the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRegistered`] for a duplicate identifier.
    pub fn append(&mut self, transfer: Transfer) -> SchedulerResult<()> {
        let info_hash = transfer.info_hash();
        if self.registry.contains(&info_hash) {
            return Err(SchedulerError::AlreadyRegistered { info_hash });
        }
        let name = transfer.name().to_owned();
        self.registry.push(transfer);
        info!(%info_hash, %name, "transfer registered");
        self.emit(Event::TransferAdded { info_hash, name });
        self.refresh_gauges();
        Ok(())
    }

    /// Register a transfer and start, queue or park it.
    ///
    /// Returns the run state after the call.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::append`], [`Self::start`] and [`Self::queue`] errors.
    pub fn transfer_added(
        &mut self,
        transfer: Transfer,
        mode: AddMode,
    ) -> SchedulerResult<TransferState> {
        let info_hash = transfer.info_hash();
        self.append(transfer)?;
        match mode {
            AddMode::Start => {
                let outcome = self.start(&info_hash, true)?;
                debug!(%info_hash, outcome = outcome.as_str(), "added transfer start");
            }
            AddMode::Queue => {
                self.queue(&info_hash)?;
            }
            AddMode::Stopped => {}
        }
        Ok(self.lookup(&info_hash)?.state())
    }

    /// Unregister a transfer, stopping it first when running.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`], [`SchedulerError::CheckingData`]
    /// while the runtime verifies data, or a backend failure from stopping it.
    pub fn remove(&mut self, info_hash: &InfoHash) -> SchedulerResult<Transfer> {
        let transfer = self.lookup(info_hash)?;
        if transfer.is_checking_data() {
            return Err(SchedulerError::CheckingData {
                operation: "remove",
                info_hash: *info_hash,
            });
        }
        if transfer.is_running() {
            self.halt(info_hash, TransferState::Stopped)?;
        }
        let removed = self
            .registry
            .remove(info_hash)
            .ok_or(SchedulerError::NotFound {
                info_hash: *info_hash,
            })?;
        self.forget(info_hash);
        info!(%info_hash, "transfer removed");
        self.emit(Event::TransferRemoved {
            info_hash: *info_hash,
        });
        self.start_next();
        self.refresh_gauges();
        Ok(removed)
    }

    /// Stop and unregister everything. Returns how many transfers were removed.
    pub fn clear(&mut self) -> usize {
        let running: Vec<InfoHash> = self
            .registry
            .iter()
            .filter(|transfer| transfer.is_running())
            .map(Transfer::info_hash)
            .collect();
        for info_hash in running {
            if let Err(err) = self.halt(&info_hash, TransferState::Stopped) {
                warn!(%info_hash, error = %err, "failed to stop transfer while clearing");
            }
        }
        let drained = self.registry.drain();
        self.user_paused.clear();
        self.suspended.clear();
        self.low_disk_notified.clear();
        for transfer in &drained {
            self.emit(Event::TransferRemoved {
                info_hash: transfer.info_hash(),
            });
        }
        info!(removed = drained.len(), "registry cleared");
        self.refresh_gauges();
        drained.len()
    }

    /// Number of registered transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Whether the identifier is already registered.
    #[must_use]
    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.registry.contains(info_hash)
    }

    /// Transfer at queue position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Transfer> {
        self.registry.get(index)
    }

    /// Transfer with the identifier.
    #[must_use]
    pub fn find(&self, info_hash: &InfoHash) -> Option<&Transfer> {
        self.registry.find(info_hash)
    }

    /// Transfers in queue order.
    pub fn iter(&self) -> std::slice::Iter<'_, Transfer> {
        self.registry.iter()
    }

    /// Incomplete transfers, running or not.
    #[must_use]
    pub fn count_downloads(&self) -> usize {
        self.count_matching(QueueFilter::Downloads)
    }

    /// Completed transfers, running or not.
    #[must_use]
    pub fn count_seeds(&self) -> usize {
        self.count_matching(QueueFilter::Seeds)
    }

    fn count_matching(&self, filter: QueueFilter) -> usize {
        self.registry
            .iter()
            .filter(|transfer| filter.matches(transfer))
            .count()
    }

    /// Running transfers selected by `filter`.
    #[must_use]
    pub fn num_running(&self, filter: QueueFilter) -> usize {
        self.registry
            .iter()
            .filter(|transfer| transfer.is_running() && filter.matches(transfer))
            .count()
    }

    /// Occupancy by run state.
    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            total: self.registry.len(),
            ..QueueCounts::default()
        };
        for transfer in &self.registry {
            match transfer.state() {
                TransferState::Downloading => counts.running_downloads += 1,
                TransferState::Seeding => counts.running_seeds += 1,
                TransferState::Queued => counts.queued += 1,
                TransferState::Stopped => {}
            }
        }
        counts
    }

    // ---- start / stop / queue -------------------------------------------

    /// Start a transfer.
    ///
    /// User starts bypass quotas but not the data-check, share-ratio and
    /// free-space constraints. Automatic starts also respect quotas and the
    /// global pause.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or a backend failure.
    pub fn start(&mut self, info_hash: &InfoHash, user: bool) -> SchedulerResult<StartOutcome> {
        let transfer = self.lookup(info_hash)?;
        if transfer.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        if transfer.is_checking_data() {
            return Ok(StartOutcome::BusyCheckingData);
        }
        if !user && (self.paused || self.exiting) {
            return Ok(StartOutcome::LimitsReached);
        }
        if transfer.is_over_ratio_limit(self.policy.default_seed_limits.as_ref()) {
            warn!(%info_hash, ratio = transfer.share_ratio(), "share ratio limit reached; start refused");
            self.emit(Event::QueuingNotPossible {
                info_hash: *info_hash,
            });
            return Ok(StartOutcome::QueuedForSeedingNotPossible);
        }
        let completed = transfer.is_completed();
        if self.probe_disk(transfer) == DiskVerdict::BelowFloor {
            self.notify_low_disk(*info_hash, false);
            return Ok(StartOutcome::InsufficientDiskSpace);
        }
        if !user {
            let counts = self.counts();
            let room = if completed {
                has_room(self.policy.max_seeds, counts.running_seeds)
            } else {
                has_room(self.policy.max_downloads, counts.running_downloads)
            };
            if !room {
                return Ok(StartOutcome::LimitsReached);
            }
        }

        self.launch(info_hash)?;
        if user {
            self.user_paused.remove(info_hash);
            if let Some(transfer) = self.registry.find_mut(info_hash) {
                transfer.set_auto_queued(false);
            }
        }
        info!(%info_hash, user, "transfer started");
        Ok(StartOutcome::Started)
    }

    /// Start several transfers as user-controlled, in list order.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] before starting anything if any
    /// identifier is unknown, or the first backend failure.
    pub fn start_list(
        &mut self,
        info_hashes: &[InfoHash],
    ) -> SchedulerResult<Vec<(InfoHash, StartOutcome)>> {
        if let Some(missing) = info_hashes.iter().find(|hash| !self.contains(hash)) {
            return Err(SchedulerError::NotFound {
                info_hash: *missing,
            });
        }
        let mut outcomes = Vec::with_capacity(info_hashes.len());
        for info_hash in info_hashes {
            self.user_paused.remove(info_hash);
            if let Some(transfer) = self.registry.find_mut(info_hash) {
                transfer.set_auto_queued(false);
            }
            outcomes.push((*info_hash, self.start(info_hash, true)?));
        }
        Ok(outcomes)
    }

    /// Stop a transfer. Stopping a stopped transfer changes nothing.
    ///
    /// System stops (`user == false`) leave automatically managed transfers
    /// queued so a later pass can resume them. User stops take the transfer
    /// out of automatic admission until it is queued again.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or a backend failure.
    pub fn stop(&mut self, info_hash: &InfoHash, user: bool) -> SchedulerResult<()> {
        let was_running = self.stop_inner(info_hash, user)?;
        if user && was_running {
            self.start_next();
        }
        Ok(())
    }

    fn stop_inner(&mut self, info_hash: &InfoHash, user: bool) -> SchedulerResult<bool> {
        let transfer = self.lookup(info_hash)?;
        let auto = transfer.is_auto_queued();
        match transfer.state() {
            TransferState::Stopped => {
                if user {
                    self.suspended.retain(|hash| hash != info_hash);
                }
                Ok(false)
            }
            TransferState::Queued if !user => Ok(false),
            TransferState::Queued => {
                self.mark_user_paused(info_hash);
                self.set_state(info_hash, TransferState::Stopped);
                info!(%info_hash, "queued transfer stopped by user");
                Ok(false)
            }
            TransferState::Downloading | TransferState::Seeding => {
                let next = if !user && auto {
                    TransferState::Queued
                } else {
                    TransferState::Stopped
                };
                self.halt(info_hash, next)?;
                if user {
                    self.mark_user_paused(info_hash);
                }
                info!(%info_hash, user, "transfer stopped");
                Ok(true)
            }
        }
    }

    /// Toggle a transfer between queued and stopped, then run an admission pass.
    ///
    /// A running transfer is handed over to automatic management instead.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn queue(&mut self, info_hash: &InfoHash) -> SchedulerResult<QueueOutcome> {
        let transfer = self.lookup(info_hash)?;
        let outcome = match transfer.state() {
            TransferState::Queued => {
                if let Some(transfer) = self.registry.find_mut(info_hash) {
                    transfer.set_auto_queued(false);
                }
                self.set_state(info_hash, TransferState::Stopped);
                QueueOutcome::Dequeued
            }
            TransferState::Stopped => {
                if transfer.is_over_ratio_limit(self.policy.default_seed_limits.as_ref()) {
                    warn!(%info_hash, "share ratio limit reached; queueing refused");
                    self.emit(Event::QueuingNotPossible {
                        info_hash: *info_hash,
                    });
                    return Ok(QueueOutcome::NotPossible);
                }
                self.hand_over(info_hash);
                self.set_state(info_hash, TransferState::Queued);
                QueueOutcome::Queued
            }
            TransferState::Downloading | TransferState::Seeding => {
                self.hand_over(info_hash);
                QueueOutcome::Managed
            }
        };
        debug!(%info_hash, ?outcome, "queue toggled");
        self.start_next();
        Ok(outcome)
    }

    /// Run one admission pass.
    ///
    /// The registry is re-sorted by priority, user-controlled running
    /// transfers are counted toward the quotas, then managed transfers are
    /// walked in order: running ones beyond a quota are stopped (back to
    /// queued) and queued ones are promoted while quotas and free space allow.
    /// Disk-blocked downloads are skipped, not waited on.
    ///
    /// Does nothing while the global pause is engaged.
    pub fn start_next(&mut self) -> AdmissionReport {
        let mut report = AdmissionReport::default();
        if self.paused || self.exiting {
            return report;
        }
        self.registry.order();
        if let Some(metrics) = &self.metrics {
            metrics.inc_admission_pass();
        }

        let defaults = self.policy.default_seed_limits;
        let (mut downloads, mut seeds) = (0_usize, 0_usize);
        for transfer in self.registry.iter().filter(|t| !t.is_auto_queued()) {
            match transfer.state() {
                TransferState::Downloading => downloads += 1,
                TransferState::Seeding => seeds += 1,
                TransferState::Queued | TransferState::Stopped => {}
            }
        }

        let mut to_stop = Vec::new();
        let mut to_start = Vec::new();
        let mut blocked = Vec::new();
        for transfer in self.registry.iter().filter(|t| t.is_auto_queued()) {
            let info_hash = transfer.info_hash();
            match transfer.state() {
                TransferState::Downloading => {
                    if has_room(self.policy.max_downloads, downloads) {
                        downloads += 1;
                    } else {
                        to_stop.push(info_hash);
                    }
                }
                TransferState::Seeding => {
                    if has_room(self.policy.max_seeds, seeds) {
                        seeds += 1;
                    } else {
                        to_stop.push(info_hash);
                    }
                }
                TransferState::Queued => {
                    if self.user_paused.contains(&info_hash) || transfer.is_checking_data() {
                        continue;
                    }
                    if transfer.is_completed() {
                        let over_limit = transfer.is_over_ratio_limit(defaults.as_ref())
                            || transfer.is_over_seed_time_limit(defaults.as_ref());
                        if !self.policy.keep_seeding
                            || over_limit
                            || !has_room(self.policy.max_seeds, seeds)
                        {
                            continue;
                        }
                        seeds += 1;
                    } else {
                        if !has_room(self.policy.max_downloads, downloads) {
                            continue;
                        }
                        if self.probe_disk(transfer) == DiskVerdict::BelowFloor {
                            blocked.push(info_hash);
                            continue;
                        }
                        downloads += 1;
                    }
                    to_start.push(info_hash);
                }
                TransferState::Stopped => {}
            }
        }

        for info_hash in blocked {
            self.notify_low_disk(info_hash, false);
        }
        for info_hash in to_stop {
            match self.halt(&info_hash, TransferState::Queued) {
                Ok(()) => {
                    report.stopped += 1;
                    info!(%info_hash, "transfer over quota returned to queue");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(%info_hash, error = %err, "failed to stop transfer over quota");
                }
            }
        }
        for info_hash in to_start {
            match self.launch(&info_hash) {
                Ok(state) => {
                    report.started += 1;
                    info!(%info_hash, state = state.as_str(), "queued transfer admitted");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(%info_hash, error = %err, "failed to start queued transfer");
                }
            }
        }
        debug!(
            started = report.started,
            stopped = report.stopped,
            failed = report.failed,
            "admission pass finished"
        );
        report
    }

    /// Re-sort the registry by priority without touching run states.
    pub fn order_queue(&mut self) {
        self.registry.order();
        self.emit(Event::QueueOrdered);
    }

    /// Change a transfer's queue priority, re-order and run an admission pass.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn set_transfer_priority(
        &mut self,
        info_hash: &InfoHash,
        priority: i32,
    ) -> SchedulerResult<()> {
        self.lookup_mut(info_hash)?.set_priority(priority);
        self.order_queue();
        self.start_next();
        Ok(())
    }

    /// Stop every running or queued transfer selected by `filter`, as a user.
    ///
    /// Returns how many running transfers were stopped.
    pub fn stopall(&mut self, filter: QueueFilter) -> usize {
        let targets: Vec<InfoHash> = self
            .registry
            .iter()
            .filter(|t| t.state() != TransferState::Stopped && filter.matches(t))
            .map(Transfer::info_hash)
            .collect();
        let mut stopped = 0;
        for info_hash in targets {
            match self.stop_inner(&info_hash, true) {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(err) => warn!(%info_hash, error = %err, "failed to stop transfer"),
            }
        }
        self.start_next();
        stopped
    }

    /// Start every idle transfer selected by `filter`, as a user.
    ///
    /// Returns how many transfers were started.
    pub fn startall(&mut self, filter: QueueFilter) -> usize {
        let targets: Vec<InfoHash> = self
            .registry
            .iter()
            .filter(|t| !t.is_running() && filter.matches(t))
            .map(Transfer::info_hash)
            .collect();
        let mut started = 0;
        for info_hash in targets {
            match self.start(&info_hash, true) {
                Ok(StartOutcome::Started) => started += 1,
                Ok(outcome) => {
                    debug!(%info_hash, outcome = outcome.as_str(), "bulk start skipped transfer");
                }
                Err(err) => warn!(%info_hash, error = %err, "failed to start transfer"),
            }
        }
        started
    }

    /// Stop every running transfer for process exit.
    ///
    /// Each tracker of a stopped transfer gets a token registered with
    /// `barrier` before its "stopped" announce is fired, so the caller can
    /// wait (bounded) for the announces to settle. Returns the number of
    /// registered tokens. Automatic admission is disabled afterwards.
    pub fn on_exit(&mut self, barrier: &ShutdownBarrier) -> usize {
        self.exiting = true;
        let running: Vec<(InfoHash, Vec<String>)> = self
            .registry
            .iter()
            .filter(|transfer| transfer.is_running())
            .map(|transfer| {
                let trackers = transfer
                    .tracker_urls()
                    .into_iter()
                    .map(str::to_owned)
                    .collect();
                (transfer.info_hash(), trackers)
            })
            .collect();

        let transfers = running.len();
        let mut registered = 0;
        for (info_hash, trackers) in running {
            if let Err(err) = self.halt(&info_hash, TransferState::Stopped) {
                warn!(%info_hash, error = %err, "failed to stop transfer during shutdown");
            }
            for tracker in trackers {
                let token = BarrierToken::new(info_hash, tracker);
                if barrier.register(token.clone()) {
                    registered += 1;
                    self.backend.announce_stopped(token, barrier.clone());
                }
            }
        }
        info!(transfers, announces = registered, "transfers stopped for shutdown");
        registered
    }

    // ---- configuration --------------------------------------------------

    /// Change the download quota and enforce it.
    pub fn set_max_downloads(&mut self, max: u32) {
        if self.policy.max_downloads != max {
            self.policy.max_downloads = max;
            self.settings_changed(format!("max_downloads set to {max}"));
        }
    }

    /// Change the seed quota and enforce it.
    pub fn set_max_seeds(&mut self, max: u32) {
        if self.policy.max_seeds != max {
            self.policy.max_seeds = max;
            self.settings_changed(format!("max_seeds set to {max}"));
        }
    }

    /// Whether finished downloads keep running as seeds.
    pub fn set_keep_seeding(&mut self, keep: bool) {
        if self.policy.keep_seeding != keep {
            self.policy.keep_seeding = keep;
            self.settings_changed(format!("keep_seeding set to {keep}"));
        }
    }

    /// Replace the whole policy. Returns the normalisation warnings.
    pub fn set_policy(&mut self, policy: &QueuePolicy) -> Vec<String> {
        let effective = normalize_policy(policy);
        for warning in &effective.warnings {
            warn!(%warning, "queue policy normalised");
        }
        if effective.policy != self.policy {
            self.policy = effective.policy;
            self.settings_changed("queue policy replaced".to_string());
        }
        effective.warnings
    }

    fn settings_changed(&mut self, description: String) {
        info!(%description, "scheduler settings changed");
        self.emit(Event::SettingsChanged { description });
        self.start_next();
    }

    /// Engage or release the global pause.
    ///
    /// Engaging stops every running transfer and blocks automatic admission
    /// and policy stops. User-controlled transfers stopped by the pause are
    /// restarted when it is released.
    pub fn set_paused_state(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if paused {
            let running: Vec<(InfoHash, bool)> = self
                .registry
                .iter()
                .filter(|transfer| transfer.is_running())
                .map(|transfer| (transfer.info_hash(), transfer.is_auto_queued()))
                .collect();
            for (info_hash, auto) in running {
                let next = if auto {
                    TransferState::Queued
                } else {
                    TransferState::Stopped
                };
                match self.halt(&info_hash, next) {
                    Ok(()) if !auto => self.suspended.push(info_hash),
                    Ok(()) => {}
                    Err(err) => warn!(%info_hash, error = %err, "failed to pause transfer"),
                }
            }
        } else {
            for info_hash in std::mem::take(&mut self.suspended) {
                if !self.contains(&info_hash) || self.user_paused.contains(&info_hash) {
                    continue;
                }
                match self.start(&info_hash, true) {
                    Ok(outcome) => {
                        debug!(%info_hash, outcome = outcome.as_str(), "resumed after pause");
                    }
                    Err(err) => warn!(%info_hash, error = %err, "failed to resume transfer"),
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_paused(paused);
        }
        info!(paused, "global pause toggled");
        self.emit(Event::PauseStateChanged { paused });
        if !paused {
            self.start_next();
        }
    }

    // ---- runtime notifications ------------------------------------------

    /// The runtime finished downloading every wanted chunk.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or a backend failure when the
    /// transfer has to be stopped because seeding is disabled.
    pub fn torrent_finished(&mut self, info_hash: &InfoHash) -> SchedulerResult<()> {
        let transfer = self.lookup_mut(info_hash)?;
        let mut stats = *transfer.stats();
        stats.completed = true;
        transfer.set_stats(stats);
        let running = transfer.is_running();

        info!(%info_hash, "transfer finished");
        self.emit(Event::TransferFinished {
            info_hash: *info_hash,
        });
        if running {
            if self.policy.keep_seeding {
                self.set_state(info_hash, TransferState::Seeding);
            } else {
                self.halt(info_hash, TransferState::Stopped)?;
                if let Some(transfer) = self.registry.find_mut(info_hash) {
                    transfer.set_auto_queued(false);
                }
            }
        }
        self.start_next();
        Ok(())
    }

    /// The runtime stopped the transfer on its own, for example after an error.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn torrent_stopped(&mut self, info_hash: &InfoHash) -> SchedulerResult<()> {
        let transfer = self.lookup_mut(info_hash)?;
        if !transfer.is_running() {
            return Ok(());
        }
        transfer.set_auto_queued(false);
        warn!(%info_hash, "transfer stopped by runtime");
        self.set_state(info_hash, TransferState::Stopped);
        self.start_next();
        Ok(())
    }

    /// The storage engine reported low free space for the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or a backend failure from stopping it.
    pub fn on_low_disk_space(&mut self, info_hash: &InfoHash, to_stop: bool) -> SchedulerResult<()> {
        let transfer = self.lookup(info_hash)?;
        let stopped = to_stop && transfer.is_running();
        if stopped {
            let next = if transfer.is_auto_queued() {
                TransferState::Queued
            } else {
                TransferState::Stopped
            };
            self.halt(info_hash, next)?;
        }
        self.notify_low_disk(*info_hash, stopped);
        Ok(())
    }

    /// The runtime started or finished verifying on-disk data.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn set_checking_data(&mut self, info_hash: &InfoHash, checking: bool) -> SchedulerResult<()> {
        self.lookup_mut(info_hash)?.set_checking_data(checking);
        if !checking {
            self.start_next();
        }
        Ok(())
    }

    /// Replace a transfer's runtime counters.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn update_stats(&mut self, info_hash: &InfoHash, stats: TransferStats) -> SchedulerResult<()> {
        self.lookup_mut(info_hash)?.set_stats(stats);
        Ok(())
    }

    /// Merge a tracker tier into a transfer's announce list.
    ///
    /// Returns how many URLs were new.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn merge_announce_list(
        &mut self,
        info_hash: &InfoHash,
        tier: &TrackerTier,
    ) -> SchedulerResult<usize> {
        let added = self.lookup_mut(info_hash)?.merge_trackers(tier);
        debug!(%info_hash, added, "announce list merged");
        Ok(added)
    }

    // ---- per-file operations -------------------------------------------

    /// Change one file's download priority.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or [`SchedulerError::Transfer`]
    /// for an unknown file index.
    pub fn set_file_priority(
        &mut self,
        info_hash: &InfoHash,
        file_index: u32,
        priority: FilePriority,
    ) -> SchedulerResult<()> {
        let monitor = EventMonitor::new(self.events.clone(), *info_hash);
        self.lookup_mut(info_hash)?
            .set_file_priority(file_index, priority, &monitor)
            .map_err(|source| SchedulerError::Transfer {
                info_hash: *info_hash,
                source,
            })
    }

    /// Toggle one file's do-not-download flag.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or [`SchedulerError::Transfer`]
    /// for an unknown file index.
    pub fn set_file_excluded(
        &mut self,
        info_hash: &InfoHash,
        file_index: u32,
        excluded: bool,
    ) -> SchedulerResult<()> {
        let monitor = EventMonitor::new(self.events.clone(), *info_hash);
        self.lookup_mut(info_hash)?
            .set_file_excluded(file_index, excluded, &monitor)
            .map_err(|source| SchedulerError::Transfer {
                info_hash: *info_hash,
                source,
            })
    }

    /// Feed a fresh snapshot of verified chunks to every file of a transfer.
    ///
    /// Returns whether every wanted chunk is present.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`].
    pub fn chunks_verified(
        &mut self,
        info_hash: &InfoHash,
        bitset: &ChunkBitSet,
    ) -> SchedulerResult<bool> {
        let monitor = EventMonitor::new(self.events.clone(), *info_hash);
        let preview = self.policy.preview;
        Ok(self
            .lookup_mut(info_hash)?
            .on_chunks_verified(bitset, &preview, &monitor))
    }

    // ---- internals ------------------------------------------------------

    fn lookup(&self, info_hash: &InfoHash) -> SchedulerResult<&Transfer> {
        self.registry
            .find(info_hash)
            .ok_or(SchedulerError::NotFound {
                info_hash: *info_hash,
            })
    }

    fn lookup_mut(&mut self, info_hash: &InfoHash) -> SchedulerResult<&mut Transfer> {
        self.registry
            .find_mut(info_hash)
            .ok_or(SchedulerError::NotFound {
                info_hash: *info_hash,
            })
    }

    fn mark_user_paused(&mut self, info_hash: &InfoHash) {
        self.user_paused.insert(*info_hash);
        self.suspended.retain(|hash| hash != info_hash);
        if let Some(transfer) = self.registry.find_mut(info_hash) {
            transfer.set_auto_queued(false);
        }
    }

    fn hand_over(&mut self, info_hash: &InfoHash) {
        self.user_paused.remove(info_hash);
        if let Some(transfer) = self.registry.find_mut(info_hash) {
            transfer.set_auto_queued(true);
        }
    }

    fn forget(&mut self, info_hash: &InfoHash) {
        self.user_paused.remove(info_hash);
        self.low_disk_notified.remove(info_hash);
        self.suspended.retain(|hash| hash != info_hash);
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_event(event.kind());
        }
        self.events.send(event);
    }

    pub(crate) fn set_state(&mut self, info_hash: &InfoHash, state: TransferState) {
        let Some(transfer) = self.registry.find_mut(info_hash) else {
            return;
        };
        if transfer.state() == state {
            return;
        }
        transfer.set_state(state);
        self.emit(Event::StateChanged {
            info_hash: *info_hash,
            state,
        });
        self.refresh_gauges();
    }

    fn launch(&mut self, info_hash: &InfoHash) -> SchedulerResult<TransferState> {
        self.backend
            .start(info_hash)
            .map_err(|source| backend_error("start", *info_hash, source))?;
        let state = if self.lookup(info_hash)?.is_completed() {
            TransferState::Seeding
        } else {
            TransferState::Downloading
        };
        self.low_disk_notified.remove(info_hash);
        self.set_state(info_hash, state);
        Ok(state)
    }

    pub(crate) fn halt(&mut self, info_hash: &InfoHash, next: TransferState) -> SchedulerResult<()> {
        self.backend
            .stop(info_hash)
            .map_err(|source| backend_error("stop", *info_hash, source))?;
        self.set_state(info_hash, next);
        Ok(())
    }

    pub(crate) fn probe_disk(&self, transfer: &Transfer) -> DiskVerdict {
        if !self.policy.disk.enabled || transfer.is_completed() {
            return DiskVerdict::Enough;
        }
        match self.disk.free_space(transfer.data_dir()) {
            Ok(free) if free < self.policy.disk.min_free_bytes => DiskVerdict::BelowFloor,
            Ok(free) if free < transfer.bytes_left() => DiskVerdict::BelowRemaining,
            Ok(_) => DiskVerdict::Enough,
            Err(err) => {
                warn!(
                    info_hash = %transfer.info_hash(),
                    path = %transfer.data_dir().display(),
                    error = %err,
                    "free space probe failed"
                );
                DiskVerdict::Enough
            }
        }
    }

    /// Emit `LowDiskSpace` once per occurrence; stops are always reported.
    pub(crate) fn notify_low_disk(&mut self, info_hash: InfoHash, stopped: bool) {
        let first = self.low_disk_notified.insert(info_hash);
        if !first && !stopped {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_low_disk_space();
        }
        warn!(%info_hash, stopped, "low disk space");
        self.emit(Event::LowDiskSpace { info_hash, stopped });
    }

    fn refresh_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            let counts = self.counts();
            metrics.set_queue_counts(counts.running_downloads, counts.running_seeds, counts.queued);
        }
    }
}
