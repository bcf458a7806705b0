//! Actor that owns a [`Scheduler`] and serialises every operation on it.
//!
//! Commands arrive over an mpsc channel and answer through oneshot replies.
//! Periodic policy checks run on a timer inside the same loop, so callers
//! never observe a half-applied transition. Scheduler work calls the
//! collaborators synchronously, so it runs through [`block_in_place`] on
//! multi-threaded runtimes to keep other tasks moving while a disk probe or
//! backend call blocks.

use std::sync::Arc;
use std::time::Duration;

use quay_events::{EventBus, InfoHash, TransferState};
use quay_transfer_core::{ChunkBitSet, FilePriority, TrackerTier, Transfer, TransferStats};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::block_in_place;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use crate::barrier::{ShutdownBarrier, WaitOutcome};
use crate::config::{PolicyMutation, apply_policy_patch};
use crate::error::{SchedulerError, SchedulerResult};
use crate::policy::PolicyReport;
use crate::scheduler::{AddMode, QueueCounts, QueueFilter, QueueOutcome, Scheduler, StartOutcome};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<SchedulerResult<T>>;

/// One registered transfer as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    /// Transfer identifier.
    pub info_hash: InfoHash,
    /// Display name.
    pub name: String,
    /// Run state.
    pub state: TransferState,
    /// Queue priority.
    pub priority: i32,
    /// Whether admission passes manage the transfer.
    pub auto_queued: bool,
    /// Whether every wanted chunk is present.
    pub completed: bool,
    /// Uploaded over downloaded bytes.
    pub share_ratio: f64,
}

/// Registry state published after every command and periodic check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSnapshot {
    /// Whether the global pause is engaged.
    pub paused: bool,
    /// Occupancy by run state.
    pub counts: QueueCounts,
    /// Transfers in queue order.
    pub transfers: Vec<TransferSummary>,
}

impl QueueSnapshot {
    fn capture(scheduler: &Scheduler) -> Self {
        Self {
            paused: scheduler.is_paused(),
            counts: scheduler.counts(),
            transfers: scheduler
                .iter()
                .map(|transfer| TransferSummary {
                    info_hash: transfer.info_hash(),
                    name: transfer.name().to_owned(),
                    state: transfer.state(),
                    priority: transfer.priority(),
                    auto_queued: transfer.is_auto_queued(),
                    completed: transfer.is_completed(),
                    share_ratio: transfer.share_ratio(),
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
enum SchedulerCommand {
    Add {
        transfer: Box<Transfer>,
        mode: AddMode,
        respond_to: Reply<TransferState>,
    },
    Remove {
        info_hash: InfoHash,
        respond_to: Reply<Box<Transfer>>,
    },
    Start {
        info_hash: InfoHash,
        user: bool,
        respond_to: Reply<StartOutcome>,
    },
    StartList {
        info_hashes: Vec<InfoHash>,
        respond_to: Reply<Vec<(InfoHash, StartOutcome)>>,
    },
    Stop {
        info_hash: InfoHash,
        user: bool,
        respond_to: Reply<()>,
    },
    Queue {
        info_hash: InfoHash,
        respond_to: Reply<QueueOutcome>,
    },
    SetPriority {
        info_hash: InfoHash,
        priority: i32,
        respond_to: Reply<()>,
    },
    StopAll {
        filter: QueueFilter,
        respond_to: Reply<usize>,
    },
    StartAll {
        filter: QueueFilter,
        respond_to: Reply<usize>,
    },
    SetPaused {
        paused: bool,
        respond_to: Reply<()>,
    },
    ApplyPolicyPatch {
        patch: Value,
        respond_to: Reply<PolicyMutation>,
    },
    SetFilePriority {
        info_hash: InfoHash,
        file_index: u32,
        priority: FilePriority,
        respond_to: Reply<()>,
    },
    SetFileExcluded {
        info_hash: InfoHash,
        file_index: u32,
        excluded: bool,
        respond_to: Reply<()>,
    },
    ChunksVerified {
        info_hash: InfoHash,
        bitset: ChunkBitSet,
        respond_to: Reply<bool>,
    },
    UpdateStats {
        info_hash: InfoHash,
        stats: TransferStats,
        respond_to: Reply<()>,
    },
    CheckingData {
        info_hash: InfoHash,
        checking: bool,
        respond_to: Reply<()>,
    },
    Finished {
        info_hash: InfoHash,
        respond_to: Reply<()>,
    },
    StoppedByRuntime {
        info_hash: InfoHash,
        respond_to: Reply<()>,
    },
    LowDiskSpace {
        info_hash: InfoHash,
        to_stop: bool,
        respond_to: Reply<()>,
    },
    MergeTrackers {
        info_hash: InfoHash,
        tier: TrackerTier,
        respond_to: Reply<usize>,
    },
    RunChecks {
        respond_to: Reply<PolicyReport>,
    },
    Shutdown {
        respond_to: Reply<(ShutdownBarrier, Duration)>,
    },
}

/// Runs a [`Scheduler`] on a tokio task.
pub struct SchedulerService {
    scheduler: Scheduler,
    snapshot: Arc<RwLock<QueueSnapshot>>,
}

fn blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => block_in_place(work),
        _ => work(),
    }
}

fn checks_interval(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl SchedulerService {
    /// Move `scheduler` onto a new task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(scheduler: Scheduler) -> SchedulerHandle {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let events = scheduler.events().clone();
        let snapshot = Arc::new(RwLock::new(QueueSnapshot::capture(&scheduler)));
        let service = Self {
            scheduler,
            snapshot: Arc::clone(&snapshot),
        };
        tokio::spawn(service.run(receiver));
        SchedulerHandle {
            commands,
            snapshot,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>) {
        let mut period = self.scheduler.policy().check_interval();
        let mut ticker = checks_interval(period);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let SchedulerCommand::Shutdown { respond_to } = command {
                        let barrier = ShutdownBarrier::new();
                        let announces = blocking(|| self.scheduler.on_exit(&barrier));
                        self.publish().await;
                        let timeout = self.scheduler.policy().shutdown_timeout();
                        info!(announces, "scheduler service stopping");
                        let _ = respond_to.send(Ok((barrier, timeout)));
                        return;
                    }
                    blocking(|| self.handle(command));
                    let configured = self.scheduler.policy().check_interval();
                    if configured != period {
                        debug!(?configured, "policy check interval changed");
                        period = configured;
                        ticker = checks_interval(period);
                    }
                }
                _ = ticker.tick() => {
                    let report = blocking(|| self.scheduler.run_periodic_checks());
                    debug!(
                        stops = report.total_stops(),
                        admitted = report.admission.started,
                        "periodic policy checks finished"
                    );
                }
            }
            self.publish().await;
        }
        info!("scheduler command channel closed");
    }

    async fn publish(&self) {
        let snapshot = QueueSnapshot::capture(&self.scheduler);
        *self.snapshot.write().await = snapshot;
    }

    fn handle(&mut self, command: SchedulerCommand) {
        let scheduler = &mut self.scheduler;
        match command {
            SchedulerCommand::Add {
                transfer,
                mode,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.transfer_added(*transfer, mode));
            }
            SchedulerCommand::Remove {
                info_hash,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.remove(&info_hash).map(Box::new));
            }
            SchedulerCommand::Start {
                info_hash,
                user,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.start(&info_hash, user));
            }
            SchedulerCommand::StartList {
                info_hashes,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.start_list(&info_hashes));
            }
            SchedulerCommand::Stop {
                info_hash,
                user,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.stop(&info_hash, user));
            }
            SchedulerCommand::Queue {
                info_hash,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.queue(&info_hash));
            }
            SchedulerCommand::SetPriority {
                info_hash,
                priority,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.set_transfer_priority(&info_hash, priority));
            }
            SchedulerCommand::StopAll { filter, respond_to } => {
                let _ = respond_to.send(Ok(scheduler.stopall(filter)));
            }
            SchedulerCommand::StartAll { filter, respond_to } => {
                let _ = respond_to.send(Ok(scheduler.startall(filter)));
            }
            SchedulerCommand::SetPaused { paused, respond_to } => {
                scheduler.set_paused_state(paused);
                let _ = respond_to.send(Ok(()));
            }
            SchedulerCommand::ApplyPolicyPatch { patch, respond_to } => {
                let result = match apply_policy_patch(scheduler.policy(), &patch) {
                    Ok(mutation) => {
                        if mutation.mutated {
                            scheduler.set_policy(&mutation.effective.policy);
                        }
                        Ok(mutation)
                    }
                    Err(err) => Err(SchedulerError::from(err)),
                };
                let _ = respond_to.send(result);
            }
            SchedulerCommand::SetFilePriority {
                info_hash,
                file_index,
                priority,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.set_file_priority(&info_hash, file_index, priority));
            }
            SchedulerCommand::SetFileExcluded {
                info_hash,
                file_index,
                excluded,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.set_file_excluded(&info_hash, file_index, excluded));
            }
            SchedulerCommand::ChunksVerified {
                info_hash,
                bitset,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.chunks_verified(&info_hash, &bitset));
            }
            SchedulerCommand::UpdateStats {
                info_hash,
                stats,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.update_stats(&info_hash, stats));
            }
            SchedulerCommand::CheckingData {
                info_hash,
                checking,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.set_checking_data(&info_hash, checking));
            }
            SchedulerCommand::Finished {
                info_hash,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.torrent_finished(&info_hash));
            }
            SchedulerCommand::StoppedByRuntime {
                info_hash,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.torrent_stopped(&info_hash));
            }
            SchedulerCommand::LowDiskSpace {
                info_hash,
                to_stop,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.on_low_disk_space(&info_hash, to_stop));
            }
            SchedulerCommand::MergeTrackers {
                info_hash,
                tier,
                respond_to,
            } => {
                let _ = respond_to.send(scheduler.merge_announce_list(&info_hash, &tier));
            }
            SchedulerCommand::RunChecks { respond_to } => {
                let _ = respond_to.send(Ok(scheduler.run_periodic_checks()));
            }
            SchedulerCommand::Shutdown { respond_to } => {
                // Intercepted by the run loop.
                let _ = respond_to.send(Err(SchedulerError::ServiceStopped));
            }
        }
    }
}

/// Cloneable front end of a running [`SchedulerService`].
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    snapshot: Arc<RwLock<QueueSnapshot>>,
    events: EventBus,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SchedulerCommand,
    ) -> SchedulerResult<T> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(build(respond_to))
            .await
            .map_err(|_| SchedulerError::ServiceStopped)?;
        response.await.map_err(|_| SchedulerError::ServiceStopped)?
    }

    /// Bus the scheduler publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Latest published registry state.
    pub async fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Register a transfer and start, queue or park it.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn add(&self, transfer: Transfer, mode: AddMode) -> SchedulerResult<TransferState> {
        self.request(|respond_to| SchedulerCommand::Add {
            transfer: Box::new(transfer),
            mode,
            respond_to,
        })
        .await
    }

    /// Unregister a transfer.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn remove(&self, info_hash: InfoHash) -> SchedulerResult<Transfer> {
        self.request(|respond_to| SchedulerCommand::Remove {
            info_hash,
            respond_to,
        })
        .await
        .map(|transfer| *transfer)
    }

    /// Start a transfer.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn start(&self, info_hash: InfoHash, user: bool) -> SchedulerResult<StartOutcome> {
        self.request(|respond_to| SchedulerCommand::Start {
            info_hash,
            user,
            respond_to,
        })
        .await
    }

    /// Start several transfers as user-controlled.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn start_list(
        &self,
        info_hashes: Vec<InfoHash>,
    ) -> SchedulerResult<Vec<(InfoHash, StartOutcome)>> {
        self.request(|respond_to| SchedulerCommand::StartList {
            info_hashes,
            respond_to,
        })
        .await
    }

    /// Stop a transfer.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn stop(&self, info_hash: InfoHash, user: bool) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::Stop {
            info_hash,
            user,
            respond_to,
        })
        .await
    }

    /// Toggle queue membership.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn queue(&self, info_hash: InfoHash) -> SchedulerResult<QueueOutcome> {
        self.request(|respond_to| SchedulerCommand::Queue {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Change a transfer's queue priority.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn set_priority(&self, info_hash: InfoHash, priority: i32) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::SetPriority {
            info_hash,
            priority,
            respond_to,
        })
        .await
    }

    /// Stop every transfer selected by `filter`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ServiceStopped`].
    pub async fn stopall(&self, filter: QueueFilter) -> SchedulerResult<usize> {
        self.request(|respond_to| SchedulerCommand::StopAll { filter, respond_to })
            .await
    }

    /// Start every transfer selected by `filter`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ServiceStopped`].
    pub async fn startall(&self, filter: QueueFilter) -> SchedulerResult<usize> {
        self.request(|respond_to| SchedulerCommand::StartAll { filter, respond_to })
            .await
    }

    /// Engage or release the global pause.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ServiceStopped`].
    pub async fn set_paused(&self, paused: bool) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::SetPaused { paused, respond_to })
            .await
    }

    /// Apply a JSON patch to the queue policy.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Config`] for a rejected patch, or
    /// [`SchedulerError::ServiceStopped`].
    pub async fn apply_policy_patch(&self, patch: Value) -> SchedulerResult<PolicyMutation> {
        self.request(|respond_to| SchedulerCommand::ApplyPolicyPatch { patch, respond_to })
            .await
    }

    /// Change one file's download priority.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn set_file_priority(
        &self,
        info_hash: InfoHash,
        file_index: u32,
        priority: FilePriority,
    ) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::SetFilePriority {
            info_hash,
            file_index,
            priority,
            respond_to,
        })
        .await
    }

    /// Toggle one file's do-not-download flag.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn set_file_excluded(
        &self,
        info_hash: InfoHash,
        file_index: u32,
        excluded: bool,
    ) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::SetFileExcluded {
            info_hash,
            file_index,
            excluded,
            respond_to,
        })
        .await
    }

    /// Report a fresh snapshot of verified chunks.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn chunks_verified(
        &self,
        info_hash: InfoHash,
        bitset: ChunkBitSet,
    ) -> SchedulerResult<bool> {
        self.request(|respond_to| SchedulerCommand::ChunksVerified {
            info_hash,
            bitset,
            respond_to,
        })
        .await
    }

    /// Replace a transfer's runtime counters.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn update_stats(&self, info_hash: InfoHash, stats: TransferStats) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::UpdateStats {
            info_hash,
            stats,
            respond_to,
        })
        .await
    }

    /// Report the start or end of an on-disk data check.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn set_checking_data(&self, info_hash: InfoHash, checking: bool) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::CheckingData {
            info_hash,
            checking,
            respond_to,
        })
        .await
    }

    /// Report that a transfer finished downloading.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn torrent_finished(&self, info_hash: InfoHash) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::Finished {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Report that the runtime stopped a transfer on its own.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn torrent_stopped(&self, info_hash: InfoHash) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::StoppedByRuntime {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Report low free space from the storage engine.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn low_disk_space(&self, info_hash: InfoHash, to_stop: bool) -> SchedulerResult<()> {
        self.request(|respond_to| SchedulerCommand::LowDiskSpace {
            info_hash,
            to_stop,
            respond_to,
        })
        .await
    }

    /// Merge a tracker tier into a transfer's announce list.
    ///
    /// # Errors
    ///
    /// Scheduler errors, or [`SchedulerError::ServiceStopped`].
    pub async fn merge_announce_list(
        &self,
        info_hash: InfoHash,
        tier: TrackerTier,
    ) -> SchedulerResult<usize> {
        self.request(|respond_to| SchedulerCommand::MergeTrackers {
            info_hash,
            tier,
            respond_to,
        })
        .await
    }

    /// Run the periodic checks now instead of waiting for the timer.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ServiceStopped`].
    pub async fn run_checks(&self) -> SchedulerResult<PolicyReport> {
        self.request(|respond_to| SchedulerCommand::RunChecks { respond_to })
            .await
    }

    /// Stop every transfer, fire "stopped" announces and wait for them.
    ///
    /// The wait is bounded by `timeout`, or by the policy's shutdown timeout
    /// when `None`. The service task exits before the wait starts.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ServiceStopped`] when the service already exited.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> SchedulerResult<WaitOutcome> {
        let (barrier, configured) = self
            .request(|respond_to| SchedulerCommand::Shutdown { respond_to })
            .await?;
        let timeout = timeout.unwrap_or(configured);
        let outcome = barrier.wait(timeout).await;
        match outcome {
            WaitOutcome::AllCompleted => info!("shutdown announces settled"),
            WaitOutcome::TimedOut => {
                info!(pending = barrier.pending(), ?timeout, "shutdown announce wait timed out");
            }
        }
        Ok(outcome)
    }
}
