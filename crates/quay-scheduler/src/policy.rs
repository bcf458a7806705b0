//! Periodic disk, share-ratio and seed-time checks.

use quay_events::{InfoHash, TransferState};
use quay_transfer_core::Transfer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LimitAction;
use crate::scheduler::{AdmissionReport, DiskVerdict, Scheduler};

/// What one periodic check did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReport {
    /// Downloads stopped because free space fell below the floor.
    pub disk_stops: usize,
    /// Seeds stopped or re-queued for reaching their share ratio.
    pub ratio_stops: usize,
    /// Seeds stopped or re-queued for reaching their seed time.
    pub seed_time_stops: usize,
    /// The admission pass that followed the checks.
    pub admission: AdmissionReport,
}

impl PolicyReport {
    /// Total transfers taken out of the running set.
    #[must_use]
    pub const fn total_stops(&self) -> usize {
        self.disk_stops + self.ratio_stops + self.seed_time_stops
    }
}

impl Scheduler {
    /// Run every periodic check, then an admission pass.
    ///
    /// Skipped entirely while the global pause is engaged.
    pub fn run_periodic_checks(&mut self) -> PolicyReport {
        if self.paused {
            debug!("periodic checks skipped while paused");
            return PolicyReport::default();
        }
        let mut report = PolicyReport {
            disk_stops: self.check_disk_space(),
            ratio_stops: self.check_max_ratio(),
            seed_time_stops: self.check_max_seed_time(),
            ..PolicyReport::default()
        };
        report.admission = self.start_next();
        if report.total_stops() > 0 {
            info!(
                disk = report.disk_stops,
                ratio = report.ratio_stops,
                seed_time = report.seed_time_stops,
                "policy checks stopped transfers"
            );
        }
        report
    }

    /// Stop downloads whose volume dropped below the free-space floor.
    ///
    /// A volume above the floor that cannot hold the rest of a download only
    /// raises one `LowDiskSpace` notice. Returns how many downloads stopped.
    pub fn check_disk_space(&mut self) -> usize {
        if self.paused || !self.policy.disk.enabled {
            return 0;
        }
        let verdicts: Vec<(InfoHash, bool, DiskVerdict)> = self
            .registry
            .iter()
            .filter(|transfer| transfer.state() == TransferState::Downloading)
            .map(|transfer| {
                (
                    transfer.info_hash(),
                    transfer.is_auto_queued(),
                    self.probe_disk(transfer),
                )
            })
            .collect();

        let mut stopped = 0;
        for (info_hash, auto, verdict) in verdicts {
            match verdict {
                DiskVerdict::Enough => {
                    self.low_disk_notified.remove(&info_hash);
                }
                DiskVerdict::BelowRemaining => self.notify_low_disk(info_hash, false),
                DiskVerdict::BelowFloor => {
                    let next = if auto {
                        TransferState::Queued
                    } else {
                        TransferState::Stopped
                    };
                    match self.halt(&info_hash, next) {
                        Ok(()) => {
                            stopped += 1;
                            self.record_policy_stop("disk");
                            self.notify_low_disk(info_hash, true);
                        }
                        Err(err) => {
                            warn!(%info_hash, error = %err, "failed to stop transfer on low disk space");
                        }
                    }
                }
            }
        }
        stopped
    }

    /// Apply the ratio-limit action to seeds that reached their share ratio.
    pub fn check_max_ratio(&mut self) -> usize {
        if self.paused {
            return 0;
        }
        let defaults = self.policy.default_seed_limits;
        let over: Vec<InfoHash> = self
            .registry
            .iter()
            .filter(|t| {
                t.state() == TransferState::Seeding && t.is_over_ratio_limit(defaults.as_ref())
            })
            .map(Transfer::info_hash)
            .collect();
        let action = self.policy.ratio_limit_action;
        let mut stopped = 0;
        for info_hash in over {
            if self.enforce_limit(&info_hash, action, "ratio") {
                stopped += 1;
            }
        }
        stopped
    }

    /// Apply the seed-time action to seeds that reached their seed time.
    pub fn check_max_seed_time(&mut self) -> usize {
        if self.paused {
            return 0;
        }
        let defaults = self.policy.default_seed_limits;
        let over: Vec<InfoHash> = self
            .registry
            .iter()
            .filter(|t| {
                t.state() == TransferState::Seeding
                    && t.is_over_seed_time_limit(defaults.as_ref())
            })
            .map(Transfer::info_hash)
            .collect();
        let action = self.policy.seed_time_limit_action;
        let mut stopped = 0;
        for info_hash in over {
            if self.enforce_limit(&info_hash, action, "seed_time") {
                stopped += 1;
            }
        }
        stopped
    }

    fn enforce_limit(&mut self, info_hash: &InfoHash, action: LimitAction, reason: &'static str) -> bool {
        let next = match action {
            LimitAction::Stop => TransferState::Stopped,
            LimitAction::Queue => TransferState::Queued,
        };
        if let Err(err) = self.halt(info_hash, next) {
            warn!(%info_hash, reason, error = %err, "failed to enforce seeding limit");
            return false;
        }
        if let Some(transfer) = self.registry.find_mut(info_hash) {
            transfer.set_auto_queued(action == LimitAction::Queue);
        }
        self.record_policy_stop(reason);
        info!(%info_hash, reason, action = action.as_str(), "seeding limit reached");
        true
    }

    fn record_policy_stop(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_policy_stop(reason);
        }
    }
}
