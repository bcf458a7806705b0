#![forbid(unsafe_code)]
#![warn(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Admission scheduler for the quay transfer core.
//!
//! Layout: `config.rs` (queue policy, normalisation, JSON patches),
//! `backend.rs` (collaborator traits), `disk.rs` (statvfs free-space probe),
//! `barrier.rs` (shutdown barrier), `queue.rs` (priority ordered registry),
//! `scheduler.rs` (admission and run-state transitions), `policy.rs`
//! (periodic disk/ratio/seed-time checks), `service.rs` (tokio actor and
//! handle), `error.rs` (scheduler errors).

pub mod backend;
pub mod barrier;
pub mod config;
pub mod disk;
pub mod error;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod service;

pub use backend::{DiskProbe, TransferBackend};
pub use barrier::{BarrierToken, ShutdownBarrier, WaitOutcome};
pub use config::{
    ConfigError, DiskSpacePolicy, EffectivePolicy, LimitAction, PolicyMutation, QueuePolicy,
    apply_policy_patch, normalize_policy,
};
pub use disk::StatvfsProbe;
pub use error::{SchedulerError, SchedulerResult};
pub use policy::PolicyReport;
pub use queue::QueueList;
pub use scheduler::{
    AddMode, AdmissionReport, QueueCounts, QueueFilter, QueueOutcome, Scheduler, StartOutcome,
};
pub use service::{QueueSnapshot, SchedulerHandle, SchedulerService, TransferSummary};
