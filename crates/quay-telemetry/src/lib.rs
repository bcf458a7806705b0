#![forbid(unsafe_code)]
#![warn(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Telemetry primitives shared across the quay workspace.
//!
//! Layout: `init.rs` (logging setup and build metadata), `metrics.rs`
//! (Prometheus registry for the scheduler), `error.rs` (telemetry errors).

pub mod error;
pub mod init;
pub mod metrics;

pub use error::{Result, TelemetryError};
pub use init::{
    DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, build_sha, init_logging, log_format_from_config,
};
pub use metrics::{Metrics, MetricsSnapshot};
