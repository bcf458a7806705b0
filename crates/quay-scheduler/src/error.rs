//! Error types for scheduler operations.

use std::error::Error;

use quay_events::InfoHash;
use quay_transfer_core::TransferError;
use thiserror::Error;

use crate::config::ConfigError;

/// Primary error type for scheduler operations.
///
/// Admission refusals are not errors; they are reported as
/// [`crate::StartOutcome`] values.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No registered transfer has the identifier.
    #[error("transfer not found")]
    NotFound {
        /// Missing transfer identifier.
        info_hash: InfoHash,
    },
    /// The transfer is already registered.
    #[error("transfer already registered")]
    AlreadyRegistered {
        /// Duplicate transfer identifier.
        info_hash: InfoHash,
    },
    /// The operation is refused while the runtime verifies on-disk data.
    #[error("transfer is checking data")]
    CheckingData {
        /// Operation identifier.
        operation: &'static str,
        /// Affected transfer.
        info_hash: InfoHash,
    },
    /// A per-file operation was rejected by the transfer.
    #[error("transfer file operation failed")]
    Transfer {
        /// Affected transfer.
        info_hash: InfoHash,
        /// Underlying failure.
        #[source]
        source: TransferError,
    },
    /// A collaborator call failed.
    #[error("transfer backend operation failed")]
    Backend {
        /// Operation identifier.
        operation: &'static str,
        /// Affected transfer.
        info_hash: InfoHash,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A policy update was rejected.
    #[error("queue policy update rejected")]
    Config {
        /// Underlying validation failure.
        #[from]
        source: ConfigError,
    },
    /// The scheduler service task is no longer running.
    #[error("scheduler service stopped")]
    ServiceStopped,
}

/// Convenience alias for scheduler operation results.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_source() {
        let err = SchedulerError::Backend {
            operation: "start",
            info_hash: InfoHash::new([0; 20]),
            source: anyhow::anyhow!("session closed").into(),
        };
        assert_eq!(err.to_string(), "transfer backend operation failed");
        assert_eq!(
            err.source().map(ToString::to_string).as_deref(),
            Some("session closed")
        );
    }

    #[test]
    fn config_errors_convert() {
        let err: SchedulerError = ConfigError::UnknownField {
            section: "queue_policy".into(),
            field: "bogus".into(),
        }
        .into();
        assert!(matches!(err, SchedulerError::Config { .. }));
    }
}
