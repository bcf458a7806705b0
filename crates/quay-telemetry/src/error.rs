//! Error types for telemetry operations.

use prometheus::Error as PrometheusError;
use thiserror::Error;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised while installing logging or exporting scheduler metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global tracing subscriber was already installed.
    #[error("failed to install tracing subscriber")]
    SubscriberInstall {
        /// Underlying tracing subscriber error.
        #[source]
        source: tracing_subscriber::util::TryInitError,
    },
    /// A scheduler collector could not be constructed.
    #[error("failed to build metrics collector `{name}`")]
    MetricsCollector {
        /// Metric identifier tied to the failure.
        name: &'static str,
        /// Underlying Prometheus error.
        #[source]
        source: PrometheusError,
    },
    /// A scheduler collector clashed with the registry.
    #[error("failed to register metrics collector `{name}`")]
    MetricsRegister {
        /// Metric identifier tied to the failure.
        name: &'static str,
        /// Underlying Prometheus error.
        #[source]
        source: PrometheusError,
    },
    /// The text exposition could not be written.
    #[error("failed to encode metrics")]
    MetricsEncode {
        /// Underlying Prometheus error.
        #[source]
        source: PrometheusError,
    },
    /// The text exposition was not UTF-8.
    #[error("metrics output was not valid utf-8")]
    MetricsUtf8 {
        /// Underlying UTF-8 conversion error.
        #[source]
        source: std::string::FromUtf8Error,
    },
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn collector_errors_name_the_metric() {
        let err = TelemetryError::MetricsRegister {
            name: "running_downloads",
            source: PrometheusError::AlreadyReg,
        };
        assert_eq!(
            err.to_string(),
            "failed to register metrics collector `running_downloads`"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn encoding_errors_keep_their_source() -> anyhow::Result<()> {
        let Err(utf8) = String::from_utf8(vec![0, 159]) else {
            anyhow::bail!("expected invalid utf-8");
        };
        let err = TelemetryError::MetricsUtf8 { source: utf8 };
        assert_eq!(err.to_string(), "metrics output was not valid utf-8");
        assert!(err.source().is_some());

        let err = TelemetryError::MetricsEncode {
            source: PrometheusError::Msg("closed".to_string()),
        };
        assert_eq!(err.to_string(), "failed to encode metrics");
        Ok(())
    }
}
