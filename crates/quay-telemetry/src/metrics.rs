//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the gauges and counters the admission scheduler maintains.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    events_emitted_total: IntCounterVec,
    policy_stops_total: IntCounterVec,
    running_downloads: IntGauge,
    running_seeds: IntGauge,
    queued_transfers: IntGauge,
    paused: IntGauge,
    admission_passes_total: IntCounter,
    low_disk_space_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Transfers currently downloading.
    pub running_downloads: i64,
    /// Transfers currently seeding.
    pub running_seeds: i64,
    /// Transfers waiting for admission.
    pub queued_transfers: i64,
    /// Whether the global pause switch is engaged.
    pub paused: bool,
    /// Admission passes executed.
    pub admission_passes_total: u64,
    /// Low disk space notifications raised.
    pub low_disk_space_total: u64,
}

fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_emitted_total = counter_vec(
            "events_emitted_total",
            "Domain events emitted by type",
            &["type"],
        )?;
        let policy_stops_total = counter_vec(
            "policy_stops_total",
            "Transfers stopped or re-queued by periodic policy checks",
            &["reason"],
        )?;
        let running_downloads = gauge("running_downloads", "Transfers currently downloading")?;
        let running_seeds = gauge("running_seeds", "Transfers currently seeding")?;
        let queued_transfers = gauge("queued_transfers", "Transfers waiting for admission")?;
        let paused = gauge("scheduler_paused", "Whether the global pause switch is on")?;
        let admission_passes_total =
            counter("admission_passes_total", "Admission passes executed")?;
        let low_disk_space_total = counter(
            "low_disk_space_total",
            "Low disk space notifications raised",
        )?;

        register(&registry, "events_emitted_total", &events_emitted_total)?;
        register(&registry, "policy_stops_total", &policy_stops_total)?;
        register(&registry, "running_downloads", &running_downloads)?;
        register(&registry, "running_seeds", &running_seeds)?;
        register(&registry, "queued_transfers", &queued_transfers)?;
        register(&registry, "scheduler_paused", &paused)?;
        register(&registry, "admission_passes_total", &admission_passes_total)?;
        register(&registry, "low_disk_space_total", &low_disk_space_total)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                events_emitted_total,
                policy_stops_total,
                running_downloads,
                running_seeds,
                queued_transfers,
                paused,
                admission_passes_total,
                low_disk_space_total,
            }),
        })
    }

    /// Increment the emitted event counter for the specific event type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Count a transfer stopped by a periodic policy check.
    pub fn inc_policy_stop(&self, reason: &str) {
        self.inner
            .policy_stops_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Count one admission pass.
    pub fn inc_admission_pass(&self) {
        self.inner.admission_passes_total.inc();
    }

    /// Count one low disk space notification.
    pub fn inc_low_disk_space(&self) {
        self.inner.low_disk_space_total.inc();
    }

    /// Publish the current queue occupancy.
    pub fn set_queue_counts(&self, downloads: usize, seeds: usize, queued: usize) {
        self.inner.running_downloads.set(Self::count_to_i64(downloads));
        self.inner.running_seeds.set(Self::count_to_i64(seeds));
        self.inner.queued_transfers.set(Self::count_to_i64(queued));
    }

    /// Publish the global pause switch.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.set(i64::from(paused));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            running_downloads: self.inner.running_downloads.get(),
            running_seeds: self.inner.running_seeds.get(),
            queued_transfers: self.inner.queued_transfers.get(),
            paused: self.inner.paused.get() != 0,
            admission_passes_total: self.inner.admission_passes_total.get(),
            low_disk_space_total: self.inner.low_disk_space_total.get(),
        }
    }

    fn count_to_i64(count: usize) -> i64 {
        i64::try_from(count).unwrap_or(i64::MAX)
    }
}
