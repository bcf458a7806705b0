//! Queue policy validation and normalisation.
//!
//! # Design
//! - `QueuePolicy` is owned by each scheduler instance; there is no process-wide state.
//! - Patches are JSON objects validated field by field; unknown keys are rejected.
//! - Normalisation clamps unusable values and records guard-rail warnings.

use std::time::Duration;

use quay_transfer_core::{PreviewSizes, SeedLimits};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Default concurrency quota for downloads and seeds.
pub const DEFAULT_MAX_RUNNING: u32 = 3;
/// Default free-space floor below which downloads are stopped (100 MiB).
pub const DEFAULT_MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;
/// Default interval between periodic policy checks.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 5;
/// Default bound on the shutdown barrier wait.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3_000;
/// Upper guard rail for the shutdown barrier wait.
pub const MAX_SHUTDOWN_TIMEOUT_MS: u64 = 60_000;

const SECTION: &str = "queue_policy";

/// Errors raised while validating policy updates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Section that failed validation.
        section: String,
        /// Field that failed validation.
        field: String,
        /// Human-readable reason for the failure.
        message: String,
    },
    /// Field did not exist in the target section.
    #[error("unknown configuration field")]
    UnknownField {
        /// Section where the unknown field was encountered.
        section: String,
        /// Name of the unexpected field.
        field: String,
    },
}

/// What happens to a seeding transfer that reaches a seeding limit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    /// Stop the transfer; it is no longer managed by the queue.
    #[default]
    Stop,
    /// Return the transfer to the queue; admission skips it while over the limit.
    Queue,
}

impl LimitAction {
    /// Render the action as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Queue => "queue",
        }
    }
}

/// Free-space policy for downloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiskSpacePolicy {
    /// Whether free-space probes run at all.
    pub enabled: bool,
    /// Running downloads are stopped below this many free bytes.
    pub min_free_bytes: u64,
}

impl Default for DiskSpacePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueuePolicy {
    /// Maximum simultaneous downloads; 0 means unlimited.
    pub max_downloads: u32,
    /// Maximum simultaneous seeds; 0 means unlimited.
    pub max_seeds: u32,
    /// Whether finished downloads keep running as seeds.
    pub keep_seeding: bool,
    /// Free-space policy.
    pub disk: DiskSpacePolicy,
    /// Action taken when the share-ratio limit is reached.
    pub ratio_limit_action: LimitAction,
    /// Action taken when the seed-time limit is reached.
    pub seed_time_limit_action: LimitAction,
    /// Limits used for transfers without their own.
    pub default_seed_limits: Option<SeedLimits>,
    /// Leading bytes required before a media file can be previewed.
    pub preview: PreviewSizes,
    /// Seconds between periodic policy checks.
    pub check_interval_secs: u64,
    /// Milliseconds to wait for stop announces during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_downloads: DEFAULT_MAX_RUNNING,
            max_seeds: DEFAULT_MAX_RUNNING,
            keep_seeding: true,
            disk: DiskSpacePolicy::default(),
            ratio_limit_action: LimitAction::Stop,
            seed_time_limit_action: LimitAction::Stop,
            default_seed_limits: None,
            preview: PreviewSizes::default(),
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl QueuePolicy {
    /// Interval between periodic policy checks.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Bound on the shutdown barrier wait.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Policy after guard rails were applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectivePolicy {
    /// Clamped policy used by the scheduler.
    pub policy: QueuePolicy,
    /// Guard-rail or normalisation warnings applied to the policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Outcome of validating and normalising a policy patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMutation {
    /// Effective policy after the patch.
    pub effective: EffectivePolicy,
    /// Whether any field changed.
    pub mutated: bool,
}

/// Produce the effective policy for inspection and runtime application.
#[must_use]
pub fn normalize_policy(policy: &QueuePolicy) -> EffectivePolicy {
    let mut warnings = Vec::new();
    let mut effective = policy.clone();

    effective.default_seed_limits = policy
        .default_seed_limits
        .map(|limits| sanitize_seed_limits(limits, &mut warnings))
        .filter(|limits| !limits.is_unlimited());

    if policy.check_interval_secs == 0 {
        warnings.push(format!(
            "check_interval_secs of 0 requested; using {DEFAULT_CHECK_INTERVAL_SECS}"
        ));
        effective.check_interval_secs = DEFAULT_CHECK_INTERVAL_SECS;
    }

    if policy.shutdown_timeout_ms == 0 {
        warnings.push(format!(
            "shutdown_timeout_ms of 0 requested; using {DEFAULT_SHUTDOWN_TIMEOUT_MS}"
        ));
        effective.shutdown_timeout_ms = DEFAULT_SHUTDOWN_TIMEOUT_MS;
    } else if policy.shutdown_timeout_ms > MAX_SHUTDOWN_TIMEOUT_MS {
        warnings.push(format!(
            "shutdown_timeout_ms of {} exceeds guard rail; clamping to {MAX_SHUTDOWN_TIMEOUT_MS}",
            policy.shutdown_timeout_ms
        ));
        effective.shutdown_timeout_ms = MAX_SHUTDOWN_TIMEOUT_MS;
    }

    if policy.disk.enabled && policy.disk.min_free_bytes == 0 {
        warnings.push("disk.min_free_bytes is 0; low disk space stops are disabled".to_string());
    }

    EffectivePolicy {
        policy: effective,
        warnings,
    }
}

/// Validate a JSON object patch against `current` and normalise the result.
///
/// # Errors
///
/// Returns `ConfigError` when the patch is not an object, names an unknown
/// field, or carries a value of the wrong type.
pub fn apply_policy_patch(
    current: &QueuePolicy,
    patch: &Value,
) -> Result<PolicyMutation, ConfigError> {
    let map = ensure_object(patch, SECTION, "<root>")?;

    let mut working = current.clone();
    let mut touched = false;
    for (key, value) in map {
        touched |= apply_field(&mut working, key, value)?;
    }

    let effective = normalize_policy(&working);
    let mutated = touched || effective.policy != *current;
    Ok(PolicyMutation { effective, mutated })
}

fn apply_field(working: &mut QueuePolicy, key: &str, value: &Value) -> Result<bool, ConfigError> {
    match key {
        "max_downloads" => Ok(assign_if_changed(
            &mut working.max_downloads,
            required_u32(value, SECTION, key)?,
        )),
        "max_seeds" => Ok(assign_if_changed(
            &mut working.max_seeds,
            required_u32(value, SECTION, key)?,
        )),
        "keep_seeding" => Ok(assign_if_changed(
            &mut working.keep_seeding,
            required_bool(value, SECTION, key)?,
        )),
        "disk" => apply_disk_fields(&mut working.disk, value),
        "ratio_limit_action" => Ok(assign_if_changed(
            &mut working.ratio_limit_action,
            parse_limit_action(value, key)?,
        )),
        "seed_time_limit_action" => Ok(assign_if_changed(
            &mut working.seed_time_limit_action,
            parse_limit_action(value, key)?,
        )),
        "default_seed_limits" => Ok(assign_if_changed(
            &mut working.default_seed_limits,
            parse_seed_limits(value)?,
        )),
        "preview" => apply_preview_fields(&mut working.preview, value),
        "check_interval_secs" => Ok(assign_if_changed(
            &mut working.check_interval_secs,
            required_u64(value, SECTION, key)?,
        )),
        "shutdown_timeout_ms" => Ok(assign_if_changed(
            &mut working.shutdown_timeout_ms,
            required_u64(value, SECTION, key)?,
        )),
        other => Err(ConfigError::UnknownField {
            section: SECTION.to_string(),
            field: other.to_string(),
        }),
    }
}

fn apply_disk_fields(disk: &mut DiskSpacePolicy, value: &Value) -> Result<bool, ConfigError> {
    const DISK: &str = "queue_policy.disk";
    let mut touched = false;
    for (key, value) in ensure_object(value, SECTION, "disk")? {
        touched |= match key.as_str() {
            "enabled" => assign_if_changed(&mut disk.enabled, required_bool(value, DISK, key)?),
            "min_free_bytes" => {
                assign_if_changed(&mut disk.min_free_bytes, required_u64(value, DISK, key)?)
            }
            other => {
                return Err(ConfigError::UnknownField {
                    section: DISK.to_string(),
                    field: other.to_string(),
                });
            }
        };
    }
    Ok(touched)
}

fn apply_preview_fields(preview: &mut PreviewSizes, value: &Value) -> Result<bool, ConfigError> {
    const PREVIEW: &str = "queue_policy.preview";
    let mut touched = false;
    for (key, value) in ensure_object(value, SECTION, "preview")? {
        touched |= match key.as_str() {
            "audio_bytes" => {
                assign_if_changed(&mut preview.audio_bytes, required_u64(value, PREVIEW, key)?)
            }
            "video_bytes" => {
                assign_if_changed(&mut preview.video_bytes, required_u64(value, PREVIEW, key)?)
            }
            other => {
                return Err(ConfigError::UnknownField {
                    section: PREVIEW.to_string(),
                    field: other.to_string(),
                });
            }
        };
    }
    Ok(touched)
}

fn parse_limit_action(value: &Value, field: &str) -> Result<LimitAction, ConfigError> {
    match value.as_str() {
        Some("stop") => Ok(LimitAction::Stop),
        Some("queue") => Ok(LimitAction::Queue),
        _ => Err(invalid(SECTION, field, "must be \"stop\" or \"queue\"")),
    }
}

fn parse_seed_limits(value: &Value) -> Result<Option<SeedLimits>, ConfigError> {
    const LIMITS: &str = "queue_policy.default_seed_limits";
    if value.is_null() {
        return Ok(None);
    }
    let mut limits = SeedLimits::default();
    for (key, value) in ensure_object(value, SECTION, "default_seed_limits")? {
        match key.as_str() {
            "max_share_ratio" if value.is_null() => limits.max_share_ratio = None,
            "max_share_ratio" => {
                let Some(ratio) = value.as_f64() else {
                    return Err(invalid(LIMITS, key, "must be a number"));
                };
                limits.max_share_ratio = Some(ratio);
            }
            "max_seed_time_secs" if value.is_null() => limits.max_seed_time_secs = None,
            "max_seed_time_secs" => {
                limits.max_seed_time_secs = Some(required_u64(value, LIMITS, key)?);
            }
            other => {
                return Err(ConfigError::UnknownField {
                    section: LIMITS.to_string(),
                    field: other.to_string(),
                });
            }
        }
    }
    Ok(Some(limits))
}

fn sanitize_seed_limits(limits: SeedLimits, warnings: &mut Vec<String>) -> SeedLimits {
    let max_share_ratio = match limits.max_share_ratio {
        Some(ratio) if ratio.is_finite() && ratio > 0.0 => Some(ratio),
        Some(ratio) => {
            warnings.push(format!(
                "default max_share_ratio {ratio} is not a positive number; disabling limit"
            ));
            None
        }
        None => None,
    };
    let max_seed_time_secs = match limits.max_seed_time_secs {
        Some(0) => {
            warnings.push("default max_seed_time_secs of 0 requested; disabling limit".to_string());
            None
        }
        other => other,
    };
    SeedLimits {
        max_share_ratio,
        max_seed_time_secs,
    }
}

fn ensure_object<'a>(
    value: &'a Value,
    section: &str,
    field: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| invalid(section, field, "must be a JSON object"))
}

fn required_bool(value: &Value, section: &str, field: &str) -> Result<bool, ConfigError> {
    value
        .as_bool()
        .ok_or_else(|| invalid(section, field, "must be a boolean"))
}

fn required_u64(value: &Value, section: &str, field: &str) -> Result<u64, ConfigError> {
    value
        .as_u64()
        .ok_or_else(|| invalid(section, field, "must be a non-negative integer"))
}

fn required_u32(value: &Value, section: &str, field: &str) -> Result<u32, ConfigError> {
    let raw = required_u64(value, section, field)?;
    u32::try_from(raw).map_err(|_| invalid(section, field, "must fit within 32 bits"))
}

fn invalid(section: &str, field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidField {
        section: section.to_string(),
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn assign_if_changed<T>(target: &mut T, value: T) -> bool
where
    T: PartialEq,
{
    if *target == value {
        false
    } else {
        *target = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let policy = QueuePolicy::default();
        assert_eq!(policy.max_downloads, 3);
        assert_eq!(policy.max_seeds, 3);
        assert!(policy.keep_seeding);
        assert_eq!(policy.disk.min_free_bytes, 100 * 1024 * 1024);
        assert_eq!(policy.check_interval(), Duration::from_secs(5));
        assert_eq!(policy.shutdown_timeout(), Duration::from_millis(3_000));
        assert!(normalize_policy(&policy).warnings.is_empty());
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: QueuePolicy =
            serde_json::from_value(json!({"max_downloads": 1, "ratio_limit_action": "queue"}))
                .expect("valid policy");
        assert_eq!(policy.max_downloads, 1);
        assert_eq!(policy.max_seeds, 3);
        assert_eq!(policy.ratio_limit_action, LimitAction::Queue);
    }

    #[test]
    fn normalisation_clamps_unusable_values() {
        let policy = QueuePolicy {
            check_interval_secs: 0,
            shutdown_timeout_ms: MAX_SHUTDOWN_TIMEOUT_MS + 1,
            default_seed_limits: Some(SeedLimits {
                max_share_ratio: Some(f64::NAN),
                max_seed_time_secs: Some(0),
            }),
            ..QueuePolicy::default()
        };
        let effective = normalize_policy(&policy);
        assert_eq!(effective.policy.check_interval_secs, DEFAULT_CHECK_INTERVAL_SECS);
        assert_eq!(effective.policy.shutdown_timeout_ms, MAX_SHUTDOWN_TIMEOUT_MS);
        assert_eq!(effective.policy.default_seed_limits, None);
        assert_eq!(effective.warnings.len(), 4);
    }

    #[test]
    fn patch_rejects_unknown_fields() {
        let policy = QueuePolicy::default();
        assert_eq!(
            apply_policy_patch(&policy, &json!({"unknown": true})),
            Err(ConfigError::UnknownField {
                section: "queue_policy".into(),
                field: "unknown".into(),
            })
        );
        assert!(matches!(
            apply_policy_patch(&policy, &json!({"disk": {"quota": 1}})),
            Err(ConfigError::UnknownField { .. })
        ));
    }

    #[test]
    fn patch_rejects_type_violations() {
        let policy = QueuePolicy::default();
        for patch in [
            json!([]),
            json!({"max_downloads": -1}),
            json!({"max_seeds": "3"}),
            json!({"keep_seeding": 1}),
            json!({"ratio_limit_action": "pause"}),
            json!({"default_seed_limits": {"max_share_ratio": "2"}}),
            json!({"preview": 5}),
        ] {
            assert!(
                matches!(
                    apply_policy_patch(&policy, &patch),
                    Err(ConfigError::InvalidField { .. })
                ),
                "patch {patch} should be rejected"
            );
        }
    }

    #[test]
    fn patch_applies_nested_fields() {
        let policy = QueuePolicy::default();
        let mutation = apply_policy_patch(
            &policy,
            &json!({
                "max_downloads": 5,
                "disk": {"min_free_bytes": 1024},
                "preview": {"video_bytes": 4096},
                "seed_time_limit_action": "queue",
                "default_seed_limits": {"max_share_ratio": 1.5}
            }),
        )
        .expect("valid patch");
        assert!(mutation.mutated);
        let patched = mutation.effective.policy;
        assert_eq!(patched.max_downloads, 5);
        assert_eq!(patched.disk.min_free_bytes, 1024);
        assert!(patched.disk.enabled);
        assert_eq!(patched.preview.video_bytes, 4096);
        assert_eq!(patched.seed_time_limit_action, LimitAction::Queue);
        assert_eq!(
            patched.default_seed_limits,
            Some(SeedLimits {
                max_share_ratio: Some(1.5),
                max_seed_time_secs: None,
            })
        );
    }

    #[test]
    fn unchanged_patch_is_not_a_mutation() {
        let policy = QueuePolicy::default();
        let mutation =
            apply_policy_patch(&policy, &json!({"max_downloads": 3})).expect("valid patch");
        assert!(!mutation.mutated);
    }
}
