//! Per-action settings, loaded once from the environment and validated up front.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use trackrelay_common::error::{RelayError, RelayResult};
use trackrelay_config::parse_var_or;

use super::models::RecordedAtField;

/// When the per-device watermark is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Oldest batch first; commit after every successful batch.
    #[default]
    PerBatch,
    /// Newest batch first; commit once after every batch succeeded.
    PerRun,
}

impl FromStr for CommitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_batch" => Ok(CommitPolicy::PerBatch),
            "per_run" => Ok(CommitPolicy::PerRun),
            other => Err(format!(
                "unknown commit policy '{other}' (expected per_batch or per_run)"
            )),
        }
    }
}

impl fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitPolicy::PerBatch => f.write_str("per_batch"),
            CommitPolicy::PerRun => f.write_str("per_run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutMode {
    #[default]
    Inline,
    Dispatched,
}

impl FromStr for FanOutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(FanOutMode::Inline),
            "dispatched" => Ok(FanOutMode::Dispatched),
            other => Err(format!(
                "unknown fan-out mode '{other}' (expected inline or dispatched)"
            )),
        }
    }
}

impl fmt::Display for FanOutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanOutMode::Inline => f.write_str("inline"),
            FanOutMode::Dispatched => f.write_str("dispatched"),
        }
    }
}

/// Account-level pull: how devices are enumerated and fanned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullObservationsConfig {
    pub recorded_at_field: RecordedAtField,
    pub fan_out: FanOutMode,
    /// Pause between devices when syncing inline.
    pub device_delay: Duration,
    pub dispatch_batch_size: usize,
    pub dispatch_batch_delay: Duration,
}

impl Default for PullObservationsConfig {
    fn default() -> Self {
        Self {
            recorded_at_field: RecordedAtField::FixTime,
            fan_out: FanOutMode::Inline,
            device_delay: Duration::from_secs(1),
            dispatch_batch_size: 20,
            dispatch_batch_delay: Duration::from_secs(10),
        }
    }
}

impl PullObservationsConfig {
    pub fn from_env() -> RelayResult<Self> {
        let defaults = Self::default();
        let config = Self {
            recorded_at_field: parse_var_or("RECORDED_AT_FIELD", defaults.recorded_at_field)?,
            fan_out: parse_var_or("FAN_OUT", defaults.fan_out)?,
            device_delay: Duration::from_secs(parse_var_or(
                "DEVICE_DELAY_SECS",
                defaults.device_delay.as_secs(),
            )?),
            dispatch_batch_size: parse_var_or("DISPATCH_BATCH_SIZE", defaults.dispatch_batch_size)?,
            dispatch_batch_delay: Duration::from_secs(parse_var_or(
                "DISPATCH_BATCH_DELAY_SECS",
                defaults.dispatch_batch_delay.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.dispatch_batch_size == 0 {
            return Err(RelayError::Validation(
                "DISPATCH_BATCH_SIZE must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-device cycle: fetch window, delivery batch size and commit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullObservationsPerDeviceConfig {
    pub observations_per_request: usize,
    pub lookback: chrono::Duration,
    pub commit_policy: CommitPolicy,
}

impl Default for PullObservationsPerDeviceConfig {
    fn default() -> Self {
        Self {
            observations_per_request: 500,
            lookback: chrono::Duration::hours(24),
            commit_policy: CommitPolicy::PerBatch,
        }
    }
}

impl PullObservationsPerDeviceConfig {
    pub fn from_env() -> RelayResult<Self> {
        let defaults = Self::default();
        let lookback_hours: i64 = parse_var_or("LOOKBACK_HOURS", defaults.lookback.num_hours())?;
        if lookback_hours <= 0 {
            return Err(RelayError::Validation(
                "LOOKBACK_HOURS must be positive".into(),
            ));
        }
        let lookback = chrono::Duration::try_hours(lookback_hours).ok_or_else(|| {
            RelayError::Validation(format!("LOOKBACK_HOURS {lookback_hours} is out of range"))
        })?;

        let config = Self {
            observations_per_request: parse_var_or(
                "OBSERVATIONS_PER_REQUEST",
                defaults.observations_per_request,
            )?,
            lookback,
            commit_policy: parse_var_or("COMMIT_POLICY", defaults.commit_policy)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.observations_per_request == 0 {
            return Err(RelayError::Validation(
                "OBSERVATIONS_PER_REQUEST must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSamplesConfig {
    pub observations_to_extract: usize,
}

impl Default for FetchSamplesConfig {
    fn default() -> Self {
        Self {
            observations_to_extract: 20,
        }
    }
}

impl FetchSamplesConfig {
    pub fn from_env() -> RelayResult<Self> {
        Ok(Self {
            observations_to_extract: parse_var_or(
                "OBSERVATIONS_TO_EXTRACT",
                Self::default().observations_to_extract,
            )?,
        })
    }
}
