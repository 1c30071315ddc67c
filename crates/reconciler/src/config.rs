//! Configuration for the deletion worker.
//!
//! Defaults reproduce the broker's historical constants; every knob can be
//! overridden from the `[deletion]` table of the daemon's TOML file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::ErrorClassifier;

/// Fatal errors tolerated in one record before it is marked FAILED.
pub const MAX_FATAL_ERROR_RETRIES: u32 = 16;
/// Retryable errors and pending polls tolerated in one phase.
pub const MAX_RETRYABLE_ERROR_RETRIES: u32 = 8192;
/// Failed polls inside STOPPING/DELETING before the operation is re-issued.
pub const RETRIES_TO_RETRY: u32 = 32;
/// Records claimed per group per tick, and concurrent provider calls.
pub const MAX_DELETIONS_AT_ONCE: usize = 32;
/// Provider call time at which the delay rate reaches 2.
pub const OPERATION_DELAY_THRESHOLD: Duration = Duration::from_secs(2);
/// Upper bound of the delay rate.
pub const MAX_DELAY_RATE: f64 = 4.0;
/// Base interval between checks of one record.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(11);
/// Extra factor applied to the delay after a fatal error.
pub const FATAL_ERROR_INTERVAL_MULTIPLIER: u32 = 2;

// Keeps `now + delay` far away from chrono's representable range.
const MAX_CHECK_INTERVAL_SECS: u64 = 86_400;

/// Configuration for the deletion worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionConfig {
    /// Fatal errors tolerated before FAILED.
    #[serde(default = "default_max_fatal_error_retries")]
    pub max_fatal_error_retries: u32,

    /// Retryable errors tolerated in one phase before FAILED.
    #[serde(
        default = "default_max_retryable_error_retries",
        alias = "max_retrayable_error_retries"
    )]
    pub max_retryable_error_retries: u32,

    /// Failed polls before the stop/delete call is re-issued.
    #[serde(default = "default_retries_to_retry")]
    pub retries_to_retry: u32,

    /// Records claimed per group per tick and in-flight provider calls.
    #[serde(default = "default_max_deletions_at_once")]
    pub max_deletions_at_once: usize,

    /// Call duration, in milliseconds, that doubles the check interval.
    #[serde(default = "default_operation_delay_threshold_ms")]
    pub operation_delay_threshold_ms: u64,

    /// Cap on the delay rate.
    #[serde(default = "default_max_delay_rate")]
    pub max_delay_rate: f64,

    /// Base interval between checks, in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Delay factor after a fatal error.
    #[serde(default = "default_fatal_error_interval_multiplier")]
    pub fatal_error_interval_multiplier: u32,

    /// Per-call timeout, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// How long a claim stays exclusive, in seconds.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Period of the tick driver, in seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Regexes; an adapter failure whose message matches is fatal instead of
    /// retryable.
    #[serde(default)]
    pub permanent_error_patterns: Vec<String>,
}

fn default_max_fatal_error_retries() -> u32 {
    MAX_FATAL_ERROR_RETRIES
}

fn default_max_retryable_error_retries() -> u32 {
    MAX_RETRYABLE_ERROR_RETRIES
}

fn default_retries_to_retry() -> u32 {
    RETRIES_TO_RETRY
}

fn default_max_deletions_at_once() -> usize {
    MAX_DELETIONS_AT_ONCE
}

fn default_operation_delay_threshold_ms() -> u64 {
    2_000
}

fn default_max_delay_rate() -> f64 {
    MAX_DELAY_RATE
}

fn default_check_interval_secs() -> u64 {
    11
}

fn default_fatal_error_interval_multiplier() -> u32 {
    FATAL_ERROR_INTERVAL_MULTIPLIER
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_lease_ttl_secs() -> u64 {
    600
}

fn default_tick_interval_secs() -> u64 {
    7
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            max_fatal_error_retries: default_max_fatal_error_retries(),
            max_retryable_error_retries: default_max_retryable_error_retries(),
            retries_to_retry: default_retries_to_retry(),
            max_deletions_at_once: default_max_deletions_at_once(),
            operation_delay_threshold_ms: default_operation_delay_threshold_ms(),
            max_delay_rate: default_max_delay_rate(),
            check_interval_secs: default_check_interval_secs(),
            fatal_error_interval_multiplier: default_fatal_error_interval_multiplier(),
            operation_timeout_secs: default_operation_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            permanent_error_patterns: Vec::new(),
        }
    }
}

impl DeletionConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from a TOML document and validate it.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the document does not parse or fails
    /// validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = teardown_core::fs::parse_toml(content)
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_deletions_at_once == 0 {
            return Err(Error::invalid_config(
                "max_deletions_at_once must be greater than 0",
            ));
        }

        if self.check_interval_secs == 0 || self.check_interval_secs > MAX_CHECK_INTERVAL_SECS {
            return Err(Error::invalid_config(format!(
                "check_interval_secs must be between 1 and {MAX_CHECK_INTERVAL_SECS}"
            )));
        }

        if self.operation_delay_threshold_ms == 0 {
            return Err(Error::invalid_config(
                "operation_delay_threshold_ms must be greater than 0",
            ));
        }

        if !self.max_delay_rate.is_finite() || !(1.0..=100.0).contains(&self.max_delay_rate) {
            return Err(Error::invalid_config(
                "max_delay_rate must be between 1.0 and 100.0",
            ));
        }

        if !(1..=100).contains(&self.fatal_error_interval_multiplier) {
            return Err(Error::invalid_config(
                "fatal_error_interval_multiplier must be between 1 and 100",
            ));
        }

        if self.operation_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "operation_timeout_secs must be greater than 0",
            ));
        }

        if self.lease_ttl_secs <= self.operation_timeout_secs {
            return Err(Error::invalid_config(
                "lease_ttl_secs must exceed operation_timeout_secs",
            ));
        }

        if self.tick_interval_secs == 0 {
            return Err(Error::invalid_config(
                "tick_interval_secs must be greater than 0",
            ));
        }

        ErrorClassifier::from_patterns(&self.permanent_error_patterns).map(|_| ())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn operation_delay_threshold(&self) -> Duration {
        Duration::from_millis(self.operation_delay_threshold_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}
