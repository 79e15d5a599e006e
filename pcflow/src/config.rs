//! Orchestrator configuration.
//!
//! Every field has a serde default, so a partial JSON document (or none at
//! all) yields a usable configuration. A handful of knobs can be overridden
//! from `PCFLOW_*` environment variables.

use crate::container::{BackoffStrategy, BinaryInfo, JitterStrategy, RetryConfig, StaticBinaryResolver};
use crate::core::Phase;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Container binaries launched by the stages and phases.
pub mod binaries {
    /// Splits the raw input into shards.
    pub const SHARDER: &str = "data_processing/sharder";
    /// Prepares a shard for the PID protocol.
    pub const PID_PREPARER: &str = "data_processing/pid_preparer";
    /// Publisher side of the PID protocol.
    pub const PID_SERVER: &str = "pid/private-id-server";
    /// Partner side of the PID protocol.
    pub const PID_CLIENT: &str = "pid/private-id-client";
    /// Joins matched ids onto the party's data.
    pub const ID_COMBINER: &str = "data_processing/id_combiner";
    /// The joint secure computation.
    pub const COMPUTE: &str = "private_compute/compute";
    /// Per-shard result aggregation.
    pub const AGGREGATOR: &str = "private_compute/shard_aggregator";
    /// Result publishing.
    pub const POST_PROCESSOR: &str = "post_processing/post_processor";

    /// Every binary the engine may launch.
    pub const ALL: [&str; 8] = [
        SHARDER,
        PID_PREPARER,
        PID_SERVER,
        PID_CLIENT,
        ID_COMBINER,
        COMPUTE,
        AGGREGATOR,
        POST_PROCESSOR,
    ];
}

/// Per-phase container timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    /// Id matching; can legitimately run for hours.
    #[serde(default = "default_id_match_timeout")]
    pub id_match_seconds: u64,
    /// Data preparation.
    #[serde(default = "default_prepare_timeout")]
    pub prepare_seconds: u64,
    /// Joint computation.
    #[serde(default = "default_compute_timeout")]
    pub compute_seconds: u64,
    /// Aggregation.
    #[serde(default = "default_aggregate_timeout")]
    pub aggregate_seconds: u64,
    /// Post-processing.
    #[serde(default = "default_post_process_timeout")]
    pub post_process_seconds: u64,
}

fn default_id_match_timeout() -> u64 {
    12 * 60 * 60
}

fn default_prepare_timeout() -> u64 {
    2 * 60 * 60
}

fn default_compute_timeout() -> u64 {
    3 * 60 * 60
}

fn default_aggregate_timeout() -> u64 {
    2 * 60 * 60
}

fn default_post_process_timeout() -> u64 {
    60 * 60
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            id_match_seconds: default_id_match_timeout(),
            prepare_seconds: default_prepare_timeout(),
            compute_seconds: default_compute_timeout(),
            aggregate_seconds: default_aggregate_timeout(),
            post_process_seconds: default_post_process_timeout(),
        }
    }
}

impl PhaseTimeouts {
    /// The same timeout for every phase.
    #[must_use]
    pub fn uniform(seconds: u64) -> Self {
        Self {
            id_match_seconds: seconds,
            prepare_seconds: seconds,
            compute_seconds: seconds,
            aggregate_seconds: seconds,
            post_process_seconds: seconds,
        }
    }

    /// Timeout for a phase.
    #[must_use]
    pub fn for_phase(&self, phase: Phase) -> Duration {
        let seconds = match phase {
            Phase::IdMatch => self.id_match_seconds,
            Phase::Prepare => self.prepare_seconds,
            Phase::Compute => self.compute_seconds,
            Phase::Aggregate => self.aggregate_seconds,
            Phase::PostProcess => self.post_process_seconds,
        };
        Duration::from_secs(seconds)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Sleep between container status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// Fixed wait before retrying a throttled container start.
    #[serde(default = "default_throttle_backoff")]
    pub throttle_backoff_seconds: f64,
    /// Cap on the growing backoffs.
    #[serde(default = "default_throttle_max_backoff")]
    pub throttle_max_backoff_seconds: f64,
    /// How the backoff grows between attempts.
    #[serde(default)]
    pub throttle_backoff_strategy: BackoffStrategy,
    /// Randomization applied to each backoff.
    #[serde(default)]
    pub throttle_jitter: JitterStrategy,
    /// Start attempts including the first one.
    #[serde(default = "default_throttle_max_attempts")]
    pub throttle_max_attempts: usize,
    /// Do not wait on the containers of the last remaining graph stage.
    #[serde(default)]
    pub detach_final_stage: bool,
    /// Retry only the containers of a failed phase that did not complete.
    #[serde(default)]
    pub partial_container_retry_enabled: bool,
    /// How long a partner waits for publisher addresses.
    #[serde(default = "default_address_wait")]
    pub address_wait_seconds: f64,
    /// Per-phase container timeouts.
    #[serde(default)]
    pub phase_timeouts: PhaseTimeouts,
    /// Binary name to deployment details.
    #[serde(default = "default_binaries")]
    pub binaries: HashMap<String, BinaryInfo>,
    /// Environment passed to every container.
    #[serde(default)]
    pub container_env: HashMap<String, String>,
}

fn default_poll_interval() -> f64 {
    5.0
}

fn default_throttle_backoff() -> f64 {
    30.0
}

fn default_throttle_max_backoff() -> f64 {
    300.0
}

fn default_throttle_max_attempts() -> usize {
    2
}

fn default_address_wait() -> f64 {
    600.0
}

fn default_binaries() -> HashMap<String, BinaryInfo> {
    binaries::ALL
        .iter()
        .map(|name| ((*name).to_string(), BinaryInfo::new("latest")))
        .collect()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            throttle_backoff_seconds: default_throttle_backoff(),
            throttle_max_backoff_seconds: default_throttle_max_backoff(),
            throttle_backoff_strategy: BackoffStrategy::default(),
            throttle_jitter: JitterStrategy::default(),
            throttle_max_attempts: default_throttle_max_attempts(),
            detach_final_stage: false,
            partial_container_retry_enabled: false,
            address_wait_seconds: default_address_wait(),
            phase_timeouts: PhaseTimeouts::default(),
            binaries: default_binaries(),
            container_env: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Applies `PCFLOW_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("PCFLOW_POLL_INTERVAL_SECONDS") {
            self.poll_interval_seconds = parse_env("PCFLOW_POLL_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("PCFLOW_THROTTLE_BACKOFF_SECONDS") {
            self.throttle_backoff_seconds = parse_env("PCFLOW_THROTTLE_BACKOFF_SECONDS", &v)?;
        }
        if let Some(v) = lookup("PCFLOW_THROTTLE_BACKOFF_STRATEGY") {
            self.throttle_backoff_strategy = parse_env_enum("PCFLOW_THROTTLE_BACKOFF_STRATEGY", &v)?;
        }
        if let Some(v) = lookup("PCFLOW_THROTTLE_JITTER") {
            self.throttle_jitter = parse_env_enum("PCFLOW_THROTTLE_JITTER", &v)?;
        }
        if let Some(v) = lookup("PCFLOW_DETACH_FINAL_STAGE") {
            self.detach_final_stage = parse_env("PCFLOW_DETACH_FINAL_STAGE", &v)?;
        }
        if let Some(v) = lookup("PCFLOW_PARTIAL_CONTAINER_RETRY") {
            self.partial_container_retry_enabled =
                parse_env("PCFLOW_PARTIAL_CONTAINER_RETRY", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll = seconds_field("poll_interval_seconds", self.poll_interval_seconds)?;
        if poll.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval_seconds".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        seconds_field("throttle_backoff_seconds", self.throttle_backoff_seconds)?;
        seconds_field("throttle_max_backoff_seconds", self.throttle_max_backoff_seconds)?;
        if self.throttle_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "throttle_max_attempts".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        seconds_field("address_wait_seconds", self.address_wait_seconds)?;
        Ok(())
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: f64) -> Self {
        self.poll_interval_seconds = seconds;
        self
    }

    /// Sets the throttling backoff.
    #[must_use]
    pub fn with_throttle_backoff_seconds(mut self, seconds: f64) -> Self {
        self.throttle_backoff_seconds = seconds;
        self
    }

    /// Sets how throttled start backoffs grow and are randomized.
    #[must_use]
    pub fn with_throttle_strategy(mut self, backoff: BackoffStrategy, jitter: JitterStrategy) -> Self {
        self.throttle_backoff_strategy = backoff;
        self.throttle_jitter = jitter;
        self
    }

    /// Enables or disables detaching the final graph stage.
    #[must_use]
    pub fn with_detach_final_stage(mut self, detach: bool) -> Self {
        self.detach_final_stage = detach;
        self
    }

    /// Enables or disables partial container retry.
    #[must_use]
    pub fn with_partial_container_retry(mut self, enabled: bool) -> Self {
        self.partial_container_retry_enabled = enabled;
        self
    }

    /// Sets the phase timeouts.
    #[must_use]
    pub fn with_phase_timeouts(mut self, timeouts: PhaseTimeouts) -> Self {
        self.phase_timeouts = timeouts;
        self
    }

    /// Sets the address wait.
    #[must_use]
    pub fn with_address_wait_seconds(mut self, seconds: f64) -> Self {
        self.address_wait_seconds = seconds;
        self
    }

    /// The poll interval.
    ///
    /// Values [`validate`](Self::validate) would reject fall back to the
    /// default.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        seconds_field("poll_interval_seconds", self.poll_interval_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| fallback("poll_interval_seconds", default_poll_interval()))
    }

    /// How long a partner waits for publisher addresses.
    #[must_use]
    pub fn address_wait(&self) -> Duration {
        seconds_field("address_wait_seconds", self.address_wait_seconds)
            .unwrap_or_else(|_| fallback("address_wait_seconds", default_address_wait()))
    }

    /// Retry policy for throttled container starts.
    #[must_use]
    pub fn start_retry(&self) -> RetryConfig {
        let backoff = seconds_field("throttle_backoff_seconds", self.throttle_backoff_seconds)
            .unwrap_or_else(|_| fallback("throttle_backoff_seconds", default_throttle_backoff()));
        let max_backoff =
            seconds_field("throttle_max_backoff_seconds", self.throttle_max_backoff_seconds)
                .unwrap_or_else(|_| {
                    fallback("throttle_max_backoff_seconds", default_throttle_max_backoff())
                })
                .max(backoff);

        RetryConfig::throttling(backoff)
            .with_max_attempts(self.throttle_max_attempts.max(1))
            .with_max_delay_ms(u64::try_from(max_backoff.as_millis()).unwrap_or(u64::MAX))
            .with_backoff(self.throttle_backoff_strategy)
            .with_jitter(self.throttle_jitter)
    }

    /// Resolver over the configured binaries.
    #[must_use]
    pub fn binary_resolver(&self) -> StaticBinaryResolver {
        StaticBinaryResolver::new(self.binaries.clone())
    }
}

/// A non-negative, finite number of seconds that fits a [`Duration`].
fn seconds_field(field: &str, seconds: f64) -> Result<Duration, ConfigError> {
    if !seconds.is_finite() {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("must be finite, got {seconds}"),
        });
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| ConfigError::Invalid {
        field: field.to_string(),
        reason: format!("{seconds}: {e}"),
    })
}

fn fallback(field: &str, default_seconds: f64) -> Duration {
    warn!(field, default_seconds, "Invalid duration in configuration, using default");
    Duration::from_secs_f64(default_seconds)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field: key.to_string(),
        reason: format!("cannot parse '{value}'"),
    })
}

fn parse_env_enum<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).map_err(|_| {
        ConfigError::Invalid {
            field: key.to_string(),
            reason: format!("unknown value '{value}'"),
        }
    })
}
