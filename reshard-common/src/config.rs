//! Explicit configuration passed into the coordinator and every reconfiguration entry point.
//!
//! Every struct implements `Default` with the values the reconfiguration pipeline uses when no
//! override is given, and deserializes from JSON with missing fields falling back to defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, ReshardResult};

/// Default byte cap for one extracted chunk when callers pass `-1`.
pub const DEFAULT_EXTRACT_LIMIT_BYTES: u64 = 1024 * 1024;

/// Default width (in keys) of one cold slice.
pub const DEFAULT_COLD_PARTITION_WIDTH: u64 = 1000;

/// Placement optimizer knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Cold tuples are redistributed in slices of this many keys.
    pub cold_partition_width: u64,
    /// Wall-clock budget for one placement search, in seconds.
    pub time_limit_secs: u64,
    /// Fitness penalty per unit of access weight moved off its current partition.
    pub move_penalty: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            cold_partition_width: DEFAULT_COLD_PARTITION_WIDTH,
            time_limit_secs: 10,
            move_penalty: 0.01,
        }
    }
}

impl PlacementConfig {
    /// Search deadline derived from `time_limit_secs`.
    #[must_use]
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
}

/// Population-based search knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Individuals per generation.
    pub population_size: usize,
    /// Generation budget.
    pub generations: usize,
    /// Per-gene probability of being reassigned to a random partition.
    pub mutation_rate: f64,
    /// Probability that two parents are recombined instead of copied.
    pub crossover_rate: f64,
    /// Best individuals copied unchanged into the next generation.
    pub elite_count: usize,
    /// Fixed RNG seed. `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Progress is reported every `log_interval` generations.
    pub log_interval: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            population_size: 64,
            generations: 100,
            mutation_rate: 0.02,
            crossover_rate: 0.8,
            elite_count: 2,
            seed: None,
            log_interval: 10,
        }
    }
}

/// Chunked extraction knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Byte cap used when a caller requests the engine default (`-1`).
    pub default_limit_bytes: u64,
    /// How many times one failed chunk is rolled back and re-extracted before giving up.
    pub max_chunk_retries: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            default_limit_bytes: DEFAULT_EXTRACT_LIMIT_BYTES,
            max_chunk_retries: 3,
        }
    }
}

/// Queue policy for pipeline consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Producer never blocks on enqueue.
    #[default]
    Unbounded,
    /// Producer blocks once the consumer already holds this many items.
    Bounded(usize),
}

/// Fan-out pipeline knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Consumer queue policy.
    pub queue: QueuePolicy,
}

/// Dependency rendezvous knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Bounded wait for one `await_value` attempt, in milliseconds.
    pub wait_timeout_ms: u64,
    /// Attempts before a missing dependency is escalated as an error.
    pub max_attempts: u32,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 100,
            max_attempts: 50,
        }
    }
}

impl RendezvousConfig {
    /// One wait attempt as a `Duration`.
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Full reconfiguration configuration handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReshardConfig {
    /// Placement optimizer knobs.
    pub placement: PlacementConfig,
    /// Search knobs.
    pub search: SearchConfig,
    /// Extraction knobs.
    pub extract: ExtractConfig,
    /// Pipeline knobs.
    pub pipeline: PipelineConfig,
    /// Rendezvous knobs.
    pub rendezvous: RendezvousConfig,
}

impl ReshardConfig {
    /// Parses a JSON configuration document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when the payload is not valid JSON for this shape and
    /// `ReshardError::InvalidConfig` when a value is out of range.
    pub fn from_json(payload: &str) -> ReshardResult<Self> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make an entry point loop forever or divide by zero.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> ReshardResult<()> {
        if self.placement.cold_partition_width == 0 {
            return Err(ReshardError::InvalidConfig(
                "placement.cold_partition_width must be positive",
            ));
        }
        if !(self.placement.move_penalty >= 0.0) {
            return Err(ReshardError::InvalidConfig(
                "placement.move_penalty must be non-negative",
            ));
        }
        if self.search.population_size < 2 {
            return Err(ReshardError::InvalidConfig(
                "search.population_size must be at least 2",
            ));
        }
        if self.search.elite_count >= self.search.population_size {
            return Err(ReshardError::InvalidConfig(
                "search.elite_count must be smaller than search.population_size",
            ));
        }
        if !(0.0..=1.0).contains(&self.search.mutation_rate)
            || !(0.0..=1.0).contains(&self.search.crossover_rate)
        {
            return Err(ReshardError::InvalidConfig(
                "search rates must be within [0, 1]",
            ));
        }
        if self.extract.default_limit_bytes == 0 {
            return Err(ReshardError::InvalidConfig(
                "extract.default_limit_bytes must be positive",
            ));
        }
        if self.pipeline.queue == QueuePolicy::Bounded(0) {
            return Err(ReshardError::InvalidConfig(
                "pipeline bounded queue capacity must be positive",
            ));
        }
        if self.rendezvous.max_attempts == 0 {
            return Err(ReshardError::InvalidConfig(
                "rendezvous.max_attempts must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{QueuePolicy, ReshardConfig};
    use crate::error::ReshardError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn default_config_is_valid() {
        assert_that!(ReshardConfig::default().validate().is_ok(), eq(true));
    }

    #[rstest]
    fn partial_json_keeps_defaults() {
        let config = ReshardConfig::from_json(
            r#"{"extract": {"default_limit_bytes": 2048}, "pipeline": {"queue": {"bounded": 8}}}"#,
        )
        .expect("config should parse");
        assert_that!(config.extract.default_limit_bytes, eq(2048_u64));
        assert_that!(config.extract.max_chunk_retries, eq(3_u32));
        assert_that!(config.pipeline.queue, eq(QueuePolicy::Bounded(8)));
        assert_that!(config.search.generations, eq(100_usize));
    }

    #[rstest]
    #[case(r#"{"placement": {"cold_partition_width": 0}}"#)]
    #[case(r#"{"search": {"population_size": 1}}"#)]
    #[case(r#"{"search": {"population_size": 4, "elite_count": 4}}"#)]
    #[case(r#"{"search": {"mutation_rate": 1.5}}"#)]
    #[case(r#"{"pipeline": {"queue": {"bounded": 0}}}"#)]
    #[case(r#"{"rendezvous": {"max_attempts": 0}}"#)]
    fn out_of_range_values_are_rejected(#[case] payload: &str) {
        let result = ReshardConfig::from_json(payload);
        assert_that!(
            matches!(result, Err(ReshardError::InvalidConfig(_))),
            eq(true)
        );
    }

    #[rstest]
    fn malformed_json_is_a_plan_error() {
        let result = ReshardConfig::from_json("{not json");
        assert_that!(matches!(result, Err(ReshardError::Plan(_))), eq(true));
    }
}
