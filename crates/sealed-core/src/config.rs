//! Engine configuration.
//!
//! All timing, sizing and threshold constants live in [`EngineConfig`] and are
//! passed into the entropy adapter, block runner and audit engine explicitly.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layout::ALPHABET;

/// Minimum salt length accepted for a commitment tape.
pub const MIN_SALT_LEN: usize = 16;

/// Retry policy for entropy fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before retry `k` is `base_delay_ms * k`.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(u64::from(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Which index-remap strategy is applied on top of the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapMode {
    /// Direct modulo mapping, no rotation.
    #[default]
    None,
    /// HMAC-seeded rotation with a logged proof.
    HmacRotation,
}

/// What happens when the commitment document cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitFailurePolicy {
    /// The block does not start.
    #[default]
    FailClosed,
    /// The block runs but is flagged "commitment unverifiable".
    FlagAndContinue,
}

/// Where per-trial bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteSupply {
    /// Pre-drawn, committed tape consumed FIFO.
    #[default]
    Tape,
    /// Two fresh bytes fetched per trial; no commitment is possible.
    Live,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol_count: usize,
    pub round_size: usize,
    /// Hits within a round needed to call the round a win.
    pub round_win_hits: usize,
    pub flash_duration_ms: u64,
    pub inter_stimulus_interval_ms: u64,
    /// 1 = single presentation, >1 = repeated-flash redundancy.
    pub flash_repeats: u32,
    pub significance_alpha: f64,
    pub salt_len: usize,
    /// Largest byte count requested from a source in one call.
    pub fetch_chunk_size: usize,
    pub retry: RetryPolicy,
    pub remap: RemapMode,
    pub commit_failure: CommitFailurePolicy,
    pub byte_supply: ByteSupply,
    /// Attempt a partial reveal when a block is abandoned.
    pub reveal_on_abandon: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol_count: ALPHABET.len(),
            round_size: 5,
            round_win_hits: 3,
            flash_duration_ms: 1_000,
            inter_stimulus_interval_ms: 500,
            flash_repeats: 1,
            significance_alpha: 0.05,
            salt_len: MIN_SALT_LEN,
            fetch_chunk_size: 1024,
            retry: RetryPolicy::default(),
            remap: RemapMode::None,
            commit_failure: CommitFailurePolicy::FailClosed,
            byte_supply: ByteSupply::Tape,
            reveal_on_abandon: false,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol_count != ALPHABET.len() {
            return Err(ConfigError::Invalid(format!(
                "symbol_count {} does not match the {}-symbol alphabet",
                self.symbol_count,
                ALPHABET.len()
            )));
        }
        if self.round_size == 0 {
            return Err(ConfigError::Invalid("round_size must be positive".into()));
        }
        if self.round_win_hits == 0 || self.round_win_hits > self.round_size {
            return Err(ConfigError::Invalid(format!(
                "round_win_hits must be in 1..={}",
                self.round_size
            )));
        }
        if self.flash_repeats == 0 {
            return Err(ConfigError::Invalid("flash_repeats must be at least 1".into()));
        }
        if !(self.significance_alpha > 0.0 && self.significance_alpha < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "significance_alpha {} is outside (0, 1)",
                self.significance_alpha
            )));
        }
        if self.salt_len < MIN_SALT_LEN {
            return Err(ConfigError::Invalid(format!(
                "salt_len {} is below the {MIN_SALT_LEN}-byte minimum",
                self.salt_len
            )));
        }
        if self.fetch_chunk_size == 0 {
            return Err(ConfigError::Invalid("fetch_chunk_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Chance hit probability `1/K`.
    pub fn chance(&self) -> f64 {
        1.0 / self.symbol_count as f64
    }

    pub fn flash_duration(&self) -> Duration {
        Duration::from_millis(self.flash_duration_ms)
    }

    pub fn inter_stimulus_interval(&self) -> Duration {
        Duration::from_millis(self.inter_stimulus_interval_ms)
    }
}
