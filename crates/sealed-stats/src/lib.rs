//! Statistical audit engine for sealed-envelope forced-choice experiments.
//!
//! Turns logged trial records into evidence: hit rates against the `1/K`
//! chance baseline, exact and asymptotic significance tests, subject vs.
//! decoy comparisons, and integrity diagnostics that catch RNG or
//! index-mapping bugs. Everything here is read-only over its input.
//!
//! Each test returns a [`TestResult`] with a p-value (where applicable), a
//! significance call at the configured alpha, and a letter grade (A through F).

pub mod aggregate;
pub mod binomial;
pub mod compare;
pub mod config;
pub mod diagnostics;
pub mod ingest;
pub mod report;
pub mod rounds;

use serde::{Deserialize, Serialize};

pub use aggregate::{AggregationMode, ParticipantMeans, one_sample_t, paired_t, participant_means, select_sessions};
pub use binomial::{binomial_lower_tail, binomial_upper_tail, exact_binomial_test, exact_binomial_two_sided, one_sample_z};
pub use compare::{SymmetryCounts, decoy_vs_chance, symmetry_test, two_proportion_z};
pub use config::AuditConfig;
pub use diagnostics::{
    Diagnostics, RtBin, StreakStats, alternation_rate, autocorrelation, compression_ratio, mapping_uniformity,
    position_bias, rt_bins, runs_test, shannon_entropy, streaks,
};
pub use ingest::{IngestError, NormalizedTrial, SessionTrials, ingest, ingest_str};
pub use report::{AuditReport, FlagKind, IntegrityFlag, PooledStats, SessionRow, audit, render_text};
pub use rounds::{RoundScore, score_blocks, score_rounds};

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a single statistical test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    /// `p < alpha`. For integrity checks this is a warning, for the
    /// subject's hit rate it is the reported effect.
    pub significant: bool,
    pub p_value: Option<f64>,
    pub statistic: f64,
    pub details: String,
    pub grade: char,
}

impl TestResult {
    /// Assign a letter grade based on p-value.
    ///
    /// - A: p >= 0.1
    /// - B: p >= 0.01
    /// - C: p >= 0.001
    /// - D: p >= 0.0001
    /// - F: otherwise or None
    pub fn grade_from_p(p: Option<f64>) -> char {
        match p {
            Some(p) if p >= 0.1 => 'A',
            Some(p) if p >= 0.01 => 'B',
            Some(p) if p >= 0.001 => 'C',
            Some(p) if p >= 0.0001 => 'D',
            _ => 'F',
        }
    }

    /// `p < alpha`; a missing p-value is never significant.
    pub fn significant_at(p: Option<f64>, alpha: f64) -> bool {
        match p {
            Some(p) => p < alpha,
            None => false,
        }
    }

    pub(crate) fn from_p(name: &str, p: f64, statistic: f64, alpha: f64, details: String) -> Self {
        let p = p.clamp(0.0, 1.0);
        TestResult {
            name: name.to_string(),
            significant: TestResult::significant_at(Some(p), alpha),
            p_value: Some(p),
            statistic,
            details,
            grade: TestResult::grade_from_p(Some(p)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Return a non-significant `TestResult` when data is too short.
pub(crate) fn insufficient(name: &str, needed: usize, got: usize) -> TestResult {
    TestResult {
        name: name.to_string(),
        significant: false,
        p_value: None,
        statistic: 0.0,
        details: format!("Insufficient data: need {needed}, got {got}"),
        grade: 'F',
    }
}

/// Two-sided p-value for a standard normal statistic.
pub(crate) fn two_sided_normal_p(z: f64) -> f64 {
    statrs::function::erf::erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
