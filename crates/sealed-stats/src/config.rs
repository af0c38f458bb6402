//! Audit parameters.

use serde::{Deserialize, Serialize};

/// Constants the audit needs, passed explicitly instead of scattered literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// K in a K-way forced choice.
    pub symbol_count: usize,
    pub round_size: usize,
    /// Hits needed in one round to call it a win.
    pub round_win_hits: usize,
    pub significance_alpha: f64,
    /// Highest lag checked by the autocorrelation diagnostic.
    pub max_lag: usize,
    /// Number of response-time quantile bins.
    pub rt_bins: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            symbol_count: 5,
            round_size: 5,
            round_win_hits: 3,
            significance_alpha: 0.05,
            max_lag: 5,
            rt_bins: 4,
        }
    }
}

impl AuditConfig {
    /// Chance hit probability `1/K`.
    pub fn chance(&self) -> f64 {
        1.0 / self.symbol_count.max(1) as f64
    }
}
