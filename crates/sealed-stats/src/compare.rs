//! Subject vs. decoy comparisons.
//!
//! The decoy stream is a parallel, non-human pick driven by the same RNG.
//! Under a correct mapping both streams sit at chance, so a decoy that
//! drifts from `p0`, or a lopsided discordant split, points at the RNG or
//! the index computation rather than at the participant.

use serde::{Deserialize, Serialize};

use crate::binomial::exact_binomial_two_sided;
use crate::{TestResult, insufficient, two_sided_normal_p};

/// Pooled-variance two-proportion z test, two-sided.
pub fn two_proportion_z(h1: u64, n1: u64, h2: u64, n2: u64, alpha: f64) -> TestResult {
    let name = "Two-Proportion Z";
    if n1 == 0 || n2 == 0 {
        return insufficient(name, 1, n1.min(n2) as usize);
    }
    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let p1 = h1 as f64 / n1f;
    let p2 = h2 as f64 / n2f;
    let pooled = (h1 + h2) as f64 / (n1f + n2f);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1f + 1.0 / n2f)).sqrt();
    if se < 1e-12 {
        return TestResult {
            name: name.to_string(),
            significant: false,
            p_value: Some(1.0),
            statistic: 0.0,
            details: format!("Degenerate pooled rate {pooled:.3}"),
            grade: 'A',
        };
    }
    let z = (p1 - p2) / se;
    let p = two_sided_normal_p(z);
    TestResult::from_p(name, p, z, alpha, format!("{p1:.4} vs {p2:.4}, z={z:.4}"))
}

/// Decoy hit rate against chance. Significance here is an RNG warning.
pub fn decoy_vs_chance(decoy_hits: u64, n: u64, p0: f64, alpha: f64) -> TestResult {
    let mut result = exact_binomial_two_sided(decoy_hits, n, p0, alpha);
    result.name = "Decoy vs Chance".to_string();
    result
}

/// Concordance table of subject and decoy correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetryCounts {
    pub both: u64,
    /// Subject right, decoy wrong.
    pub n10: u64,
    /// Subject wrong, decoy right.
    pub n01: u64,
    pub neither: u64,
}

impl SymmetryCounts {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (bool, bool)>) -> Self {
        let mut c = Self::default();
        for (subject, decoy) in pairs {
            match (subject, decoy) {
                (true, true) => c.both += 1,
                (true, false) => c.n10 += 1,
                (false, true) => c.n01 += 1,
                (false, false) => c.neither += 1,
            }
        }
        c
    }

    pub fn discordant(&self) -> u64 {
        self.n10 + self.n01
    }
}

/// `z = (n10 - n01) / sqrt(n10 + n01)`, two-sided against a 50/50 split.
pub fn symmetry_test(counts: &SymmetryCounts, alpha: f64) -> TestResult {
    let name = "Symmetry (n10 vs n01)";
    let d = counts.discordant();
    if d == 0 {
        return insufficient(name, 1, 0);
    }
    let z = (counts.n10 as f64 - counts.n01 as f64) / (d as f64).sqrt();
    let p = two_sided_normal_p(z);
    TestResult::from_p(
        name,
        p,
        z,
        alpha,
        format!("n10={}, n01={}, z={z:.4}", counts.n10, counts.n01),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_proportion_equal_rates() {
        let r = two_proportion_z(20, 100, 20, 100, 0.05);
        assert!(r.statistic.abs() < 1e-12);
        assert!(!r.significant);
    }

    #[test]
    fn test_two_proportion_known_value() {
        // pooled 0.25, se = sqrt(0.1875 * 0.02) = 0.061237
        let r = two_proportion_z(30, 100, 20, 100, 0.05);
        assert!((r.statistic - 1.632993).abs() < 1e-5, "{}", r.statistic);
        assert!(!r.significant);
        let r = two_proportion_z(60, 200, 20, 200, 0.05);
        assert!(r.significant);
    }

    #[test]
    fn test_two_proportion_degenerate() {
        let r = two_proportion_z(0, 10, 0, 10, 0.05);
        assert_eq!(r.p_value, Some(1.0));
        assert!(two_proportion_z(1, 0, 1, 10, 0.05).details.contains("Insufficient"));
    }

    #[test]
    fn test_decoy_off_chance_is_flagged() {
        assert!(decoy_vs_chance(45, 100, 0.2, 0.05).significant);
        assert!(!decoy_vs_chance(21, 100, 0.2, 0.05).significant);
        assert_eq!(decoy_vs_chance(21, 100, 0.2, 0.05).name, "Decoy vs Chance");
    }

    #[test]
    fn test_symmetry_counts() {
        let c = SymmetryCounts::from_pairs([(true, true), (true, false), (true, false), (false, true), (false, false)]);
        assert_eq!((c.both, c.n10, c.n01, c.neither), (1, 2, 1, 1));
        assert_eq!(c.discordant(), 3);
    }

    #[test]
    fn test_symmetry_z() {
        let c = SymmetryCounts {
            n10: 30,
            n01: 10,
            ..Default::default()
        };
        let r = symmetry_test(&c, 0.05);
        assert!((r.statistic - 20.0 / 40f64.sqrt()).abs() < 1e-12);
        assert!(r.significant);
        let balanced = SymmetryCounts {
            n10: 12,
            n01: 11,
            ..Default::default()
        };
        assert!(!symmetry_test(&balanced, 0.05).significant);
        assert!(symmetry_test(&SymmetryCounts::default(), 0.05).p_value.is_none());
    }
}
