//! Exact binomial tails and the one-sample z approximation.
//!
//! Blocks are short (30–40 trials), so the significance shown to
//! participants comes from an exact tail sum, never from the normal
//! approximation. The z score is reported beside it for pooled data.

use statrs::function::factorial::ln_binomial;

use crate::{TestResult, insufficient, two_sided_normal_p};

fn pmf(i: u64, n: u64, p: f64) -> f64 {
    (ln_binomial(n, i) + i as f64 * p.ln() + (n - i) as f64 * (1.0 - p).ln()).exp()
}

/// `P(X >= k)` for `X ~ Binomial(n, p)`, by exact summation.
pub fn binomial_upper_tail(k: u64, n: u64, p: f64) -> f64 {
    if k == 0 {
        return 1.0;
    }
    if k > n || p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }
    let tail: f64 = (k..=n).map(|i| pmf(i, n, p)).sum();
    tail.min(1.0)
}

/// `P(X <= k)` for `X ~ Binomial(n, p)`, by exact summation.
pub fn binomial_lower_tail(k: u64, n: u64, p: f64) -> f64 {
    if k >= n || p <= 0.0 {
        return 1.0;
    }
    if p >= 1.0 {
        return 0.0;
    }
    let tail: f64 = (0..=k).map(|i| pmf(i, n, p)).sum();
    tail.min(1.0)
}

/// One-sided exact test of `hits` out of `n` against chance `p0`.
pub fn exact_binomial_test(hits: u64, n: u64, p0: f64, alpha: f64) -> TestResult {
    let name = "Exact Binomial";
    if n == 0 {
        return insufficient(name, 1, 0);
    }
    let p = binomial_upper_tail(hits, n, p0);
    TestResult::from_p(
        name,
        p,
        hits as f64 / n as f64,
        alpha,
        format!("{hits}/{n} hits, P(X>={hits} | p0={p0:.3}) = {p:.6}"),
    )
}

/// Two-sided exact test: twice the smaller tail, capped at 1.
pub fn exact_binomial_two_sided(hits: u64, n: u64, p0: f64, alpha: f64) -> TestResult {
    let name = "Exact Binomial (two-sided)";
    if n == 0 {
        return insufficient(name, 1, 0);
    }
    let upper = binomial_upper_tail(hits, n, p0);
    let lower = binomial_lower_tail(hits, n, p0);
    let p = (2.0 * upper.min(lower)).min(1.0);
    TestResult::from_p(
        name,
        p,
        hits as f64 / n as f64,
        alpha,
        format!("{hits}/{n}, expected {:.1}, p={p:.6}", n as f64 * p0),
    )
}

/// Normal-approximation z of `hits` against `n * p0`, two-sided.
pub fn one_sample_z(hits: u64, n: u64, p0: f64, alpha: f64) -> TestResult {
    let name = "One-Sample Z";
    if n == 0 {
        return insufficient(name, 1, 0);
    }
    let nf = n as f64;
    let sd = (nf * p0 * (1.0 - p0)).sqrt();
    if sd < 1e-12 {
        return TestResult {
            name: name.to_string(),
            significant: false,
            p_value: None,
            statistic: 0.0,
            details: "Zero variance under p0".to_string(),
            grade: 'F',
        };
    }
    let z = (hits as f64 - nf * p0) / sd;
    let p = two_sided_normal_p(z);
    TestResult::from_p(name, p, z, alpha, format!("z={z:.4}, rate={:.4}", hits as f64 / nf))
}
