//! Integrity diagnostics.
//!
//! These do not test the experimental hypothesis. They exist to catch
//! implementation bugs (a biased shuffle, a skewed byte source, a broken
//! index mapping) and anomalous participant behaviour (button-mashing,
//! fixed response patterns).

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::config::AuditConfig;
use crate::ingest::NormalizedTrial;
use crate::{TestResult, insufficient, two_sided_normal_p};

// ═══════════════════════════════════════════════════════════════════════════════
// Byte stream
// ═══════════════════════════════════════════════════════════════════════════════

/// Shannon entropy in bits per byte, normalised by the maximum reachable
/// for this sample size (`min(8, log2 n)`).
pub fn shannon_entropy(data: &[u8]) -> TestResult {
    let name = "Shannon Entropy";
    let n = data.len();
    if n < 16 {
        return insufficient(name, 16, n);
    }
    let mut hist = [0u64; 256];
    for &b in data {
        hist[b as usize] += 1;
    }
    let mut h = 0.0;
    for &c in &hist {
        if c > 0 {
            let p = c as f64 / n as f64;
            h -= p * p.log2();
        }
    }
    let ceiling = (n as f64).log2().min(8.0);
    let ratio = h / ceiling;
    let grade = if ratio > 0.95 {
        'A'
    } else if ratio > 0.85 {
        'B'
    } else if ratio > 0.7 {
        'C'
    } else if ratio > 0.5 {
        'D'
    } else {
        'F'
    };
    TestResult {
        name: name.to_string(),
        significant: ratio <= 0.85,
        p_value: None,
        statistic: h,
        details: format!("{h:.4} / {ceiling:.2} bits ({:.1}%)", ratio * 100.0),
        grade,
    }
}

/// Chi-square goodness of fit of `byte mod K`.
///
/// Expected counts use the exact residue frequencies of a uniform byte
/// (for K=5, residue 0 has 52 preimages, the others 51), so only real
/// source skew is flagged.
pub fn mapping_uniformity(data: &[u8], k: usize, alpha: f64) -> TestResult {
    let name = "Mapping Uniformity (byte mod K)";
    let n = data.len();
    let needed = 5 * k.max(2);
    if k < 2 || n < needed {
        return insufficient(name, needed, n);
    }
    let mut observed = vec![0u64; k];
    for &b in data {
        observed[b as usize % k] += 1;
    }
    let mut chi2 = 0.0;
    for (r, &o) in observed.iter().enumerate() {
        let preimages = (0..256usize).filter(|b| b % k == r).count();
        let expected = n as f64 * preimages as f64 / 256.0;
        chi2 += (o as f64 - expected).powi(2) / expected;
    }
    let p = ChiSquared::new((k - 1) as f64)
        .map(|d| d.sf(chi2))
        .unwrap_or(f64::NAN);
    TestResult::from_p(name, p, chi2, alpha, format!("chi2={chi2:.4}, counts={observed:?}"))
}

/// Lag-1..=max_lag autocorrelation with a Bonferroni-combined p-value.
/// Under independence `r * sqrt(n)` is approximately standard normal.
pub fn autocorrelation(series: &[f64], max_lag: usize, alpha: f64) -> TestResult {
    let name = "Autocorrelation";
    let n = series.len();
    if max_lag == 0 || n < max_lag + 10 {
        return insufficient(name, max_lag + 10, n);
    }
    let mean: f64 = series.iter().sum::<f64>() / n as f64;
    let var: f64 = series.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if var < 1e-10 {
        return TestResult {
            name: name.to_string(),
            significant: false,
            p_value: None,
            statistic: 0.0,
            details: "Zero variance".to_string(),
            grade: 'F',
        };
    }
    let mut max_abs = 0.0f64;
    let mut min_p = 1.0f64;
    let mut parts = Vec::with_capacity(max_lag);
    for lag in 1..=max_lag {
        let count = n - lag;
        let sum: f64 = (0..count)
            .map(|i| (series[i] - mean) * (series[i + lag] - mean))
            .sum();
        let r = sum / (count as f64 * var);
        max_abs = max_abs.max(r.abs());
        min_p = min_p.min(two_sided_normal_p(r * (n as f64).sqrt()));
        parts.push(format!("lag{lag}={r:.4}"));
    }
    let p = (min_p * max_lag as f64).min(1.0);
    TestResult::from_p(name, p, max_abs, alpha, parts.join(", "))
}

/// zlib compression ratio; near or above 1.0 for random bytes.
pub fn compression_ratio(data: &[u8]) -> TestResult {
    let name = "Compression Ratio";
    let n = data.len();
    if n < 32 {
        return insufficient(name, 32, n);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    let compressed = match encoder.write_all(data).and_then(|()| encoder.finish()) {
        Ok(out) => out,
        Err(e) => {
            return TestResult {
                name: name.to_string(),
                significant: false,
                p_value: None,
                statistic: 0.0,
                details: format!("zlib failed: {e}"),
                grade: 'F',
            };
        }
    };
    let ratio = compressed.len() as f64 / n as f64;
    let grade = if ratio > 0.95 {
        'A'
    } else if ratio > 0.85 {
        'B'
    } else if ratio > 0.7 {
        'C'
    } else if ratio > 0.5 {
        'D'
    } else {
        'F'
    };
    TestResult {
        name: name.to_string(),
        significant: ratio <= 0.85,
        p_value: None,
        statistic: ratio,
        details: format!("{}/{n} = {ratio:.4}", compressed.len()),
        grade,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Response stream
// ═══════════════════════════════════════════════════════════════════════════════

/// Chi-square of selected positions against uniform over `0..K`.
pub fn position_bias(selected: &[u8], k: usize, alpha: f64) -> TestResult {
    let name = "Position Bias";
    let n = selected.len();
    let needed = 5 * k.max(2);
    if k < 2 || n < needed {
        return insufficient(name, needed, n);
    }
    let mut observed = vec![0u64; k];
    for &s in selected {
        if let Some(slot) = observed.get_mut(s as usize) {
            *slot += 1;
        }
    }
    let expected = n as f64 / k as f64;
    let chi2: f64 = observed
        .iter()
        .map(|&o| (o as f64 - expected).powi(2) / expected)
        .sum();
    let p = ChiSquared::new((k - 1) as f64)
        .map(|d| d.sf(chi2))
        .unwrap_or(f64::NAN);
    TestResult::from_p(name, p, chi2, alpha, format!("chi2={chi2:.4}, counts={observed:?}"))
}

/// Rate at which consecutive selections differ, against `(K-1)/K`.
pub fn alternation_rate(selected: &[u8], k: usize, alpha: f64) -> TestResult {
    let name = "Alternation Rate";
    let n = selected.len();
    if k < 2 || n < 10 {
        return insufficient(name, 10, n);
    }
    let transitions = (n - 1) as f64;
    let alternations = selected.windows(2).filter(|w| w[0] != w[1]).count() as f64;
    let expected = (k - 1) as f64 / k as f64;
    let sd = (transitions * expected * (1.0 - expected)).sqrt();
    let z = (alternations - transitions * expected) / sd;
    let p = two_sided_normal_p(z);
    let rate = alternations / transitions;
    TestResult::from_p(
        name,
        p,
        rate,
        alpha,
        format!("rate={rate:.4}, expected={expected:.4}, z={z:.4}"),
    )
}

/// Wald–Wolfowitz runs test on the hit/miss sequence.
pub fn runs_test(hits: &[bool], alpha: f64) -> TestResult {
    let name = "Runs Test";
    let n = hits.len();
    if n < 10 {
        return insufficient(name, 10, n);
    }
    let n1 = hits.iter().filter(|&&h| h).count() as f64;
    let n2 = n as f64 - n1;
    if n1 == 0.0 || n2 == 0.0 {
        return TestResult {
            name: name.to_string(),
            significant: false,
            p_value: None,
            statistic: 1.0,
            details: "All outcomes identical".to_string(),
            grade: 'F',
        };
    }
    let runs = 1 + hits.windows(2).filter(|w| w[0] != w[1]).count();
    let nf = n as f64;
    let mu = 2.0 * n1 * n2 / nf + 1.0;
    let var = 2.0 * n1 * n2 * (2.0 * n1 * n2 - nf) / (nf * nf * (nf - 1.0));
    if var < 1e-12 {
        return insufficient(name, n + 1, n);
    }
    let z = (runs as f64 - mu) / var.sqrt();
    let p = two_sided_normal_p(z);
    TestResult::from_p(
        name,
        p,
        z,
        alpha,
        format!("runs={runs}, expected={mu:.2}, z={z:.4}"),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreakStats {
    pub longest_hit_streak: usize,
    pub longest_miss_streak: usize,
    pub runs: usize,
    pub mean_run_length: f64,
}

pub fn streaks(hits: &[bool]) -> StreakStats {
    let Some(&first) = hits.first() else {
        return StreakStats::default();
    };
    let mut stats = StreakStats {
        runs: 1,
        ..Default::default()
    };
    let mut current = 0usize;
    let mut value = first;
    for &h in hits {
        if h == value {
            current += 1;
        } else {
            stats.runs += 1;
            value = h;
            current = 1;
        }
        if value {
            stats.longest_hit_streak = stats.longest_hit_streak.max(current);
        } else {
            stats.longest_miss_streak = stats.longest_miss_streak.max(current);
        }
    }
    stats.mean_run_length = hits.len() as f64 / stats.runs as f64;
    stats
}

/// Accuracy within one response-time quantile bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtBin {
    pub lower_ms: f64,
    pub upper_ms: f64,
    pub trials: usize,
    pub hits: usize,
    pub hit_rate: f64,
}

/// Split `(latency, hit)` pairs into `bins` equal-count bins by latency.
pub fn rt_bins(samples: &[(f64, bool)], bins: usize) -> Vec<RtBin> {
    if bins == 0 || samples.is_empty() {
        return Vec::new();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let n = sorted.len();
    (0..bins)
        .filter_map(|i| {
            let chunk = &sorted[i * n / bins..(i + 1) * n / bins];
            let (first, last) = (chunk.first()?, chunk.last()?);
            let hits = chunk.iter().filter(|(_, h)| *h).count();
            Some(RtBin {
                lower_ms: first.0,
                upper_ms: last.0,
                trials: chunk.len(),
                hits,
                hit_rate: hits as f64 / chunk.len() as f64,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bundle
// ═══════════════════════════════════════════════════════════════════════════════

/// All diagnostics over one ordered trial stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub byte_entropy: TestResult,
    pub mapping_uniformity: TestResult,
    pub compression: TestResult,
    pub byte_autocorrelation: TestResult,
    pub hit_autocorrelation: TestResult,
    pub position_bias: TestResult,
    pub alternation: TestResult,
    pub runs: TestResult,
    pub streaks: StreakStats,
    pub rt_bins: Vec<RtBin>,
}

impl Diagnostics {
    /// Raw bytes are taken in tape order (subject, decoy) from every trial
    /// that logged them; response diagnostics use valid trials only.
    pub fn compute<'a>(trials: impl IntoIterator<Item = &'a NormalizedTrial>, config: &AuditConfig) -> Self {
        let alpha = config.significance_alpha;
        let k = config.symbol_count;
        let mut bytes = Vec::new();
        let mut hits = Vec::new();
        let mut selected = Vec::new();
        let mut latencies = Vec::new();
        for t in trials {
            bytes.extend(t.subject_byte);
            bytes.extend(t.decoy_byte);
            let Some(sel) = t.selected_index.filter(|_| t.is_valid()) else {
                continue;
            };
            hits.push(t.subject_hit);
            selected.push(sel);
            if let Some(l) = t.latency_ms {
                latencies.push((l, t.subject_hit));
            }
        }
        let byte_series: Vec<f64> = bytes.iter().map(|&b| b as f64).collect();
        let hit_series: Vec<f64> = hits.iter().map(|&h| if h { 1.0 } else { 0.0 }).collect();
        Diagnostics {
            byte_entropy: shannon_entropy(&bytes),
            mapping_uniformity: mapping_uniformity(&bytes, k, alpha),
            compression: compression_ratio(&bytes),
            byte_autocorrelation: autocorrelation(&byte_series, config.max_lag, alpha),
            hit_autocorrelation: autocorrelation(&hit_series, config.max_lag, alpha),
            position_bias: position_bias(&selected, k, alpha),
            alternation: alternation_rate(&selected, k, alpha),
            runs: runs_test(&hits, alpha),
            streaks: streaks(&hits),
            rt_bins: rt_bins(&latencies, config.rt_bins),
        }
    }
}
