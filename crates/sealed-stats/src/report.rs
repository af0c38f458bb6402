//! Audit report assembly and rendering.
//!
//! The report is derived on demand and never written back to the source
//! records. Integrity warnings are collected as flagged rows for human
//! review; none of them say anything about the participant's ability.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationMode, one_sample_t, paired_t, participant_means, select_sessions};
use crate::binomial::{exact_binomial_test, one_sample_z};
use crate::compare::{SymmetryCounts, decoy_vs_chance, symmetry_test, two_proportion_z};
use crate::config::AuditConfig;
use crate::diagnostics::{Diagnostics, alternation_rate, position_bias};
use crate::ingest::{NormalizedTrial, SessionTrials};
use crate::rounds::score_blocks;
use crate::TestResult;

// ═══════════════════════════════════════════════════════════════════════════════
// Report types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub participant_id: String,
    /// Valid trials only.
    pub trials: usize,
    /// Trials dropped for a missing index.
    pub excluded: usize,
    pub hits: usize,
    pub decoy_hits: usize,
    pub hit_rate: f64,
    pub decoy_rate: f64,
    /// One-sided exact binomial p against chance.
    pub exact_p: Option<f64>,
    pub significant: bool,
    pub rounds_total: usize,
    pub rounds_won: usize,
    pub exited_early: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledStats {
    pub sessions: usize,
    pub participants: usize,
    pub trials: usize,
    pub hits: usize,
    pub decoy_hits: usize,
    pub hit_rate: f64,
    pub decoy_rate: f64,
    pub exact: TestResult,
    pub z: TestResult,
    pub subject_vs_decoy: TestResult,
    pub decoy_vs_chance: TestResult,
    pub symmetry_counts: SymmetryCounts,
    pub symmetry: TestResult,
    /// Participant means vs. chance; first-session mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_t: Option<TestResult>,
    /// Participant subject vs. decoy means; first-session mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_t: Option<TestResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    DecoyOffChance,
    SymmetryViolation,
    MappingNonUniform,
    PositionBias,
    AlternationAnomaly,
    Autocorrelation,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlagKind::DecoyOffChance => "decoy_off_chance",
            FlagKind::SymmetryViolation => "symmetry_violation",
            FlagKind::MappingNonUniform => "mapping_non_uniform",
            FlagKind::PositionBias => "position_bias",
            FlagKind::AlternationAnomaly => "alternation_anomaly",
            FlagKind::Autocorrelation => "autocorrelation",
        })
    }
}

/// A warning row. `scope` is a session id or `pooled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityFlag {
    pub kind: FlagKind,
    pub scope: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub mode: AggregationMode,
    pub chance: f64,
    pub alpha: f64,
    pub sessions: Vec<SessionRow>,
    pub pooled: PooledStats,
    pub diagnostics: Diagnostics,
    pub flags: Vec<IntegrityFlag>,
}

impl AuditReport {
    pub fn flags_of(&self, kind: FlagKind) -> impl Iterator<Item = &IntegrityFlag> {
        self.flags.iter().filter(move |f| f.kind == kind)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Assembly
// ═══════════════════════════════════════════════════════════════════════════════

pub const POOLED_SCOPE: &str = "pooled";

fn flag_if(flags: &mut Vec<IntegrityFlag>, kind: FlagKind, scope: &str, result: &TestResult) {
    if result.significant {
        flags.push(IntegrityFlag {
            kind,
            scope: scope.to_string(),
            detail: format!("{}: {}", result.name, result.details),
        });
    }
}

fn rate(k: usize, n: usize) -> f64 {
    if n == 0 { 0.0 } else { k as f64 / n as f64 }
}

fn session_row(s: &SessionTrials, config: &AuditConfig, flags: &mut Vec<IntegrityFlag>) -> SessionRow {
    let alpha = config.significance_alpha;
    let p0 = config.chance();
    let valid: Vec<&NormalizedTrial> = s.valid().collect();
    let n = valid.len();
    let hits = valid.iter().filter(|t| t.subject_hit).count();
    let decoy_hits = valid.iter().filter(|t| t.decoy_hit).count();
    let selected: Vec<u8> = valid.iter().filter_map(|t| t.selected_index).collect();
    let rounds = score_blocks(
        s.trials
            .iter()
            .map(|t| (t.block_id.as_str(), t.trial_number, t.is_valid() && t.subject_hit)),
        config.round_size,
        config.round_win_hits,
    );
    let exact = exact_binomial_test(hits as u64, n as u64, p0, alpha);

    let scope = s.session_id.as_str();
    flag_if(flags, FlagKind::DecoyOffChance, scope, &decoy_vs_chance(decoy_hits as u64, n as u64, p0, alpha));
    let counts = SymmetryCounts::from_pairs(valid.iter().map(|t| (t.subject_hit, t.decoy_hit)));
    flag_if(flags, FlagKind::SymmetryViolation, scope, &symmetry_test(&counts, alpha));
    flag_if(flags, FlagKind::PositionBias, scope, &position_bias(&selected, config.symbol_count, alpha));
    flag_if(
        flags,
        FlagKind::AlternationAnomaly,
        scope,
        &alternation_rate(&selected, config.symbol_count, alpha),
    );

    SessionRow {
        session_id: s.session_id.clone(),
        participant_id: s.participant_id.clone(),
        trials: n,
        excluded: s.excluded(),
        hits,
        decoy_hits,
        hit_rate: rate(hits, n),
        decoy_rate: rate(decoy_hits, n),
        exact_p: exact.p_value,
        significant: exact.significant,
        rounds_total: rounds.rounds_total,
        rounds_won: rounds.rounds_won,
        exited_early: s.exited_early,
    }
}

/// Build the audit report for `sessions` under `mode`.
///
/// Sequence diagnostics (autocorrelation, alternation, runs) treat the
/// selected sessions as one stream in input order.
pub fn audit(sessions: &[SessionTrials], mode: AggregationMode, config: &AuditConfig) -> AuditReport {
    let alpha = config.significance_alpha;
    let p0 = config.chance();
    let selected = select_sessions(sessions, mode);
    let mut flags = Vec::new();

    let rows: Vec<SessionRow> = selected.iter().map(|s| session_row(s, config, &mut flags)).collect();

    let valid: Vec<&NormalizedTrial> = selected.iter().flat_map(|s| s.valid()).collect();
    let n = valid.len();
    let hits = valid.iter().filter(|t| t.subject_hit).count();
    let decoy_hits = valid.iter().filter(|t| t.decoy_hit).count();
    let counts = SymmetryCounts::from_pairs(valid.iter().map(|t| (t.subject_hit, t.decoy_hit)));

    let (participant_t, paired) = match mode {
        AggregationMode::Pooled => (None, None),
        AggregationMode::FirstSession => {
            let means = participant_means(&selected);
            let subject: Vec<f64> = means.iter().map(|m| m.subject_rate).collect();
            let decoy: Vec<f64> = means.iter().map(|m| m.decoy_rate).collect();
            (
                Some(one_sample_t(&subject, p0, alpha)),
                Some(paired_t(&subject, &decoy, alpha)),
            )
        }
    };

    let mut participants: Vec<&str> = selected.iter().map(|s| s.participant_id.as_str()).collect();
    participants.sort_unstable();
    participants.dedup();

    let pooled = PooledStats {
        sessions: selected.len(),
        participants: participants.len(),
        trials: n,
        hits,
        decoy_hits,
        hit_rate: rate(hits, n),
        decoy_rate: rate(decoy_hits, n),
        exact: exact_binomial_test(hits as u64, n as u64, p0, alpha),
        z: one_sample_z(hits as u64, n as u64, p0, alpha),
        subject_vs_decoy: two_proportion_z(hits as u64, n as u64, decoy_hits as u64, n as u64, alpha),
        decoy_vs_chance: decoy_vs_chance(decoy_hits as u64, n as u64, p0, alpha),
        symmetry_counts: counts,
        symmetry: symmetry_test(&counts, alpha),
        participant_t,
        paired_t: paired,
    };

    let all_trials = selected.iter().flat_map(|s| s.trials.iter());
    let diagnostics = Diagnostics::compute(all_trials, config);

    flag_if(&mut flags, FlagKind::DecoyOffChance, POOLED_SCOPE, &pooled.decoy_vs_chance);
    flag_if(&mut flags, FlagKind::SymmetryViolation, POOLED_SCOPE, &pooled.symmetry);
    flag_if(&mut flags, FlagKind::MappingNonUniform, POOLED_SCOPE, &diagnostics.mapping_uniformity);
    flag_if(&mut flags, FlagKind::PositionBias, POOLED_SCOPE, &diagnostics.position_bias);
    flag_if(&mut flags, FlagKind::AlternationAnomaly, POOLED_SCOPE, &diagnostics.alternation);
    flag_if(&mut flags, FlagKind::Autocorrelation, POOLED_SCOPE, &diagnostics.byte_autocorrelation);
    flag_if(&mut flags, FlagKind::Autocorrelation, POOLED_SCOPE, &diagnostics.hit_autocorrelation);

    for f in &flags {
        log::warn!("integrity flag {} [{}]: {}", f.kind, f.scope, f.detail);
    }

    AuditReport {
        mode,
        chance: p0,
        alpha,
        sessions: rows,
        pooled,
        diagnostics,
        flags,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Text rendering
// ═══════════════════════════════════════════════════════════════════════════════

fn p_cell(p: Option<f64>) -> String {
    match p {
        Some(p) => format!("{p:.4}"),
        None => "-".to_string(),
    }
}

fn test_line(out: &mut String, r: &TestResult) {
    let mark = if r.significant { "*" } else { " " };
    let _ = writeln!(
        out,
        "  {mark} {:<32} {:>10.4} p={:<8} [{}] {}",
        r.name,
        r.statistic,
        p_cell(r.p_value),
        r.grade,
        r.details
    );
}

/// Plain-text rendering: per-session table, pooled tests, diagnostics, flags.
pub fn render_text(report: &AuditReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Audit ({} mode, chance={:.3}, alpha={})",
        report.mode, report.chance, report.alpha
    );
    let _ = writeln!(out, "{}", "=".repeat(96));
    let _ = writeln!(
        out,
        "{:<38} {:<14} {:>6} {:>5} {:>6} {:>7} {:>8} {:>6} {:>5}",
        "Session", "Participant", "Trials", "Hits", "Decoy", "Rate", "p", "Rounds", "Exit"
    );
    let _ = writeln!(out, "{}", "-".repeat(96));
    for row in &report.sessions {
        let _ = writeln!(
            out,
            "{:<38} {:<14} {:>6} {:>5} {:>6} {:>6.1}% {:>8} {:>3}/{:<2} {:>5}",
            row.session_id,
            row.participant_id,
            row.trials,
            row.hits,
            row.decoy_hits,
            row.hit_rate * 100.0,
            p_cell(row.exact_p),
            row.rounds_won,
            row.rounds_total,
            if row.exited_early { "early" } else { "" }
        );
    }

    let p = &report.pooled;
    let _ = writeln!(out, "\nPooled: {} sessions, {} participants, {} trials", p.sessions, p.participants, p.trials);
    let _ = writeln!(
        out,
        "  hits {} ({:.1}%), decoy hits {} ({:.1}%), n10={} n01={}",
        p.hits,
        p.hit_rate * 100.0,
        p.decoy_hits,
        p.decoy_rate * 100.0,
        p.symmetry_counts.n10,
        p.symmetry_counts.n01
    );
    for r in [&p.exact, &p.z, &p.subject_vs_decoy, &p.decoy_vs_chance, &p.symmetry] {
        test_line(&mut out, r);
    }
    for r in [&p.participant_t, &p.paired_t].into_iter().flatten() {
        test_line(&mut out, r);
    }

    let d = &report.diagnostics;
    let _ = writeln!(out, "\nDiagnostics");
    for r in [
        &d.byte_entropy,
        &d.mapping_uniformity,
        &d.compression,
        &d.byte_autocorrelation,
        &d.hit_autocorrelation,
        &d.position_bias,
        &d.alternation,
        &d.runs,
    ] {
        test_line(&mut out, r);
    }
    let _ = writeln!(
        out,
        "    streaks: longest hit {}, longest miss {}, mean run {:.2}",
        d.streaks.longest_hit_streak, d.streaks.longest_miss_streak, d.streaks.mean_run_length
    );
    for bin in &d.rt_bins {
        let _ = writeln!(
            out,
            "    rt {:>7.0}-{:<7.0} ms: {:>4} trials, {:.1}% hits",
            bin.lower_ms,
            bin.upper_ms,
            bin.trials,
            bin.hit_rate * 100.0
        );
    }

    let _ = writeln!(out, "\nIntegrity flags: {}", report.flags.len());
    for f in &report.flags {
        let _ = writeln!(out, "  ! {:<20} {:<38} {}", f.kind.to_string(), f.scope, f.detail);
    }
    out
}
