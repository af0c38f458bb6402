//! Pooled vs. first-session aggregation.
//!
//! Pooling every trial from every session maximises trial-level power but
//! counts repeat players many times. First-session mode keeps one session
//! per participant (the earliest) and tests participant-level means with t
//! tests. The two answer different questions and are never mixed in one
//! report.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::ingest::SessionTrials;
use crate::{TestResult, insufficient};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMode {
    /// Every valid trial from every session.
    #[default]
    Pooled,
    /// The earliest session of each participant only.
    FirstSession,
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregationMode::Pooled => "pooled",
            AggregationMode::FirstSession => "first-session",
        })
    }
}

impl FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pooled" => Ok(AggregationMode::Pooled),
            "first-session" | "first_session" => Ok(AggregationMode::FirstSession),
            other => Err(format!("unknown aggregation mode '{other}' (expected pooled or first-session)")),
        }
    }
}

/// Sessions that participate under `mode`, in input order.
///
/// Sessions without a start time sort after timed ones; ties keep input order.
pub fn select_sessions(sessions: &[SessionTrials], mode: AggregationMode) -> Vec<&SessionTrials> {
    match mode {
        AggregationMode::Pooled => sessions.iter().collect(),
        AggregationMode::FirstSession => {
            let mut first: HashMap<&str, (u64, usize)> = HashMap::new();
            for (i, s) in sessions.iter().enumerate() {
                let key = (s.started_at_ms.unwrap_or(u64::MAX), i);
                first
                    .entry(s.participant_id.as_str())
                    .and_modify(|best| {
                        if key < *best {
                            *best = key;
                        }
                    })
                    .or_insert(key);
            }
            let mut keep: Vec<usize> = first.into_values().map(|(_, i)| i).collect();
            keep.sort_unstable();
            keep.into_iter().map(|i| &sessions[i]).collect()
        }
    }
}

/// Per-session hit rates used as participant-level observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantMeans {
    pub participant_id: String,
    pub session_id: String,
    pub trials: usize,
    pub subject_rate: f64,
    pub decoy_rate: f64,
}

/// One row per session with at least one valid trial.
pub fn participant_means(sessions: &[&SessionTrials]) -> Vec<ParticipantMeans> {
    sessions
        .iter()
        .filter_map(|s| {
            let valid: Vec<_> = s.valid().collect();
            if valid.is_empty() {
                return None;
            }
            let n = valid.len() as f64;
            Some(ParticipantMeans {
                participant_id: s.participant_id.clone(),
                session_id: s.session_id.clone(),
                trials: valid.len(),
                subject_rate: valid.iter().filter(|t| t.subject_hit).count() as f64 / n,
                decoy_rate: valid.iter().filter(|t| t.decoy_hit).count() as f64 / n,
            })
        })
        .collect()
}

/// Two-sided one-sample t test of `values` against `mu`.
pub fn one_sample_t(values: &[f64], mu: f64, alpha: f64) -> TestResult {
    let name = "One-Sample t";
    let n = values.len();
    if n < 2 {
        return insufficient(name, 2, n);
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
    let se = (var / nf).sqrt();
    if se < 1e-12 {
        return TestResult {
            name: name.to_string(),
            significant: false,
            p_value: None,
            statistic: 0.0,
            details: format!("Zero variance (mean={mean:.4})"),
            grade: 'F',
        };
    }
    let t = (mean - mu) / se;
    let df = nf - 1.0;
    let p = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * dist.sf(t.abs()),
        Err(_) => f64::NAN,
    };
    TestResult::from_p(name, p, t, alpha, format!("mean={mean:.4} vs {mu:.4}, t={t:.4}, df={df}"))
}

/// Two-sided paired t test on `a[i] - b[i]`.
pub fn paired_t(a: &[f64], b: &[f64], alpha: f64) -> TestResult {
    let diffs: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    let mut result = one_sample_t(&diffs, 0.0, alpha);
    result.name = "Paired t".to_string();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::NormalizedTrial;

    fn session(id: &str, participant: &str, started: Option<u64>, hits: &[bool]) -> SessionTrials {
        SessionTrials {
            session_id: id.into(),
            participant_id: participant.into(),
            started_at_ms: started,
            exited_early: false,
            trials: hits
                .iter()
                .enumerate()
                .map(|(i, &h)| NormalizedTrial {
                    block_id: "b".into(),
                    trial_number: i as u32 + 1,
                    target_index: Some(0),
                    decoy_index: Some(1),
                    selected_index: Some(if h { 0 } else { 2 }),
                    subject_hit: h,
                    decoy_hit: false,
                    latency_ms: None,
                    subject_byte: None,
                    decoy_byte: None,
                    responded_at_ms: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("pooled".parse::<AggregationMode>().unwrap(), AggregationMode::Pooled);
        assert_eq!("first-session".parse::<AggregationMode>().unwrap(), AggregationMode::FirstSession);
        assert!("both".parse::<AggregationMode>().is_err());
        assert_eq!(AggregationMode::FirstSession.to_string(), "first-session");
        assert_eq!(serde_json::to_string(&AggregationMode::FirstSession).unwrap(), "\"first-session\"");
    }

    #[test]
    fn test_first_session_picks_earliest() {
        let sessions = vec![
            session("late", "p1", Some(200), &[true]),
            session("other", "p2", None, &[true]),
            session("early", "p1", Some(100), &[false]),
            session("untimed", "p1", None, &[false]),
        ];
        let ids: Vec<&str> = select_sessions(&sessions, AggregationMode::FirstSession)
            .iter()
            .map(|s| s.session_id.as_str())
            .collect();
        assert_eq!(ids, vec!["other", "early"]);
        assert_eq!(select_sessions(&sessions, AggregationMode::Pooled).len(), 4);
    }

    #[test]
    fn test_participant_means() {
        let sessions = [
            session("a", "p1", None, &[true, false, false, false]),
            session("b", "p2", None, &[]),
        ];
        let refs: Vec<&SessionTrials> = sessions.iter().collect();
        let means = participant_means(&refs);
        assert_eq!(means.len(), 1);
        assert!((means[0].subject_rate - 0.25).abs() < 1e-12);
        assert_eq!(means[0].decoy_rate, 0.0);
    }

    #[test]
    fn test_one_sample_t_known_value() {
        // mean 0.3, sd 0.0816, n 4 -> t ~ 2.449, df 3, p ~ 0.092
        let values = [0.2, 0.3, 0.3, 0.4];
        let sd = (0.02 / 3.0f64).sqrt();
        let r = one_sample_t(&values, 0.2, 0.05);
        assert!((r.statistic - 0.1 / (sd / 2.0)).abs() < 1e-9);
        let p = r.p_value.unwrap();
        assert!(p > 0.05 && p < 0.3, "{p}");
        assert!(!r.significant);
    }

    #[test]
    fn test_one_sample_t_edges() {
        assert!(one_sample_t(&[0.2], 0.2, 0.05).details.contains("Insufficient"));
        assert!(one_sample_t(&[0.2, 0.2, 0.2], 0.2, 0.05).p_value.is_none());
    }

    #[test]
    fn test_paired_t() {
        let a = [0.40, 0.35, 0.45, 0.38, 0.42, 0.41];
        let b = [0.20, 0.18, 0.22, 0.21, 0.19, 0.20];
        let r = paired_t(&a, &b, 0.05);
        assert_eq!(r.name, "Paired t");
        assert!(r.significant);
        assert!(r.statistic > 0.0);
    }
}
