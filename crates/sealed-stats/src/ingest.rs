//! Record ingestion.
//!
//! Historical session documents name the same fields in several ways
//! (`target_index`, `targetIndex`, `subjectIndex`, ...). Every alias is
//! resolved exactly once here into [`NormalizedTrial`]; analysis code never
//! looks at raw JSON. Hit flags are recomputed from indices whenever the
//! indices are present, so a stale or hand-edited flag cannot leak into the
//! statistics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AuditConfig;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected document shape: {0}")]
    Shape(String),

    #[error("session {session}, record {record}: field `{field}` {detail}")]
    Field {
        session: String,
        record: usize,
        field: &'static str,
        detail: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Aliases
// ═══════════════════════════════════════════════════════════════════════════════

const SESSION_ID: &[&str] = &["session_id", "sessionId", "run_id", "runId", "id"];
const PARTICIPANT_ID: &[&str] = &["participant_id", "participantId", "uid", "user_id", "userId"];
const STARTED_AT: &[&str] = &[
    "started_at_ms",
    "startedAtMs",
    "aggregate.started_at_ms",
    "created_at_ms",
    "createdAt",
    "timestamp",
];
const EXITED_EARLY: &[&str] = &["exited_early", "exitedEarly", "aggregate.exited_early"];
const BLOCKS: &[&str] = &["blocks"];
const TRIALS: &[&str] = &["trials", "logs", "records"];
const BLOCK_ID: &[&str] = &["block_id", "blockId", "block"];
const TRIAL_NUMBER: &[&str] = &["trial_number", "trialNumber", "trial", "trialIndex"];
const TARGET: &[&str] = &["target_index", "targetIndex", "subject_index", "subjectIndex", "target"];
const DECOY: &[&str] = &["decoy_index", "decoyIndex", "ghost_index", "ghostIndex", "ghostTargetIndex"];
const SELECTED: &[&str] = &[
    "selected_index",
    "selectedIndex",
    "choice_index",
    "choiceIndex",
    "chosenIndex",
    "selection",
];
const SUBJECT_HIT: &[&str] = &["subject_hit", "subjectHit", "hit", "isHit"];
const DECOY_HIT: &[&str] = &["decoy_hit", "decoyHit", "ghost_hit", "ghostHit"];
const LATENCY: &[&str] = &["latency_ms", "latencyMs", "rt", "reaction_time_ms", "responseTimeMs"];
const SUBJECT_BYTE: &[&str] = &["assignment.subject_byte", "subject_byte", "subjectByte", "rawByte"];
const DECOY_BYTE: &[&str] = &["assignment.decoy_byte", "decoy_byte", "decoyByte", "ghostByte"];
const RESPONDED_AT: &[&str] = &["responded_at_ms", "respondedAtMs"];

/// First non-null value under any alias. Aliases may be dotted paths.
fn lookup<'a>(obj: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| {
        let mut cur = obj;
        for part in alias.split('.') {
            cur = cur.get(part)?;
        }
        (!cur.is_null()).then_some(cur)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Normalized types
// ═══════════════════════════════════════════════════════════════════════════════

/// One trial in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTrial {
    pub block_id: String,
    pub trial_number: u32,
    pub target_index: Option<u8>,
    pub decoy_index: Option<u8>,
    pub selected_index: Option<u8>,
    pub subject_hit: bool,
    pub decoy_hit: bool,
    pub latency_ms: Option<f64>,
    pub subject_byte: Option<u8>,
    pub decoy_byte: Option<u8>,
    pub responded_at_ms: Option<u64>,
}

impl NormalizedTrial {
    /// Only trials with all three indices enter the tallies.
    pub fn is_valid(&self) -> bool {
        self.target_index.is_some() && self.decoy_index.is_some() && self.selected_index.is_some()
    }
}

/// One participant run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTrials {
    pub session_id: String,
    pub participant_id: String,
    pub started_at_ms: Option<u64>,
    pub exited_early: bool,
    pub trials: Vec<NormalizedTrial>,
}

impl SessionTrials {
    pub fn valid(&self) -> impl Iterator<Item = &NormalizedTrial> {
        self.trials.iter().filter(|t| t.is_valid())
    }

    pub fn excluded(&self) -> usize {
        self.trials.len() - self.valid().count()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field coercion
// ═══════════════════════════════════════════════════════════════════════════════

struct Ctx<'a> {
    session: &'a str,
    record: usize,
}

impl Ctx<'_> {
    fn err(&self, field: &'static str, detail: impl Into<String>) -> IngestError {
        IngestError::Field {
            session: self.session.to_string(),
            record: self.record,
            field,
            detail: detail.into(),
        }
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().filter(|n| *n <= 1).map(|n| n == 1),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn byte_field(obj: &Value, aliases: &[&str], field: &'static str, ctx: &Ctx) -> Result<Option<u8>, IngestError> {
    match lookup(obj, aliases) {
        None => Ok(None),
        Some(v) => {
            let n = as_u64(v).ok_or_else(|| ctx.err(field, format!("is not a non-negative integer: {v}")))?;
            u8::try_from(n)
                .map(Some)
                .map_err(|_| ctx.err(field, format!("is out of byte range: {n}")))
        }
    }
}

/// An index outside `0..K` is treated as missing, which excludes the trial.
fn index_field(
    obj: &Value,
    aliases: &[&str],
    field: &'static str,
    k: usize,
    ctx: &Ctx,
) -> Result<Option<u8>, IngestError> {
    let idx = byte_field(obj, aliases, field, ctx)?;
    Ok(match idx {
        Some(i) if (i as usize) < k => Some(i),
        Some(i) => {
            log::warn!(
                "session {} record {}: {field}={i} outside 0..{k}, trial excluded",
                ctx.session,
                ctx.record
            );
            None
        }
        None => None,
    })
}

fn normalize_trial(
    obj: &Value,
    fallback_block: &str,
    position: usize,
    config: &AuditConfig,
    ctx: &Ctx,
) -> Result<NormalizedTrial, IngestError> {
    if !obj.is_object() {
        return Err(ctx.err("record", "is not an object"));
    }
    let k = config.symbol_count;
    let target_index = index_field(obj, TARGET, "target_index", k, ctx)?;
    let decoy_index = index_field(obj, DECOY, "decoy_index", k, ctx)?;
    let selected_index = index_field(obj, SELECTED, "selected_index", k, ctx)?;

    let logged_subject_hit = lookup(obj, SUBJECT_HIT).and_then(as_bool).unwrap_or(false);
    let logged_decoy_hit = lookup(obj, DECOY_HIT).and_then(as_bool).unwrap_or(false);
    let subject_hit = match (selected_index, target_index) {
        (Some(s), Some(t)) => s == t,
        _ => logged_subject_hit,
    };
    let decoy_hit = match (decoy_index, target_index) {
        (Some(d), Some(t)) => d == t,
        _ => logged_decoy_hit,
    };
    if target_index.is_some() && selected_index.is_some() && subject_hit != logged_subject_hit {
        log::debug!(
            "session {} record {}: logged subject_hit disagrees with indices",
            ctx.session,
            ctx.record
        );
    }

    let trial_number = match lookup(obj, TRIAL_NUMBER) {
        Some(v) => {
            let n = as_u64(v).ok_or_else(|| ctx.err("trial_number", format!("is not an integer: {v}")))?;
            u32::try_from(n).map_err(|_| ctx.err("trial_number", "does not fit in u32"))?
        }
        None => position as u32 + 1,
    };

    Ok(NormalizedTrial {
        block_id: lookup(obj, BLOCK_ID)
            .and_then(text)
            .unwrap_or_else(|| fallback_block.to_string()),
        trial_number,
        target_index,
        decoy_index,
        selected_index,
        subject_hit,
        decoy_hit,
        latency_ms: lookup(obj, LATENCY).and_then(as_f64).filter(|l| l.is_finite() && *l >= 0.0),
        subject_byte: byte_field(obj, SUBJECT_BYTE, "subject_byte", ctx)?,
        decoy_byte: byte_field(obj, DECOY_BYTE, "decoy_byte", ctx)?,
        responded_at_ms: lookup(obj, RESPONDED_AT).and_then(as_u64),
    })
}

fn normalize_session(doc: &Value, ordinal: usize, config: &AuditConfig) -> Result<SessionTrials, IngestError> {
    if !doc.is_object() {
        return Err(IngestError::Shape(format!("session #{ordinal} is not an object")));
    }
    let session_id = lookup(doc, SESSION_ID)
        .and_then(text)
        .unwrap_or_else(|| format!("session-{ordinal}"));
    let participant_id = lookup(doc, PARTICIPANT_ID)
        .and_then(text)
        .unwrap_or_else(|| session_id.clone());

    let mut raw: Vec<(&Value, String)> = Vec::new();
    if let Some(blocks) = lookup(doc, BLOCKS).and_then(Value::as_array) {
        for (b, block) in blocks.iter().enumerate() {
            let block_id = lookup(block, BLOCK_ID)
                .and_then(text)
                .unwrap_or_else(|| format!("block-{}", b + 1));
            if let Some(trials) = lookup(block, TRIALS).and_then(Value::as_array) {
                raw.extend(trials.iter().map(|t| (t, block_id.clone())));
            }
        }
    } else if let Some(trials) = lookup(doc, TRIALS).and_then(Value::as_array) {
        raw.extend(trials.iter().map(|t| (t, "block-1".to_string())));
    }

    let mut trials = Vec::with_capacity(raw.len());
    for (record, (obj, block_id)) in raw.into_iter().enumerate() {
        let ctx = Ctx {
            session: &session_id,
            record,
        };
        trials.push(normalize_trial(obj, &block_id, record, config, &ctx)?);
    }

    let started_at_ms = lookup(doc, STARTED_AT)
        .and_then(as_u64)
        .or_else(|| trials.iter().filter_map(|t| t.responded_at_ms).min());

    Ok(SessionTrials {
        session_id,
        participant_id,
        started_at_ms,
        exited_early: lookup(doc, EXITED_EARLY).and_then(as_bool).unwrap_or(false),
        trials,
    })
}

/// Normalize an export bundle (`{"sessions": [...]}`), a bare array of
/// session documents, or a single session document.
pub fn ingest(doc: &Value, config: &AuditConfig) -> Result<Vec<SessionTrials>, IngestError> {
    let sessions: Vec<&Value> = match doc {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("sessions") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(_) => return Err(IngestError::Shape("`sessions` is not an array".into())),
            None => vec![doc],
        },
        _ => {
            return Err(IngestError::Shape(
                "expected an array of sessions or an object with `sessions`".into(),
            ));
        }
    };
    let out = sessions
        .into_iter()
        .enumerate()
        .map(|(i, s)| normalize_session(s, i + 1, config))
        .collect::<Result<Vec<_>, _>>()?;
    log::info!(
        "ingested {} sessions, {} trials",
        out.len(),
        out.iter().map(|s| s.trials.len()).sum::<usize>()
    );
    Ok(out)
}

/// [`ingest`] from JSON text.
pub fn ingest_str(json: &str, config: &AuditConfig) -> Result<Vec<SessionTrials>, IngestError> {
    let doc: Value = serde_json::from_str(json)?;
    ingest(&doc, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> AuditConfig {
        AuditConfig::default()
    }

    #[test]
    fn test_canonical_bundle() {
        let doc = json!({
            "version": 1,
            "sessions": [{
                "session_id": "s1",
                "participant_id": "p1",
                "aggregate": {"started_at_ms": 1000, "exited_early": true},
                "blocks": [{
                    "block_id": "b1",
                    "trials": [
                        {"trial_number": 1, "target_index": 2, "decoy_index": 2, "selected_index": 2,
                         "subject_hit": true, "decoy_hit": true, "latency_ms": 640,
                         "assignment": {"subject_byte": 7, "decoy_byte": 12}},
                        {"trial_number": 2, "target_index": 0, "decoy_index": 3, "selected_index": null,
                         "subject_hit": false, "decoy_hit": false}
                    ]
                }]
            }]
        });
        let sessions = ingest(&doc, &cfg()).unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.session_id, "s1");
        assert_eq!(s.participant_id, "p1");
        assert_eq!(s.started_at_ms, Some(1000));
        assert!(s.exited_early);
        assert_eq!(s.trials.len(), 2);
        assert_eq!(s.valid().count(), 1);
        assert_eq!(s.excluded(), 1);
        let t = &s.trials[0];
        assert_eq!(t.block_id, "b1");
        assert!(t.subject_hit && t.decoy_hit);
        assert_eq!(t.latency_ms, Some(640.0));
        assert_eq!((t.subject_byte, t.decoy_byte), (Some(7), Some(12)));
    }

    #[test]
    fn test_legacy_aliases() {
        let doc = json!([{
            "sessionId": "old",
            "uid": "u9",
            "timestamp": "1700000000000",
            "logs": [
                {"trialIndex": 1, "subjectIndex": "1", "ghostIndex": 4, "choiceIndex": 1, "rt": 512.5, "ghostByte": 9},
                {"trialIndex": 2, "targetIndex": 3, "ghostTargetIndex": 3, "chosenIndex": 0}
            ]
        }]);
        let sessions = ingest(&doc, &cfg()).unwrap();
        let s = &sessions[0];
        assert_eq!(s.session_id, "old");
        assert_eq!(s.participant_id, "u9");
        assert_eq!(s.started_at_ms, Some(1_700_000_000_000));
        assert_eq!(s.trials[0].target_index, Some(1));
        assert!(s.trials[0].subject_hit);
        assert!(!s.trials[0].decoy_hit);
        assert_eq!(s.trials[0].decoy_byte, Some(9));
        assert_eq!(s.trials[0].block_id, "block-1");
        assert!(!s.trials[1].subject_hit);
        assert!(s.trials[1].decoy_hit);
    }

    #[test]
    fn test_logged_flags_are_recomputed() {
        let doc = json!({"session_id": "s", "trials": [
            {"target_index": 1, "decoy_index": 2, "selected_index": 3, "subject_hit": true, "decoy_hit": true}
        ]});
        let t = &ingest(&doc, &cfg()).unwrap()[0].trials[0];
        assert!(!t.subject_hit);
        assert!(!t.decoy_hit);
    }

    #[test]
    fn test_out_of_range_index_excludes_trial() {
        let doc = json!({"session_id": "s", "trials": [
            {"target_index": 7, "decoy_index": 2, "selected_index": 3}
        ]});
        let s = &ingest(&doc, &cfg()).unwrap()[0];
        assert_eq!(s.trials[0].target_index, None);
        assert_eq!(s.valid().count(), 0);
    }

    #[test]
    fn test_missing_ids_get_fallbacks() {
        let doc = json!([{"trials": [{"target_index": 0, "decoy_index": 0, "selected_index": 0, "responded_at_ms": 55}]}]);
        let s = &ingest(&doc, &cfg()).unwrap()[0];
        assert_eq!(s.session_id, "session-1");
        assert_eq!(s.participant_id, "session-1");
        assert_eq!(s.trials[0].trial_number, 1);
        assert_eq!(s.started_at_ms, Some(55));
    }

    #[test]
    fn test_bad_field_is_an_error() {
        let doc = json!([{"session_id": "s", "trials": [{"target_index": "north"}]}]);
        match ingest(&doc, &cfg()) {
            Err(IngestError::Field { field, record, .. }) => {
                assert_eq!(field, "target_index");
                assert_eq!(record, 0);
            }
            other => panic!("expected field error, got {other:?}"),
        }
        let doc = json!([{"session_id": "s", "trials": [{"subject_byte": 300}]}]);
        assert!(matches!(ingest(&doc, &cfg()), Err(IngestError::Field { .. })));
    }

    #[test]
    fn test_bad_shapes() {
        assert!(matches!(ingest(&json!(3), &cfg()), Err(IngestError::Shape(_))));
        assert!(matches!(ingest(&json!({"sessions": 1}), &cfg()), Err(IngestError::Shape(_))));
        assert!(matches!(ingest(&json!([1]), &cfg()), Err(IngestError::Shape(_))));
        assert!(matches!(ingest_str("{", &cfg()), Err(IngestError::Json(_))));
    }
}
