//! End-to-end audits over synthetic session exports.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sealed_stats::{AggregationMode, AuditConfig, FlagKind, audit, ingest, ingest_str, render_text};
use serde_json::{Value, json};

const LAYOUT: [&str; 5] = ["circle", "plus", "waves", "square", "star"];

/// A session shaped like the engine's export: blocks of trial records with
/// identity layouts, `byte mod 5` targets, and a participant picking at random.
fn exported_session(rng: &mut StdRng, id: &str, participant: &str, started: u64, trials: usize) -> Value {
    let records: Vec<Value> = (1..=trials)
        .map(|n| {
            let subject_byte: u8 = rng.random();
            let decoy_byte: u8 = rng.random();
            let target = subject_byte % 5;
            let decoy = decoy_byte % 5;
            let selected = rng.random_range(0..5u8);
            json!({
                "session_id": id,
                "block_id": "block-a",
                "trial_number": n,
                "assignment": {
                    "subject_byte": subject_byte,
                    "decoy_byte": decoy_byte,
                    "subject_symbol": LAYOUT[target as usize],
                    "decoy_symbol": LAYOUT[decoy as usize],
                    "target_index": target,
                    "decoy_index": decoy
                },
                "layout": LAYOUT,
                "target_index": target,
                "decoy_index": decoy,
                "selected_index": selected,
                "subject_hit": selected == target,
                "decoy_hit": decoy == target,
                "latency_ms": rng.random_range(300..2000u64),
                "responded_at_ms": started + n as u64 * 1000
            })
        })
        .collect();
    json!({
        "session_id": id,
        "participant_id": participant,
        "aggregate": {"started_at_ms": started, "exited_early": false},
        "blocks": [{"block_id": "block-a", "trials": records}]
    })
}

#[test]
fn random_sessions_raise_no_mapping_or_decoy_flags() {
    let mut rng = StdRng::seed_from_u64(20_240_601);
    let sessions: Vec<Value> = (0..40)
        .map(|i| exported_session(&mut rng, &format!("s{i}"), &format!("p{}", i % 25), 1_000 + i as u64, 100))
        .collect();
    let bundle = json!({"version": 1, "exported_at": "2024-06-01T00:00:00.000Z", "sessions": sessions});
    let config = AuditConfig {
        significance_alpha: 0.001,
        ..Default::default()
    };
    let parsed = ingest(&bundle, &config).unwrap();
    assert_eq!(parsed.len(), 40);

    let report = audit(&parsed, AggregationMode::Pooled, &config);
    assert_eq!(report.pooled.trials, 4_000);
    assert!(report.flags_of(FlagKind::MappingNonUniform).next().is_none());
    assert!(
        report
            .flags_of(FlagKind::DecoyOffChance)
            .all(|f| f.scope != "pooled"),
        "{:?}",
        report.flags
    );
    assert!(report.pooled.decoy_rate > 0.17 && report.pooled.decoy_rate < 0.23);

    let first = audit(&parsed, AggregationMode::FirstSession, &config);
    assert_eq!(first.pooled.sessions, 25);
    assert_eq!(first.pooled.trials, 2_500);
    assert!(first.pooled.participant_t.is_some());
}

#[test]
fn swapped_index_bug_is_surfaced_as_symmetry_and_decoy_flags() {
    // A mapping bug that writes the decoy's index into the target slot.
    let mut rng = StdRng::seed_from_u64(7);
    let mut session = exported_session(&mut rng, "buggy", "p1", 1, 200);
    if let Some(trials) = session["blocks"][0]["trials"].as_array_mut() {
        for t in trials {
            let decoy = t["decoy_index"].clone();
            t["target_index"] = decoy;
        }
    }
    let parsed = ingest(&json!([session]), &AuditConfig::default()).unwrap();
    let report = audit(&parsed, AggregationMode::Pooled, &AuditConfig::default());
    assert_eq!(report.pooled.decoy_hits, 200);
    assert!(report.flags_of(FlagKind::DecoyOffChance).any(|f| f.scope == "pooled"));
    assert!(report.flags_of(FlagKind::SymmetryViolation).any(|f| f.scope == "pooled"));
}

#[test]
fn early_exit_session_is_reported_with_partial_trials() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut session = exported_session(&mut rng, "quit", "p1", 1, 12);
    session["aggregate"]["exited_early"] = json!(true);
    session["blocks"][0]["trials"][11]["selected_index"] = Value::Null;
    let text = serde_json::to_string(&json!({"sessions": [session]})).unwrap();

    let parsed = ingest_str(&text, &AuditConfig::default()).unwrap();
    let report = audit(&parsed, AggregationMode::Pooled, &AuditConfig::default());
    let row = &report.sessions[0];
    assert!(row.exited_early);
    assert_eq!(row.trials, 11);
    assert_eq!(row.excluded, 1);
    assert_eq!(row.rounds_total, 3);
    let rendered = render_text(&report);
    assert!(rendered.contains("early"));
}
