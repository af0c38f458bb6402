//! Integration tests for sealed-core.
//!
//! These tests drive whole sessions through a store and then audit them
//! offline: commit → trials → reveal → export → verify.

use std::sync::Arc;

use sealed_core::{
    BlockVerdict, DocumentStore, EngineConfig, EntropyAdapter, ExitReason, FileStore, LocalSecureSource,
    MemoryStore, RemapMode, RetryPolicy, Session, SourceKind, TrialRecord, export_all, export_session, now_ms,
    paths, verify_bundle,
};

fn config(remap: RemapMode) -> EngineConfig {
    EngineConfig {
        flash_duration_ms: 1,
        inter_stimulus_interval_ms: 0,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        remap,
        ..Default::default()
    }
}

fn adapter() -> Arc<EntropyAdapter> {
    Arc::new(EntropyAdapter::new(RetryPolicy::default(), 256).with_source(Arc::new(LocalSecureSource::new())))
}

async fn run_block(session: &mut Session, trials: usize) -> Vec<TrialRecord> {
    let block = session.start_block(trials).await.unwrap();
    let mut records = Vec::new();
    for i in 0..trials {
        let trial = session.prepare_trial().await.unwrap().ready().unwrap();
        let shown = block.present(&trial).await.unwrap().ready().unwrap();
        let pick = (i % 5) as u8;
        records.push(
            session
                .record_response(&trial, shown, Some(pick), Some(500 + i as u64), now_ms())
                .await
                .unwrap(),
        );
    }
    records
}

#[tokio::test]
async fn completed_session_verifies_offline() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(tmp.path()));
    let mut session = Session::start(config(RemapMode::None), adapter(), store.clone(), SourceKind::LocalSecure, "p1", 20)
        .await
        .unwrap();
    for _ in 0..2 {
        run_block(&mut session, 10).await;
        assert!(session.finish_block().await.unwrap());
    }
    session.finalize().await.unwrap();

    let exported = export_session(store.as_ref(), session.run_id()).await.unwrap();
    assert_eq!(exported.participant_id, "p1");
    assert_eq!(exported.blocks.len(), 2);
    assert!(exported.blocks.iter().all(|b| b.trials.len() == 10));
    assert_eq!(exported.aggregate.as_ref().unwrap().total_trials, 20);

    let bundle = export_all(store.clone()).await.unwrap();
    let report = verify_bundle(&bundle);
    assert_eq!(report.verified, 2, "{report:?}");
    assert!(report.is_ok());
}

#[tokio::test]
async fn hmac_remap_session_verifies_offline() {
    let store = Arc::new(MemoryStore::new());
    let mut session = Session::start(
        config(RemapMode::HmacRotation),
        adapter(),
        store.clone(),
        SourceKind::LocalSecure,
        "p2",
        8,
    )
    .await
    .unwrap();
    let records = run_block(&mut session, 8).await;
    assert!(records.iter().all(|r| r.remap.proof_hex.is_some()));
    session.finish_block().await.unwrap();

    let report = verify_bundle(&export_all(store).await.unwrap());
    assert_eq!(report.verified, 1, "{report:?}");
}

#[tokio::test]
async fn tampered_log_is_detected() {
    let store = Arc::new(MemoryStore::new());
    let mut session = Session::start(config(RemapMode::None), adapter(), store.clone(), SourceKind::LocalSecure, "p3", 5)
        .await
        .unwrap();
    let records = run_block(&mut session, 5).await;
    session.finish_block().await.unwrap();

    // Rewrite one record so it claims the participant picked the target.
    let mut forged = records[2].clone();
    forged.selected_index = Some(forged.target_index);
    forged.subject_hit = true;
    forged.assignment.subject_byte = forged.assignment.subject_byte.wrapping_add(1);
    let path = paths::log(session.run_id(), &forged.block_id, forged.trial_number);
    store.upsert(&path, serde_json::to_value(&forged).unwrap()).await.unwrap();

    let report = verify_bundle(&export_all(store).await.unwrap());
    assert_eq!(report.failed, 1);
    match &report.blocks[0].verdict {
        BlockVerdict::Failed { problems } => assert!(problems.iter().any(|p| p.contains("trial 3"))),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn abandoned_block_is_unverifiable_but_counted() {
    let store = Arc::new(MemoryStore::new());
    let mut session = Session::start(config(RemapMode::None), adapter(), store.clone(), SourceKind::LocalSecure, "p4", 30)
        .await
        .unwrap();
    let block = session.start_block(30).await.unwrap();
    for _ in 0..12 {
        let trial = session.prepare_trial().await.unwrap().ready().unwrap();
        let shown = block.present(&trial).await.unwrap().ready().unwrap();
        session.record_response(&trial, shown, Some(0), None, now_ms()).await.unwrap();
    }
    let agg = session.exit_early(ExitReason::ParticipantQuit).await;
    assert!(agg.exited_early);
    assert_eq!(agg.total_trials, 12);

    let report = verify_bundle(&export_all(store).await.unwrap());
    assert_eq!(report.unverifiable, 1);
    assert!(report.is_ok());
}

#[tokio::test]
async fn live_session_records_are_marked_live() {
    let store = Arc::new(MemoryStore::new());
    let live = EngineConfig {
        byte_supply: sealed_core::ByteSupply::Live,
        ..config(RemapMode::None)
    };
    let mut session = Session::start(live, adapter(), store.clone(), SourceKind::LocalSecure, "p5", 3)
        .await
        .unwrap();
    let records = run_block(&mut session, 3).await;
    assert!(records.iter().all(|r| r.provenance.live && r.provenance.tape_position.is_none()));
    session.finish_block().await.unwrap();
    assert!(store.list(&paths::commits(session.run_id())).await.unwrap().is_empty());

    let report = verify_bundle(&export_all(store).await.unwrap());
    assert_eq!(report.unverifiable, 1);
}
