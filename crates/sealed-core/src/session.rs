//! Participant sessions.
//!
//! A session owns one run document in the store and a sequence of blocks.
//! The run document is created lazily and exactly once, no matter how many
//! callers ask for it concurrently.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::OnceCell;

use crate::block::{BlockRunner, BlockState, Prepared, PreparedTrial};
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::fetch::EntropyAdapter;
use crate::record::{AuditGapKind, Consent, ExitReason, ExitStatus, Presentation, SessionAggregate, TrialRecord};
use crate::source::SourceKind;
use crate::store::{DocumentStore, paths};
use crate::time::now_ms;

/// Lazily created run document.
pub struct SessionHandle {
    store: Arc<dyn DocumentStore>,
    participant_id: String,
    run_id: OnceCell<String>,
}

impl SessionHandle {
    pub fn new(store: Arc<dyn DocumentStore>, participant_id: impl Into<String>) -> Self {
        Self {
            store,
            participant_id: participant_id.into(),
            run_id: OnceCell::new(),
        }
    }

    /// Id of the run document, creating it on first use.
    ///
    /// Concurrent callers share one in-flight creation. If creation fails the
    /// cell stays empty and the next call tries again.
    pub async fn ensure_run_document(&self) -> Result<String, StoreError> {
        let id = self
            .run_id
            .get_or_try_init(|| async {
                let id = self
                    .store
                    .create(
                        paths::SESSIONS,
                        json!({
                            "participant_id": self.participant_id,
                            "created_at_ms": now_ms(),
                        }),
                    )
                    .await?;
                log::info!("created run document {id} for participant {}", self.participant_id);
                Ok::<_, StoreError>(id)
            })
            .await?;
        Ok(id.clone())
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.get().map(String::as_str)
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }
}

/// One participant run: a series of blocks and the aggregate document.
pub struct Session {
    config: EngineConfig,
    adapter: Arc<EntropyAdapter>,
    store: Arc<dyn DocumentStore>,
    source: SourceKind,
    handle: Arc<SessionHandle>,
    run_id: String,
    aggregate: SessionAggregate,
    active: Option<Arc<BlockRunner>>,
    finished_blocks: Vec<Arc<BlockRunner>>,
}

impl Session {
    /// Create the run document and an empty aggregate.
    pub async fn start(
        config: EngineConfig,
        adapter: Arc<EntropyAdapter>,
        store: Arc<dyn DocumentStore>,
        source: SourceKind,
        participant_id: impl Into<String>,
        planned_trials: usize,
    ) -> Result<Self, EngineError> {
        let handle = Arc::new(SessionHandle::new(store.clone(), participant_id));
        Self::start_with_handle(config, adapter, store, source, handle, planned_trials).await
    }

    /// Start on a handle other tasks may already be resolving.
    pub async fn start_with_handle(
        config: EngineConfig,
        adapter: Arc<EntropyAdapter>,
        store: Arc<dyn DocumentStore>,
        source: SourceKind,
        handle: Arc<SessionHandle>,
        planned_trials: usize,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let run_id = handle.ensure_run_document().await?;
        let session = Self {
            aggregate: SessionAggregate::new(&run_id, handle.participant_id(), planned_trials),
            config,
            adapter,
            store,
            source,
            handle,
            run_id,
            active: None,
            finished_blocks: Vec::new(),
        };
        session.write_aggregate().await;
        Ok(session)
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn aggregate(&self) -> &SessionAggregate {
        &self.aggregate
    }

    pub fn active_block(&self) -> Option<&Arc<BlockRunner>> {
        self.active.as_ref()
    }

    pub fn set_consent(&mut self, version: impl Into<String>) {
        self.aggregate.consent = Some(Consent {
            version: version.into(),
            accepted_at_ms: now_ms(),
        });
    }

    /// Best-effort write of the aggregate document.
    async fn write_aggregate(&self) -> bool {
        let doc = match serde_json::to_value(&self.aggregate) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("session {}: aggregate encoding failed: {e}", self.run_id);
                return false;
            }
        };
        if let Err(e) = self
            .store
            .upsert(&paths::detail(&self.run_id, "aggregate"), doc.clone())
            .await
        {
            log::warn!("session {}: aggregate write failed: {e}", self.run_id);
            return false;
        }
        // Mirror onto the run document so listings carry the totals.
        let mut run_doc = self
            .store
            .get(&paths::session(&self.run_id))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut run_doc {
            map.insert("aggregate".into(), doc);
        }
        if let Err(e) = self.store.upsert(&paths::session(&self.run_id), run_doc).await {
            log::warn!("session {}: run document update failed: {e}", self.run_id);
            return false;
        }
        true
    }

    /// Commit a new block. Fails if a block is still running.
    pub async fn start_block(&mut self, trial_count: usize) -> Result<Arc<BlockRunner>, EngineError> {
        if let Some(active) = &self.active {
            return Err(EngineError::InvalidState {
                block_id: active.block_id().to_string(),
                state: active.state().await.to_string(),
                action: "start another block while this one is active",
            });
        }
        let block = Arc::new(BlockRunner::new(
            &self.run_id,
            self.source,
            trial_count,
            self.config.clone(),
            self.adapter.clone(),
            self.store.clone(),
        )?);
        block.commit().await?;
        self.aggregate.set_block_state(block.block_id(), BlockState::Committed);
        for gap in block.gaps().await {
            self.aggregate.add_gap(gap.block_id, gap.kind, gap.detail);
        }
        self.write_aggregate().await;
        self.active = Some(block.clone());
        Ok(block)
    }

    /// Prepare the active block's next trial.
    pub async fn prepare_trial(&self) -> Result<Prepared<PreparedTrial>, EngineError> {
        let block = self.require_active("prepare a trial")?;
        block.prepare_trial().await
    }

    /// Record a response on the active block and update the aggregate.
    pub async fn record_response(
        &mut self,
        trial: &PreparedTrial,
        presentation: Presentation,
        selected_index: Option<u8>,
        latency_ms: Option<u64>,
        click_ms: u64,
    ) -> Result<TrialRecord, EngineError> {
        let block = self.require_active("record a response")?.clone();
        let record = block
            .record_response(trial, presentation, selected_index, latency_ms, click_ms)
            .await?;
        self.aggregate.add_record(&record);
        self.aggregate.set_block_state(block.block_id(), BlockState::InTrials);
        self.write_aggregate().await;
        Ok(record)
    }

    fn require_active(&self, action: &'static str) -> Result<&Arc<BlockRunner>, EngineError> {
        self.active.as_ref().ok_or(EngineError::InvalidState {
            block_id: String::new(),
            state: "no active block".into(),
            action,
        })
    }

    /// Reveal and close the active block after its last trial.
    ///
    /// Returns whether the reveal was written; a failed reveal is recorded as
    /// an audit gap and the block is closed regardless.
    pub async fn finish_block(&mut self) -> Result<bool, EngineError> {
        let block = self.require_active("finish a block")?.clone();
        let revealed = block.reveal().await?;
        block.close().await?;
        self.fold_block(&block).await;
        self.active = None;
        self.finished_blocks.push(block);
        self.write_aggregate().await;
        Ok(revealed)
    }

    /// Retry reveals that failed earlier. Returns how many are still missing.
    pub async fn retry_pending_reveals(&mut self) -> usize {
        let mut missing = 0;
        for block in &self.finished_blocks {
            let gaps = block.gaps().await;
            if !gaps.iter().any(|g| g.kind == AuditGapKind::RevealMissing) {
                continue;
            }
            match block.retry_reveal().await {
                Ok(true) => {
                    self.aggregate
                        .audit_gaps
                        .retain(|g| !(g.block_id == block.block_id() && g.kind == AuditGapKind::RevealMissing));
                    self.aggregate.set_block_state(block.block_id(), block.state().await);
                }
                Ok(false) | Err(_) => missing += 1,
            }
        }
        self.write_aggregate().await;
        missing
    }

    async fn fold_block(&mut self, block: &BlockRunner) {
        let remaining = block.flush_unsaved().await;
        if remaining > 0 {
            self.aggregate.add_gap(
                block.block_id(),
                AuditGapKind::RecordWriteFailed,
                format!("{remaining} trial records not persisted"),
            );
        }
        for gap in block.gaps().await {
            let known = self
                .aggregate
                .audit_gaps
                .iter()
                .any(|g| g.block_id == gap.block_id && g.kind == gap.kind);
            if !known {
                self.aggregate.add_gap(gap.block_id, gap.kind, gap.detail);
            }
        }
        self.aggregate
            .recount_block(block.block_id(), &block.records().await);
        self.aggregate
            .set_block_state(block.block_id(), block.state().await);
    }

    /// Leave the session before all planned trials are done.
    ///
    /// Stops the active block (no new fetches), flushes any records whose
    /// write failed, and writes the aggregate with `exited_early = true`.
    pub async fn exit_early(&mut self, reason: ExitReason) -> SessionAggregate {
        if let Some(block) = self.active.take() {
            block.abandon().await;
            self.fold_block(&block).await;
            self.finished_blocks.push(block);
        }
        log::info!(
            "session {} exited early ({:?}) after {} trials",
            self.run_id,
            reason,
            self.aggregate.total_trials
        );
        self.aggregate.finish(ExitStatus::EarlyExit { reason });
        self.write_aggregate().await;
        self.aggregate.clone()
    }

    /// Mark the session completed. Fails while a block is still active.
    pub async fn finalize(&mut self) -> Result<SessionAggregate, EngineError> {
        if self.active.is_some() {
            return Err(EngineError::InvalidState {
                block_id: String::new(),
                state: "block active".into(),
                action: "finalize the session",
            });
        }
        self.aggregate.finish(ExitStatus::Completed);
        self.write_aggregate().await;
        Ok(self.aggregate.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::sources::LocalSecureSource;
    use crate::store::MemoryStore;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            flash_duration_ms: 1,
            inter_stimulus_interval_ms: 0,
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..Default::default()
        }
    }

    async fn new_session(store: Arc<MemoryStore>, planned: usize) -> Session {
        let adapter = Arc::new(EntropyAdapter::new(RetryPolicy::default(), 1024).with_source(Arc::new(LocalSecureSource::new())));
        Session::start(fast_config(), adapter, store, SourceKind::LocalSecure, "p1", planned)
            .await
            .unwrap()
    }

    async fn play(session: &mut Session, trials: usize, hit_every: u32) {
        for _ in 0..trials {
            let trial = session.prepare_trial().await.unwrap().ready().unwrap();
            let block = session.active_block().unwrap().clone();
            let shown = block.present(&trial).await.unwrap().ready().unwrap();
            let pick = if trial.trial_number % hit_every == 0 {
                trial.assignment.target_index
            } else {
                (trial.assignment.target_index + 1) % 5
            };
            session.record_response(&trial, shown, Some(pick), Some(300), now_ms()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_exactly_one_document() {
        let store = Arc::new(MemoryStore::new().with_create_delay(Duration::from_millis(20)));
        let handle = Arc::new(SessionHandle::new(store.clone(), "p1"));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.ensure_run_document().await.unwrap() }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        assert_eq!(store.create_count(), 1);
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(handle.run_id(), Some(ids[0].as_str()));
    }

    #[tokio::test]
    async fn test_session_shares_handle_with_concurrent_callers() {
        let store = Arc::new(MemoryStore::new().with_create_delay(Duration::from_millis(20)));
        let handle = Arc::new(SessionHandle::new(store.clone(), "p7"));
        let early = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.ensure_run_document().await.unwrap() })
        };

        let adapter = Arc::new(EntropyAdapter::new(RetryPolicy::default(), 1024).with_source(Arc::new(LocalSecureSource::new())));
        let session = Session::start_with_handle(fast_config(), adapter, store.clone(), SourceKind::LocalSecure, handle.clone(), 5)
            .await
            .unwrap();

        assert_eq!(early.await.unwrap(), session.run_id());
        assert_eq!(store.create_count(), 1);
        assert!(Arc::ptr_eq(session.handle(), &handle));
        assert_eq!(session.aggregate().participant_id, "p7");
    }

    #[tokio::test]
    async fn test_failed_creation_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_on("sessions/");
        let handle = SessionHandle::new(store.clone(), "p1");
        assert!(handle.ensure_run_document().await.is_err());
        assert!(handle.run_id().is_none());

        store.clear_failures();
        let id = handle.ensure_run_document().await.unwrap();
        assert_eq!(handle.ensure_run_document().await.unwrap(), id);
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn test_early_exit_after_twelve_of_thirty() {
        let store = Arc::new(MemoryStore::new());
        let mut session = new_session(store.clone(), 30).await;
        session.set_consent("v2");
        session.start_block(30).await.unwrap();
        play(&mut session, 12, 4).await;

        let agg = session.exit_early(ExitReason::ParticipantQuit).await;
        assert!(agg.exited_early);
        assert_eq!(agg.total_trials, 12);
        assert_eq!(agg.total_hits, 3);
        assert_eq!(agg.blocks.len(), 1);
        assert_eq!(agg.blocks[0].state, BlockState::Abandoned);

        let block_records: usize = store.list(&paths::logs(session.run_id())).await.unwrap().len();
        assert_eq!(block_records, 12);
        let stored: SessionAggregate = serde_json::from_value(
            store
                .get(&paths::detail(session.run_id(), "aggregate"))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(stored.exited_early);
        assert_eq!(stored.consent.unwrap().version, "v2");
        assert!(store.get(&paths::reveal(session.run_id(), agg.blocks[0].block_id.as_str())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_early_exit_flushes_unsaved_records() {
        let store = Arc::new(MemoryStore::new());
        let mut session = new_session(store.clone(), 10).await;
        session.start_block(10).await.unwrap();
        store.fail_on(paths::logs(session.run_id()));
        play(&mut session, 3, 1).await;
        store.clear_failures();

        let agg = session.exit_early(ExitReason::Timeout).await;
        assert_eq!(agg.total_trials, 3);
        assert_eq!(store.list(&paths::logs(session.run_id())).await.unwrap().len(), 3);
        assert!(agg.audit_gaps.iter().all(|g| g.kind != AuditGapKind::RecordWriteFailed));
    }

    #[tokio::test]
    async fn test_two_blocks_then_finalize() {
        let store = Arc::new(MemoryStore::new());
        let mut session = new_session(store.clone(), 10).await;
        for _ in 0..2 {
            session.start_block(5).await.unwrap();
            assert!(session.start_block(5).await.is_err());
            play(&mut session, 5, 1).await;
            assert!(session.finish_block().await.unwrap());
        }
        let agg = session.finalize().await.unwrap();
        assert_eq!(agg.exit_status, ExitStatus::Completed);
        assert!(!agg.exited_early);
        assert_eq!(agg.total_trials, 10);
        assert_eq!(agg.total_hits, 10);
        assert!(agg.blocks.iter().all(|b| b.state == BlockState::Closed));
        assert_eq!(store.list(&paths::reveals(session.run_id())).await.unwrap().len(), 2);
        assert_eq!(store.list(&paths::sealed_envelopes(session.run_id())).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reveal_gap_then_retry() {
        let store = Arc::new(MemoryStore::new());
        let mut session = new_session(store.clone(), 3).await;
        session.start_block(3).await.unwrap();
        play(&mut session, 3, 2).await;
        store.fail_on(paths::reveals(session.run_id()));
        assert!(!session.finish_block().await.unwrap());
        assert!(session
            .aggregate()
            .audit_gaps
            .iter()
            .any(|g| g.kind == AuditGapKind::RevealMissing));

        store.clear_failures();
        assert_eq!(session.retry_pending_reveals().await, 0);
        assert!(session.aggregate().audit_gaps.is_empty());
    }
}
