//! Block runner: one block of trials from commitment to reveal.
//!
//! ```text
//! Idle ──commit──▶ Committed ──prepare──▶ InTrials ──reveal──▶ Revealed ──close──▶ Closed
//!                                            │           │
//!                                            │           └─(write fails)─▶ RevealPending ──retry──▶ Revealed
//!                                            └──abandon──▶ Abandoned
//! ```
//!
//! In tape mode the digest is written before the first trial can be
//! prepared. Every preparation is tagged with a run id from a monotonically
//! increasing counter; a preparation (or a presentation) that finds a newer
//! id has been issued aborts with [`Prepared::Stale`] and applies nothing.
//!
//! A prepared trial that is superseded by a newer one, or cut off by
//! [`BlockRunner::abandon`], has already consumed its tape pair. It is logged
//! without a selection so every consumed position has exactly one record.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{ByteSupply, CommitFailurePolicy, EngineConfig};
use crate::error::{EngineError, EntropyError};
use crate::fetch::EntropyAdapter;
use crate::layout::{SYMBOL_COUNT, SymbolLayout, shuffle_layout};
use crate::record::{
    AuditGap, AuditGapKind, BlockSummary, Presentation, PresentationMode, Provenance, TrialRecord,
};
use crate::remap::{IndexRemap, remap_for};
use crate::resolver::{TrialAssignment, resolve};
use crate::source::SourceKind;
use crate::store::{DocumentStore, paths};
use crate::tape::CommitmentTape;
use crate::time::now_ms;

/// Upper bound on the best-effort reveal attempted while abandoning.
const ABANDON_REVEAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Idle,
    Committed,
    InTrials,
    RevealPending,
    Revealed,
    Closed,
    Abandoned,
}

impl BlockState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Abandoned)
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Committed => "committed",
            Self::InTrials => "in_trials",
            Self::RevealPending => "reveal_pending",
            Self::Revealed => "revealed",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Index entry under `sealed_envelope/` pointing at a block's commit and reveal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub block_id: String,
    pub digest_hex: String,
    pub trial_count: usize,
    pub commit_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reveal_path: Option<String>,
    pub state: BlockState,
}

/// A trial whose bytes and layout are fixed, ready to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTrial {
    pub run_id: u64,
    pub trial_number: u32,
    pub layout: SymbolLayout,
    pub assignment: TrialAssignment,
    pub provenance: Provenance,
}

/// Result of a step that can be superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared<T> {
    Ready(T),
    Stale,
}

impl<T> Prepared<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(t) => Some(t),
            Self::Stale => None,
        }
    }
}

struct BlockInner {
    state: BlockState,
    tape: Option<CommitmentTape>,
    commitment_published: bool,
    next_trial: u32,
    /// Prepared trial awaiting a response.
    outstanding: Option<PreparedTrial>,
    records: Vec<TrialRecord>,
    /// Records whose log write failed; retried by [`BlockRunner::flush_unsaved`].
    unsaved: Vec<TrialRecord>,
    gaps: Vec<AuditGap>,
}

/// Runs one block against an entropy adapter and a document store.
pub struct BlockRunner {
    session_id: String,
    block_id: String,
    source: SourceKind,
    trial_count: usize,
    config: EngineConfig,
    adapter: Arc<EntropyAdapter>,
    store: Arc<dyn DocumentStore>,
    remap: Box<dyn IndexRemap>,
    latest_run: AtomicU64,
    inner: Mutex<BlockInner>,
}

impl BlockRunner {
    pub fn new(
        session_id: impl Into<String>,
        source: SourceKind,
        trial_count: usize,
        config: EngineConfig,
        adapter: Arc<EntropyAdapter>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if trial_count == 0 {
            return Err(EngineError::InvalidState {
                block_id: String::new(),
                state: BlockState::Idle.to_string(),
                action: "start a block with zero trials",
            });
        }
        let remap = remap_for(config.remap)?;
        Ok(Self {
            session_id: session_id.into(),
            block_id: uuid::Uuid::new_v4().to_string(),
            source,
            trial_count,
            config,
            adapter,
            store,
            remap,
            latest_run: AtomicU64::new(0),
            inner: Mutex::new(BlockInner {
                state: BlockState::Idle,
                tape: None,
                commitment_published: false,
                next_trial: 1,
                outstanding: None,
                records: Vec::new(),
                unsaved: Vec::new(),
                gaps: Vec::new(),
            }),
        })
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn trial_count(&self) -> usize {
        self.trial_count
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub async fn state(&self) -> BlockState {
        self.inner.lock().await.state
    }

    pub async fn records(&self) -> Vec<TrialRecord> {
        self.inner.lock().await.records.clone()
    }

    pub async fn gaps(&self) -> Vec<AuditGap> {
        self.inner.lock().await.gaps.clone()
    }

    pub async fn commitment_published(&self) -> bool {
        self.inner.lock().await.commitment_published
    }

    fn invalid(&self, state: BlockState, action: &'static str) -> EngineError {
        EngineError::InvalidState {
            block_id: self.block_id.clone(),
            state: state.to_string(),
            action,
        }
    }

    fn is_current(&self, run_id: u64) -> bool {
        self.latest_run.load(Ordering::SeqCst) == run_id
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Fetch the block's bytes, build the tape and publish its digest.
    ///
    /// Nothing is published if the fetch fails, and the block stays `Idle`.
    /// With live byte supply there is no tape; the block is marked as such.
    pub async fn commit(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.state != BlockState::Idle {
            return Err(self.invalid(inner.state, "commit"));
        }

        if self.config.byte_supply == ByteSupply::Live {
            log::info!("block {} runs on live bytes from {}; no commitment", self.block_id, self.source);
            inner.gaps.push(AuditGap {
                block_id: self.block_id.clone(),
                kind: AuditGapKind::LiveBytes,
                detail: format!("per-trial fetch from {}", self.source),
            });
            inner.state = BlockState::Committed;
            return Ok(());
        }

        let batch = self
            .adapter
            .fetch_bytes(self.trial_count * 2, self.source)
            .await
            .inspect_err(|e| {
                log::warn!("block {}: entropy fetch from {} failed, block not started: {e}", self.block_id, self.source)
            })?;
        let tape = CommitmentTape::build(&self.block_id, &batch, self.config.salt_len)?;
        let doc = tape.commitment_doc(self.remap.key_digest_hex());
        let commit_path = paths::commit(&self.session_id, &self.block_id);

        match self.store.upsert(&commit_path, serde_json::to_value(&doc)?).await {
            Ok(()) => {
                log::info!(
                    "block {} committed {} trials from {} (batch {}), digest {}",
                    self.block_id,
                    tape.len(),
                    tape.source(),
                    tape.batch_id(),
                    doc.digest_hex
                );
                inner.commitment_published = true;
            }
            Err(e) => match self.config.commit_failure {
                CommitFailurePolicy::FailClosed => {
                    log::warn!("block {}: commitment write failed, block not started: {e}", self.block_id);
                    return Err(EngineError::CommitmentNotPublished {
                        block_id: self.block_id.clone(),
                        source: e,
                    });
                }
                CommitFailurePolicy::FlagAndContinue => {
                    log::warn!(
                        "block {}: commitment write failed, continuing unverifiable: {e}",
                        self.block_id
                    );
                    inner.gaps.push(AuditGap {
                        block_id: self.block_id.clone(),
                        kind: AuditGapKind::CommitmentUnverifiable,
                        detail: e.to_string(),
                    });
                }
            },
        }

        if inner.commitment_published {
            let envelope = SealedEnvelope {
                block_id: self.block_id.clone(),
                digest_hex: doc.digest_hex.clone(),
                trial_count: tape.len(),
                commit_path,
                reveal_path: None,
                state: BlockState::Committed,
            };
            self.write_envelope(&envelope).await;
        }

        inner.tape = Some(tape);
        inner.state = BlockState::Committed;
        Ok(())
    }

    async fn write_envelope(&self, envelope: &SealedEnvelope) {
        let path = paths::sealed_envelope(&self.session_id, &self.block_id);
        let result = match serde_json::to_value(envelope) {
            Ok(doc) => self.store.upsert(&path, doc).await,
            Err(e) => {
                log::warn!("block {}: envelope encoding failed: {e}", self.block_id);
                return;
            }
        };
        if let Err(e) = result {
            log::warn!("block {}: envelope index write failed: {e}", self.block_id);
        }
    }

    // -----------------------------------------------------------------------
    // Trials
    // -----------------------------------------------------------------------

    /// Fix the next trial's bytes and layout.
    ///
    /// Returns [`Prepared::Stale`] when another preparation started while this
    /// one was suspended; a stale preparation consumes nothing.
    pub async fn prepare_trial(&self) -> Result<Prepared<PreparedTrial>, EngineError> {
        let run_id = self.latest_run.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let inner = self.inner.lock().await;
            if !matches!(inner.state, BlockState::Committed | BlockState::InTrials) {
                return Err(self.invalid(inner.state, "prepare a trial"));
            }
        }

        let live = if self.config.byte_supply == ByteSupply::Live {
            let batch = self.adapter.fetch_bytes(2, self.source).await.inspect_err(|e| {
                log::warn!("block {}: live fetch from {} failed: {e}", self.block_id, self.source)
            })?;
            Some(batch)
        } else {
            None
        };
        let layout = shuffle_layout()?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !self.is_current(run_id) {
            log::debug!("block {}: preparation {run_id} superseded", self.block_id);
            return Ok(Prepared::Stale);
        }
        if !matches!(inner.state, BlockState::Committed | BlockState::InTrials) {
            return Err(self.invalid(inner.state, "prepare a trial"));
        }
        if let Some(superseded) = inner.outstanding.take() {
            self.void_trial(inner, superseded).await;
        }

        let trial_number = inner.next_trial;
        let (subject, decoy, provenance) = match (live, inner.tape.as_mut()) {
            (Some(batch), _) => {
                if trial_number as usize > self.trial_count {
                    return Err(self.invalid(inner.state, "prepare a trial past the block length"));
                }
                let provenance = Provenance {
                    source: batch.source.clone(),
                    source_kind: batch.kind,
                    batch_id: batch.batch_id.clone(),
                    tape_position: None,
                    live: true,
                };
                (batch.bytes[0], batch.bytes[1], provenance)
            }
            (None, Some(tape)) => {
                let (position, pair) = tape.next_pair()?;
                let provenance = Provenance {
                    source: tape.source().to_string(),
                    source_kind: self.source,
                    batch_id: tape.batch_id().to_string(),
                    tape_position: Some(position),
                    live: false,
                };
                (pair.subject, pair.decoy, provenance)
            }
            (None, None) => return Err(self.invalid(inner.state, "prepare a trial without a tape")),
        };

        let prepared = PreparedTrial {
            run_id,
            trial_number,
            layout,
            assignment: resolve(subject, decoy, &layout),
            provenance,
        };
        inner.next_trial += 1;
        inner.outstanding = Some(prepared.clone());
        inner.state = BlockState::InTrials;

        Ok(Prepared::Ready(prepared))
    }

    /// Run the flash schedule for a prepared trial.
    ///
    /// With `flash_repeats = n` the layout is shown `n` times for
    /// `flash_duration_ms`, separated by `inter_stimulus_interval_ms`. The
    /// layout never changes between flashes. Aborts if superseded mid-way.
    pub async fn present(&self, trial: &PreparedTrial) -> Result<Prepared<Presentation>, EngineError> {
        let repeats = self.config.flash_repeats.max(1);
        let mut onsets = Vec::with_capacity(repeats as usize);
        for i in 0..repeats {
            if !self.is_current(trial.run_id) {
                log::debug!("block {}: trial {} presentation superseded", self.block_id, trial.trial_number);
                return Ok(Prepared::Stale);
            }
            onsets.push(now_ms());
            tokio::time::sleep(self.config.flash_duration()).await;
            if i + 1 < repeats {
                tokio::time::sleep(self.config.inter_stimulus_interval()).await;
            }
        }
        if !self.is_current(trial.run_id) {
            return Ok(Prepared::Stale);
        }
        Ok(Prepared::Ready(Presentation {
            mode: if repeats > 1 {
                PresentationMode::RepeatedFlash
            } else {
                PresentationMode::Single
            },
            repeat_count: repeats,
            flash_timestamps_ms: onsets,
        }))
    }

    /// Log the participant's response and persist the record.
    ///
    /// A failed log write does not lose the record: it is kept in memory and
    /// retried by [`BlockRunner::flush_unsaved`].
    pub async fn record_response(
        &self,
        trial: &PreparedTrial,
        presentation: Presentation,
        selected_index: Option<u8>,
        latency_ms: Option<u64>,
        click_ms: u64,
    ) -> Result<TrialRecord, EngineError> {
        if let Some(index) = selected_index.filter(|&i| i as usize >= SYMBOL_COUNT) {
            return Err(EngineError::SelectionOutOfRange {
                index,
                symbol_count: SYMBOL_COUNT,
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.state != BlockState::InTrials {
            return Err(self.invalid(inner.state, "record a response"));
        }
        if inner.outstanding.as_ref().map(|t| t.run_id) != Some(trial.run_id) {
            return Err(self.invalid(inner.state, "record a response for a superseded trial"));
        }
        let remapped = self
            .remap
            .remap(&self.block_id, trial.trial_number, click_ms, &trial.assignment)?;
        inner.outstanding = None;

        let record = TrialRecord::new(
            &self.session_id,
            &self.block_id,
            trial.trial_number,
            trial.assignment,
            trial.layout,
            remapped.target_index,
            remapped.decoy_index,
            selected_index,
            latency_ms,
            trial.provenance.clone(),
            presentation,
            remapped.record,
        );

        Ok(self.store_record(&mut inner, record).await)
    }

    /// Log a trial that consumed its slot but never got a response.
    async fn void_trial(&self, inner: &mut BlockInner, trial: PreparedTrial) {
        let remapped = match self
            .remap
            .remap(&self.block_id, trial.trial_number, now_ms(), &trial.assignment)
        {
            Ok(remapped) => remapped,
            Err(e) => {
                log::warn!("block {} trial {}: cannot log superseded trial: {e}", self.block_id, trial.trial_number);
                return;
            }
        };
        let record = TrialRecord::new(
            &self.session_id,
            &self.block_id,
            trial.trial_number,
            trial.assignment,
            trial.layout,
            remapped.target_index,
            remapped.decoy_index,
            None,
            None,
            trial.provenance,
            Presentation {
                mode: PresentationMode::Single,
                repeat_count: 0,
                flash_timestamps_ms: Vec::new(),
            },
            remapped.record,
        );
        log::debug!(
            "block {} trial {}: no response before it was superseded, logged without a selection",
            self.block_id,
            trial.trial_number
        );
        self.store_record(inner, record).await;
    }

    /// Attach the block summary to the last trial, then persist and keep the record.
    async fn store_record(&self, inner: &mut BlockInner, mut record: TrialRecord) -> TrialRecord {
        if record.trial_number as usize >= self.trial_count {
            let mut all = inner.records.clone();
            all.push(record.clone());
            record.summary = Some(BlockSummary::from_records(
                &all,
                self.config.chance(),
                self.config.round_size,
                self.config.round_win_hits,
            ));
        }

        let path = paths::log(&self.session_id, &self.block_id, record.trial_number);
        let result = match serde_json::to_value(&record) {
            Ok(doc) => self.store.upsert(&path, doc).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => log::debug!(
                "block {} trial {}: target {} selected {:?} ({})",
                self.block_id,
                record.trial_number,
                record.target_index,
                record.selected_index,
                record.provenance.source
            ),
            Err(e) => {
                log::warn!(
                    "block {} trial {}: record write failed, kept for retry: {e}",
                    self.block_id,
                    record.trial_number
                );
                inner.unsaved.push(record.clone());
            }
        }
        inner.records.push(record.clone());
        record
    }

    /// Retry writes of records that failed earlier. Returns how many remain unsaved.
    pub async fn flush_unsaved(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let pending = std::mem::take(&mut inner.unsaved);
        for record in pending {
            let path = paths::log(&self.session_id, &self.block_id, record.trial_number);
            let result = match serde_json::to_value(&record) {
                Ok(doc) => self.store.upsert(&path, doc).await,
                Err(e) => {
                    log::warn!("block {} trial {}: encoding failed: {e}", self.block_id, record.trial_number);
                    inner.unsaved.push(record);
                    continue;
                }
            };
            if let Err(e) = result {
                log::warn!("block {} trial {}: record write retry failed: {e}", self.block_id, record.trial_number);
                inner.unsaved.push(record);
            }
        }
        inner.unsaved.len()
    }

    /// Records that could not be written yet.
    pub async fn unsaved(&self) -> Vec<TrialRecord> {
        self.inner.lock().await.unsaved.clone()
    }

    /// Whether every trial slot has been used.
    pub async fn is_complete(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.outstanding.is_none() && inner.next_trial as usize > self.trial_count
    }

    // -----------------------------------------------------------------------
    // Reveal / close / abandon
    // -----------------------------------------------------------------------

    /// Publish salt and pairs after the last trial.
    ///
    /// A failed write is not an error for the caller: the block moves to
    /// `RevealPending`, an audit gap is noted and `Ok(false)` is returned.
    pub async fn reveal(&self) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.state != BlockState::InTrials || inner.outstanding.is_some() || (inner.next_trial as usize) <= self.trial_count {
            return Err(self.invalid(inner.state, "reveal before the last trial"));
        }
        self.write_reveal(&mut inner).await
    }

    /// Retry a reveal whose write failed, before or after the block was closed.
    pub async fn retry_reveal(&self) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let unrevealed = inner.tape.as_ref().is_some_and(|t| !t.is_revealed());
        let allowed = match inner.state {
            BlockState::RevealPending => true,
            BlockState::Closed => unrevealed,
            _ => false,
        };
        if !allowed {
            return Err(self.invalid(inner.state, "retry reveal"));
        }
        self.write_reveal(&mut inner).await
    }

    async fn write_reveal(&self, inner: &mut BlockInner) -> Result<bool, EngineError> {
        let Some(tape) = inner.tape.as_ref() else {
            inner.state = BlockState::Revealed;
            return Ok(true);
        };
        let doc = tape.reveal_doc(self.remap.reveal_key(), true);
        let reveal_path = paths::reveal(&self.session_id, &self.block_id);
        match self.store.upsert(&reveal_path, serde_json::to_value(&doc)?).await {
            Ok(()) => {
                log::info!("block {} revealed ({} pairs)", self.block_id, doc.pairs.len());
                let envelope = SealedEnvelope {
                    block_id: self.block_id.clone(),
                    digest_hex: doc.digest_hex.clone(),
                    trial_count: doc.pairs.len(),
                    commit_path: paths::commit(&self.session_id, &self.block_id),
                    reveal_path: Some(reveal_path),
                    state: BlockState::Revealed,
                };
                if let Some(tape) = inner.tape.as_mut() {
                    tape.mark_revealed();
                }
                inner.gaps.retain(|g| g.kind != AuditGapKind::RevealMissing);
                if inner.state != BlockState::Closed {
                    inner.state = BlockState::Revealed;
                }
                if inner.commitment_published {
                    self.write_envelope(&envelope).await;
                }
                Ok(true)
            }
            Err(e) => {
                log::warn!("block {}: reveal write failed, audit gap recorded: {e}", self.block_id);
                if !inner.gaps.iter().any(|g| g.kind == AuditGapKind::RevealMissing) {
                    inner.gaps.push(AuditGap {
                        block_id: self.block_id.clone(),
                        kind: AuditGapKind::RevealMissing,
                        detail: e.to_string(),
                    });
                }
                if inner.state != BlockState::Closed {
                    inner.state = BlockState::RevealPending;
                }
                Ok(false)
            }
        }
    }

    /// Archive the block. Allowed once the reveal was attempted.
    pub async fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BlockState::Revealed | BlockState::RevealPending => {
                inner.state = BlockState::Closed;
                Ok(())
            }
            other => Err(self.invalid(other, "close")),
        }
    }

    /// Stop the block early. In-flight preparations become stale.
    ///
    /// When `reveal_on_abandon` is set a partial reveal is attempted with a
    /// short timeout; its outcome never affects the return value.
    pub async fn abandon(&self) -> BlockState {
        self.latest_run.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return inner.state;
        }
        let was = inner.state;
        if let Some(cut_off) = inner.outstanding.take() {
            self.void_trial(&mut inner, cut_off).await;
        }
        inner.state = BlockState::Abandoned;
        log::info!(
            "block {} abandoned after {} recorded trials (was {was})",
            self.block_id,
            inner.records.len()
        );

        if self.config.reveal_on_abandon && inner.commitment_published && was != BlockState::Revealed {
            if let Some(tape) = inner.tape.as_ref() {
                let doc = tape.reveal_doc(self.remap.reveal_key(), false);
                let path = paths::reveal(&self.session_id, &self.block_id);
                match serde_json::to_value(&doc) {
                    Ok(value) => {
                        match tokio::time::timeout(ABANDON_REVEAL_TIMEOUT, self.store.upsert(&path, value)).await {
                            Ok(Ok(())) => log::info!("block {}: partial reveal written", self.block_id),
                            Ok(Err(e)) => log::warn!("block {}: partial reveal failed: {e}", self.block_id),
                            Err(_) => log::warn!("block {}: partial reveal timed out", self.block_id),
                        }
                    }
                    Err(e) => log::warn!("block {}: partial reveal encoding failed: {e}", self.block_id),
                }
            }
        }
        BlockState::Abandoned
    }
}

impl std::fmt::Debug for BlockRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRunner")
            .field("session_id", &self.session_id)
            .field("block_id", &self.block_id)
            .field("source", &self.source)
            .field("trial_count", &self.trial_count)
            .finish_non_exhaustive()
    }
}

/// Entropy failures that should end the block rather than the trial.
pub fn is_entropy_failure(err: &EngineError) -> bool {
    matches!(err, EngineError::Entropy(EntropyError::Exhausted { .. } | EntropyError::Unavailable(_)))
}
