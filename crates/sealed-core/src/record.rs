//! Persisted trial records and the per-session aggregate.

use serde::{Deserialize, Serialize};
use sealed_stats::{binomial_upper_tail, score_rounds};

use crate::block::BlockState;
use crate::layout::SymbolLayout;
use crate::remap::RemapRecord;
use crate::resolver::TrialAssignment;
use crate::source::SourceKind;
use crate::time::{format_iso8601_ms, now_ms};

/// Where a trial's two bytes came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub source_kind: SourceKind,
    pub batch_id: String,
    /// 1-based tape position; absent for live trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tape_position: Option<usize>,
    /// Bytes were fetched per trial instead of from a committed tape.
    #[serde(default)]
    pub live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationMode {
    Single,
    RepeatedFlash,
}

/// How the trial was shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    pub mode: PresentationMode,
    pub repeat_count: u32,
    /// Onset time of each flash, Unix ms.
    pub flash_timestamps_ms: Vec<u64>,
}

/// Derived block totals attached to the block's last record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub trials: usize,
    pub hits: usize,
    pub decoy_hits: usize,
    pub rounds_total: usize,
    pub rounds_won: usize,
    /// One-sided exact `P(X >= hits)` under `Binomial(trials, 1/K)`.
    pub exact_p: f64,
}

impl BlockSummary {
    /// Tallies over valid records; rounds follow trial order with timeouts as misses.
    pub fn from_records(records: &[TrialRecord], chance: f64, round_size: usize, win_hits: usize) -> Self {
        let valid: Vec<&TrialRecord> = records.iter().filter(|r| r.is_valid()).collect();
        let hits = valid.iter().filter(|r| r.subject_hit).count();
        let decoy_hits = valid.iter().filter(|r| r.decoy_hit).count();
        let mut ordered: Vec<&TrialRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.trial_number);
        let hit_seq: Vec<bool> = ordered.iter().map(|r| r.is_valid() && r.subject_hit).collect();
        let rounds = score_rounds(&hit_seq, round_size, win_hits);
        Self {
            trials: valid.len(),
            hits,
            decoy_hits,
            rounds_total: rounds.rounds_total,
            rounds_won: rounds.rounds_won,
            exact_p: binomial_upper_tail(hits as u64, valid.len() as u64, chance),
        }
    }
}

/// One participant response, immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub session_id: String,
    pub block_id: String,
    pub trial_number: u32,
    /// Raw resolver output.
    pub assignment: TrialAssignment,
    pub layout: SymbolLayout,
    /// Target index after any remap; hit flags are computed against this.
    pub target_index: u8,
    pub decoy_index: u8,
    /// `None` when the trial timed out without a selection.
    pub selected_index: Option<u8>,
    pub subject_hit: bool,
    pub decoy_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub provenance: Provenance,
    pub presentation: Presentation,
    pub remap: RemapRecord,
    pub responded_at_ms: u64,
    pub responded_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<BlockSummary>,
}

impl TrialRecord {
    /// Assemble a record; hit flags are derived here and nowhere else.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        block_id: impl Into<String>,
        trial_number: u32,
        assignment: TrialAssignment,
        layout: SymbolLayout,
        target_index: u8,
        decoy_index: u8,
        selected_index: Option<u8>,
        latency_ms: Option<u64>,
        provenance: Provenance,
        presentation: Presentation,
        remap: RemapRecord,
    ) -> Self {
        let at = now_ms();
        Self {
            session_id: session_id.into(),
            block_id: block_id.into(),
            trial_number,
            assignment,
            layout,
            target_index,
            decoy_index,
            selected_index,
            subject_hit: selected_index == Some(target_index),
            decoy_hit: decoy_index == target_index,
            latency_ms,
            provenance,
            presentation,
            remap,
            responded_at_ms: at,
            responded_at: format_iso8601_ms(at),
            summary: None,
        }
    }

    /// A record counts toward tallies only when a selection was made.
    pub fn is_valid(&self) -> bool {
        self.selected_index.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    pub version: String,
    pub accepted_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ParticipantQuit,
    ConsentWithdrawn,
    EntropyUnavailable,
    Timeout,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExitStatus {
    #[default]
    InProgress,
    Completed,
    EarlyExit { reason: ExitReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditGapKind {
    /// Trials ran without a published digest.
    CommitmentUnverifiable,
    /// The reveal document was never written.
    RevealMissing,
    /// A trial record could not be persisted.
    RecordWriteFailed,
    /// Block ran on live bytes; nothing was committed.
    LiveBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditGap {
    pub block_id: String,
    pub kind: AuditGapKind,
    pub detail: String,
}

/// Per-block counts inside the session aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTally {
    pub block_id: String,
    pub state: BlockState,
    /// Records with a selection.
    pub trials: usize,
    /// Records without a selection, excluded from the counts.
    pub excluded: usize,
    pub hits: usize,
    pub decoy_hits: usize,
}

impl BlockTally {
    pub fn new(block_id: impl Into<String>, state: BlockState) -> Self {
        Self {
            block_id: block_id.into(),
            state,
            trials: 0,
            excluded: 0,
            hits: 0,
            decoy_hits: 0,
        }
    }

    fn add(&mut self, record: &TrialRecord) {
        if !record.is_valid() {
            self.excluded += 1;
            return;
        }
        self.trials += 1;
        self.hits += usize::from(record.subject_hit);
        self.decoy_hits += usize::from(record.decoy_hit);
    }
}

/// One document per participant run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregate {
    pub session_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<Consent>,
    pub planned_trials: usize,
    pub blocks: Vec<BlockTally>,
    pub total_trials: usize,
    pub total_hits: usize,
    pub total_decoy_hits: usize,
    pub exit_status: ExitStatus,
    pub exited_early: bool,
    #[serde(default)]
    pub audit_gaps: Vec<AuditGap>,
    pub started_at_ms: u64,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl SessionAggregate {
    pub fn new(session_id: impl Into<String>, participant_id: impl Into<String>, planned_trials: usize) -> Self {
        let at = now_ms();
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            consent: None,
            planned_trials,
            blocks: Vec::new(),
            total_trials: 0,
            total_hits: 0,
            total_decoy_hits: 0,
            exit_status: ExitStatus::InProgress,
            exited_early: false,
            audit_gaps: Vec::new(),
            started_at_ms: at,
            started_at: format_iso8601_ms(at),
            finished_at_ms: None,
            finished_at: None,
        }
    }

    /// Rebuild the tallies from scratch.
    pub fn from_records(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        planned_trials: usize,
        records: &[TrialRecord],
    ) -> Self {
        let mut agg = Self::new(session_id, participant_id, planned_trials);
        for record in records {
            agg.add_record(record);
        }
        agg
    }

    fn tally_mut(&mut self, block_id: &str) -> &mut BlockTally {
        match self.blocks.iter().position(|b| b.block_id == block_id) {
            Some(i) => &mut self.blocks[i],
            None => {
                self.blocks.push(BlockTally::new(block_id, BlockState::InTrials));
                let last = self.blocks.len() - 1;
                &mut self.blocks[last]
            }
        }
    }

    /// Incremental update for one newly written record.
    pub fn add_record(&mut self, record: &TrialRecord) {
        self.tally_mut(&record.block_id).add(record);
        if record.is_valid() {
            self.total_trials += 1;
            self.total_hits += usize::from(record.subject_hit);
            self.total_decoy_hits += usize::from(record.decoy_hit);
        }
    }

    /// Replace one block's tally with counts over its full record list.
    ///
    /// Picks up records the runner logged on its own, such as trials cut off
    /// before a response.
    pub fn recount_block(&mut self, block_id: &str, records: &[TrialRecord]) {
        let tally = self.tally_mut(block_id);
        let (old_trials, old_hits, old_decoys) = (tally.trials, tally.hits, tally.decoy_hits);
        let mut fresh = BlockTally::new(block_id, tally.state);
        for record in records.iter().filter(|r| r.block_id == block_id) {
            fresh.add(record);
        }
        *tally = fresh.clone();
        self.total_trials = self.total_trials + fresh.trials - old_trials;
        self.total_hits = self.total_hits + fresh.hits - old_hits;
        self.total_decoy_hits = self.total_decoy_hits + fresh.decoy_hits - old_decoys;
    }

    pub fn set_block_state(&mut self, block_id: &str, state: BlockState) {
        self.tally_mut(block_id).state = state;
    }

    pub fn add_gap(&mut self, block_id: impl Into<String>, kind: AuditGapKind, detail: impl Into<String>) {
        self.audit_gaps.push(AuditGap {
            block_id: block_id.into(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn finish(&mut self, status: ExitStatus) {
        self.exited_early = matches!(status, ExitStatus::EarlyExit { .. });
        self.exit_status = status;
        let at = now_ms();
        self.finished_at_ms = Some(at);
        self.finished_at = Some(format_iso8601_ms(at));
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at_ms.is_some()
    }
}
