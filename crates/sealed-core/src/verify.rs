//! Offline verification of exported sessions.
//!
//! An [`ExportBundle`] carries everything needed to audit a session without
//! the live store: commitments, reveals and trial records. [`verify_bundle`]
//! recomputes each block's digest, matches every trial's bytes against its
//! tape position, re-resolves indices from the logged layout, and checks
//! hit flags and HMAC remap proofs.
//!
//! In a committed block trial `n` must cite tape position `n`, no trial may
//! use live bytes, and no trial may start before the commitment was written.
//! Once revealed, the tape's consumed count must equal the number of trials.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RemapMode;
use crate::error::{StoreError, TapeError};
use crate::layout::SYMBOL_COUNT;
use crate::record::{SessionAggregate, TrialRecord};
use crate::remap::{key_digest_hex, rotate, verify_proof};
use crate::resolver::resolve;
use crate::store::{DocumentStore, paths};
use crate::tape::{CommitmentDoc, RevealDoc};
use crate::time::now_iso8601;

pub const BUNDLE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub version: u32,
    pub exported_at: String,
    pub sessions: Vec<ExportedSession>,
}

impl ExportBundle {
    pub fn new(sessions: Vec<ExportedSession>) -> Self {
        Self {
            version: BUNDLE_VERSION,
            exported_at: now_iso8601(),
            sessions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedSession {
    pub session_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<SessionAggregate>,
    pub blocks: Vec<ExportedBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedBlock {
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<CommitmentDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reveal: Option<RevealDoc>,
    pub trials: Vec<TrialRecord>,
}

fn decode<T: serde::de::DeserializeOwned>(path: String, doc: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|source| StoreError::Encoding { path, source })
}

/// Collect one session's documents from a store.
pub async fn export_session(store: &dyn DocumentStore, run_id: &str) -> Result<ExportedSession, StoreError> {
    let run_path = paths::session(run_id);
    let run_doc = store
        .get(&run_path)
        .await?
        .ok_or_else(|| StoreError::NotFound(run_path.clone()))?;
    let participant_id = run_doc
        .get("participant_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let aggregate_path = paths::detail(run_id, "aggregate");
    let aggregate = match store.get(&aggregate_path).await? {
        Some(doc) => Some(decode::<SessionAggregate>(aggregate_path, doc)?),
        None => None,
    };

    let mut blocks: BTreeMap<String, ExportedBlock> = BTreeMap::new();

    for (id, doc) in store.list(&paths::commits(run_id)).await? {
        let commitment: CommitmentDoc = decode(paths::commit(run_id, &id), doc)?;
        block_entry(&mut blocks, &id).commitment = Some(commitment);
    }
    for (id, doc) in store.list(&paths::reveals(run_id)).await? {
        let reveal: RevealDoc = decode(paths::reveal(run_id, &id), doc)?;
        block_entry(&mut blocks, &id).reveal = Some(reveal);
    }
    for (id, doc) in store.list(&paths::logs(run_id)).await? {
        let record: TrialRecord = decode(format!("{}/{id}", paths::logs(run_id)), doc)?;
        let block_id = record.block_id.clone();
        block_entry(&mut blocks, &block_id).trials.push(record);
    }

    let mut blocks: Vec<ExportedBlock> = blocks.into_values().collect();
    for block in &mut blocks {
        block.trials.sort_by_key(|t| t.trial_number);
    }
    blocks.sort_by_key(|b| {
        b.commitment
            .as_ref()
            .map(|c| c.created_at_ms)
            .or_else(|| b.trials.first().map(|t| t.responded_at_ms))
            .unwrap_or(u64::MAX)
    });

    Ok(ExportedSession {
        session_id: run_id.to_string(),
        participant_id,
        aggregate,
        blocks,
    })
}

fn block_entry<'a>(blocks: &'a mut BTreeMap<String, ExportedBlock>, id: &str) -> &'a mut ExportedBlock {
    blocks.entry(id.to_string()).or_insert_with(|| ExportedBlock {
        block_id: id.to_string(),
        commitment: None,
        reveal: None,
        trials: Vec::new(),
    })
}

/// Export every session in the store.
pub async fn export_all(store: Arc<dyn DocumentStore>) -> Result<ExportBundle, StoreError> {
    let mut sessions = Vec::new();
    for (run_id, _) in store.list(paths::SESSIONS).await? {
        sessions.push(export_session(store.as_ref(), &run_id).await?);
    }
    Ok(ExportBundle::new(sessions))
}

/// One verification failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyError {
    #[error(transparent)]
    Tape(#[from] TapeError),

    #[error("reveal lists digest {revealed}, commitment published {committed}")]
    DigestFieldMismatch { committed: String, revealed: String },

    #[error("commitment covers {committed} trials, reveal has {revealed} pairs")]
    PairCountMismatch { committed: usize, revealed: usize },

    #[error("trial {trial}: tape position {position:?} is not among the consumed pairs")]
    TapePosition { trial: u32, position: Option<usize> },

    #[error("trial {trial}: cites tape position {position:?}, expected its own trial number")]
    TapeOrder { trial: u32, position: Option<usize> },

    #[error("trial {trial} is logged more than once")]
    DuplicateTrial { trial: u32 },

    #[error("trial {trial}: live bytes in a committed block")]
    LiveTrialInCommittedBlock { trial: u32 },

    #[error("trial {trial}: started at {trial_at_ms}, before the commitment at {committed_at_ms}")]
    CommittedAfterTrial {
        trial: u32,
        committed_at_ms: u64,
        trial_at_ms: u64,
    },

    #[error("reveal consumed {consumed} pairs, {logged} trials are logged")]
    ConsumedMismatch { consumed: usize, logged: usize },

    #[error("trial {trial}: logged bytes ({subject}, {decoy}) differ from tape ({tape_subject}, {tape_decoy})")]
    TapeBytes {
        trial: u32,
        subject: u8,
        decoy: u8,
        tape_subject: u8,
        tape_decoy: u8,
    },

    #[error("trial {trial}: logged assignment does not match re-resolution from layout")]
    Resolution { trial: u32 },

    #[error("trial {trial}: hit flags do not follow from the logged indices")]
    HitFlags { trial: u32 },

    #[error("trial {trial}: index {index} is outside the symbol range")]
    IndexRange { trial: u32, index: u8 },

    #[error("remap key digest does not match the committed digest")]
    RemapKeyDigest,

    #[error("trial {trial}: remap key was not revealed")]
    RemapKeyMissing { trial: u32 },

    #[error("trial {trial}: remap proof does not verify")]
    RemapProof { trial: u32 },

    #[error("trial {trial}: remapped indices do not match rotation {rotation}")]
    RemapIndices { trial: u32, rotation: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum BlockVerdict {
    Verified,
    /// Nothing contradicts the log, but the tape cannot be checked.
    Unverifiable { reason: String },
    Failed { problems: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
    pub session_id: String,
    pub block_id: String,
    pub trials: usize,
    #[serde(flatten)]
    pub verdict: BlockVerdict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub blocks: Vec<BlockReport>,
    pub verified: usize,
    pub unverifiable: usize,
    pub failed: usize,
}

impl VerifyReport {
    /// True when no block failed. Unverifiable blocks do not count as failures.
    pub fn is_ok(&self) -> bool {
        self.failed == 0
    }

    fn push(&mut self, report: BlockReport) {
        match report.verdict {
            BlockVerdict::Verified => self.verified += 1,
            BlockVerdict::Unverifiable { .. } => self.unverifiable += 1,
            BlockVerdict::Failed { .. } => self.failed += 1,
        }
        self.blocks.push(report);
    }
}

/// Verify every block in a bundle.
pub fn verify_bundle(bundle: &ExportBundle) -> VerifyReport {
    let mut report = VerifyReport::default();
    for session in &bundle.sessions {
        for block in &session.blocks {
            let problems = verify_block(block);
            let verdict = if !problems.is_empty() {
                log::warn!(
                    "session {} block {}: {} verification problems",
                    session.session_id,
                    block.block_id,
                    problems.len()
                );
                BlockVerdict::Failed {
                    problems: problems.iter().map(ToString::to_string).collect(),
                }
            } else {
                match (&block.commitment, &block.reveal) {
                    (Some(_), Some(_)) => BlockVerdict::Verified,
                    (None, _) => BlockVerdict::Unverifiable {
                        reason: "no commitment published".into(),
                    },
                    (Some(_), None) => BlockVerdict::Unverifiable {
                        reason: "tape not revealed".into(),
                    },
                }
            };
            report.push(BlockReport {
                session_id: session.session_id.clone(),
                block_id: block.block_id.clone(),
                trials: block.trials.len(),
                verdict,
            });
        }
    }
    report
}

/// All problems found in one block.
pub fn verify_block(block: &ExportedBlock) -> Vec<VerifyError> {
    let mut problems = Vec::new();

    let tape = match (&block.commitment, &block.reveal) {
        (Some(commitment), Some(reveal)) => {
            check_tape(commitment, reveal, &mut problems);
            Some((commitment, reveal))
        }
        _ => None,
    };

    let remap_key = match tape {
        Some((commitment, reveal)) => check_remap_key(commitment, reveal, &mut problems),
        None => None,
    };

    if let Some(commitment) = &block.commitment {
        check_sequence(commitment, &block.trials, &mut problems);
    }
    if let Some(reveal) = &block.reveal {
        if reveal.consumed != block.trials.len() {
            problems.push(VerifyError::ConsumedMismatch {
                consumed: reveal.consumed,
                logged: block.trials.len(),
            });
        }
    }

    for trial in &block.trials {
        check_trial(trial, tape.map(|(_, r)| r), remap_key.as_deref(), &mut problems);
    }
    problems
}

fn check_tape(commitment: &CommitmentDoc, reveal: &RevealDoc, problems: &mut Vec<VerifyError>) {
    if !reveal.digest_hex.eq_ignore_ascii_case(&commitment.digest_hex) {
        problems.push(VerifyError::DigestFieldMismatch {
            committed: commitment.digest_hex.clone(),
            revealed: reveal.digest_hex.clone(),
        });
    }
    if let Err(e) = reveal.verify_against(commitment) {
        problems.push(e.into());
    }
    if reveal.pairs.len() != commitment.trial_count {
        problems.push(VerifyError::PairCountMismatch {
            committed: commitment.trial_count,
            revealed: reveal.pairs.len(),
        });
    }
}

/// Trials of a committed block draw the tape in order, one pair each, after the commitment.
fn check_sequence(commitment: &CommitmentDoc, trials: &[TrialRecord], problems: &mut Vec<VerifyError>) {
    let mut seen = HashSet::new();
    for trial in trials {
        let n = trial.trial_number;
        if !seen.insert(n) {
            problems.push(VerifyError::DuplicateTrial { trial: n });
        }
        if trial.provenance.live {
            problems.push(VerifyError::LiveTrialInCommittedBlock { trial: n });
        } else if trial.provenance.tape_position != Some(n as usize) {
            problems.push(VerifyError::TapeOrder {
                trial: n,
                position: trial.provenance.tape_position,
            });
        }

        let started = trial
            .presentation
            .flash_timestamps_ms
            .first()
            .map_or(trial.responded_at_ms, |&first| first.min(trial.responded_at_ms));
        if started < commitment.created_at_ms {
            problems.push(VerifyError::CommittedAfterTrial {
                trial: n,
                committed_at_ms: commitment.created_at_ms,
                trial_at_ms: started,
            });
        }
    }
}

fn check_remap_key(commitment: &CommitmentDoc, reveal: &RevealDoc, problems: &mut Vec<VerifyError>) -> Option<Vec<u8>> {
    let key_hex = reveal.remap_key_hex.as_ref()?;
    let key = match hex::decode(key_hex) {
        Ok(key) => key,
        Err(e) => {
            problems.push(
                TapeError::Hex {
                    field: "remap_key_hex",
                    message: e.to_string(),
                }
                .into(),
            );
            return None;
        }
    };
    match &commitment.remap_key_digest_hex {
        Some(digest) if digest.eq_ignore_ascii_case(&key_digest_hex(&key)) => Some(key),
        _ => {
            problems.push(VerifyError::RemapKeyDigest);
            None
        }
    }
}

fn check_trial(trial: &TrialRecord, reveal: Option<&RevealDoc>, remap_key: Option<&[u8]>, problems: &mut Vec<VerifyError>) {
    let n = trial.trial_number;
    let a = &trial.assignment;

    for index in [trial.target_index, trial.decoy_index]
        .into_iter()
        .chain(trial.selected_index)
    {
        if index as usize >= SYMBOL_COUNT {
            problems.push(VerifyError::IndexRange { trial: n, index });
        }
    }

    if resolve(a.subject_byte, a.decoy_byte, &trial.layout) != *a {
        problems.push(VerifyError::Resolution { trial: n });
    }

    if let Some(reveal) = reveal {
        let pair = trial
            .provenance
            .tape_position
            .filter(|&p| p <= reveal.consumed)
            .and_then(|p| p.checked_sub(1))
            .and_then(|i| reveal.pairs.get(i));
        match pair {
            None => problems.push(VerifyError::TapePosition {
                trial: n,
                position: trial.provenance.tape_position,
            }),
            Some(pair) if (pair.subject, pair.decoy) != (a.subject_byte, a.decoy_byte) => {
                problems.push(VerifyError::TapeBytes {
                    trial: n,
                    subject: a.subject_byte,
                    decoy: a.decoy_byte,
                    tape_subject: pair.subject,
                    tape_decoy: pair.decoy,
                })
            }
            Some(_) => {}
        }
    }

    let rotation = trial.remap.rotation;
    let expected = (
        rotate(a.target_index, rotation, SYMBOL_COUNT),
        rotate(a.decoy_index, rotation, SYMBOL_COUNT),
    );
    let rotation_ok = match trial.remap.strategy {
        RemapMode::None => rotation == 0,
        RemapMode::HmacRotation => true,
    };
    if !rotation_ok || (trial.target_index, trial.decoy_index) != expected {
        problems.push(VerifyError::RemapIndices { trial: n, rotation });
    }

    if trial.remap.strategy == RemapMode::HmacRotation && reveal.is_some() {
        match (remap_key, trial.remap.click_ms, trial.remap.proof_hex.as_deref()) {
            (Some(key), Some(click_ms), Some(proof)) => {
                if !verify_proof(key, &trial.block_id, n, click_ms, proof, rotation) {
                    problems.push(VerifyError::RemapProof { trial: n });
                }
            }
            (None, _, _) => problems.push(VerifyError::RemapKeyMissing { trial: n }),
            _ => problems.push(VerifyError::RemapProof { trial: n }),
        }
    }

    let subject_hit = trial.selected_index == Some(trial.target_index);
    let decoy_hit = trial.decoy_index == trial.target_index;
    if trial.subject_hit != subject_hit || trial.decoy_hit != decoy_hit {
        problems.push(VerifyError::HitFlags { trial: n });
    }
}
