//! Commitment Tape Builder.
//!
//! A tape is one block's pre-drawn randomness: an ordered list of
//! (subject byte, decoy byte) pairs plus a random salt. Before the first
//! trial is shown only the digest is published:
//!
//! ```text
//! digest = SHA-256(salt || s1 d1 s2 d2 ... sN dN)
//! ```
//!
//! After the last trial the salt and pairs are revealed, and anyone can
//! recompute the digest to confirm the targets were fixed in advance.
//!
//! The tape itself is never serialized; only [`CommitmentDoc`] (before) and
//! [`RevealDoc`] (after) leave the process.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::MIN_SALT_LEN;
use crate::error::{EntropyError, TapeError};
use crate::source::{RawByteBatch, SourceKind};
use crate::time::{format_iso8601_ms, now_ms};

/// Algorithm id written next to every digest.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// One trial's worth of tape: subject byte then decoy byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 2]", into = "[u8; 2]")]
pub struct BytePair {
    pub subject: u8,
    pub decoy: u8,
}

impl From<[u8; 2]> for BytePair {
    fn from(value: [u8; 2]) -> Self {
        Self {
            subject: value[0],
            decoy: value[1],
        }
    }
}

impl From<BytePair> for [u8; 2] {
    fn from(value: BytePair) -> Self {
        [value.subject, value.decoy]
    }
}

/// Split raw bytes into pairs in arrival order.
pub fn pairs_from_bytes(bytes: &[u8]) -> Result<Vec<BytePair>, TapeError> {
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return Err(TapeError::OddOrEmptyBatch(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| BytePair {
            subject: c[0],
            decoy: c[1],
        })
        .collect())
}

/// `SHA-256(salt || pairs)`.
pub fn tape_digest(salt: &[u8], pairs: &[BytePair]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(salt);
    for pair in pairs {
        h.update([pair.subject, pair.decoy]);
    }
    h.finalize().into()
}

/// Fresh salt from the OS CSPRNG.
pub fn generate_salt(len: usize) -> Result<Vec<u8>, EntropyError> {
    let mut salt = vec![0u8; len];
    getrandom::fill(&mut salt)?;
    Ok(salt)
}

/// Published before the block starts. Contains no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentDoc {
    pub block_id: String,
    pub algorithm: String,
    pub digest_hex: String,
    pub trial_count: usize,
    pub source: String,
    pub source_kind: SourceKind,
    pub batch_id: String,
    pub created_at_ms: u64,
    pub created_at: String,
    /// SHA-256 of the HMAC remap key, when remap is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remap_key_digest_hex: Option<String>,
}

/// Published after the block ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealDoc {
    pub block_id: String,
    pub algorithm: String,
    pub digest_hex: String,
    pub salt_hex: String,
    pub pairs: Vec<BytePair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remap_key_hex: Option<String>,
    pub revealed_at_ms: u64,
    pub revealed_at: String,
    /// False for a best-effort reveal of an abandoned block.
    pub complete: bool,
    /// Pairs actually consumed by presented trials.
    pub consumed: usize,
}

impl RevealDoc {
    pub fn salt(&self) -> Result<Vec<u8>, TapeError> {
        hex::decode(&self.salt_hex).map_err(|e| TapeError::Hex {
            field: "salt_hex",
            message: e.to_string(),
        })
    }

    /// Recompute the digest from the revealed salt and pairs.
    pub fn recompute_digest_hex(&self) -> Result<String, TapeError> {
        let salt = self.salt()?;
        Ok(hex::encode(tape_digest(&salt, &self.pairs)))
    }

    /// Check this reveal against a previously published commitment.
    pub fn verify_against(&self, commitment: &CommitmentDoc) -> Result<(), TapeError> {
        let salt = self.salt()?;
        if salt.len() < MIN_SALT_LEN {
            return Err(TapeError::SaltTooShort {
                min: MIN_SALT_LEN,
                got: salt.len(),
            });
        }
        let recomputed = hex::encode(tape_digest(&salt, &self.pairs));
        if !recomputed.eq_ignore_ascii_case(&commitment.digest_hex) {
            return Err(TapeError::DigestMismatch {
                committed: commitment.digest_hex.clone(),
                recomputed,
            });
        }
        Ok(())
    }
}

/// One block's sealed randomness.
pub struct CommitmentTape {
    block_id: String,
    pairs: Vec<BytePair>,
    salt: Vec<u8>,
    digest: [u8; 32],
    created_at_ms: u64,
    source: String,
    kind: SourceKind,
    batch_id: String,
    cursor: usize,
    revealed: bool,
}

impl fmt::Debug for CommitmentTape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitmentTape")
            .field("block_id", &self.block_id)
            .field("digest", &self.digest_hex())
            .field("len", &self.pairs.len())
            .field("cursor", &self.cursor)
            .field("revealed", &self.revealed)
            .finish_non_exhaustive()
    }
}

impl CommitmentTape {
    /// Build a tape from a fetched batch with a fresh salt of `salt_len` bytes.
    pub fn build(
        block_id: impl Into<String>,
        batch: &RawByteBatch,
        salt_len: usize,
    ) -> Result<Self, crate::error::EngineError> {
        if salt_len < MIN_SALT_LEN {
            return Err(TapeError::SaltTooShort {
                min: MIN_SALT_LEN,
                got: salt_len,
            }
            .into());
        }
        let salt = generate_salt(salt_len)?;
        Ok(Self::build_with_salt(block_id, batch, salt)?)
    }

    /// Build with a caller-supplied salt.
    pub fn build_with_salt(
        block_id: impl Into<String>,
        batch: &RawByteBatch,
        salt: Vec<u8>,
    ) -> Result<Self, TapeError> {
        if salt.len() < MIN_SALT_LEN {
            return Err(TapeError::SaltTooShort {
                min: MIN_SALT_LEN,
                got: salt.len(),
            });
        }
        let pairs = pairs_from_bytes(&batch.bytes)?;
        let digest = tape_digest(&salt, &pairs);
        Ok(Self {
            block_id: block_id.into(),
            pairs,
            salt,
            digest,
            created_at_ms: now_ms(),
            source: batch.source.clone(),
            kind: batch.kind,
            batch_id: batch.batch_id.clone(),
            cursor: 0,
            revealed: false,
        })
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn consumed(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.pairs.len() - self.cursor
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    /// Take the next unconsumed pair. Returns its 1-based tape position.
    pub fn next_pair(&mut self) -> Result<(usize, BytePair), TapeError> {
        let Some(&pair) = self.pairs.get(self.cursor) else {
            return Err(TapeError::Exhausted {
                block_id: self.block_id.clone(),
                consumed: self.cursor,
            });
        };
        self.cursor += 1;
        Ok((self.cursor, pair))
    }

    /// Digest and metadata only.
    pub fn commitment_doc(&self, remap_key_digest_hex: Option<String>) -> CommitmentDoc {
        CommitmentDoc {
            block_id: self.block_id.clone(),
            algorithm: DIGEST_ALGORITHM.to_string(),
            digest_hex: self.digest_hex(),
            trial_count: self.pairs.len(),
            source: self.source.clone(),
            source_kind: self.kind,
            batch_id: self.batch_id.clone(),
            created_at_ms: self.created_at_ms,
            created_at: format_iso8601_ms(self.created_at_ms),
            remap_key_digest_hex,
        }
    }

    /// Salt and every pair. `complete` is false when the block was abandoned.
    pub fn reveal_doc(&self, remap_key: Option<&[u8]>, complete: bool) -> RevealDoc {
        let at = now_ms();
        RevealDoc {
            block_id: self.block_id.clone(),
            algorithm: DIGEST_ALGORITHM.to_string(),
            digest_hex: self.digest_hex(),
            salt_hex: hex::encode(&self.salt),
            pairs: self.pairs.clone(),
            remap_key_hex: remap_key.map(hex::encode),
            revealed_at_ms: at,
            revealed_at: format_iso8601_ms(at),
            complete,
            consumed: self.cursor,
        }
    }

    pub fn mark_revealed(&mut self) {
        self.revealed = true;
    }

    /// Check a reveal document against this tape's digest.
    pub fn verify_reveal(&self, reveal: &RevealDoc) -> Result<(), TapeError> {
        reveal.verify_against(&self.commitment_doc(None))
    }
}
