//! Index-remap strategies applied on top of the resolver.
//!
//! The resolver maps bytes to layout positions and knows nothing about
//! remapping. A strategy here may then rotate both indices by the same
//! amount `r`:
//!
//! ```text
//! index' = (index + r) mod K
//! ```
//!
//! [`HmacRotationRemap`] derives `r` from
//! `HMAC-SHA256(key, block_id || trial_number_be32 || click_ms_be64)`. The
//! key's SHA-256 is committed alongside the tape digest and the key itself is
//! revealed with the tape, so every rotation can be recomputed offline from
//! the logged proof.

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RemapMode;
use crate::error::{EntropyError, TapeError};
use crate::layout::SYMBOL_COUNT;
use crate::resolver::TrialAssignment;

type HmacSha256 = Hmac<Sha256>;

/// Length of a freshly generated remap key.
pub const REMAP_KEY_LEN: usize = 32;

/// What a strategy did to one trial, as logged in the trial record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRecord {
    pub strategy: RemapMode,
    pub rotation: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_ms: Option<u64>,
    /// Hex HMAC the rotation was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_hex: Option<String>,
}

impl RemapRecord {
    pub fn identity() -> Self {
        Self {
            strategy: RemapMode::None,
            rotation: 0,
            click_ms: None,
            proof_hex: None,
        }
    }
}

/// Remapped indices plus the record explaining them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remapped {
    pub target_index: u8,
    pub decoy_index: u8,
    pub record: RemapRecord,
}

/// Pluggable post-resolution index transform.
pub trait IndexRemap: Send + Sync {
    fn mode(&self) -> RemapMode;

    /// SHA-256 of the secret key, published with the commitment.
    fn key_digest_hex(&self) -> Option<String> {
        None
    }

    /// Key material to disclose with the reveal.
    fn reveal_key(&self) -> Option<&[u8]> {
        None
    }

    fn remap(
        &self,
        block_id: &str,
        trial_number: u32,
        click_ms: u64,
        assignment: &TrialAssignment,
    ) -> Result<Remapped, TapeError>;
}

/// Leaves resolver output unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityRemap;

impl IndexRemap for IdentityRemap {
    fn mode(&self) -> RemapMode {
        RemapMode::None
    }

    fn remap(
        &self,
        _block_id: &str,
        _trial_number: u32,
        _click_ms: u64,
        assignment: &TrialAssignment,
    ) -> Result<Remapped, TapeError> {
        Ok(Remapped {
            target_index: assignment.target_index,
            decoy_index: assignment.decoy_index,
            record: RemapRecord::identity(),
        })
    }
}

/// HMAC-seeded rotation with a verifiable proof.
#[derive(Clone)]
pub struct HmacRotationRemap {
    key: Vec<u8>,
}

impl fmt::Debug for HmacRotationRemap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacRotationRemap")
            .field("key_digest", &key_digest_hex(&self.key))
            .finish()
    }
}

impl HmacRotationRemap {
    /// New strategy with a random per-block key.
    pub fn generate() -> Result<Self, EntropyError> {
        let mut key = vec![0u8; REMAP_KEY_LEN];
        getrandom::fill(&mut key)?;
        Ok(Self { key })
    }

    pub fn from_key(key: Vec<u8>) -> Self {
        Self { key }
    }
}

impl IndexRemap for HmacRotationRemap {
    fn mode(&self) -> RemapMode {
        RemapMode::HmacRotation
    }

    fn key_digest_hex(&self) -> Option<String> {
        Some(key_digest_hex(&self.key))
    }

    fn reveal_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn remap(
        &self,
        block_id: &str,
        trial_number: u32,
        click_ms: u64,
        assignment: &TrialAssignment,
    ) -> Result<Remapped, TapeError> {
        let mac = compute_mac(&self.key, block_id, trial_number, click_ms)?;
        let rotation = rotation_from_mac(&mac, SYMBOL_COUNT);
        Ok(Remapped {
            target_index: rotate(assignment.target_index, rotation, SYMBOL_COUNT),
            decoy_index: rotate(assignment.decoy_index, rotation, SYMBOL_COUNT),
            record: RemapRecord {
                strategy: RemapMode::HmacRotation,
                rotation,
                click_ms: Some(click_ms),
                proof_hex: Some(hex::encode(mac)),
            },
        })
    }
}

/// Build the strategy selected by `mode`.
pub fn remap_for(mode: RemapMode) -> Result<Box<dyn IndexRemap>, EntropyError> {
    Ok(match mode {
        RemapMode::None => Box::new(IdentityRemap),
        RemapMode::HmacRotation => Box::new(HmacRotationRemap::generate()?),
    })
}

pub fn key_digest_hex(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

/// `HMAC-SHA256(key, block_id || trial_number_be32 || click_ms_be64)`.
pub fn compute_mac(key: &[u8], block_id: &str, trial_number: u32, click_ms: u64) -> Result<[u8; 32], TapeError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| TapeError::RemapKey(e.to_string()))?;
    mac.update(block_id.as_bytes());
    mac.update(&trial_number.to_be_bytes());
    mac.update(&click_ms.to_be_bytes());
    Ok(mac.finalize().into_bytes().into())
}

/// First MAC byte below the largest multiple of `k` under 256, reduced mod `k`.
///
/// An all-rejected MAC (probability 2^-256 for k = 5) yields rotation 0.
pub fn rotation_from_mac(mac: &[u8], k: usize) -> u8 {
    let limit = 256 / k * k;
    mac.iter()
        .find(|&&b| (b as usize) < limit)
        .map_or(0, |&b| (b as usize % k) as u8)
}

pub fn rotate(index: u8, rotation: u8, k: usize) -> u8 {
    ((index as usize + rotation as usize) % k) as u8
}

/// Recompute a logged proof and the rotation derived from it.
pub fn verify_proof(
    key: &[u8],
    block_id: &str,
    trial_number: u32,
    click_ms: u64,
    proof_hex: &str,
    rotation: u8,
) -> bool {
    let Ok(mac) = compute_mac(key, block_id, trial_number, click_ms) else {
        return false;
    };
    hex::encode(mac).eq_ignore_ascii_case(proof_hex) && rotation_from_mac(&mac, SYMBOL_COUNT) == rotation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SymbolLayout;
    use crate::resolver::resolve;

    #[test]
    fn test_identity_is_noop() {
        let a = resolve(7, 13, &SymbolLayout::identity());
        let out = IdentityRemap.remap("b", 1, 123, &a).unwrap();
        assert_eq!(out.target_index, a.target_index);
        assert_eq!(out.decoy_index, a.decoy_index);
        assert_eq!(out.record, RemapRecord::identity());
        assert!(IdentityRemap.key_digest_hex().is_none());
    }

    #[test]
    fn test_rotation_skips_rejected_bytes() {
        assert_eq!(rotation_from_mac(&[255, 255, 7], 5), 2);
        assert_eq!(rotation_from_mac(&[254], 5), 4);
        assert_eq!(rotation_from_mac(&[255; 32], 5), 0);
    }

    #[test]
    fn test_hmac_rotation_shifts_both_indices_equally() {
        let remap = HmacRotationRemap::from_key(vec![42; 32]);
        let a = resolve(2, 4, &SymbolLayout::identity());
        for click in 0..50u64 {
            let out = remap.remap("block-1", 3, 1_700_000_000_000 + click, &a).unwrap();
            let r = out.record.rotation;
            assert!(r < 5);
            assert_eq!(out.target_index, rotate(a.target_index, r, 5));
            assert_eq!(out.decoy_index, rotate(a.decoy_index, r, 5));
            // The relative offset survives rotation, so the decoy-hit relation does too.
            assert_eq!(
                (out.decoy_index as i32 - out.target_index as i32).rem_euclid(5),
                (a.decoy_index as i32 - a.target_index as i32).rem_euclid(5)
            );
        }
    }

    #[test]
    fn test_proof_verifies_and_rejects_tampering() {
        let key = vec![9u8; 32];
        let remap = HmacRotationRemap::from_key(key.clone());
        let a = resolve(0, 1, &SymbolLayout::identity());
        let out = remap.remap("blk", 12, 555, &a).unwrap();
        let proof = out.record.proof_hex.clone().unwrap();
        let r = out.record.rotation;

        assert!(verify_proof(&key, "blk", 12, 555, &proof, r));
        assert!(!verify_proof(&key, "blk", 13, 555, &proof, r));
        assert!(!verify_proof(&key, "blk", 12, 556, &proof, r));
        assert!(!verify_proof(&[8u8; 32], "blk", 12, 555, &proof, r));
        assert!(!verify_proof(&key, "blk", 12, 555, &proof, (r + 1) % 5));
    }

    #[test]
    fn test_mac_accepts_any_key_length() {
        for len in [0usize, 1, 32, 64, 200] {
            let key = vec![0x5a; len];
            let mac = compute_mac(&key, "b", 1, 2).unwrap();
            assert_eq!(mac, compute_mac(&key, "b", 1, 2).unwrap());
        }
        assert_ne!(compute_mac(&[1; 32], "b", 1, 2).unwrap(), compute_mac(&[1; 32], "b", 1, 3).unwrap());
    }

    #[test]
    fn test_key_digest_committed_not_key() {
        let remap = HmacRotationRemap::generate().unwrap();
        let digest = remap.key_digest_hex().unwrap();
        let key = remap.reveal_key().unwrap();
        assert_eq!(key.len(), REMAP_KEY_LEN);
        assert_eq!(digest, key_digest_hex(key));
        assert_ne!(digest, hex::encode(key));
        assert!(!format!("{remap:?}").contains(&hex::encode(key)));
    }

    #[test]
    fn test_remap_for_mode() {
        assert_eq!(remap_for(RemapMode::None).unwrap().mode(), RemapMode::None);
        let hmac = remap_for(RemapMode::HmacRotation).unwrap();
        assert_eq!(hmac.mode(), RemapMode::HmacRotation);
        assert!(hmac.reveal_key().is_some());
    }

    #[test]
    fn test_rotations_cover_all_residues() {
        let remap = HmacRotationRemap::from_key(b"fixed test key".to_vec());
        let a = resolve(0, 0, &SymbolLayout::identity());
        let mut seen = [0usize; 5];
        for t in 0..500u32 {
            seen[remap.remap("b", t, 0, &a).unwrap().record.rotation as usize] += 1;
        }
        assert!(seen.iter().all(|&c| c > 50), "{seen:?}");
    }
}
