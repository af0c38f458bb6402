//! Trial Assignment Resolver.
//!
//! Maps two raw bytes and one frozen layout to two on-screen indices:
//!
//! ```text
//! symbol = ALPHABET[byte mod 5]
//! index  = layout.position(symbol)
//! ```
//!
//! The function is pure: the same (subject byte, decoy byte, layout) always
//! yields the same assignment, so a verifier holding the revealed tape and the
//! logged layout can recompute every trial. Equal bytes resolve to the same
//! index; that is a valid trial, not an error.

use serde::{Deserialize, Serialize};

use crate::layout::{ALPHABET, Symbol, SymbolLayout};

/// Symbol a raw byte selects from the canonical alphabet.
pub fn symbol_for_byte(byte: u8) -> Symbol {
    ALPHABET[byte as usize % ALPHABET.len()]
}

/// Resolved indices for one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialAssignment {
    pub subject_byte: u8,
    pub decoy_byte: u8,
    pub subject_symbol: Symbol,
    pub decoy_symbol: Symbol,
    /// Subject's target index in the layout.
    pub target_index: u8,
    pub decoy_index: u8,
}

/// Resolve both bytes against the same layout instance.
pub fn resolve(subject_byte: u8, decoy_byte: u8, layout: &SymbolLayout) -> TrialAssignment {
    let subject_symbol = symbol_for_byte(subject_byte);
    let decoy_symbol = symbol_for_byte(decoy_byte);
    TrialAssignment {
        subject_byte,
        decoy_byte,
        subject_symbol,
        decoy_symbol,
        target_index: layout.position(subject_symbol) as u8,
        decoy_index: layout.position(decoy_symbol) as u8,
    }
}

impl TrialAssignment {
    /// Whether the participant's pick matches the target.
    pub fn subject_hit(&self, selected_index: u8) -> bool {
        selected_index == self.target_index
    }

    /// Whether the decoy stream's claim lands on the target.
    pub fn decoy_hit(&self) -> bool {
        self.decoy_index == self.target_index
    }
}
