//! Symbol alphabet and per-trial randomized layouts.
//!
//! A [`SymbolLayout`] is a permutation of the five-symbol [`ALPHABET`],
//! drawn fresh for every trial with a Fisher-Yates shuffle whose index
//! draws use rejection sampling on 32-bit words from the OS CSPRNG, so
//! every one of the 5! orders is equally likely.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EntropyError;

/// On-screen symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbol {
    Circle,
    Plus,
    Waves,
    Square,
    Star,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circle => write!(f, "circle"),
            Self::Plus => write!(f, "plus"),
            Self::Waves => write!(f, "waves"),
            Self::Square => write!(f, "square"),
            Self::Star => write!(f, "star"),
        }
    }
}

/// Canonical symbol order; `byte mod 5` indexes into this array.
pub const ALPHABET: [Symbol; 5] = [
    Symbol::Circle,
    Symbol::Plus,
    Symbol::Waves,
    Symbol::Square,
    Symbol::Star,
];

/// Number of symbols on screen.
pub const SYMBOL_COUNT: usize = ALPHABET.len();

/// Source of uniform 32-bit words for shuffling.
pub trait UniformSource {
    fn next_u32(&mut self) -> Result<u32, EntropyError>;

    /// Uniform integer in `0..bound` by rejection sampling.
    ///
    /// Words at or above the largest multiple of `bound` that fits in 2^32
    /// are discarded, so no residue class is over-represented.
    fn below(&mut self, bound: u32) -> Result<u32, EntropyError> {
        debug_assert!(bound > 0);
        let limit = (1u64 << 32) / u64::from(bound) * u64::from(bound);
        loop {
            let x = self.next_u32()?;
            if u64::from(x) < limit {
                return Ok(x % bound);
            }
        }
    }
}

/// OS CSPRNG-backed word source.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl UniformSource for OsRandom {
    fn next_u32(&mut self) -> Result<u32, EntropyError> {
        let mut buf = [0u8; 4];
        getrandom::fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// One trial's on-screen order of the alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Symbol>", into = "Vec<Symbol>")]
pub struct SymbolLayout {
    order: [Symbol; SYMBOL_COUNT],
}

impl SymbolLayout {
    /// The alphabet in canonical order.
    pub fn identity() -> Self {
        Self { order: ALPHABET }
    }

    /// Build from an explicit order. Fails unless it is a permutation of the alphabet.
    pub fn from_order(order: [Symbol; SYMBOL_COUNT]) -> Result<Self, String> {
        for symbol in ALPHABET {
            if !order.contains(&symbol) {
                return Err(format!("layout is missing {symbol}"));
            }
        }
        Ok(Self { order })
    }

    /// Fresh uniformly random layout.
    pub fn shuffled(rng: &mut impl UniformSource) -> Result<Self, EntropyError> {
        let mut order = ALPHABET;
        for i in (1..SYMBOL_COUNT).rev() {
            let j = rng.below(i as u32 + 1)? as usize;
            order.swap(i, j);
        }
        Ok(Self { order })
    }

    /// Position of `symbol` on screen.
    pub fn position(&self, symbol: Symbol) -> usize {
        self.order
            .iter()
            .position(|&s| s == symbol)
            .unwrap_or_default()
    }

    pub fn symbol_at(&self, index: usize) -> Option<Symbol> {
        self.order.get(index).copied()
    }

    pub fn order(&self) -> &[Symbol; SYMBOL_COUNT] {
        &self.order
    }
}

impl TryFrom<Vec<Symbol>> for SymbolLayout {
    type Error = String;

    fn try_from(value: Vec<Symbol>) -> Result<Self, Self::Error> {
        let order: [Symbol; SYMBOL_COUNT] = value
            .try_into()
            .map_err(|v: Vec<Symbol>| format!("layout has {} symbols, expected {SYMBOL_COUNT}", v.len()))?;
        Self::from_order(order)
    }
}

impl From<SymbolLayout> for Vec<Symbol> {
    fn from(value: SymbolLayout) -> Self {
        value.order.to_vec()
    }
}

/// Shuffle a fresh layout from the OS CSPRNG.
pub fn shuffle_layout() -> Result<SymbolLayout, EntropyError> {
    SymbolLayout::shuffled(&mut OsRandom)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Replays fixed words, cycling.
    struct Words {
        words: Vec<u32>,
        pos: usize,
    }

    impl UniformSource for Words {
        fn next_u32(&mut self) -> Result<u32, EntropyError> {
            let w = self.words[self.pos % self.words.len()];
            self.pos += 1;
            Ok(w)
        }
    }

    #[test]
    fn test_below_rejects_top_of_range() {
        // 2^32 = 858993459 * 5 + 1, so u32::MAX is the single rejected word for bound 5.
        let mut rng = Words {
            words: vec![u32::MAX, 7],
            pos: 0,
        };
        assert_eq!(rng.below(5).unwrap(), 2);
        assert_eq!(rng.pos, 2);
    }

    #[test]
    fn test_below_accepts_just_under_limit() {
        let limit = (1u64 << 32) / 5 * 5;
        let mut rng = Words {
            words: vec![(limit - 1) as u32],
            pos: 0,
        };
        assert_eq!(rng.below(5).unwrap(), ((limit - 1) % 5) as u32);
        assert_eq!(rng.pos, 1);
    }

    #[test]
    fn test_shuffle_is_permutation() {
        for _ in 0..200 {
            let layout = shuffle_layout().unwrap();
            let mut seen = layout.order().to_vec();
            seen.sort();
            assert_eq!(seen, ALPHABET.to_vec());
        }
    }

    #[test]
    fn test_shuffle_covers_all_permutations_roughly_uniformly() {
        let draws = 24_000;
        let mut counts: HashMap<[Symbol; 5], usize> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(*shuffle_layout().unwrap().order()).or_default() += 1;
        }
        assert_eq!(counts.len(), 120);
        let expected = draws as f64 / 120.0;
        let chi2: f64 = counts
            .values()
            .map(|&c| (c as f64 - expected).powi(2) / expected)
            .sum();
        // df = 119; P(chi2 > 190) is below 1e-4.
        assert!(chi2 < 190.0, "chi2 = {chi2}");
    }

    #[test]
    fn test_position_and_symbol_at_agree() {
        let layout = SymbolLayout::from_order([
            Symbol::Star,
            Symbol::Circle,
            Symbol::Square,
            Symbol::Plus,
            Symbol::Waves,
        ])
        .unwrap();
        for i in 0..SYMBOL_COUNT {
            let symbol = layout.symbol_at(i).unwrap();
            assert_eq!(layout.position(symbol), i);
        }
        assert_eq!(layout.symbol_at(5), None);
    }

    #[test]
    fn test_from_order_rejects_duplicates() {
        assert!(
            SymbolLayout::from_order([
                Symbol::Star,
                Symbol::Star,
                Symbol::Square,
                Symbol::Plus,
                Symbol::Waves,
            ])
            .is_err()
        );
    }

    #[test]
    fn test_layout_serde_as_list() {
        let json = serde_json::to_string(&SymbolLayout::identity()).unwrap();
        assert_eq!(json, r#"["circle","plus","waves","square","star"]"#);
        let parsed: SymbolLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SymbolLayout::identity());
        assert!(serde_json::from_str::<SymbolLayout>(r#"["circle","plus"]"#).is_err());
    }
}
