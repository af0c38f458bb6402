//! Entropy source contract.
//!
//! Every byte generator (hardware proxy, quantum proxy, local CSPRNG)
//! implements [`EntropySource`]: "give me N raw bytes or fail". Sources never
//! substitute a weaker generator on their own.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EntropyError;

/// Kind of external byte generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Hardware-RNG proxy service.
    #[serde(rename = "hardware-proxy")]
    HardwareProxy,
    /// Quantum-RNG proxy service.
    #[serde(rename = "quantum-proxy")]
    QuantumProxy,
    /// Local cryptographically secure generator.
    #[serde(rename = "local-secure-random")]
    LocalSecure,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::HardwareProxy, Self::QuantumProxy, Self::LocalSecure];

    /// Stable label persisted in provenance fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::HardwareProxy => "hardware-proxy",
            Self::QuantumProxy => "quantum-proxy",
            Self::LocalSecure => "local-secure-random",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardware-proxy" | "hardware" | "hw" => Ok(Self::HardwareProxy),
            "quantum-proxy" | "quantum" | "qrng" => Ok(Self::QuantumProxy),
            "local-secure-random" | "local" | "os" => Ok(Self::LocalSecure),
            other => Err(format!("unknown entropy source '{other}'")),
        }
    }
}

/// An immutable batch of raw bytes returned by one logical fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawByteBatch {
    pub bytes: Vec<u8>,
    /// Label reported by the service (or the local generator name).
    pub source: String,
    pub kind: SourceKind,
    /// Unique id so records can cite the batch they came from.
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<String>,
}

impl RawByteBatch {
    pub fn new(kind: SourceKind, source: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            source: source.into(),
            kind,
            batch_id: uuid::Uuid::new_v4().to_string(),
            server_time: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Trait every entropy source implements.
#[async_trait]
pub trait EntropySource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Human-readable label, used in logs and provenance.
    fn label(&self) -> &str {
        self.kind().label()
    }

    /// Fetch exactly `n` bytes in one call, or fail.
    async fn fetch(&self, n: usize) -> Result<RawByteBatch, EntropyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_aliases() {
        assert_eq!("local".parse::<SourceKind>().unwrap(), SourceKind::LocalSecure);
        assert_eq!("qrng".parse::<SourceKind>().unwrap(), SourceKind::QuantumProxy);
        assert_eq!(
            "hardware-proxy".parse::<SourceKind>().unwrap(),
            SourceKind::HardwareProxy
        );
        assert!("dice".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_kind_serde_uses_labels() {
        let json = serde_json::to_string(&SourceKind::LocalSecure).unwrap();
        assert_eq!(json, "\"local-secure-random\"");
        for kind in SourceKind::ALL {
            assert_eq!(kind.to_string(), kind.label());
        }
    }

    #[test]
    fn test_batches_get_distinct_ids() {
        let a = RawByteBatch::new(SourceKind::LocalSecure, "os", vec![1, 2]);
        let b = RawByteBatch::new(SourceKind::LocalSecure, "os", vec![1, 2]);
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(a.len(), 2);
    }
}
