//! Error types for the sealed-envelope engine.
//!
//! Failures are split by the component that raises them so callers can apply
//! the right propagation policy: entropy and commitment failures close the
//! block, reveal and bookkeeping failures only degrade auditability.

use thiserror::Error;

use crate::source::SourceKind;

/// Failure to obtain raw bytes from an entropy source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EntropyError {
    /// No source of the requested kind is registered with the adapter.
    #[error("entropy source {0} is not registered")]
    Unavailable(SourceKind),

    /// The request itself is invalid (zero bytes, oversized chunk).
    #[error("invalid entropy request: {0}")]
    InvalidRequest(String),

    /// Network or transport failure before a response was received.
    #[error("entropy transport error from {source_label}: {message}")]
    Transport {
        source_label: String,
        message: String,
    },

    /// The service answered with a non-2xx status.
    #[error("entropy service {source_label} returned HTTP {status}")]
    Status { source_label: String, status: u16 },

    /// The payload reported `success: false`.
    #[error("entropy service {source_label} reported failure: {message}")]
    Rejected {
        source_label: String,
        message: String,
    },

    /// The payload flagged a fallback or low-quality generator.
    #[error("entropy service {source_label} served fallback randomness")]
    Fallback { source_label: String },

    /// The payload could not be parsed or contained out-of-range values.
    #[error("malformed entropy payload from {source_label}: {message}")]
    Malformed {
        source_label: String,
        message: String,
    },

    /// The service returned fewer bytes than requested.
    #[error("entropy service {source_label} returned {got} of {expected} bytes")]
    ShortBatch {
        source_label: String,
        expected: usize,
        got: usize,
    },

    /// The OS CSPRNG failed.
    #[error("OS random generator failed: {0}")]
    Os(String),

    /// Every retry attempt failed.
    #[error("entropy source {kind} exhausted after {attempts} attempts: {last}")]
    Exhausted {
        kind: SourceKind,
        attempts: u32,
        last: Box<EntropyError>,
    },
}

impl EntropyError {
    /// Whether the backoff loop should try again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Status { .. }
                | Self::Rejected { .. }
                | Self::Fallback { .. }
                | Self::Malformed { .. }
                | Self::ShortBatch { .. }
        )
    }
}

impl From<getrandom::Error> for EntropyError {
    fn from(value: getrandom::Error) -> Self {
        Self::Os(value.to_string())
    }
}

/// Failure while building or checking a commitment tape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TapeError {
    #[error("tape needs an even, non-zero number of bytes, got {0}")]
    OddOrEmptyBatch(usize),

    #[error("salt must be at least {min} bytes, got {got}")]
    SaltTooShort { min: usize, got: usize },

    #[error("tape for block {block_id} is exhausted after {consumed} pairs")]
    Exhausted { block_id: String, consumed: usize },

    #[error("reveal digest mismatch: committed {committed}, recomputed {recomputed}")]
    DigestMismatch {
        committed: String,
        recomputed: String,
    },

    #[error("invalid hex in {field}: {message}")]
    Hex { field: &'static str, message: String },

    #[error("remap key rejected: {0}")]
    RemapKey(String),
}

/// Failure talking to the document store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("write rejected for {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("document encoding error at {path}: {source}")]
    Encoding {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid engine configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level engine error surfaced by blocks and sessions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Entropy(#[from] EntropyError),

    #[error(transparent)]
    Tape(#[from] TapeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The commitment could not be published and the policy is fail-closed.
    #[error("commitment for block {block_id} was not published: {source}")]
    CommitmentNotPublished {
        block_id: String,
        #[source]
        source: StoreError,
    },

    /// An operation was attempted in a state that does not allow it.
    #[error("block {block_id} is {state}; cannot {action}")]
    InvalidState {
        block_id: String,
        state: String,
        action: &'static str,
    },

    #[error("selected index {index} is outside 0..{symbol_count}")]
    SelectionOutOfRange { index: u8, symbol_count: usize },

    #[error("document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
