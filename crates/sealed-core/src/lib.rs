//! # sealed-core
//!
//! **Targets fixed before the participant sees them, and provably so.**
//!
//! `sealed-core` runs forced-choice trials where the answer for every trial
//! is drawn from an external entropy source, sealed under a salted SHA-256
//! digest before the block starts, and revealed after it ends.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sealed_core::{EngineConfig, EntropyAdapter, LocalSecureSource, MemoryStore, Session, SourceKind, now_ms};
//!
//! # async fn demo() -> Result<(), sealed_core::EngineError> {
//! let config = EngineConfig::default();
//! let adapter = Arc::new(EntropyAdapter::from_config(&config).with_source(Arc::new(LocalSecureSource::new())));
//! let store = Arc::new(MemoryStore::new());
//!
//! let mut session = Session::start(config, adapter, store, SourceKind::LocalSecure, "participant-1", 5).await?;
//! let block = session.start_block(5).await?;
//! while let Some(trial) = session.prepare_trial().await?.ready() {
//!     let Some(shown) = block.present(&trial).await?.ready() else { continue };
//!     session.record_response(&trial, shown, Some(2), Some(850), now_ms()).await?;
//!     if block.is_complete().await {
//!         break;
//!     }
//! }
//! session.finish_block().await?;
//! session.finalize().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Entropy source → Adapter (retry, chunking) → Tape (commit) → Resolver
//! (per trial) → Trial records → Reveal
//!
//! - [`EntropyAdapter`] never substitutes a weaker source; exhaustion is a typed error.
//! - [`CommitmentTape`] publishes `SHA-256(salt || pairs)` before the first trial.
//! - [`resolve`] maps `byte mod 5` onto a freshly shuffled [`SymbolLayout`].
//! - [`BlockRunner`] drives the block state machine and drops stale preparations.
//! - [`verify_bundle`] re-checks an exported session offline.

pub mod block;
pub mod config;
pub mod error;
pub mod fetch;
pub mod layout;
pub mod record;
pub mod remap;
pub mod resolver;
pub mod session;
pub mod source;
pub mod sources;
pub mod store;
pub mod tape;
pub mod time;
pub mod verify;

pub use block::{BlockRunner, BlockState, Prepared, PreparedTrial, SealedEnvelope, is_entropy_failure};
pub use config::{ByteSupply, CommitFailurePolicy, EngineConfig, MIN_SALT_LEN, RemapMode, RetryPolicy};
pub use error::{ConfigError, EngineError, EntropyError, StoreError, TapeError};
pub use fetch::EntropyAdapter;
pub use layout::{ALPHABET, OsRandom, SYMBOL_COUNT, Symbol, SymbolLayout, UniformSource, shuffle_layout};
pub use record::{
    AuditGap, AuditGapKind, BlockSummary, BlockTally, Consent, ExitReason, ExitStatus, Presentation,
    PresentationMode, Provenance, SessionAggregate, TrialRecord,
};
pub use remap::{HmacRotationRemap, IdentityRemap, IndexRemap, RemapRecord, remap_for};
pub use resolver::{TrialAssignment, resolve, symbol_for_byte};
pub use session::{Session, SessionHandle};
pub use source::{EntropySource, RawByteBatch, SourceKind};
pub use sources::{EntropyPayload, HttpEntropySource, LocalSecureSource, validate_payload};
pub use store::{DocumentStore, FileStore, MemoryStore, paths};
pub use tape::{BytePair, CommitmentDoc, CommitmentTape, DIGEST_ALGORITHM, RevealDoc, tape_digest};
pub use time::{now_iso8601, now_ms};
pub use verify::{
    BlockReport, BlockVerdict, ExportBundle, ExportedBlock, ExportedSession, VerifyError, VerifyReport,
    export_all, export_session, verify_block, verify_bundle,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
