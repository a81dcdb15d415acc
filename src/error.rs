//! Error types for tickchain

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::chain::{ChainBreak, RecordKind};
use crate::types::{Account, ContentHash, EntityId, Tick, Version};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// A value that has no deterministic canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("Floating-point value at {path} cannot be canonicalized")]
    FloatNotAllowed { path: String },

    #[error("Unsupported value: {reason}")]
    Unsupported { reason: String },

    #[error("Malformed hash: {value}")]
    MalformedHash { value: String },
}

/// Strict-mode verification failure for a hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIntegrityError {
    pub kind: RecordKind,
    pub breaks: Vec<ChainBreak>,
}

impl fmt::Display for ChainIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.breaks.first() {
            Some(first) => write!(
                f,
                "{} chain broken at index {} ({}): {} break(s)",
                self.kind,
                first.index,
                first.record_id,
                self.breaks.len()
            ),
            None => write!(f, "{} chain integrity error", self.kind),
        }
    }
}

impl std::error::Error for ChainIntegrityError {}

impl ChainIntegrityError {
    /// The first break in chain order
    pub fn first(&self) -> Option<&ChainBreak> {
        self.breaks.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Duplicate {kind} record: {id}")]
    DuplicateRecord { kind: RecordKind, id: String },

    #[error("{kind} record {id} does not extend the chain head")]
    Detached {
        kind: RecordKind,
        id: String,
        expected: Option<ContentHash>,
        found: Option<ContentHash>,
    },

    #[error(transparent)]
    Integrity(#[from] ChainIntegrityError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Invalid posting {id}: {reason}")]
    InvalidPosting { id: String, reason: String },

    #[error("Balance of {account:?} on {entity_id} would leave the i64 range")]
    BalanceOverflow { entity_id: EntityId, account: Account },
}

impl LedgerError {
    /// True when the append was rejected because the id already exists
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LedgerError::Chain(ChainError::DuplicateRecord { .. }))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is terminated")]
    Terminated,

    #[error("Unknown entity: {entity_id}")]
    UnknownEntity { entity_id: EntityId },

    #[error("Entity already registered: {entity_id}")]
    DuplicateEntity { entity_id: EntityId },

    #[error("Counter overflow on {entity_id}: {field}")]
    Overflow { entity_id: EntityId, field: String },

    #[error("Clock overflow at tick {tick}")]
    ClockOverflow { tick: Tick },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Infrastructure failures from the external content-addressed store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("External store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("External store timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Content not found: {id}")]
    NotFound { id: String },

    #[error("External store rejected request: {reason}")]
    Rejected { reason: String },
}

impl StoreError {
    /// Connectivity and timeout failures, as opposed to data problems
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Timeout { .. })
    }
}

/// Stored content no longer matches its own hashes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Canonical hash mismatch for {checkpoint_id}: stored {stored}, computed {computed}")]
    CanonicalHashMismatch {
        checkpoint_id: String,
        stored: ContentHash,
        computed: ContentHash,
    },

    #[error("Checkpoint id mismatch: expected {expected}, found {found}")]
    CheckpointIdMismatch { expected: String, found: String },

    #[error("Content id {content_id} does not match payload")]
    ContentIdMismatch { content_id: String },

    #[error("Malformed content id {content_id}: {reason}")]
    MalformedContentId { content_id: String, reason: String },

    #[error("Capsule header disagrees with state vector: {field}")]
    HeaderMismatch { field: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Checkpoint not found: {id}")]
    NotFound { id: String },

    #[error("Checkpoint id {id} already holds a different state")]
    Conflict { id: String },

    #[error("Rules version {found} is incompatible with checkpoint rules {expected}")]
    RulesMismatch { expected: Version, found: Version },

    #[error("Malformed checkpoint document {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stored merkle root diverges from the ledgers as they stood at the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Tamper detected at checkpoint {checkpoint_id} (tick {tick}): {reason}")]
pub struct TamperError {
    pub checkpoint_id: String,
    pub tick: Tick,
    pub stored_root: ContentHash,
    pub recomputed_root: Option<ContentHash>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Ledger of {entity_id} is invalid: {source}")]
    Ledger {
        entity_id: EntityId,
        #[source]
        source: ChainIntegrityError,
    },

    #[error("Market history is invalid: {0}")]
    MarketHistory(ChainIntegrityError),

    #[error("Checkpoint chain is invalid: {0}")]
    Checkpoints(ChainIntegrityError),

    #[error("Checkpoint identity is invalid: {0}")]
    Identity(#[from] IntegrityError),

    #[error(transparent)]
    Tamper(#[from] TamperError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl VerificationError {
    /// Divergence between audit time and checkpoint time, rather than a malformed record
    pub fn is_tamper(&self) -> bool {
        matches!(self, VerificationError::Tamper(_))
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed journal line {line} in {path}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Journal for {entity_id} diverged from the ledger: {reason}")]
    Diverged { entity_id: EntityId, reason: String },

    #[error("Entity id {entity_id} cannot name a journal file")]
    InvalidEntityId { entity_id: EntityId },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value {field}: {reason}")]
    Invalid { field: String, reason: String },
}
