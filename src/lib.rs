//! tickchain
//!
//! A deterministic, tamper-evident record of simulated entity state: hash-chained
//! per-entity ledgers, a discrete-tick state engine that mutates entities through
//! those ledgers, and content-addressed checkpoints that snapshot, verify and
//! replay the whole world at any tick.

pub mod canonical;
pub mod chain;
pub mod checkpoint;
pub mod cid;
pub mod config;
pub mod context;
pub mod engine;
pub mod entity;
pub mod environment;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod market;
pub mod replay;
pub mod rules;
pub mod scaled;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod verifier;

// Re-export core types
pub use canonical::{canonicalize, compute_hash, hashes_equal, CanonicalEncoder};
pub use chain::{Anchor, BreakKind, ChainBreak, ChainReport, ChainedRecord, HashChain, RecordKind, ScanOptions};
pub use checkpoint::{CheckpointCapsule, CheckpointStore, ExternalPin, RestoreSource};
pub use cid::ContentId;
pub use config::{CheckpointConfig, CoreConfig, EngineConfig};
pub use context::{DeterministicTime, SeededRandom};
pub use engine::{EngineStatus, OperationOutcome, OperationReceipt, StateEngine};
pub use entity::{Entity, Financials, Metrics, Resources};
pub use environment::EnvironmentParams;
pub use error::{
    ChainError, ChainIntegrityError, CheckpointError, ConfigError, CoreError, EncodingError, EngineError,
    IntegrityError, JournalError, LedgerError, StoreError, TamperError, VerificationError,
};
pub use journal::LedgerJournal;
pub use ledger::{Posting, SealedBatch, TransactionLedger, TransactionRecord};
pub use market::{MarketHistory, MarketState, Ranking};
pub use replay::{
    first_divergence, Divergence, ReplayEngine, ReplayEngineBuilder, ReplayResult, ReplayScript, ReplayStep,
};
pub use rules::{
    OperationKind, OperationParams, OperationPlan, OperationRules, PlannedPosting, PreconditionFailure, StandardRules,
};
pub use scaled::ScaledDecimal;
pub use snapshot::{EntitySnapshot, StateSnapshot};
pub use store::{pin_with_retry, ContentStore, MemoryContentStore, PinPolicy};
pub use types::{Account, AccountClass, ContentHash, EntityId, Tick, TransactionKind, Version};
pub use verifier::{ChainVerifier, VerificationReport};
