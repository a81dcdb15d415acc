//! Generic append-only hash chain
//!
//! Ledger records and checkpoint capsules are both links in a chain: each
//! carries the hash of its predecessor and a hash of its own content. This
//! module holds the one implementation of appending and verifying such a
//! chain, parameterized by the record type.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{ChainError, ChainIntegrityError, EncodingError};
use crate::types::ContentHash;

/// Tag identifying which kind of record a chain holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Transaction,
    Checkpoint,
    MarketState,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Transaction => f.write_str("transaction"),
            RecordKind::Checkpoint => f.write_str("checkpoint"),
            RecordKind::MarketState => f.write_str("market_state"),
        }
    }
}

/// A record that links to its predecessor by hash
pub trait ChainedRecord {
    const KIND: RecordKind;

    /// Identifier, unique within one chain
    fn record_id(&self) -> &str;

    /// Hash of the predecessor, `None` for genesis
    fn prev_hash(&self) -> Option<&ContentHash>;

    /// Hash stored alongside the record
    fn stored_hash(&self) -> &ContentHash;

    /// Hash recomputed from the record's content
    fn compute_hash(&self) -> Result<ContentHash, EncodingError>;
}

/// What went wrong at one position of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakKind {
    /// First record of an anchored chain points at a predecessor
    GenesisHasPredecessor { found: ContentHash },
    /// Non-first record has no predecessor link
    MissingPredecessor,
    /// Predecessor link does not match the predecessor's recomputed hash
    LinkMismatch {
        expected: ContentHash,
        found: ContentHash,
    },
    /// Stored hash does not match the record's content
    HashMismatch {
        stored: ContentHash,
        computed: ContentHash,
    },
    /// Record content can no longer be canonicalized
    Unencodable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub index: usize,
    pub record_id: String,
    pub kind: BreakKind,
}

/// Where a verified sequence is expected to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// First record must be a genesis record
    Genesis,
    /// First record may link to anything outside the sequence
    Any,
}

/// How to walk a sequence during verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub anchor: Anchor,
    pub stop_at_first: bool,
}

impl ScanOptions {
    /// Stop at the first break, genesis required
    pub fn query() -> Self {
        Self {
            anchor: Anchor::Genesis,
            stop_at_first: true,
        }
    }

    /// Collect every break, genesis required
    pub fn detailed() -> Self {
        Self {
            anchor: Anchor::Genesis,
            stop_at_first: false,
        }
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }
}

/// Walk a sequence of records and report every break found.
///
/// Position `i` is checked as: the link from record `i` to the recomputed hash
/// of record `i - 1`, then the stored hash of record `i - 1`. A record whose
/// content was altered therefore shows up first as a broken link on its
/// successor, then as a hash mismatch on itself.
pub fn scan<R: ChainedRecord>(records: &[R], options: ScanOptions) -> Vec<ChainBreak> {
    let mut breaks = Vec::new();
    let mut prev: Option<(usize, ContentHash)> = None;

    for (index, record) in records.iter().enumerate() {
        let link = match (&prev, record.prev_hash()) {
            (None, Some(found)) if options.anchor == Anchor::Genesis => {
                Some(BreakKind::GenesisHasPredecessor { found: found.clone() })
            }
            (Some(_), None) => Some(BreakKind::MissingPredecessor),
            (Some((_, expected)), Some(found)) if expected != found => Some(BreakKind::LinkMismatch {
                expected: expected.clone(),
                found: found.clone(),
            }),
            _ => None,
        };
        if let Some(kind) = link {
            breaks.push(ChainBreak {
                index,
                record_id: record.record_id().to_string(),
                kind,
            });
            if options.stop_at_first {
                return breaks;
            }
        }

        if let Some((prev_index, computed)) = prev.take() {
            if let Some(b) = check_stored(&records[prev_index], prev_index, computed) {
                breaks.push(b);
                if options.stop_at_first {
                    return breaks;
                }
            }
        }

        match record.compute_hash() {
            Ok(computed) => prev = Some((index, computed)),
            Err(e) => {
                breaks.push(ChainBreak {
                    index,
                    record_id: record.record_id().to_string(),
                    kind: BreakKind::Unencodable { reason: e.to_string() },
                });
                return breaks;
            }
        }
    }

    if let Some((last, computed)) = prev {
        if let Some(b) = check_stored(&records[last], last, computed) {
            breaks.push(b);
        }
    }

    breaks
}

fn check_stored<R: ChainedRecord>(record: &R, index: usize, computed: ContentHash) -> Option<ChainBreak> {
    if record.stored_hash() == &computed {
        return None;
    }
    Some(ChainBreak {
        index,
        record_id: record.record_id().to_string(),
        kind: BreakKind::HashMismatch {
            stored: record.stored_hash().clone(),
            computed,
        },
    })
}

/// Outcome of a detailed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub kind: RecordKind,
    pub length: usize,
    pub breaks: Vec<ChainBreak>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.breaks.is_empty()
    }

    /// Convert into the strict-mode error, if any break was found
    pub fn into_result(self) -> Result<(), ChainIntegrityError> {
        if self.breaks.is_empty() {
            Ok(())
        } else {
            Err(ChainIntegrityError {
                kind: self.kind,
                breaks: self.breaks,
            })
        }
    }
}

/// Append-only sequence of chained records with an id index
#[derive(Debug, Clone)]
pub struct HashChain<R> {
    records: Vec<R>,
    index: HashMap<String, usize>,
}

impl<R: ChainedRecord> HashChain<R> {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a chain from stored records, rejecting any break or duplicate
    pub fn from_records(records: Vec<R>) -> Result<Self, ChainError> {
        let breaks = scan(&records, ScanOptions::detailed());
        if !breaks.is_empty() {
            return Err(ChainIntegrityError { kind: R::KIND, breaks }.into());
        }
        let mut chain = Self::new();
        for (i, record) in records.iter().enumerate() {
            if chain.index.insert(record.record_id().to_string(), i).is_some() {
                return Err(ChainError::DuplicateRecord {
                    kind: R::KIND,
                    id: record.record_id().to_string(),
                });
            }
        }
        chain.records = records;
        Ok(chain)
    }

    /// Load stored records as-is, for inspecting untrusted history
    pub fn from_records_unverified(records: Vec<R>) -> Self {
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            index.entry(record.record_id().to_string()).or_insert(i);
        }
        Self { records, index }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.index.get(id).and_then(|&i| self.records.get(i))
    }

    /// Most recently appended record
    pub fn head(&self) -> Option<&R> {
        self.records.last()
    }

    pub fn head_hash(&self) -> Option<&ContentHash> {
        self.head().map(ChainedRecord::stored_hash)
    }

    /// Hash of the head as it stood when the chain had `height` records
    pub fn hash_at(&self, height: usize) -> Option<&ContentHash> {
        height
            .checked_sub(1)
            .and_then(|i| self.records.get(i))
            .map(ChainedRecord::stored_hash)
    }

    /// Append one record that already links to the current head
    pub fn append(&mut self, record: R) -> Result<&R, ChainError> {
        self.check_batch(std::slice::from_ref(&record))?;
        let position = self.records.len();
        self.push_checked(vec![record]);
        Ok(&self.records[position])
    }

    /// Append a batch atomically: either every record is added or none is
    pub fn extend(&mut self, batch: Vec<R>) -> Result<(), ChainError> {
        self.check_batch(&batch)?;
        self.push_checked(batch);
        Ok(())
    }

    /// Check that `batch` would extend the current head, without changing the chain
    pub fn check_batch(&self, batch: &[R]) -> Result<(), ChainError> {
        let mut head = self.head_hash().cloned();
        let mut seen = HashSet::with_capacity(batch.len());

        for (offset, record) in batch.iter().enumerate() {
            let id = record.record_id();
            if self.index.contains_key(id) || !seen.insert(id) {
                return Err(ChainError::DuplicateRecord {
                    kind: R::KIND,
                    id: id.to_string(),
                });
            }
            if record.prev_hash() != head.as_ref() {
                return Err(ChainError::Detached {
                    kind: R::KIND,
                    id: id.to_string(),
                    expected: head,
                    found: record.prev_hash().cloned(),
                });
            }
            let computed = record.compute_hash()?;
            if &computed != record.stored_hash() {
                return Err(ChainIntegrityError {
                    kind: R::KIND,
                    breaks: vec![ChainBreak {
                        index: self.records.len() + offset,
                        record_id: id.to_string(),
                        kind: BreakKind::HashMismatch {
                            stored: record.stored_hash().clone(),
                            computed,
                        },
                    }],
                }
                .into());
            }
            head = Some(computed);
        }
        Ok(())
    }

    /// Append a batch that passed [`HashChain::check_batch`] against the current head
    pub(crate) fn push_checked(&mut self, batch: Vec<R>) {
        for record in batch {
            self.index.insert(record.record_id().to_string(), self.records.len());
            self.records.push(record);
        }
    }

    /// Query mode: false at the first break
    pub fn verify(&self) -> bool {
        scan(&self.records, ScanOptions::query()).is_empty()
    }

    /// Detailed mode: every break, in chain order
    pub fn report(&self) -> ChainReport {
        ChainReport {
            kind: R::KIND,
            length: self.records.len(),
            breaks: scan(&self.records, ScanOptions::detailed()),
        }
    }

    /// Strict mode: the first break as an error
    pub fn ensure_valid(&self) -> Result<(), ChainIntegrityError> {
        let breaks = scan(&self.records, ScanOptions::query());
        if breaks.is_empty() {
            Ok(())
        } else {
            Err(ChainIntegrityError { kind: R::KIND, breaks })
        }
    }
}

impl<R: ChainedRecord> Default for HashChain<R> {
    fn default() -> Self {
        Self::new()
    }
}
