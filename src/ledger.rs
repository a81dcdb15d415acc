//! Per-entity append-only transaction ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::canonical::compute_hash;
use crate::chain::{ChainReport, ChainedRecord, HashChain, RecordKind};
use crate::error::{ChainIntegrityError, EncodingError, LedgerError};
use crate::types::{Account, ContentHash, EntityId, Tick, TransactionKind};

/// One immutable double-entry record in a ledger chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub tick: Tick,
    pub timestamp: DateTime<Utc>,
    pub amount: i64,
    pub kind: TransactionKind,
    pub debit_account: Account,
    pub credit_account: Account,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
    pub prev_hash: Option<ContentHash>,
    pub record_hash: ContentHash,
}

/// Every field except `record_hash`
#[derive(Serialize)]
struct RecordPreimage<'a> {
    id: &'a str,
    tick: Tick,
    timestamp: &'a DateTime<Utc>,
    amount: i64,
    kind: TransactionKind,
    debit_account: Account,
    credit_account: Account,
    metadata: &'a Option<BTreeMap<String, Value>>,
    prev_hash: &'a Option<ContentHash>,
}

impl TransactionRecord {
    fn preimage(&self) -> RecordPreimage<'_> {
        RecordPreimage {
            id: &self.id,
            tick: self.tick,
            timestamp: &self.timestamp,
            amount: self.amount,
            kind: self.kind,
            debit_account: self.debit_account,
            credit_account: self.credit_account,
            metadata: &self.metadata,
            prev_hash: &self.prev_hash,
        }
    }

    /// Hash over every field except the stored hash itself
    pub fn content_hash(&self) -> Result<ContentHash, EncodingError> {
        compute_hash(&self.preimage())
    }
}

impl ChainedRecord for TransactionRecord {
    const KIND: RecordKind = RecordKind::Transaction;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn prev_hash(&self) -> Option<&ContentHash> {
        self.prev_hash.as_ref()
    }

    fn stored_hash(&self) -> &ContentHash {
        &self.record_hash
    }

    fn compute_hash(&self) -> Result<ContentHash, EncodingError> {
        self.content_hash()
    }
}

/// A transaction to be recorded; the ledger supplies the chain linkage
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub id: String,
    pub tick: Tick,
    pub timestamp: DateTime<Utc>,
    pub amount: i64,
    pub kind: TransactionKind,
    pub debit: Account,
    pub credit: Account,
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Posting {
    /// Create a new posting stamped at the epoch
    pub fn new(
        id: impl Into<String>,
        tick: Tick,
        amount: i64,
        kind: TransactionKind,
        debit: Account,
        credit: Account,
    ) -> Self {
        Self {
            id: id.into(),
            tick,
            timestamp: DateTime::<Utc>::default(),
            amount,
            kind,
            debit,
            credit,
            metadata: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach a single metadata entry
    pub fn with_note(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.amount < 0 {
            return Err(LedgerError::InvalidPosting {
                id: self.id.clone(),
                reason: format!("negative amount {}", self.amount),
            });
        }
        if self.debit == self.credit {
            return Err(LedgerError::InvalidPosting {
                id: self.id.clone(),
                reason: format!("debit and credit are both {:?}", self.debit),
            });
        }
        Ok(())
    }

    fn seal(self, prev_hash: Option<ContentHash>) -> Result<TransactionRecord, LedgerError> {
        self.validate()?;
        let mut record = TransactionRecord {
            id: self.id,
            tick: self.tick,
            timestamp: self.timestamp,
            amount: self.amount,
            kind: self.kind,
            debit_account: self.debit,
            credit_account: self.credit,
            metadata: self.metadata,
            prev_hash,
            // Placeholder until the preimage is hashed below
            record_hash: ContentHash::from_digest(&[0u8; 32]),
        };
        record.record_hash = record.content_hash()?;
        Ok(record)
    }
}

/// Postings sealed against a ledger head, ready to be appended.
///
/// Produced by [`TransactionLedger::prepare_batch`]; holds everything the
/// append needs so that committing it cannot fail.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    base: Option<ContentHash>,
    records: Vec<TransactionRecord>,
    balances: BTreeMap<Account, i128>,
}

impl SealedBatch {
    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Net debits per account; a credit counts negative
fn net_debits<'a>(records: impl IntoIterator<Item = &'a TransactionRecord>) -> BTreeMap<Account, i128> {
    let mut balances = BTreeMap::new();
    for record in records {
        *balances.entry(record.debit_account).or_insert(0i128) += i128::from(record.amount);
        *balances.entry(record.credit_account).or_insert(0i128) -= i128::from(record.amount);
    }
    balances
}

/// A net balance that reads as an i64 under either account sense
fn fits_i64(net: i128) -> bool {
    net.abs() <= i128::from(i64::MAX)
}

/// Append-only, hash-chained record store for one entity
#[derive(Debug, Clone)]
pub struct TransactionLedger {
    entity_id: EntityId,
    chain: HashChain<TransactionRecord>,
    balances: BTreeMap<Account, i128>,
}

impl TransactionLedger {
    /// Create a new empty ledger
    pub fn new(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            chain: HashChain::new(),
            balances: BTreeMap::new(),
        }
    }

    /// Rebuild a ledger from stored records, rejecting any break or out-of-range balance
    pub fn from_records(entity_id: impl Into<EntityId>, records: Vec<TransactionRecord>) -> Result<Self, LedgerError> {
        let entity_id = entity_id.into();
        let balances = net_debits(&records);
        if let Some((&account, _)) = balances.iter().find(|(_, net)| !fits_i64(**net)) {
            return Err(LedgerError::BalanceOverflow { entity_id, account });
        }
        Ok(Self {
            entity_id,
            chain: HashChain::from_records(records)?,
            balances,
        })
    }

    /// Load stored records without verifying them, for audits of untrusted history
    pub fn from_records_unverified(entity_id: impl Into<EntityId>, records: Vec<TransactionRecord>) -> Self {
        Self {
            entity_id: entity_id.into(),
            balances: net_debits(&records),
            chain: HashChain::from_records_unverified(records),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Append one posting and return the stored record. On error the ledger is unchanged.
    pub fn record(&mut self, posting: Posting) -> Result<&TransactionRecord, LedgerError> {
        let batch = self.prepare_batch(vec![posting])?;
        for record in &batch.records {
            debug!(
                entity = %self.entity_id,
                id = %record.id,
                amount = record.amount,
                hash = %record.record_hash.short(),
                "Recording transaction"
            );
        }
        let position = self.chain.len();
        self.commit_sealed(batch);
        Ok(&self.chain.records()[position])
    }

    /// Append several postings as one unit: all are recorded or none is
    pub fn record_batch(&mut self, postings: Vec<Posting>) -> Result<usize, LedgerError> {
        let batch = self.prepare_batch(postings)?;
        let count = self.commit_sealed(batch);
        if count > 0 {
            debug!(entity = %self.entity_id, count, "Recorded transaction batch");
        }
        Ok(count)
    }

    /// Seal and check postings against the current head without appending them.
    ///
    /// Every way an append can fail is checked here: posting validity,
    /// duplicate ids, encodability and balances leaving the i64 range.
    pub fn prepare_batch(&self, postings: Vec<Posting>) -> Result<SealedBatch, LedgerError> {
        let base = self.chain.head_hash().cloned();
        let mut head = base.clone();
        let mut records = Vec::with_capacity(postings.len());
        let mut balances = BTreeMap::new();

        for posting in postings {
            let record = posting.seal(head.take())?;
            for (account, delta) in [
                (record.debit_account, i128::from(record.amount)),
                (record.credit_account, -i128::from(record.amount)),
            ] {
                let net = balances
                    .entry(account)
                    .or_insert_with(|| self.balances.get(&account).copied().unwrap_or(0));
                *net += delta;
                if !fits_i64(*net) {
                    return Err(LedgerError::BalanceOverflow {
                        entity_id: self.entity_id.clone(),
                        account,
                    });
                }
            }
            head = Some(record.record_hash.clone());
            records.push(record);
        }

        self.chain.check_batch(&records)?;
        Ok(SealedBatch { base, records, balances })
    }

    /// Append a batch prepared against the current head
    pub(crate) fn commit_sealed(&mut self, batch: SealedBatch) -> usize {
        debug_assert_eq!(batch.base.as_ref(), self.chain.head_hash());
        let count = batch.records.len();
        self.balances.extend(batch.balances);
        self.chain.push_checked(batch.records);
        count
    }

    /// Hash of the most recent record
    pub fn chain_head_hash(&self) -> Option<&ContentHash> {
        self.chain.head_hash()
    }

    /// Head hash as it stood when the ledger held `height` records
    pub fn head_at(&self, height: usize) -> Option<&ContentHash> {
        self.chain.hash_at(height)
    }

    /// Hash of the first record
    pub fn genesis_hash(&self) -> Option<&ContentHash> {
        self.chain.hash_at(1)
    }

    /// False at the first broken link or hash
    pub fn verify_chain(&self) -> bool {
        self.chain.verify()
    }

    /// Every break in the chain, in order
    pub fn verification_report(&self) -> ChainReport {
        self.chain.report()
    }

    pub fn ensure_valid(&self) -> Result<(), ChainIntegrityError> {
        self.chain.ensure_valid()
    }

    /// Signed balance of an account: debit-normal for assets, credit-normal otherwise.
    ///
    /// `None` only for histories loaded with
    /// [`TransactionLedger::from_records_unverified`] whose balance leaves the i64 range.
    pub fn checked_balance(&self, account: Account) -> Option<i64> {
        let net = self.balances.get(&account).copied().unwrap_or(0);
        let signed = if account.class().is_debit_normal() { net } else { -net };
        i64::try_from(signed).ok()
    }

    /// Signed balance of an account. Appends that would push a balance out of
    /// range are rejected, so this is exact for every verified ledger.
    pub fn get_balance(&self, account: Account) -> i64 {
        match self.checked_balance(account) {
            Some(balance) => balance,
            None => {
                warn!(entity = %self.entity_id, ?account, "Balance out of range in unverified history");
                let net = self.balances.get(&account).copied().unwrap_or(0);
                if (net > 0) == account.class().is_debit_normal() {
                    i64::MAX
                } else {
                    i64::MIN
                }
            }
        }
    }

    pub fn get_transaction(&self, id: &str) -> Option<&TransactionRecord> {
        self.chain.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.chain.contains(id)
    }

    pub fn records(&self) -> &[TransactionRecord] {
        self.chain.records()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Complete history as a JSON document
    pub fn export_audit_trail(&self) -> Result<Value, EncodingError> {
        #[derive(Serialize)]
        struct AuditTrail<'a> {
            entity_id: &'a str,
            length: usize,
            head_hash: Option<&'a ContentHash>,
            records: &'a [TransactionRecord],
        }

        serde_json::to_value(AuditTrail {
            entity_id: &self.entity_id,
            length: self.len(),
            head_hash: self.chain_head_hash(),
            records: self.records(),
        })
        .map_err(|e| EncodingError::Unsupported { reason: e.to_string() })
    }
}
