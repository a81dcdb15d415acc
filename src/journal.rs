//! Append-only NDJSON journal per entity ledger

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::JournalError;
use crate::ledger::{TransactionLedger, TransactionRecord};

/// Directory of `<entity>.ndjson` files, one record per line
#[derive(Debug, Clone)]
pub struct LedgerJournal {
    dir: PathBuf,
}

impl LedgerJournal {
    /// Open (creating if needed) a journal directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an entity's journal file
    pub fn path_for(&self, entity_id: &str) -> Result<PathBuf, JournalError> {
        let valid = !entity_id.is_empty()
            && entity_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !entity_id.starts_with('.');
        if !valid {
            return Err(JournalError::InvalidEntityId {
                entity_id: entity_id.to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.ndjson", entity_id)))
    }

    /// Append every record of `ledger` not yet on disk and return how many were written.
    ///
    /// Fails with [`JournalError::Diverged`] when the file does not hold a prefix
    /// of the ledger.
    pub fn sync(&self, ledger: &TransactionLedger) -> Result<usize, JournalError> {
        let path = self.path_for(ledger.entity_id())?;
        let on_disk = if path.exists() {
            read_records(&path)?
        } else {
            Vec::new()
        };

        let records = ledger.records();
        if on_disk.len() > records.len() {
            return Err(JournalError::Diverged {
                entity_id: ledger.entity_id().to_string(),
                reason: format!("journal holds {} records, ledger {}", on_disk.len(), records.len()),
            });
        }
        if let Some(last) = on_disk.last() {
            let expected = &records[on_disk.len() - 1];
            if last.record_hash != expected.record_hash {
                return Err(JournalError::Diverged {
                    entity_id: ledger.entity_id().to_string(),
                    reason: format!("record {} differs at position {}", last.id, on_disk.len() - 1),
                });
            }
        }

        let pending = &records[on_disk.len()..];
        if pending.is_empty() {
            return Ok(0);
        }

        let io = |source: std::io::Error| JournalError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io)?;
        let mut buffer = Vec::new();
        for record in pending {
            serde_json::to_writer(&mut buffer, record).map_err(|e| JournalError::Malformed {
                path: path.clone(),
                line: 0,
                reason: e.to_string(),
            })?;
            buffer.push(b'\n');
        }
        file.write_all(&buffer).map_err(io)?;
        file.sync_data().map_err(io)?;

        debug!(entity = ledger.entity_id(), appended = pending.len(), "Journal synced");
        Ok(pending.len())
    }

    /// Rebuild a ledger from its journal, verifying every link
    pub fn load(&self, entity_id: &str) -> Result<TransactionLedger, JournalError> {
        let records = read_records(&self.path_for(entity_id)?)?;
        Ok(TransactionLedger::from_records(entity_id, records)?)
    }

    /// Rebuild a ledger without verification, for auditing damaged journals
    pub fn load_unverified(&self, entity_id: &str) -> Result<TransactionLedger, JournalError> {
        let records = read_records(&self.path_for(entity_id)?)?;
        Ok(TransactionLedger::from_records_unverified(entity_id, records))
    }
}

fn read_records(path: &Path) -> Result<Vec<TransactionRecord>, JournalError> {
    let file = File::open(path).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| JournalError::Malformed {
            path: path.to_path_buf(),
            line: i + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}
