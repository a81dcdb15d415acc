//! Content-addressed, hash-chained checkpoints of the whole world

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::canonical::{compute_hash, CanonicalEncoder};
use crate::chain::{scan, Anchor, ChainReport, ChainedRecord, RecordKind, ScanOptions};
use crate::cid::{self, ContentId};
use crate::config::CheckpointConfig;
use crate::engine::StateEngine;
use crate::error::{CheckpointError, EncodingError, EngineError, IntegrityError, StoreError};
use crate::rules::{OperationRules, StandardRules};
use crate::snapshot::StateSnapshot;
use crate::store::{pin_with_retry, ContentStore, PinPolicy};
use crate::types::{ContentHash, EntityId, Tick};

/// Number of hash characters that follow the prefix in a checkpoint id
pub const ID_HASH_CHARS: usize = 32;

/// Where a capsule was pinned externally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPin {
    pub content_id: String,
    /// Hex multihash of the capsule payload
    pub multihash: String,
}

/// Immutable snapshot of the world, chained to its predecessor by
/// `canonical_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCapsule {
    pub checkpoint_id: String,
    pub tick: Tick,
    pub timestamp: DateTime<Utc>,
    pub seed: u64,
    pub state_vector: StateSnapshot,
    /// Hash of the canonical `state_vector`
    pub canonical_hash: ContentHash,
    /// Hash over the sorted ledger heads at capture time
    pub merkle_root: ContentHash,
    pub prev_checkpoint_hash: Option<ContentHash>,
    /// Ledger lengths at capture time, for recomputing `merkle_root` later
    pub ledger_heights: BTreeMap<EntityId, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalPin>,
}

impl CheckpointCapsule {
    /// Derive the id for a canonical hash
    pub fn derive_id(prefix: &str, canonical_hash: &ContentHash) -> String {
        format!("{}{}", prefix, &canonical_hash.as_str()[..ID_HASH_CHARS])
    }

    /// Everything except the external pin, as a JSON tree
    pub fn payload(&self) -> Result<Value, EncodingError> {
        let mut value = serde_json::to_value(self).map_err(|e| EncodingError::Unsupported {
            reason: e.to_string(),
        })?;
        if let Value::Object(map) = &mut value {
            map.remove("external");
        }
        Ok(value)
    }

    /// Canonical bytes of [`CheckpointCapsule::payload`]; what gets pinned
    pub fn payload_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        CanonicalEncoder::new().canonicalize_value(&self.payload()?)
    }

    /// Content identifier of the payload
    pub fn content_id(&self) -> Result<ContentId, EncodingError> {
        Ok(ContentId::for_bytes(&self.payload_bytes()?))
    }

    /// Recompute the hashes and header fields; the first disagreement is an error
    pub fn verify_identity(&self, prefix: &str) -> Result<(), CheckpointError> {
        let computed = compute_hash(&self.state_vector)?;
        if computed != self.canonical_hash {
            return Err(IntegrityError::CanonicalHashMismatch {
                checkpoint_id: self.checkpoint_id.clone(),
                stored: self.canonical_hash.clone(),
                computed,
            }
            .into());
        }

        let expected = Self::derive_id(prefix, &computed);
        if expected != self.checkpoint_id {
            return Err(IntegrityError::CheckpointIdMismatch {
                expected,
                found: self.checkpoint_id.clone(),
            }
            .into());
        }

        if self.tick != self.state_vector.tick {
            return Err(IntegrityError::HeaderMismatch {
                field: "tick".to_string(),
            }
            .into());
        }
        if self.seed != self.state_vector.seed {
            return Err(IntegrityError::HeaderMismatch {
                field: "seed".to_string(),
            }
            .into());
        }

        if let Some(pin) = &self.external {
            let bytes = self.payload_bytes()?;
            let parsed = ContentId::parse(&pin.content_id)?;
            if !parsed.matches_bytes(&bytes) || parsed.multihash_hex() != pin.multihash {
                return Err(IntegrityError::ContentIdMismatch {
                    content_id: pin.content_id.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl ChainedRecord for CheckpointCapsule {
    const KIND: RecordKind = RecordKind::Checkpoint;

    fn record_id(&self) -> &str {
        &self.checkpoint_id
    }

    fn prev_hash(&self) -> Option<&ContentHash> {
        self.prev_checkpoint_hash.as_ref()
    }

    fn stored_hash(&self) -> &ContentHash {
        &self.canonical_hash
    }

    fn compute_hash(&self) -> Result<ContentHash, EncodingError> {
        compute_hash(&self.state_vector)
    }
}

/// What to restore from
#[derive(Debug, Clone)]
pub enum RestoreSource {
    Capsule(CheckpointCapsule),
    CheckpointId(String),
    ContentId(String),
}

#[derive(Debug, Clone)]
enum Backend {
    Memory(BTreeMap<String, CheckpointCapsule>),
    /// One pretty-printed `<id>.json` per checkpoint
    Directory(PathBuf),
}

/// Creates, persists, verifies and restores checkpoint capsules
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    config: CheckpointConfig,
    backend: Backend,
    external: Option<Arc<dyn ContentStore>>,
}

impl CheckpointStore {
    /// Create a new store that keeps capsules in memory
    pub fn in_memory() -> Self {
        Self {
            config: CheckpointConfig::default(),
            backend: Backend::Memory(BTreeMap::new()),
            external: None,
        }
    }

    /// Open (creating if needed) a directory of checkpoint documents
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            config: CheckpointConfig {
                dir: Some(dir.clone()),
                ..CheckpointConfig::default()
            },
            backend: Backend::Directory(dir),
            external: None,
        })
    }

    /// Build a store from configuration
    pub fn from_config(config: CheckpointConfig) -> Result<Self, CheckpointError> {
        let mut store = match &config.dir {
            Some(dir) => Self::open(dir)?,
            None => Self::in_memory(),
        };
        store.config = config;
        Ok(store)
    }

    /// Pin every new capsule to an external store
    pub fn with_external(mut self, external: Arc<dyn ContentStore>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn with_pin_policy(mut self, policy: PinPolicy) -> Self {
        self.config.pin = policy;
        self
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    fn prefix(&self) -> &str {
        &self.config.id_prefix
    }

    fn path_for(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.json", id))
    }

    /// Snapshot the engine, chain the capsule to `prev` and persist it.
    ///
    /// External pinning is best-effort: failure is logged and the capsule is
    /// returned without an external pin.
    pub fn create(
        &mut self,
        engine: &StateEngine,
        prev: Option<ContentHash>,
    ) -> Result<CheckpointCapsule, CheckpointError> {
        let state_vector = engine.snapshot();
        let canonical_hash = compute_hash(&state_vector)?;
        let tick = state_vector.tick;
        let timestamp = engine
            .clock()
            .at(tick)
            .ok_or(EngineError::ClockOverflow { tick })?;

        let mut capsule = CheckpointCapsule {
            checkpoint_id: CheckpointCapsule::derive_id(self.prefix(), &canonical_hash),
            tick,
            timestamp,
            seed: state_vector.seed,
            state_vector,
            canonical_hash,
            merkle_root: engine.merkle_root(),
            prev_checkpoint_hash: prev,
            ledger_heights: engine.ledger_heights(),
            external: None,
        };
        capsule.external = self.pin(&capsule)?;

        self.save(&capsule)?;
        info!(
            checkpoint = %capsule.checkpoint_id,
            tick,
            pinned = capsule.external.is_some(),
            "Checkpoint created"
        );
        Ok(capsule)
    }

    fn pin(&self, capsule: &CheckpointCapsule) -> Result<Option<ExternalPin>, CheckpointError> {
        let Some(external) = &self.external else {
            return Ok(None);
        };
        let bytes = capsule.payload_bytes()?;
        let local = ContentId::for_bytes(&bytes);
        let expected = local.encode();

        match pin_with_retry(external.as_ref(), &bytes, &self.config.pin) {
            Ok(id) if id == expected => Ok(Some(ExternalPin {
                content_id: id,
                multihash: local.multihash_hex(),
            })),
            Ok(id) => {
                warn!(
                    checkpoint = %capsule.checkpoint_id,
                    returned = %id,
                    expected = %expected,
                    "External store returned a different content id; keeping local only"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(checkpoint = %capsule.checkpoint_id, error = %e, "External pin failed; keeping local only");
                Ok(None)
            }
        }
    }

    /// Persist a verified capsule. Re-saving the same state is a no-op.
    pub fn save(&mut self, capsule: &CheckpointCapsule) -> Result<(), CheckpointError> {
        capsule.verify_identity(self.config.id_prefix.as_str())?;
        let id = capsule.checkpoint_id.clone();

        match &mut self.backend {
            Backend::Memory(map) => {
                if let Some(existing) = map.get(&id) {
                    return keep_first(existing, capsule);
                }
                map.insert(id, capsule.clone());
            }
            Backend::Directory(dir) => {
                let path = Self::path_for(dir, &id);
                if path.exists() {
                    let existing = read_document(&path, &id)?;
                    return keep_first(&existing, capsule);
                }
                let json = serde_json::to_string_pretty(capsule).map_err(|e| CheckpointError::Malformed {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;
                let staging = path.with_extension("json.tmp");
                fs::write(&staging, json).map_err(|source| CheckpointError::Io {
                    path: staging.clone(),
                    source,
                })?;
                fs::rename(&staging, &path).map_err(|source| CheckpointError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Read a capsule and re-verify its hashes and id
    pub fn load(&self, id: &str) -> Result<CheckpointCapsule, CheckpointError> {
        let capsule = match &self.backend {
            Backend::Memory(map) => map
                .get(id)
                .cloned()
                .ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })?,
            Backend::Directory(dir) => {
                let path = Self::path_for(dir, id);
                if !path.exists() {
                    return Err(CheckpointError::NotFound { id: id.to_string() });
                }
                read_document(&path, id)?
            }
        };
        if capsule.checkpoint_id != id {
            return Err(IntegrityError::CheckpointIdMismatch {
                expected: id.to_string(),
                found: capsule.checkpoint_id,
            }
            .into());
        }
        capsule.verify_identity(self.prefix())?;
        Ok(capsule)
    }

    /// Ids of every stored capsule, sorted
    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.keys().cloned().collect()),
            Backend::Directory(dir) => {
                let entries = fs::read_dir(dir).map_err(|source| CheckpointError::Io {
                    path: dir.clone(),
                    source,
                })?;
                let mut ids = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|source| CheckpointError::Io {
                        path: dir.clone(),
                        source,
                    })?;
                    let name = entry.file_name();
                    if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                        ids.push(id.to_string());
                    }
                }
                ids.sort();
                Ok(ids)
            }
        }
    }

    /// Walk `prev_checkpoint_hash` links back from `id`, oldest first
    pub fn lineage(&self, id: &str) -> Result<Vec<CheckpointCapsule>, CheckpointError> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut next = Some(id.to_string());

        while let Some(current) = next.take() {
            if !seen.insert(current.clone()) {
                return Err(CheckpointError::Malformed {
                    id: current,
                    reason: "cycle in checkpoint links".to_string(),
                });
            }
            let capsule = self.load(&current)?;
            next = capsule
                .prev_checkpoint_hash
                .as_ref()
                .map(|prev| CheckpointCapsule::derive_id(self.prefix(), prev));
            chain.push(capsule);
        }
        chain.reverse();
        Ok(chain)
    }

    /// True when every listed capsule loads with intact hashes and each links
    /// to the one before it. The first capsule may link to anything.
    pub fn verify_chain(&self, ids: &[&str]) -> bool {
        let mut capsules = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id) {
                Ok(capsule) => capsules.push(capsule),
                Err(e) => {
                    warn!(checkpoint = %id, error = %e, "Checkpoint failed verification");
                    return false;
                }
            }
        }
        let breaks = scan(&capsules, ScanOptions::query().with_anchor(Anchor::Any));
        if let Some(first) = breaks.first() {
            warn!(checkpoint = %first.record_id, index = first.index, "Checkpoint chain broken");
        }
        breaks.is_empty()
    }

    /// Every break across the listed capsules
    pub fn chain_report(&self, ids: &[&str]) -> Result<ChainReport, CheckpointError> {
        let capsules = ids
            .iter()
            .map(|id| self.load(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChainReport {
            kind: RecordKind::Checkpoint,
            length: capsules.len(),
            breaks: scan(&capsules, ScanOptions::detailed().with_anchor(Anchor::Any)),
        })
    }

    /// Restore an engine under the standard rules
    pub fn restore(&self, source: RestoreSource) -> Result<StateEngine, CheckpointError> {
        self.restore_with_rules(source, Arc::new(StandardRules::new()))
    }

    /// Fetch and verify a capsule, then build a fresh engine from it
    pub fn restore_with_rules(
        &self,
        source: RestoreSource,
        rules: Arc<dyn OperationRules>,
    ) -> Result<StateEngine, CheckpointError> {
        let capsule = match source {
            RestoreSource::Capsule(capsule) => {
                capsule.verify_identity(self.prefix())?;
                capsule
            }
            RestoreSource::CheckpointId(id) => self.load(&id)?,
            RestoreSource::ContentId(content_id) => self.fetch_by_content_id(&content_id)?,
        };

        let expected = &capsule.state_vector.rules_version;
        let found = rules.version();
        if !found.is_compatible_with(expected) {
            return Err(CheckpointError::RulesMismatch {
                expected: expected.clone(),
                found,
            });
        }

        let engine = StateEngine::resume(&capsule, rules)?;
        info!(checkpoint = %capsule.checkpoint_id, tick = capsule.tick, "Checkpoint restored");
        Ok(engine)
    }

    fn fetch_by_content_id(&self, content_id: &str) -> Result<CheckpointCapsule, CheckpointError> {
        ContentId::parse(content_id)?;

        let remote_error = match &self.external {
            Some(external) => match external.cat(content_id) {
                Ok(bytes) => return self.decode_remote(content_id, &bytes),
                Err(e) if e.is_infrastructure() => {
                    warn!(content_id, error = %e, "External store unreachable; trying local copy");
                    e
                }
                Err(e @ StoreError::NotFound { .. }) => {
                    warn!(content_id, "Content missing from external store; trying local copy");
                    e
                }
                Err(e) => return Err(e.into()),
            },
            None => StoreError::Unavailable {
                reason: "no external store configured".to_string(),
            },
        };

        match self.find_local(content_id)? {
            Some(capsule) => {
                debug!(content_id, checkpoint = %capsule.checkpoint_id, "Restoring from local copy");
                Ok(capsule)
            }
            None => Err(remote_error.into()),
        }
    }

    fn decode_remote(&self, content_id: &str, bytes: &[u8]) -> Result<CheckpointCapsule, CheckpointError> {
        if !cid::verify_bytes(content_id, bytes) {
            return Err(IntegrityError::ContentIdMismatch {
                content_id: content_id.to_string(),
            }
            .into());
        }
        let mut capsule: CheckpointCapsule =
            serde_json::from_slice(bytes).map_err(|e| CheckpointError::Malformed {
                id: content_id.to_string(),
                reason: e.to_string(),
            })?;
        let parsed = ContentId::parse(content_id)?;
        capsule.external = Some(ExternalPin {
            content_id: content_id.to_string(),
            multihash: parsed.multihash_hex(),
        });
        capsule.verify_identity(self.prefix())?;
        Ok(capsule)
    }

    fn find_local(&self, content_id: &str) -> Result<Option<CheckpointCapsule>, CheckpointError> {
        for id in self.list()? {
            let Ok(capsule) = self.load(&id) else {
                continue;
            };
            let pinned = capsule.external.as_ref().map(|p| p.content_id == content_id);
            if pinned == Some(true) || cid::verify_bytes(content_id, &capsule.payload_bytes()?) {
                return Ok(Some(capsule));
            }
        }
        Ok(None)
    }
}

fn keep_first(existing: &CheckpointCapsule, incoming: &CheckpointCapsule) -> Result<(), CheckpointError> {
    if existing.payload_bytes()? == incoming.payload_bytes()? {
        debug!(checkpoint = %existing.checkpoint_id, "Checkpoint already stored");
        Ok(())
    } else {
        warn!(checkpoint = %existing.checkpoint_id, "Stored checkpoint has the same state but a different payload");
        Err(CheckpointError::Conflict {
            id: existing.checkpoint_id.clone(),
        })
    }
}

fn read_document(path: &Path, id: &str) -> Result<CheckpointCapsule, CheckpointError> {
    let text = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| CheckpointError::Malformed {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
