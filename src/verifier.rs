//! Integrity checks spanning ledgers and checkpoints

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::canonical::CanonicalEncoder;
use crate::chain::{scan, Anchor, RecordKind, ScanOptions};
use crate::checkpoint::CheckpointCapsule;
use crate::config::CheckpointConfig;
use crate::engine::StateEngine;
use crate::error::{ChainIntegrityError, CheckpointError, EncodingError, TamperError, VerificationError};
use crate::types::ContentHash;

/// Summary of a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub ledgers_checked: usize,
    pub records_checked: usize,
    pub market_states_checked: usize,
    pub checkpoints_checked: usize,
    /// Capsules whose merkle root was recomputed
    pub roots_checked: usize,
}

/// Verifies an engine's ledgers against a sequence of its checkpoints.
///
/// Checks run in order and stop at the first failure:
/// 1. every ledger chain is intact (in parallel, one task per entity), then
///    the market-state history
/// 2. every capsule's hashes and id are intact and each links to its predecessor
/// 3. every capsule's `merkle_root` matches the ledger heads at its recorded heights
///
/// A failure in step 3 is a [`TamperError`]: the records are individually
/// valid but history diverged from what the checkpoint committed to.
#[derive(Debug, Clone)]
pub struct ChainVerifier {
    id_prefix: String,
}

impl Default for ChainVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainVerifier {
    /// Create a new verifier using the default checkpoint id prefix
    pub fn new() -> Self {
        Self::with_config(&CheckpointConfig::default())
    }

    pub fn with_config(config: &CheckpointConfig) -> Self {
        Self {
            id_prefix: config.id_prefix.clone(),
        }
    }

    /// Verify the engine against the capsules it produced
    pub fn verify_engine(&self, engine: &StateEngine) -> Result<VerificationReport, VerificationError> {
        self.verify(engine, engine.checkpoints())
    }

    pub fn verify(
        &self,
        engine: &StateEngine,
        capsules: &[CheckpointCapsule],
    ) -> Result<VerificationReport, VerificationError> {
        let entities: Vec<_> = engine.entities().collect();

        // (a) ledgers, independent of each other
        let mut failures: Vec<(String, ChainIntegrityError)> = entities
            .par_iter()
            .filter_map(|e| e.ledger.ensure_valid().err().map(|err| (e.id.clone(), err)))
            .collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some((entity_id, source)) = failures.into_iter().next() {
            warn!(entity = %entity_id, error = %source, "Ledger verification failed");
            return Err(VerificationError::Ledger { entity_id, source });
        }
        let records_checked = entities.iter().map(|e| e.ledger.len()).sum();

        let market = engine.market_history();
        if let Err(err) = market.ensure_valid() {
            warn!(error = %err, "Market history verification failed");
            return Err(VerificationError::MarketHistory(err));
        }

        // (b) capsules and their links
        for capsule in capsules {
            capsule.verify_identity(&self.id_prefix).map_err(identity_error)?;
        }
        let breaks = scan(capsules, ScanOptions::detailed().with_anchor(Anchor::Any));
        if !breaks.is_empty() {
            let err = ChainIntegrityError {
                kind: RecordKind::Checkpoint,
                breaks,
            };
            warn!(error = %err, "Checkpoint chain verification failed");
            return Err(VerificationError::Checkpoints(err));
        }

        // (c) merkle roots against history
        let mut roots_checked = 0;
        for capsule in capsules {
            if engine.restored_from() == Some(&capsule.canonical_hash) {
                // Committed to ledgers this engine never held
                continue;
            }
            self.check_root(engine, capsule)?;
            roots_checked += 1;
        }

        info!(
            ledgers = entities.len(),
            records = records_checked,
            checkpoints = capsules.len(),
            "Verification passed"
        );
        Ok(VerificationReport {
            ledgers_checked: entities.len(),
            records_checked,
            market_states_checked: market.len(),
            checkpoints_checked: capsules.len(),
            roots_checked,
        })
    }

    /// Recompute one capsule's merkle root from the heads at its recorded heights
    pub fn check_root(&self, engine: &StateEngine, capsule: &CheckpointCapsule) -> Result<(), TamperError> {
        let tamper = |recomputed: Option<ContentHash>, reason: String| TamperError {
            checkpoint_id: capsule.checkpoint_id.clone(),
            tick: capsule.tick,
            stored_root: capsule.merkle_root.clone(),
            recomputed_root: recomputed,
            reason,
        };

        let mut heads = Vec::with_capacity(capsule.ledger_heights.len());
        for (entity_id, &height) in &capsule.ledger_heights {
            let entity = engine
                .entity(entity_id)
                .ok_or_else(|| tamper(None, format!("ledger of {} is missing", entity_id)))?;
            let head = entity.ledger.head_at(height).ok_or_else(|| {
                let reason = format!(
                    "ledger of {} has {} records, expected at least {}",
                    entity_id,
                    entity.ledger.len(),
                    height
                );
                tamper(None, reason)
            })?;
            heads.push(head);
        }

        let recomputed = CanonicalEncoder::new().merkle_root(heads);
        if recomputed != capsule.merkle_root {
            warn!(checkpoint = %capsule.checkpoint_id, "Merkle root mismatch");
            return Err(tamper(Some(recomputed), "merkle root does not match ledger heads".to_string()));
        }
        Ok(())
    }
}

fn identity_error(err: CheckpointError) -> VerificationError {
    match err {
        CheckpointError::Integrity(e) => VerificationError::Identity(e),
        CheckpointError::Encoding(e) => VerificationError::Encoding(e),
        other => VerificationError::Encoding(EncodingError::Unsupported {
            reason: other.to_string(),
        }),
    }
}
