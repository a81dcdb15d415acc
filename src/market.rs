//! Hash-chained history of market-wide state
//!
//! After every tick the engine records one [`MarketState`]: the environment the
//! tick ran under and the resulting entity rankings, linked to the previous
//! state by hash. The history is verified the same way as a ledger.

use serde::{Deserialize, Serialize};

use crate::canonical::compute_hash;
use crate::chain::{ChainReport, ChainedRecord, HashChain, RecordKind};
use crate::environment::EnvironmentParams;
use crate::error::{ChainError, ChainIntegrityError, EncodingError};
use crate::types::{ContentHash, EntityId, Tick};

/// One row of the market summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    pub rank: usize,
    pub entity_id: EntityId,
    pub name: String,
    pub total_revenue_cents: i64,
    pub market_share_bp: i64,
    pub employees: i64,
}

/// Figures an entity is ranked on
#[derive(Debug, Clone, Copy)]
pub(crate) struct Standing<'a> {
    pub entity_id: &'a str,
    pub name: &'a str,
    pub total_revenue_cents: i64,
    pub market_share_bp: i64,
    pub employees: i64,
}

/// Rank by total revenue, descending, ties broken by id
pub(crate) fn rank<'a>(standings: impl IntoIterator<Item = Standing<'a>>) -> Vec<Ranking> {
    let mut standings: Vec<Standing<'a>> = standings.into_iter().collect();
    standings.sort_by(|a, b| {
        b.total_revenue_cents
            .cmp(&a.total_revenue_cents)
            .then_with(|| a.entity_id.cmp(b.entity_id))
    });
    standings
        .into_iter()
        .enumerate()
        .map(|(i, s)| Ranking {
            rank: i + 1,
            entity_id: s.entity_id.to_string(),
            name: s.name.to_string(),
            total_revenue_cents: s.total_revenue_cents,
            market_share_bp: s.market_share_bp,
            employees: s.employees,
        })
        .collect()
}

/// Market conditions and rankings at the end of one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketState {
    pub id: String,
    /// Tick the world stood at once this state was reached
    pub tick: Tick,
    pub environment: EnvironmentParams,
    pub rankings: Vec<Ranking>,
    pub prev_state_hash: Option<ContentHash>,
    pub state_hash: ContentHash,
}

#[derive(Serialize)]
struct StatePreimage<'a> {
    id: &'a str,
    tick: Tick,
    environment: &'a EnvironmentParams,
    rankings: &'a [Ranking],
    prev_state_hash: &'a Option<ContentHash>,
}

impl MarketState {
    pub fn state_id(tick: Tick) -> String {
        format!("market-{:06}", tick)
    }

    /// Hash over every field except the stored hash itself
    pub fn content_hash(&self) -> Result<ContentHash, EncodingError> {
        compute_hash(&StatePreimage {
            id: &self.id,
            tick: self.tick,
            environment: &self.environment,
            rankings: &self.rankings,
            prev_state_hash: &self.prev_state_hash,
        })
    }
}

impl ChainedRecord for MarketState {
    const KIND: RecordKind = RecordKind::MarketState;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn prev_hash(&self) -> Option<&ContentHash> {
        self.prev_state_hash.as_ref()
    }

    fn stored_hash(&self) -> &ContentHash {
        &self.state_hash
    }

    fn compute_hash(&self) -> Result<ContentHash, EncodingError> {
        self.content_hash()
    }
}

/// Append-only chain of market states
#[derive(Debug, Clone, Default)]
pub struct MarketHistory {
    chain: HashChain<MarketState>,
}

impl MarketHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load stored states without verifying them
    pub fn from_records_unverified(records: Vec<MarketState>) -> Self {
        Self {
            chain: HashChain::from_records_unverified(records),
        }
    }

    /// Build the state that would follow the current head, checked but not appended
    pub fn prepare(
        &self,
        tick: Tick,
        environment: EnvironmentParams,
        rankings: Vec<Ranking>,
    ) -> Result<MarketState, ChainError> {
        let mut state = MarketState {
            id: MarketState::state_id(tick),
            tick,
            environment,
            rankings,
            prev_state_hash: self.chain.head_hash().cloned(),
            // Placeholder until the preimage is hashed below
            state_hash: ContentHash::from_digest(&[0u8; 32]),
        };
        state.state_hash = state.content_hash()?;
        self.chain.check_batch(std::slice::from_ref(&state))?;
        Ok(state)
    }

    /// Append a state returned by [`MarketHistory::prepare`] against the current head
    pub(crate) fn commit_prepared(&mut self, state: MarketState) {
        self.chain.push_checked(vec![state]);
    }

    pub fn head(&self) -> Option<&MarketState> {
        self.chain.head()
    }

    pub fn head_hash(&self) -> Option<&ContentHash> {
        self.chain.head_hash()
    }

    pub fn get(&self, id: &str) -> Option<&MarketState> {
        self.chain.get(id)
    }

    pub fn records(&self) -> &[MarketState] {
        self.chain.records()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn verify_chain(&self) -> bool {
        self.chain.verify()
    }

    pub fn verification_report(&self) -> ChainReport {
        self.chain.report()
    }

    pub fn ensure_valid(&self) -> Result<(), ChainIntegrityError> {
        self.chain.ensure_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BreakKind;

    fn standing(id: &'static str, revenue: i64) -> Standing<'static> {
        Standing {
            entity_id: id,
            name: id,
            total_revenue_cents: revenue,
            market_share_bp: 0,
            employees: 1,
        }
    }

    fn history(ticks: Tick) -> MarketHistory {
        let mut history = MarketHistory::new();
        for tick in 1..=ticks {
            let rankings = rank([standing("a", 100 * tick as i64), standing("b", 150)]);
            let state = history.prepare(tick, EnvironmentParams::default(), rankings).unwrap();
            history.commit_prepared(state);
        }
        history
    }

    #[test]
    fn test_rank_orders_by_revenue_then_id() {
        let rankings = rank([standing("c", 10), standing("a", 50), standing("b", 10)]);
        let order: Vec<_> = rankings.iter().map(|r| (r.rank, r.entity_id.as_str())).collect();
        assert_eq!(order, vec![(1, "a"), (2, "b"), (3, "c")]);
    }

    #[test]
    fn test_states_link_to_predecessor() {
        let history = history(3);

        assert!(history.verify_chain());
        assert!(history.records()[0].prev_state_hash.is_none());
        assert_eq!(history.records()[2].prev_state_hash.as_ref(), Some(&history.records()[1].state_hash));
        assert_eq!(history.get("market-000002").map(|s| s.tick), Some(2));
        assert_eq!(history.head().map(|s| s.rankings[0].entity_id.as_str()), Some("a"));
    }

    #[test]
    fn test_prepare_does_not_append() {
        let history = history(1);
        let next = history.prepare(2, EnvironmentParams::default(), Vec::new()).unwrap();

        assert_eq!(history.len(), 1);
        assert_eq!(next.prev_state_hash.as_ref(), history.head_hash());
    }

    #[test]
    fn test_repeated_tick_is_rejected() {
        let history = history(2);
        assert!(matches!(
            history.prepare(2, EnvironmentParams::default(), Vec::new()),
            Err(ChainError::DuplicateRecord { kind: RecordKind::MarketState, .. })
        ));
    }

    #[test]
    fn test_rewritten_ranking_is_detected() {
        let mut records = history(3).records().to_vec();
        records[1].rankings[0].total_revenue_cents = 1_000_000;
        let tampered = MarketHistory::from_records_unverified(records);

        assert!(!tampered.verify_chain());
        let report = tampered.verification_report();
        assert_eq!(report.kind, RecordKind::MarketState);
        assert_eq!(report.breaks[0].index, 2);
        assert!(matches!(report.breaks[0].kind, BreakKind::LinkMismatch { .. }));
        assert_eq!(report.breaks[1].index, 1);
        assert!(tampered.ensure_valid().is_err());
    }
}
