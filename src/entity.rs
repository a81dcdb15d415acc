//! Simulated entities and their integer counters

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ledger::{Posting, TransactionLedger};
use crate::types::{Account, AccountClass, EntityId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub employees: i64,
    pub cash_cents: i64,
    pub inventory_units: i64,
    pub equipment_value_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Financials {
    pub total_revenue_cents: i64,
    pub total_expenses_cents: i64,
    pub tick_revenue_cents: i64,
    pub tick_expenses_cents: i64,
    /// Derived: revenue minus expenses
    pub net_income_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Basis points of market share
    pub market_share_bp: i64,
    pub brand_value_cents: i64,
    /// Derived: revenue per employee
    pub employee_productivity_cents: i64,
}

/// Change to non-cash counters requested by an operation.
///
/// Cash, revenue and expenses are not listed: they follow from the postings
/// the operation records, so counters and ledger cannot drift apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub employees: i64,
    pub inventory_units: i64,
    pub equipment_value_cents: i64,
    pub market_share_bp: i64,
    pub brand_value_cents: i64,
}

/// A simulated entity. Owns its ledger; holds no reference to the engine.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub resources: Resources,
    pub financial: Financials,
    pub metrics: Metrics,
    pub ledger: TransactionLedger,
}

/// Counters computed ahead of a ledger append, committed only once it succeeds
#[derive(Debug, Clone)]
pub(crate) struct StagedUpdate {
    pub(crate) resources: Resources,
    pub(crate) financial: Financials,
    pub(crate) metrics: Metrics,
}

impl Entity {
    /// Create a new entity with an empty ledger
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            ledger: TransactionLedger::new(id.clone()),
            id,
            name: name.into(),
            resources: Resources::default(),
            financial: Financials::default(),
            metrics: Metrics::default(),
        }
    }

    fn overflow(&self, field: &str) -> EngineError {
        EngineError::Overflow {
            entity_id: self.id.clone(),
            field: field.to_string(),
        }
    }

    /// Compute the counters that result from `delta` plus `postings`
    pub(crate) fn stage(&self, delta: &ResourceDelta, postings: &[Posting]) -> Result<StagedUpdate, EngineError> {
        self.stage_from(&self.financial, delta, postings)
    }

    /// Like [`Entity::stage`], with the per-tick accumulators starting from zero
    pub(crate) fn stage_new_tick(&self, postings: &[Posting]) -> Result<StagedUpdate, EngineError> {
        let base = Financials {
            tick_revenue_cents: 0,
            tick_expenses_cents: 0,
            ..self.financial.clone()
        };
        self.stage_from(&base, &ResourceDelta::default(), postings)
    }

    fn stage_from(
        &self,
        base: &Financials,
        delta: &ResourceDelta,
        postings: &[Posting],
    ) -> Result<StagedUpdate, EngineError> {
        let add = |value: i64, by: i64, field: &str| value.checked_add(by).ok_or_else(|| self.overflow(field));

        let mut cash = 0i64;
        let mut revenue = 0i64;
        let mut expenses = 0i64;
        for posting in postings {
            if posting.debit == Account::Cash {
                cash = add(cash, posting.amount, "cash_cents")?;
            }
            if posting.credit == Account::Cash {
                cash = cash
                    .checked_sub(posting.amount)
                    .ok_or_else(|| self.overflow("cash_cents"))?;
            }
            if posting.credit.class() == AccountClass::Revenue {
                revenue = add(revenue, posting.amount, "revenue")?;
            }
            if posting.debit.class() == AccountClass::Expense {
                expenses = add(expenses, posting.amount, "expenses")?;
            }
        }

        let resources = Resources {
            employees: add(self.resources.employees, delta.employees, "employees")?,
            cash_cents: add(self.resources.cash_cents, cash, "cash_cents")?,
            inventory_units: add(self.resources.inventory_units, delta.inventory_units, "inventory_units")?,
            equipment_value_cents: add(
                self.resources.equipment_value_cents,
                delta.equipment_value_cents,
                "equipment_value_cents",
            )?,
        };
        let financial = Financials {
            total_revenue_cents: add(base.total_revenue_cents, revenue, "total_revenue_cents")?,
            total_expenses_cents: add(base.total_expenses_cents, expenses, "total_expenses_cents")?,
            tick_revenue_cents: add(base.tick_revenue_cents, revenue, "tick_revenue_cents")?,
            tick_expenses_cents: add(base.tick_expenses_cents, expenses, "tick_expenses_cents")?,
            net_income_cents: base.net_income_cents,
        };
        let metrics = Metrics {
            market_share_bp: add(self.metrics.market_share_bp, delta.market_share_bp, "market_share_bp")?,
            brand_value_cents: add(self.metrics.brand_value_cents, delta.brand_value_cents, "brand_value_cents")?,
            employee_productivity_cents: self.metrics.employee_productivity_cents,
        };

        Ok(StagedUpdate {
            resources,
            financial,
            metrics,
        })
    }

    pub(crate) fn commit(&mut self, staged: StagedUpdate) {
        self.resources = staged.resources;
        self.financial = staged.financial;
        self.metrics = staged.metrics;
    }

    /// Recompute derived summary fields
    pub(crate) fn refresh_derived(&mut self) {
        self.financial.net_income_cents = self
            .financial
            .total_revenue_cents
            .saturating_sub(self.financial.total_expenses_cents);
        self.metrics.employee_productivity_cents = if self.resources.employees > 0 {
            self.financial.total_revenue_cents / self.resources.employees
        } else {
            0
        };
    }

    /// Next ledger record id for this entity
    pub(crate) fn record_id(&self, offset: usize) -> String {
        format!("{}-{:06}", self.id, self.ledger.len() + offset)
    }
}
