//! Operation rules: preconditions and effects of entity operations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::entity::{Entity, ResourceDelta};
use crate::environment::EnvironmentParams;
use crate::error::EngineError;
use crate::types::{Account, EntityId, Tick, TransactionKind, Version};

/// Operations an entity can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Hire,
    Fire,
    Produce,
    Market,
    RAndD,
    Invest,
    Loan,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Hire => "HIRE",
            OperationKind::Fire => "FIRE",
            OperationKind::Produce => "PRODUCE",
            OperationKind::Market => "MARKET",
            OperationKind::RAndD => "R_AND_D",
            OperationKind::Invest => "INVEST",
            OperationKind::Loan => "LOAN",
        };
        f.write_str(name)
    }
}

/// Integer operation parameters keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationParams(BTreeMap<String, i64>);

impl OperationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: i64) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.get(key).copied()
    }

    pub fn get_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).unwrap_or(default)
    }
}

/// Everything a rule set may read when evaluating one operation
#[derive(Debug, Clone, Copy)]
pub struct OperationRequest<'a> {
    pub tick: Tick,
    pub kind: OperationKind,
    pub params: &'a OperationParams,
    pub entity: &'a Entity,
    pub environment: &'a EnvironmentParams,
}

/// Ledger entry an operation wants recorded; the engine assigns id and time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPosting {
    pub amount: i64,
    pub kind: TransactionKind,
    pub debit: Account,
    pub credit: Account,
    pub description: String,
}

impl PlannedPosting {
    pub fn new(
        amount: i64,
        kind: TransactionKind,
        debit: Account,
        credit: Account,
        description: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            kind,
            debit,
            credit,
            description: description.into(),
        }
    }
}

/// One evaluated condition, kept for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionStep {
    pub step: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, i64>,
}

impl DecisionStep {
    fn new(step: &str, passed: bool) -> Self {
        Self {
            step: step.to_string(),
            passed,
            details: BTreeMap::new(),
        }
    }

    fn detail(mut self, key: &str, value: i64) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Effects of an operation whose preconditions hold
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPlan {
    pub delta: ResourceDelta,
    pub postings: Vec<PlannedPosting>,
    pub trace: Vec<DecisionStep>,
}

/// Structured explanation of why an operation was not applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionFailure {
    pub entity_id: EntityId,
    pub operation: OperationKind,
    pub condition: String,
    pub required: i64,
    pub available: i64,
    pub trace: Vec<DecisionStep>,
}

impl fmt::Display for PreconditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for {} failed {}: required {}, available {}",
            self.operation, self.entity_id, self.condition, self.required, self.available
        )
    }
}

/// Pluggable business rules the engine delegates to
pub trait OperationRules: Send + Sync + fmt::Debug {
    /// Get the version of these rules
    fn version(&self) -> Version;

    /// Decide whether an operation may run and what it changes
    fn evaluate(&self, request: &OperationRequest<'_>) -> Result<OperationPlan, PreconditionFailure>;

    /// Charges applied to an entity on every tick. An error aborts the whole tick.
    fn periodic_charges(
        &self,
        entity: &Entity,
        environment: &EnvironmentParams,
    ) -> Result<Vec<PlannedPosting>, EngineError>;
}

/// Base sale price per unit before demand adjustment
pub const BASE_PRICE_CENTS: i64 = 15_000;
/// Units one employee can produce per operation
pub const UNITS_PER_EMPLOYEE: i64 = 10;
/// Market share gained per unit sold
pub const SHARE_BP_PER_UNIT: i64 = 10;
/// Brand value gained per 100 cents of research
pub const BRAND_PER_HUNDRED: i64 = 5;
/// Default research spend
pub const DEFAULT_RESEARCH_CENTS: i64 = 1_000_000;

/// Default rule set covering hiring, production, sales, research and financing
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl StandardRules {
    pub const VERSION: Version = Version {
        major: 1,
        minor: 0,
        patch: 0,
    };

    /// Create a new standard rule set
    pub fn new() -> Self {
        Self
    }
}

struct Evaluation<'a, 'r> {
    request: &'a OperationRequest<'r>,
    trace: Vec<DecisionStep>,
}

impl<'a, 'r> Evaluation<'a, 'r> {
    fn require(&mut self, condition: &str, required: i64, available: i64) -> Result<(), PreconditionFailure> {
        let passed = available >= required;
        self.trace.push(
            DecisionStep::new(condition, passed)
                .detail("required", required)
                .detail("available", available),
        );
        if passed {
            Ok(())
        } else {
            Err(PreconditionFailure {
                entity_id: self.request.entity.id.clone(),
                operation: self.request.kind,
                condition: condition.to_string(),
                required,
                available,
                trace: std::mem::take(&mut self.trace),
            })
        }
    }

    fn positive(&mut self, param: &str, value: i64) -> Result<(), PreconditionFailure> {
        self.require(&format!("positive_{}", param), 1, value)
    }

    /// Product that fails the precondition rather than wrapping
    fn cost(&mut self, condition: &str, a: i64, b: i64) -> Result<i64, PreconditionFailure> {
        match a.checked_mul(b) {
            Some(v) => Ok(v),
            None => self.require(condition, i64::MAX, 0).map(|_| 0),
        }
    }

    fn done(mut self, step: &str, delta: ResourceDelta, postings: Vec<PlannedPosting>) -> OperationPlan {
        self.trace.push(DecisionStep::new(step, true));
        OperationPlan {
            delta,
            postings,
            trace: self.trace,
        }
    }
}

impl OperationRules for StandardRules {
    fn version(&self) -> Version {
        Self::VERSION
    }

    fn evaluate(&self, request: &OperationRequest<'_>) -> Result<OperationPlan, PreconditionFailure> {
        let resources = &request.entity.resources;
        let env = request.environment;
        let params = request.params;
        let mut eval = Evaluation {
            request,
            trace: Vec::new(),
        };

        match request.kind {
            OperationKind::Hire => {
                let count = params.get_or("num_employees", 1);
                eval.positive("num_employees", count)?;
                let cost = eval.cost("hire_cost", count, env.labor_cost_cents)?;
                eval.require("check_cash", cost, resources.cash_cents)?;
                Ok(eval.done(
                    "hire_employees",
                    ResourceDelta {
                        employees: count,
                        ..ResourceDelta::default()
                    },
                    vec![PlannedPosting::new(
                        cost,
                        TransactionKind::Expense,
                        Account::OperatingExpenses,
                        Account::Cash,
                        format!("Hired {} employees", count),
                    )],
                ))
            }
            OperationKind::Fire => {
                let count = params.get_or("num_employees", 1);
                eval.positive("num_employees", count)?;
                eval.require("check_employees", count, resources.employees)?;
                Ok(eval.done(
                    "fire_employees",
                    ResourceDelta {
                        employees: -count,
                        ..ResourceDelta::default()
                    },
                    Vec::new(),
                ))
            }
            OperationKind::Produce => {
                let units = params.get_or("units", 10);
                eval.positive("units", units)?;
                eval.require("check_employees", units / UNITS_PER_EMPLOYEE, resources.employees)?;
                let cost = eval.cost("material_cost", units, env.raw_material_cost_cents)?;
                eval.require("check_cash", cost, resources.cash_cents)?;
                Ok(eval.done(
                    "produce_goods",
                    ResourceDelta {
                        inventory_units: units,
                        ..ResourceDelta::default()
                    },
                    vec![PlannedPosting::new(
                        cost,
                        TransactionKind::Expense,
                        Account::Cogs,
                        Account::Cash,
                        format!("Produced {} units", units),
                    )],
                ))
            }
            OperationKind::Market => {
                let units = params
                    .get_or("units", resources.inventory_units)
                    .min(resources.inventory_units);
                eval.require("check_inventory", 1, units)?;
                let gross = eval.cost("sale_value", units, BASE_PRICE_CENTS)?;
                let revenue = match env.demand_multiplier.apply_to(gross) {
                    Some(v) => v,
                    None => eval.require("sale_value", i64::MAX, 0).map(|_| 0)?,
                };
                let share = eval.cost("market_share", units, SHARE_BP_PER_UNIT)?;
                Ok(eval.done(
                    "sell_to_market",
                    ResourceDelta {
                        inventory_units: -units,
                        market_share_bp: share,
                        ..ResourceDelta::default()
                    },
                    vec![PlannedPosting::new(
                        revenue,
                        TransactionKind::Revenue,
                        Account::Cash,
                        Account::Revenue,
                        format!("Sold {} units to market", units),
                    )],
                ))
            }
            OperationKind::RAndD => {
                let amount = params.get_or("amount_cents", DEFAULT_RESEARCH_CENTS);
                eval.positive("amount_cents", amount)?;
                eval.require("check_cash", amount, resources.cash_cents)?;
                Ok(eval.done(
                    "invest_r_and_d",
                    ResourceDelta {
                        brand_value_cents: amount / 100 * BRAND_PER_HUNDRED,
                        ..ResourceDelta::default()
                    },
                    vec![PlannedPosting::new(
                        amount,
                        TransactionKind::Expense,
                        Account::OperatingExpenses,
                        Account::Cash,
                        "R&D investment",
                    )],
                ))
            }
            OperationKind::Invest => {
                let amount = params.get_or("amount_cents", 0);
                eval.positive("amount_cents", amount)?;
                eval.require("check_cash", amount, resources.cash_cents)?;
                Ok(eval.done(
                    "acquire_equipment",
                    ResourceDelta {
                        equipment_value_cents: amount,
                        ..ResourceDelta::default()
                    },
                    vec![PlannedPosting::new(
                        amount,
                        TransactionKind::Acquisition,
                        Account::Equipment,
                        Account::Cash,
                        "Equipment purchase",
                    )],
                ))
            }
            OperationKind::Loan => {
                let amount = params.get_or("amount_cents", 0);
                eval.positive("amount_cents", amount)?;
                Ok(eval.done(
                    "take_loan",
                    ResourceDelta::default(),
                    vec![PlannedPosting::new(
                        amount,
                        TransactionKind::Loan,
                        Account::Cash,
                        Account::LoansPayable,
                        format!("Loan at {}%", env.interest_rate),
                    )],
                ))
            }
        }
    }

    fn periodic_charges(
        &self,
        entity: &Entity,
        environment: &EnvironmentParams,
    ) -> Result<Vec<PlannedPosting>, EngineError> {
        let employees = entity.resources.employees;
        if employees <= 0 {
            return Ok(Vec::new());
        }
        let cost = employees
            .checked_mul(environment.labor_cost_cents)
            .ok_or_else(|| EngineError::Overflow {
                entity_id: entity.id.clone(),
                field: "salaries".to_string(),
            })?;
        Ok(vec![PlannedPosting::new(
            cost,
            TransactionKind::Expense,
            Account::OperatingExpenses,
            Account::Cash,
            format!("Salaries for {} employees", employees),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(cash: i64, employees: i64, inventory: i64) -> Entity {
        let mut e = Entity::new("acme", "Acme");
        e.resources.cash_cents = cash;
        e.resources.employees = employees;
        e.resources.inventory_units = inventory;
        e
    }

    fn evaluate(
        entity: &Entity,
        kind: OperationKind,
        params: &OperationParams,
    ) -> Result<OperationPlan, PreconditionFailure> {
        let env = EnvironmentParams::default();
        StandardRules.evaluate(&OperationRequest {
            tick: 0,
            kind,
            params,
            entity,
            environment: &env,
        })
    }

    #[test]
    fn test_hire_charges_labor_cost() {
        let e = entity(2_000_000, 0, 0);
        let plan = evaluate(&e, OperationKind::Hire, &OperationParams::new().with("num_employees", 3)).unwrap();

        assert_eq!(plan.delta.employees, 3);
        assert_eq!(plan.postings[0].amount, 1_500_000);
        assert_eq!(plan.postings[0].debit, Account::OperatingExpenses);
        assert!(plan.trace.iter().all(|s| s.passed));
    }

    #[test]
    fn test_hire_without_cash_is_structured_failure() {
        let e = entity(100, 0, 0);
        let failure = evaluate(&e, OperationKind::Hire, &OperationParams::new()).unwrap_err();

        assert_eq!(failure.condition, "check_cash");
        assert_eq!(failure.required, 500_000);
        assert_eq!(failure.available, 100);
        assert!(!failure.trace.last().unwrap().passed);
    }

    #[test]
    fn test_produce_requires_staff() {
        let e = entity(10_000_000, 1, 0);
        let failure = evaluate(&e, OperationKind::Produce, &OperationParams::new().with("units", 50)).unwrap_err();
        assert_eq!(failure.condition, "check_employees");
        assert_eq!(failure.required, 5);
    }

    #[test]
    fn test_market_sells_at_demand_adjusted_price() {
        let e = entity(0, 1, 4);
        let plan = evaluate(&e, OperationKind::Market, &OperationParams::new().with("units", 10)).unwrap();

        assert_eq!(plan.delta.inventory_units, -4);
        assert_eq!(plan.delta.market_share_bp, 40);
        assert_eq!(plan.postings[0].amount, 60_000);
        assert_eq!(plan.postings[0].kind, TransactionKind::Revenue);
    }

    #[test]
    fn test_fire_needs_enough_employees() {
        let e = entity(0, 2, 0);
        assert!(evaluate(&e, OperationKind::Fire, &OperationParams::new().with("num_employees", 3)).is_err());
        let plan = evaluate(&e, OperationKind::Fire, &OperationParams::new().with("num_employees", 2)).unwrap();
        assert_eq!(plan.delta.employees, -2);
        assert!(plan.postings.is_empty());
    }

    #[test]
    fn test_salary_charges() {
        let env = EnvironmentParams::default();
        assert!(StandardRules.periodic_charges(&entity(0, 0, 0), &env).unwrap().is_empty());

        let charges = StandardRules.periodic_charges(&entity(0, 2, 0), &env).unwrap();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount, 1_000_000);
    }

    #[test]
    fn test_salary_overflow_is_reported() {
        let env = EnvironmentParams {
            labor_cost_cents: i64::MAX,
            ..EnvironmentParams::default()
        };

        assert!(matches!(
            StandardRules.periodic_charges(&entity(0, 2, 0), &env),
            Err(EngineError::Overflow { ref entity_id, ref field }) if entity_id == "acme" && field == "salaries"
        ));
    }

    #[test]
    fn test_operation_kind_names() {
        assert_eq!(serde_json::to_string(&OperationKind::RAndD).unwrap(), "\"R_AND_D\"");
        assert_eq!(OperationKind::RAndD.to_string(), "R_AND_D");
    }
}
