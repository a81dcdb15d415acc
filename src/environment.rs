//! Shared market environment perturbed once per tick

use serde::{Deserialize, Serialize};

use crate::context::SeededRandom;
use crate::scaled::ScaledDecimal;

/// Largest per-tick move of the demand multiplier, in thousandths
pub const DEMAND_STEP_MILLI: i64 = 50;
/// Largest per-tick move of the interest rate, in basis points
pub const INTEREST_STEP_BP: i64 = 20;

/// Environment parameters shared by every entity.
///
/// Rates and multipliers are [`ScaledDecimal`]s, money is integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentParams {
    /// Scale 3, clamped to `[0.500, 2.000]`
    pub demand_multiplier: ScaledDecimal,
    /// Percent at scale 2, clamped to `[0.00, 15.00]`
    pub interest_rate: ScaledDecimal,
    pub labor_cost_cents: i64,
    pub raw_material_cost_cents: i64,
    /// 0 to 100
    pub consumer_confidence: i64,
    /// Scale 3, 0 to 1
    pub regulatory_burden: ScaledDecimal,
}

impl Default for EnvironmentParams {
    fn default() -> Self {
        Self {
            demand_multiplier: ScaledDecimal::new(1_000, ScaledDecimal::MILLI_SCALE),
            interest_rate: ScaledDecimal::new(500, ScaledDecimal::PERCENT_SCALE),
            labor_cost_cents: 500_000,
            raw_material_cost_cents: 10_000,
            consumer_confidence: 70,
            regulatory_burden: ScaledDecimal::new(100, ScaledDecimal::MILLI_SCALE),
        }
    }
}

impl EnvironmentParams {
    /// Apply one tick of bounded random drift
    pub fn perturb(&mut self, rng: &mut SeededRandom) {
        let demand_step = rng.gen_range(-DEMAND_STEP_MILLI..=DEMAND_STEP_MILLI);
        let rate_step = rng.gen_range(-INTEREST_STEP_BP..=INTEREST_STEP_BP);

        let demand = ScaledDecimal::new(demand_step, ScaledDecimal::MILLI_SCALE);
        if let Some(next) = self.demand_multiplier.checked_add(&demand) {
            self.demand_multiplier = next.clamp(
                &ScaledDecimal::new(500, ScaledDecimal::MILLI_SCALE),
                &ScaledDecimal::new(2_000, ScaledDecimal::MILLI_SCALE),
            );
        }

        let rate = ScaledDecimal::new(rate_step, ScaledDecimal::PERCENT_SCALE);
        if let Some(next) = self.interest_rate.checked_add(&rate) {
            self.interest_rate = next.clamp(
                &ScaledDecimal::new(0, ScaledDecimal::PERCENT_SCALE),
                &ScaledDecimal::new(1_500, ScaledDecimal::PERCENT_SCALE),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perturb_is_reproducible() {
        let mut a = EnvironmentParams::default();
        let mut b = EnvironmentParams::default();
        for tick in 0..20 {
            a.perturb(&mut SeededRandom::for_tick(9, tick).unwrap());
            b.perturb(&mut SeededRandom::for_tick(9, tick).unwrap());
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_perturb_respects_bounds() {
        let mut env = EnvironmentParams {
            demand_multiplier: ScaledDecimal::new(510, 3),
            interest_rate: ScaledDecimal::new(5, 2),
            ..EnvironmentParams::default()
        };
        for tick in 0..500 {
            env.perturb(&mut SeededRandom::for_tick(3, tick).unwrap());
            assert!((500..=2_000).contains(&env.demand_multiplier.value()));
            assert!((0..=1_500).contains(&env.interest_rate.value()));
            assert_eq!(env.demand_multiplier.scale(), 3);
        }
    }
}
