//! Fixed-point decimal values that carry their own scale

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EncodingError;

/// Largest supported number of decimal places
pub const MAX_SCALE: u32 = 9;

/// An integer `value` interpreted as `value / 10^scale`.
///
/// Rates, multipliers and percentages live in hashed state as one of these
/// instead of as floats, so the precision policy travels with the number.
/// Money stays in plain integer minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawScaled")]
pub struct ScaledDecimal {
    value: i64,
    scale: u32,
}

/// Decoded form, checked before it becomes a [`ScaledDecimal`]
#[derive(Deserialize)]
struct RawScaled {
    value: i64,
    scale: u32,
}

impl TryFrom<RawScaled> for ScaledDecimal {
    type Error = EncodingError;

    fn try_from(raw: RawScaled) -> Result<Self, Self::Error> {
        if raw.scale > MAX_SCALE {
            return Err(EncodingError::Unsupported {
                reason: format!("scale {} exceeds the maximum of {}", raw.scale, MAX_SCALE),
            });
        }
        Ok(Self {
            value: raw.value,
            scale: raw.scale,
        })
    }
}

impl ScaledDecimal {
    /// Basis points of a percentage: 5.25% is `525` at scale 2
    pub const PERCENT_SCALE: u32 = 2;
    /// Three decimal places for multipliers
    pub const MILLI_SCALE: u32 = 3;

    /// Build from a raw scaled integer
    pub fn new(value: i64, scale: u32) -> Self {
        Self {
            value,
            scale: scale.min(MAX_SCALE),
        }
    }

    /// Convert a float at the edge of the system, rounding half away from zero
    pub fn from_f64(value: f64, scale: u32) -> Result<Self, EncodingError> {
        let scale = scale.min(MAX_SCALE);
        let scaled = (value * 10f64.powi(scale as i32)).round();
        if !scaled.is_finite() || scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
            return Err(EncodingError::Unsupported {
                reason: format!("{} does not fit at scale {}", value, scale),
            });
        }
        Ok(Self::new(scaled as i64, scale))
    }

    /// Approximate float, for display only
    pub fn to_f64(&self) -> f64 {
        self.value as f64 / 10f64.powi(self.scale as i32)
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    fn factor(scale: u32) -> i128 {
        10i128.pow(scale)
    }

    /// Express at a different scale; fails on overflow, rounds when narrowing
    pub fn rescale(&self, scale: u32) -> Option<Self> {
        let scale = scale.min(MAX_SCALE);
        let value = i128::from(self.value);
        let rescaled = if scale >= self.scale {
            value.checked_mul(Self::factor(scale - self.scale))?
        } else {
            div_round(value, Self::factor(self.scale - scale))
        };
        i64::try_from(rescaled).ok().map(|v| Self::new(v, scale))
    }

    /// Add another decimal, aligning to the wider scale
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        let scale = self.scale.max(other.scale);
        let left = self.rescale(scale)?;
        let right = other.rescale(scale)?;
        left.value.checked_add(right.value).map(|v| Self::new(v, scale))
    }

    /// Multiply an integer amount by this decimal, rounding half away from zero
    pub fn apply_to(&self, amount: i64) -> Option<i64> {
        let product = i128::from(amount).checked_mul(i128::from(self.value))?;
        i64::try_from(div_round(product, Self::factor(self.scale))).ok()
    }

    /// Clamp between two bounds expressed at any scale
    pub fn clamp(&self, min: &Self, max: &Self) -> Self {
        let (Some(lo), Some(hi)) = (min.rescale(self.scale), max.rescale(self.scale)) else {
            return *self;
        };
        Self::new(self.value.clamp(lo.value, hi.value.max(lo.value)), self.scale)
    }
}

fn div_round(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator {
        quotient + numerator.signum()
    } else {
        quotient
    }
}

impl fmt::Display for ScaledDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.value);
        }
        let factor = 10u64.pow(self.scale);
        let sign = if self.value < 0 { "-" } else { "" };
        let magnitude = self.value.unsigned_abs();
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            magnitude / factor,
            magnitude % factor,
            width = self.scale as usize
        )
    }
}
