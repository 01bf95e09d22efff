//! Small numeric helpers shared by the aggregators.
//!
//! Reported ratios carry 6 decimal places and day counts carry 4, which keeps
//! the result bundle stable across serialization round trips.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

pub const RATIO_PRECISION: i32 = 6;
pub const DAYS_PRECISION: i32 = 4;
pub const MONEY_PRECISION: u32 = 2;

/// `numerator / denominator`, defined as 0 when the denominator is 0.
pub fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    round_ratio(numerator as f64 / denominator as f64)
}

pub fn round_ratio(value: f64) -> f64 {
    round_to(value, RATIO_PRECISION)
}

pub fn round_days(value: f64) -> f64 {
    round_to(value, DAYS_PRECISION)
}

fn round_to(value: f64, places: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Linear-interpolated percentile over an ascending slice; `pct` in [0, 100].
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

pub fn median(sorted: &[f64]) -> Option<f64> {
    percentile(sorted, 50.0)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn sort_ascending(values: &mut [f64]) {
    values.sort_by(|left, right| left.total_cmp(right));
}

pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Probability in [0, 1] as a decimal with ratio precision.
pub fn probability_to_decimal(probability: f64) -> Decimal {
    let clamped = if probability.is_finite() { probability.clamp(0.0, 1.0) } else { 0.0 };
    Decimal::from_f64(clamped)
        .unwrap_or(Decimal::ZERO)
        .round_dp(RATIO_PRECISION as u32)
        .min(Decimal::ONE)
}

/// Money truncated toward zero so derived sums never overshoot their inputs.
pub fn truncate_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_PRECISION, RoundingStrategy::ToZero)
}

/// Money addition that saturates at the decimal bounds instead of panicking.
pub fn add_money(left: Decimal, right: Decimal) -> Decimal {
    left.checked_add(right).unwrap_or(if right.is_sign_negative() {
        Decimal::MIN
    } else {
        Decimal::MAX
    })
}

pub fn sum_money(values: impl IntoIterator<Item = Decimal>) -> Decimal {
    values.into_iter().fold(Decimal::ZERO, add_money)
}

/// `amount * probability`, truncated to cents.
pub fn weighted_money(amount: Decimal, probability: f64) -> Decimal {
    let weighted = amount
        .checked_mul(probability_to_decimal(probability))
        .unwrap_or(amount.max(Decimal::ZERO));
    truncate_money(weighted)
}

pub fn decimal_ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    match numerator.checked_div(denominator) {
        Some(quotient) => round_ratio(decimal_to_f64(quotient)),
        None => round_ratio(decimal_to_f64(numerator) / decimal_to_f64(denominator)),
    }
}
