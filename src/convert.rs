//! GBP <-> foreign currency conversion.
//!
//! Pure functions over [`rust_decimal::Decimal`]; nothing here touches the
//! rate store. Displayed values are rounded half-up (away from zero) to 2
//! decimal places.

use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal places shown for amounts and results
const DISPLAY_DP: u32 = 2;
/// Internal precision kept after dividing by the rate
const DIVISION_DP: u32 = 12;
/// Decimal places shown for the rate itself
const RATE_DP: u32 = 6;

const ROUNDING: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

/// User-facing conversion failures. The display strings are shown inline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("invalid number")]
    InvalidNumber,
    #[error("amount must be non-negative")]
    NegativeAmount,
    #[error("rate unavailable")]
    RateUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `amount` is in GBP, result in the foreign currency
    GbpToForeign,
    /// `amount` is in the foreign currency, result in GBP
    ForeignToGbp,
}

/// A successful conversion, both values already rounded for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    pub direction: Direction,
    pub amount: Decimal,
    pub result: Decimal,
}

impl Conversion {
    /// Renders the conversion the way the converter screen shows it, e.g.
    /// `£100.00 GBP = 494.71 AED`.
    pub fn describe(&self, code: &str) -> String {
        match self.direction {
            Direction::GbpToForeign => {
                format!("£{:.2} GBP = {:.2} {}", self.amount, self.result, code)
            }
            Direction::ForeignToGbp => {
                format!("{:.2} {} = £{:.2} GBP", self.amount, code, self.result)
            }
        }
    }
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.result)
    }
}

/// Converts `amount` using a GBP -> foreign `rate`.
///
/// `amount` accepts `,` as the decimal separator. Checks run in order:
/// unparsable amount, negative amount, missing or non-positive rate.
pub fn convert(
    amount: &str,
    rate: Option<f64>,
    direction: Direction,
) -> Result<Conversion, ConversionError> {
    let amount = parse_amount(amount)?;
    if amount < Decimal::ZERO {
        return Err(ConversionError::NegativeAmount);
    }
    let rate = rate_to_decimal(rate)?;

    let raw = match direction {
        Direction::GbpToForeign => amount
            .checked_mul(rate)
            .ok_or(ConversionError::InvalidNumber)?,
        Direction::ForeignToGbp => amount
            .checked_div(rate)
            .ok_or(ConversionError::InvalidNumber)?
            .round_dp_with_strategy(DIVISION_DP, ROUNDING),
    };

    Ok(Conversion {
        direction,
        amount: amount.round_dp_with_strategy(DISPLAY_DP, ROUNDING),
        result: raw.round_dp_with_strategy(DISPLAY_DP, ROUNDING),
    })
}

/// Formats a rate to 6 decimal places, or `None` if it is unusable.
pub fn format_rate(rate: f64) -> Option<String> {
    let rate = rate_to_decimal(Some(rate)).ok()?;
    Some(format!("{:.6}", rate.round_dp_with_strategy(RATE_DP, ROUNDING)))
}

fn parse_amount(raw: &str) -> Result<Decimal, ConversionError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConversionError::InvalidNumber);
    }
    Decimal::from_str(&raw.replace(',', ".")).map_err(|_| ConversionError::InvalidNumber)
}

/// Goes through the shortest decimal rendering of the float so `4.9471`
/// becomes exactly `4.9471` rather than its binary approximation.
fn rate_to_decimal(rate: Option<f64>) -> Result<Decimal, ConversionError> {
    let rate = rate
        .filter(|r| r.is_finite() && *r > 0.0)
        .ok_or(ConversionError::RateUnavailable)?;
    let rate =
        Decimal::from_str(&rate.to_string()).map_err(|_| ConversionError::RateUnavailable)?;
    if rate <= Decimal::ZERO {
        return Err(ConversionError::RateUnavailable);
    }
    Ok(rate)
}
