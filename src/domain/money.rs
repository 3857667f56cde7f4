//! Decimal money helpers. Amounts cross every boundary as decimal strings and
//! are held as `BigDecimal` with at most [`MONEY_SCALE`] fractional digits.

use bigdecimal::{BigDecimal, Zero};
use std::str::FromStr;

use super::LedgerError;

pub const MONEY_SCALE: i64 = 8;
pub const AMOUNT_INPUT_MAX_LEN: usize = 64;

/// Parses a client-supplied decimal string into a strictly positive amount.
pub fn parse_amount(raw: &str) -> Result<BigDecimal, LedgerError> {
    let value = parse_decimal(raw)?;
    ensure_positive(&value)?;
    Ok(value)
}

/// Parses a decimal string that may carry a sign (used by adjustments).
pub fn parse_signed_amount(raw: &str) -> Result<BigDecimal, LedgerError> {
    let value = parse_decimal(raw)?;
    if value.is_zero() {
        return Err(LedgerError::InvalidAmount("amount must not be zero".to_string()));
    }
    ensure_scale(&value)?;
    Ok(value)
}

fn parse_decimal(raw: &str) -> Result<BigDecimal, LedgerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > AMOUNT_INPUT_MAX_LEN {
        return Err(LedgerError::InvalidAmount(format!("malformed amount '{}'", raw)));
    }

    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let well_formed = !digits.is_empty()
        && digits.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
        && digits.chars().filter(|ch| *ch == '.').count() <= 1
        && digits.chars().any(|ch| ch.is_ascii_digit());
    if !well_formed {
        return Err(LedgerError::InvalidAmount(format!("malformed amount '{}'", raw)));
    }

    BigDecimal::from_str(trimmed)
        .map_err(|_| LedgerError::InvalidAmount(format!("malformed amount '{}'", raw)))
}

pub fn ensure_positive(amount: &BigDecimal) -> Result<(), LedgerError> {
    if amount <= &BigDecimal::zero() {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    ensure_scale(amount)
}

fn ensure_scale(amount: &BigDecimal) -> Result<(), LedgerError> {
    if fractional_digits(amount) > MONEY_SCALE {
        return Err(LedgerError::InvalidAmount(format!(
            "amount {} has more than {} fractional digits",
            amount, MONEY_SCALE
        )));
    }
    Ok(())
}

/// Number of significant fractional digits (trailing zeros ignored).
pub fn fractional_digits(amount: &BigDecimal) -> i64 {
    let (_, scale) = amount.normalized().as_bigint_and_exponent();
    scale.max(0)
}

/// Rescales to the storage scale, truncating toward zero.
pub fn to_storage_scale(amount: &BigDecimal) -> BigDecimal {
    amount.with_scale(MONEY_SCALE)
}

pub fn zero() -> BigDecimal {
    BigDecimal::zero().with_scale(MONEY_SCALE)
}

/// Converts a currency amount into integer token base units
/// (`amount * 10^decimals`). Returns `None` when the amount has more
/// precision than the token supports.
pub fn to_base_units(amount: &BigDecimal, decimals: u8) -> Option<String> {
    let factor = BigDecimal::from_str(&format!("1{}", "0".repeat(decimals as usize))).ok()?;
    let scaled = amount.clone() * factor;
    if fractional_digits(&scaled) > 0 {
        return None;
    }
    Some(scaled.with_scale(0).to_string())
}
