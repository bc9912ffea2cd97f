use bigdecimal::BigDecimal;
use num_traits::Zero;
use std::str::FromStr;

/// Fractional digits stored for every monetary amount.
pub const MONEY_SCALE: i64 = 2;

/// Exclusive upper bound imposed by the column precision.
const PRICE_CEILING: i64 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceError {
    #[error("price must be a plain decimal string such as \"1500.00\"")]
    Malformed,
    #[error("price must have at most 2 decimal places")]
    TooPrecise,
    #[error("price must be greater than zero")]
    NotPositive,
    #[error("price must be below 100000000")]
    TooLarge,
}

/// Parses a client supplied price, rejecting exponents, excess precision and
/// non-positive values. The result always carries exactly two decimals.
pub fn parse_price(raw: &str) -> Result<BigDecimal, PriceError> {
    let trimmed = raw.trim();
    let well_formed = !trimmed.is_empty()
        && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        && trimmed.chars().any(|c| c.is_ascii_digit());
    if !well_formed {
        return Err(PriceError::Malformed);
    }

    let value = BigDecimal::from_str(trimmed).map_err(|_| PriceError::Malformed)?;
    let (_, scale) = value.normalized().as_bigint_and_exponent();
    if scale > MONEY_SCALE {
        return Err(PriceError::TooPrecise);
    }
    if value <= BigDecimal::zero() {
        return Err(PriceError::NotPositive);
    }
    if value >= BigDecimal::from(PRICE_CEILING) {
        return Err(PriceError::TooLarge);
    }

    Ok(value.with_scale(MONEY_SCALE))
}

/// Exclusive upper bound of `orders.total_price` (`NUMERIC(20, 2)`). Any
/// valid price times any `i32` quantity stays below it.
pub const TOTAL_CEILING: i64 = 1_000_000_000_000_000_000;

/// `price * quantity` in exact decimal arithmetic.
pub fn line_total(price: &BigDecimal, quantity: i32) -> BigDecimal {
    (price * BigDecimal::from(quantity)).with_scale(MONEY_SCALE)
}
