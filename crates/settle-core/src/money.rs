use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{SettlementError, SettlementResult};

/// Minor-unit scale for every currency in use.
pub const MONEY_SCALE: u32 = 2;
/// Stored quantities carry up to four decimal places.
pub const QUANTITY_SCALE: u32 = 4;
/// Tax rates are percentages with up to two decimal places.
pub const TAX_RATE_SCALE: u32 = 2;

/// Exclusive magnitude bound for amounts; matches `NUMERIC(18,2)`.
pub const MONEY_LIMIT: Decimal = Decimal::from_parts(1_874_919_424, 2_328_306, 0, false, 0);
/// Exclusive magnitude bound for quantities; matches `NUMERIC(18,4)`.
pub const QUANTITY_LIMIT: Decimal = Decimal::from_parts(276_447_232, 23_283, 0, false, 0);

/// Validates a monetary amount: at most two decimal places, normalised to
/// exactly two.
pub fn money(amount: Decimal, field: &str) -> SettlementResult<Decimal> {
    if amount.normalize().scale() > MONEY_SCALE {
        return Err(SettlementError::invalid_input(format!(
            "{field} must have at most {MONEY_SCALE} decimal places, got {amount}"
        )));
    }
    if amount.abs() >= MONEY_LIMIT {
        return Err(SettlementError::invalid_input(format!(
            "{field} must be less than {MONEY_LIMIT} in magnitude"
        )));
    }

    let mut value = amount;
    value.rescale(MONEY_SCALE);
    Ok(value)
}

/// Like [`money`], additionally requiring the amount to be strictly positive.
pub fn positive_money(amount: Decimal, field: &str) -> SettlementResult<Decimal> {
    let value = money(amount, field)?;
    if value <= Decimal::ZERO {
        return Err(SettlementError::invalid_input(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(value)
}

/// Rounds a computed amount (products, percentages) half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut value = amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    value.rescale(MONEY_SCALE);
    value
}

/// Validates a line quantity: strictly positive, at most four decimal places.
pub fn quantity(value: Decimal, field: &str) -> SettlementResult<Decimal> {
    if value <= Decimal::ZERO {
        return Err(SettlementError::invalid_input(format!(
            "{field} must be greater than zero"
        )));
    }
    if value.normalize().scale() > QUANTITY_SCALE {
        return Err(SettlementError::invalid_input(format!(
            "{field} must have at most {QUANTITY_SCALE} decimal places, got {value}"
        )));
    }
    if value >= QUANTITY_LIMIT {
        return Err(SettlementError::invalid_input(format!(
            "{field} must be less than {QUANTITY_LIMIT}"
        )));
    }
    Ok(value)
}

/// Validates a tax percentage in `0..=100` with at most two decimal places.
pub fn tax_rate(value: Decimal, field: &str) -> SettlementResult<Decimal> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(SettlementError::invalid_input(format!(
            "{field} must be between 0 and 100"
        )));
    }
    if value.normalize().scale() > TAX_RATE_SCALE {
        return Err(SettlementError::invalid_input(format!(
            "{field} must have at most {TAX_RATE_SCALE} decimal places, got {value}"
        )));
    }
    Ok(value)
}

/// `quantity * unit_price` rounded to money, rejecting results outside the
/// storable range instead of overflowing.
pub fn line_amount(quantity: Decimal, unit_price: Decimal) -> SettlementResult<Decimal> {
    let product = quantity
        .checked_mul(unit_price)
        .ok_or_else(|| out_of_range("line amount"))?;
    bounded(round_money(product), "line amount")
}

/// Sums amounts with overflow checks. The total must itself be storable.
pub fn sum_money<I>(amounts: I) -> SettlementResult<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    let total = amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value))
        .ok_or_else(|| out_of_range("amount total"))?;
    bounded(round_money(total), "amount total")
}

fn bounded(amount: Decimal, what: &str) -> SettlementResult<Decimal> {
    if amount.abs() >= MONEY_LIMIT {
        return Err(out_of_range(what));
    }
    Ok(amount)
}

fn out_of_range(what: &str) -> SettlementError {
    SettlementError::invalid_input(format!(
        "{what} must be less than {MONEY_LIMIT} in magnitude"
    ))
}
