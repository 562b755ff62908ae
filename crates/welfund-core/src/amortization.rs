//! Fixed-payment (annuity) loan amortization.
//!
//! Everything here is pure `Decimal` arithmetic. The only rounding is to
//! the cent, half away from zero, and it is applied to the final payment
//! figure (and to each period's interest when building a schedule), never
//! to intermediate terms.

use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::{util::days_in_year_month, Date, Month};

use crate::error::LedgerError;

const CURRENCY_DP: u32 = 2;
const MONTHS_PER_YEAR: u32 = 12;

/// Longest accepted term: fifty years of monthly installments.
pub const MAX_TERM_MONTHS: u32 = 600;

/// How a percentage interest rate maps onto the monthly period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    /// The rate already is the monthly rate.
    #[default]
    Monthly,
    /// The rate is nominal annual and is divided by 12.
    Annual,
}

impl RateBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateBasis::Monthly => "monthly",
            RateBasis::Annual => "annual",
        }
    }

    /// Converts a percentage into the periodic fraction `r`.
    pub fn periodic_rate(&self, rate_percent: Decimal) -> Decimal {
        let r = rate_percent / Decimal::ONE_HUNDRED;
        match self {
            RateBasis::Monthly => r,
            RateBasis::Annual => r / Decimal::from(MONTHS_PER_YEAR),
        }
    }
}

impl std::str::FromStr for RateBasis {
    type Err = crate::models::UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(RateBasis::Monthly),
            "annual" => Ok(RateBasis::Annual),
            _ => Err(crate::models::UnknownVariant::new("rate basis", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amortization {
    pub monthly_payment: Decimal,
    pub total_interest: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub period: u32,
    pub payment: Decimal,
    pub interest: Decimal,
    pub principal: Decimal,
    pub remaining_balance: Decimal,
}

pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::MidpointAwayFromZero)
}

fn validate(principal: Decimal, rate: Decimal, term_months: u32) -> Result<(), LedgerError> {
    if principal <= Decimal::ZERO {
        return Err(LedgerError::InvalidLoanParameters(format!(
            "principal must be greater than zero, got {}",
            principal
        )));
    }
    if term_months < 1 {
        return Err(LedgerError::InvalidLoanParameters(
            "term must be at least one month".to_string(),
        ));
    }
    if term_months > MAX_TERM_MONTHS {
        return Err(LedgerError::InvalidLoanParameters(format!(
            "term cannot exceed {} months, got {}",
            MAX_TERM_MONTHS, term_months
        )));
    }
    if rate < Decimal::ZERO {
        return Err(LedgerError::InvalidLoanParameters(format!(
            "interest rate cannot be negative, got {}",
            rate
        )));
    }
    Ok(())
}

fn overflow() -> LedgerError {
    LedgerError::InvalidLoanParameters("values exceed decimal precision".to_string())
}

/// Unrounded periodic payment for an already validated input.
fn exact_payment(principal: Decimal, r: Decimal, term_months: u32) -> Result<Decimal, LedgerError> {
    let n = Decimal::from(term_months);
    if r.is_zero() {
        return Ok(principal / n);
    }

    let growth = (Decimal::ONE + r)
        .checked_powu(u64::from(term_months))
        .ok_or_else(overflow)?;
    let denominator = growth - Decimal::ONE;
    if denominator.is_zero() {
        // (1+r)^n collapsed to 1 at 28 digits of precision.
        return Ok(principal / n);
    }

    let factor = r.checked_mul(growth).ok_or_else(overflow)?;
    principal
        .checked_mul(factor)
        .and_then(|v| v.checked_div(denominator))
        .ok_or_else(overflow)
}

/// Fixed monthly payment for a loan whose `rate` is a monthly percentage.
///
/// `calculate(P, 0, n)` is `P / n` rounded to the cent.
pub fn calculate(principal: Decimal, rate: Decimal, term_months: u32) -> Result<Amortization, LedgerError> {
    calculate_with_basis(principal, rate, term_months, RateBasis::Monthly)
}

pub fn calculate_with_basis(
    principal: Decimal,
    rate: Decimal,
    term_months: u32,
    basis: RateBasis,
) -> Result<Amortization, LedgerError> {
    validate(principal, rate, term_months)?;

    let r = basis.periodic_rate(rate);
    let monthly_payment = round_currency(exact_payment(principal, r, term_months)?);
    let total_amount = monthly_payment
        .checked_mul(Decimal::from(term_months))
        .ok_or_else(overflow)?;

    Ok(Amortization {
        monthly_payment,
        total_interest: total_amount - principal,
        total_amount,
    })
}

/// Period-by-period breakdown of the fixed payment.
///
/// The final installment pays whatever principal is left, so the
/// remaining balance ends at exactly zero.
pub fn schedule(
    principal: Decimal,
    rate: Decimal,
    term_months: u32,
    basis: RateBasis,
) -> Result<Vec<Installment>, LedgerError> {
    let amortization = calculate_with_basis(principal, rate, term_months, basis)?;
    let r = basis.periodic_rate(rate);

    let mut balance = principal;
    let mut installments = Vec::new();
    for period in 1..=term_months {
        let interest = round_currency(balance * r);
        let principal_part = if period == term_months {
            balance
        } else {
            (amortization.monthly_payment - interest).min(balance)
        };
        balance -= principal_part;
        installments.push(Installment {
            period,
            payment: principal_part + interest,
            interest,
            principal: principal_part,
            remaining_balance: balance,
        });
    }

    Ok(installments)
}

/// Existing monthly debt service as a percentage of monthly income.
///
/// Zero when there is no income to compare against.
pub fn debt_to_income_ratio(existing_debt: Decimal, monthly_income: Decimal) -> Decimal {
    if monthly_income <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_currency(existing_debt / monthly_income * Decimal::ONE_HUNDRED)
}

/// Calendar date `months` after `date`, clamped to the end of shorter months.
pub fn add_months(date: Date, months: u32) -> Option<Date> {
    let zero_based = date.month() as i64 - 1 + i64::from(months);
    let year = date.year().checked_add(i32::try_from(zero_based / 12).ok()?)?;
    let month = Month::try_from(u8::try_from(zero_based % 12 + 1).ok()?).ok()?;
    let day = date.day().min(days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).ok()
}
