use std::{fmt::Display, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::UnknownVariant;
use crate::amortization::RateBasis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Applied,
    Approved,
    Disbursed,
    Repaying,
    Completed,
    Defaulted,
    WrittenOff,
    Rejected,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Applied => "applied",
            LoanStatus::Approved => "approved",
            LoanStatus::Disbursed => "disbursed",
            LoanStatus::Repaying => "repaying",
            LoanStatus::Completed => "completed",
            LoanStatus::Defaulted => "defaulted",
            LoanStatus::WrittenOff => "written_off",
            LoanStatus::Rejected => "rejected",
        }
    }

    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (*self, next),
            (Applied, Approved)
                | (Applied, Rejected)
                | (Approved, Disbursed)
                | (Approved, Rejected)
                | (Disbursed, Repaying)
                | (Disbursed, Completed)
                | (Disbursed, Defaulted)
                | (Repaying, Completed)
                | (Repaying, Defaulted)
                | (Defaulted, Repaying)
                | (Defaulted, WrittenOff)
        )
    }

    /// Statuses in which the borrower holds money and repayments are accepted.
    pub fn accepts_repayments(&self) -> bool {
        matches!(
            self,
            LoanStatus::Disbursed | LoanStatus::Repaying | LoanStatus::Defaulted
        )
    }
}

impl FromStr for LoanStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(LoanStatus::Applied),
            "approved" => Ok(LoanStatus::Approved),
            "disbursed" => Ok(LoanStatus::Disbursed),
            "repaying" => Ok(LoanStatus::Repaying),
            "completed" => Ok(LoanStatus::Completed),
            "defaulted" => Ok(LoanStatus::Defaulted),
            "written_off" => Ok(LoanStatus::WrittenOff),
            "rejected" => Ok(LoanStatus::Rejected),
            _ => Err(UnknownVariant::new("loan status", s)),
        }
    }
}

impl Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanType {
    Emergency,
    BikeRepair,
    Fuel,
    Medical,
    SchoolFees,
    Business,
    Other,
}

impl LoanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanType::Emergency => "emergency",
            LoanType::BikeRepair => "bike_repair",
            LoanType::Fuel => "fuel",
            LoanType::Medical => "medical",
            LoanType::SchoolFees => "school_fees",
            LoanType::Business => "business",
            LoanType::Other => "other",
        }
    }
}

impl FromStr for LoanType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emergency" => Ok(LoanType::Emergency),
            "bike_repair" => Ok(LoanType::BikeRepair),
            "fuel" => Ok(LoanType::Fuel),
            "medical" => Ok(LoanType::Medical),
            "school_fees" => Ok(LoanType::SchoolFees),
            "business" => Ok(LoanType::Business),
            "other" => Ok(LoanType::Other),
            _ => Err(UnknownVariant::new("loan type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Mpesa,
    Cash,
    Deduction,
    ContributionOffset,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Mpesa => "mpesa",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Deduction => "deduction",
            PaymentMethod::ContributionOffset => "contribution_offset",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpesa" => Ok(PaymentMethod::Mpesa),
            "cash" => Ok(PaymentMethod::Cash),
            "deduction" => Ok(PaymentMethod::Deduction),
            "contribution_offset" => Ok(PaymentMethod::ContributionOffset),
            _ => Err(UnknownVariant::new("payment method", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Arc<str>,
    pub member_id: Arc<str>,
    pub loan_type: LoanType,
    pub status: LoanStatus,

    pub requested_amount: Decimal,
    pub approved_amount: Option<Decimal>,
    pub disbursed_amount: Option<Decimal>,

    /// Percentage, interpreted per `rate_basis`.
    pub interest_rate: Decimal,
    pub rate_basis: RateBasis,
    pub term_months: u32,

    // Populated once, at approval.
    pub monthly_payment: Option<Decimal>,
    pub total_interest: Option<Decimal>,
    pub total_amount: Option<Decimal>,

    pub purpose: Arc<str>,
    pub guarantors: Vec<Arc<str>>,
    pub approved_by: Option<Arc<str>>,
    pub rejection_reason: Option<Arc<str>>,

    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub disbursed_at: Option<OffsetDateTime>,
    pub expected_completion_date: Option<Date>,
}

impl Loan {
    /// The amount the amortization schedule runs on.
    pub fn principal(&self) -> Decimal {
        self.approved_amount.unwrap_or(self.requested_amount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRepayment {
    pub id: Uuid,
    pub sequence: u64,
    pub loan_id: Arc<str>,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub transaction_reference: Option<Arc<str>>,
    pub principal_amount: Decimal,
    pub interest_amount: Decimal,
    pub collected_by: Option<Arc<str>>,
    pub notes: Arc<str>,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_at: OffsetDateTime,
}

/// Repayment totals projected from a loan's repayment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanPosition {
    pub loan_id: Arc<str>,
    pub principal: Decimal,
    pub total_repaid: Decimal,
    pub principal_repaid: Decimal,
    pub interest_repaid: Decimal,
    pub balance_remaining: Decimal,
    pub repayment_count: u64,
}

impl LoanPosition {
    pub fn project(loan: &Loan, repayments: &[LoanRepayment]) -> Self {
        let principal = loan.principal();
        let mut position = Self {
            loan_id: loan.id.clone(),
            principal,
            total_repaid: Decimal::ZERO,
            principal_repaid: Decimal::ZERO,
            interest_repaid: Decimal::ZERO,
            balance_remaining: principal,
            repayment_count: 0,
        };

        for r in repayments.iter().filter(|r| r.loan_id == loan.id) {
            position.total_repaid += r.amount;
            position.principal_repaid += r.principal_amount;
            position.interest_repaid += r.interest_amount;
            position.repayment_count += 1;
        }
        position.balance_remaining = (principal - position.principal_repaid).max(Decimal::ZERO);
        position
    }

    pub fn is_cleared(&self) -> bool {
        self.balance_remaining.is_zero()
    }
}
