use std::{fmt::Display, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerError;

pub mod loan;
pub mod read;
pub mod write;

/// Returned when a stored or submitted label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {what}: '{value}'")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Contribution,
    Disbursement,
    LoanDisbursement,
    LoanRepayment,
    Penalty,
    Expense,
    Interest,
    WriteOff,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 8] = [
        TransactionKind::Contribution,
        TransactionKind::Disbursement,
        TransactionKind::LoanDisbursement,
        TransactionKind::LoanRepayment,
        TransactionKind::Penalty,
        TransactionKind::Expense,
        TransactionKind::Interest,
        TransactionKind::WriteOff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Contribution => "contribution",
            TransactionKind::Disbursement => "disbursement",
            TransactionKind::LoanDisbursement => "loan_disbursement",
            TransactionKind::LoanRepayment => "loan_repayment",
            TransactionKind::Penalty => "penalty",
            TransactionKind::Expense => "expense",
            TransactionKind::Interest => "interest",
            TransactionKind::WriteOff => "write_off",
        }
    }

    /// Parses a kind submitted by a caller, failing with `InvalidTransactionKind`.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        value
            .parse()
            .map_err(|e: UnknownVariant| LedgerError::InvalidTransactionKind(e.value))
    }
}

impl FromStr for TransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "contribution" => Ok(TransactionKind::Contribution),
            "disbursement" => Ok(TransactionKind::Disbursement),
            "loan_disbursement" | "loan" => Ok(TransactionKind::LoanDisbursement),
            "loan_repayment" | "repayment" => Ok(TransactionKind::LoanRepayment),
            "penalty" => Ok(TransactionKind::Penalty),
            "expense" => Ok(TransactionKind::Expense),
            "interest" | "interest_earned" => Ok(TransactionKind::Interest),
            "write_off" | "writeoff" => Ok(TransactionKind::WriteOff),
            _ => Err(UnknownVariant::new("transaction kind", s)),
        }
    }
}

impl Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether money moves into (credit) or out of (debit) a fund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn from_credit_flag(is_credit: bool) -> Self {
        if is_credit {
            Direction::Credit
        } else {
            Direction::Debit
        }
    }

    pub fn is_credit(&self) -> bool {
        matches!(self, Direction::Credit)
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        }
    }

    /// Applies the direction to an unsigned amount: credits add, debits subtract.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Credit => f.write_str("credit"),
            Direction::Debit => f.write_str("debit"),
        }
    }
}

/// The source record a ledger entry was recorded for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntryReference {
    Contribution(Arc<str>),
    Loan(Arc<str>),
    Repayment(Arc<str>),
    EmergencyCase(Arc<str>),
    /// The entry this one offsets.
    Entry(Uuid),
}

impl EntryReference {
    pub fn type_str(&self) -> &'static str {
        match self {
            EntryReference::Contribution(_) => "contribution",
            EntryReference::Loan(_) => "loan",
            EntryReference::Repayment(_) => "repayment",
            EntryReference::EmergencyCase(_) => "emergency_case",
            EntryReference::Entry(_) => "entry",
        }
    }

    pub fn id_string(&self) -> String {
        match self {
            EntryReference::Contribution(id)
            | EntryReference::Loan(id)
            | EntryReference::Repayment(id)
            | EntryReference::EmergencyCase(id) => id.to_string(),
            EntryReference::Entry(id) => id.to_string(),
        }
    }

    /// Rebuilds a reference from the two columns a backend stores it in.
    pub fn from_parts(ref_type: &str, id: &str) -> Result<Self, UnknownVariant> {
        match ref_type {
            "contribution" => Ok(EntryReference::Contribution(Arc::from(id))),
            "loan" => Ok(EntryReference::Loan(Arc::from(id))),
            "repayment" => Ok(EntryReference::Repayment(Arc::from(id))),
            "emergency_case" => Ok(EntryReference::EmergencyCase(Arc::from(id))),
            "entry" => Uuid::parse_str(id)
                .map(EntryReference::Entry)
                .map_err(|_| UnknownVariant::new("entry reference id", id)),
            _ => Err(UnknownVariant::new("entry reference type", ref_type)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundKind {
    Welfare,
    LoanKitty,
    Other,
}

impl FundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundKind::Welfare => "welfare",
            FundKind::LoanKitty => "loan_kitty",
            FundKind::Other => "other",
        }
    }
}

impl FromStr for FundKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welfare" => Ok(FundKind::Welfare),
            "loan_kitty" => Ok(FundKind::LoanKitty),
            "other" => Ok(FundKind::Other),
            _ => Err(UnknownVariant::new("fund kind", s)),
        }
    }
}

/// A named pool of money whose balance is the net of its ledger entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fund {
    pub id: Arc<str>,
    pub name: Arc<str>,
    pub kind: FundKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parses_canonical_names() {
        for kind in TransactionKind::ALL {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_kind_accepts_legacy_aliases() {
        assert_eq!(TransactionKind::parse("loan").unwrap(), TransactionKind::LoanDisbursement);
        assert_eq!(TransactionKind::parse("repayment").unwrap(), TransactionKind::LoanRepayment);
        assert_eq!(TransactionKind::parse("interest_earned").unwrap(), TransactionKind::Interest);
        assert_eq!(TransactionKind::parse("writeoff").unwrap(), TransactionKind::WriteOff);
        assert_eq!(TransactionKind::parse("Loan-Repayment").unwrap(), TransactionKind::LoanRepayment);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        match TransactionKind::parse("lottery") {
            Err(LedgerError::InvalidTransactionKind(k)) => assert_eq!(k, "lottery"),
            other => panic!("Expected InvalidTransactionKind, got {:?}", other),
        }
    }

    #[test]
    fn test_direction_sign() {
        let amt = Decimal::from(250);
        assert_eq!(Direction::Credit.signed(amt), amt);
        assert_eq!(Direction::Debit.signed(amt), -amt);
        assert_eq!(Direction::from_credit_flag(false).opposite(), Direction::Credit);
    }

    #[test]
    fn test_reference_parts_roundtrip() {
        let id = Uuid::new_v4();
        let r = EntryReference::Entry(id);
        assert_eq!(EntryReference::from_parts(r.type_str(), &r.id_string()).unwrap(), r);
        assert!(EntryReference::from_parts("invoice", "1").is_err());
    }
}
