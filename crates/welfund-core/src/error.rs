use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::{models::loan::LoanStatus, storage::StorageError};

/// Failures surfaced by the ledger, the loan book and the calculator.
///
/// Validation variants are raised before anything is written.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid transaction kind: {0}")]
    InvalidTransactionKind(String),
    #[error("amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),
    #[error("invalid loan parameters: {0}")]
    InvalidLoanParameters(String),
    #[error("invalid loan application: {0}")]
    InvalidApplication(String),
    #[error("loan {loan_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        loan_id: String,
        from: LoanStatus,
        to: LoanStatus,
    },
    #[error("terms of loan {0} are locked once it has been approved")]
    TermsLocked(String),
    #[error("repayment split does not add up: principal {principal} + interest {interest} != amount {amount}")]
    RepaymentSplitMismatch {
        amount: Decimal,
        principal: Decimal,
        interest: Decimal,
    },
    #[error("repayment principal {principal} exceeds outstanding balance {outstanding}")]
    Overpayment {
        principal: Decimal,
        outstanding: Decimal,
    },
    #[error("entry {0} has already been reversed")]
    AlreadyReversed(Uuid),
    #[error("a reference to entry {0} can only be created by reversing it")]
    ReservedReference(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// True for failures caused by the caller's input rather than the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidTransactionKind(_)
                | LedgerError::NonPositiveAmount(_)
                | LedgerError::InvalidLoanParameters(_)
                | LedgerError::InvalidApplication(_)
                | LedgerError::ReservedReference(_)
                | LedgerError::RepaymentSplitMismatch { .. }
                | LedgerError::Overpayment { .. }
        )
    }
}
