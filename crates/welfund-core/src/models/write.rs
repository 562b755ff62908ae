use std::sync::Arc;

use rust_decimal::Decimal;

use super::{loan::PaymentMethod, Direction, EntryReference, FundKind, TransactionKind};
use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateFundCommand {
    pub id: Arc<str>,
    pub name: Arc<str>,
    pub kind: FundKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntryCommand {
    pub fund_id: Arc<str>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub direction: Direction,
    pub reference: Option<EntryReference>,
    pub description: Arc<str>,
    pub actor: Option<Arc<str>>,
}

impl AppendEntryCommand {
    pub fn new(fund_id: &str, kind: TransactionKind, amount: Decimal, direction: Direction, description: &str) -> Self {
        Self {
            fund_id: Arc::from(fund_id),
            kind,
            amount,
            direction,
            reference: None,
            description: Arc::from(description),
            actor: None,
        }
    }

    pub fn credit(fund_id: &str, kind: TransactionKind, amount: Decimal, description: &str) -> Self {
        Self::new(fund_id, kind, amount, Direction::Credit, description)
    }

    pub fn debit(fund_id: &str, kind: TransactionKind, amount: Decimal, description: &str) -> Self {
        Self::new(fund_id, kind, amount, Direction::Debit, description)
    }

    pub fn with_reference(mut self, reference: EntryReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(Arc::from);
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(self.amount));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendRepaymentCommand {
    pub loan_id: Arc<str>,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub transaction_reference: Option<Arc<str>>,
    pub principal_amount: Decimal,
    pub interest_amount: Decimal,
    pub collected_by: Option<Arc<str>>,
    pub notes: Arc<str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_rejects_zero_and_negative() {
        for amount in [dec!(0), dec!(-0.01), dec!(-500)] {
            let cmd = AppendEntryCommand::credit("welfare", TransactionKind::Contribution, amount, "bad");
            match cmd.validate() {
                Err(LedgerError::NonPositiveAmount(a)) => assert_eq!(a, amount),
                other => panic!("Expected NonPositiveAmount, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_builder_sets_reference_and_actor() {
        let cmd = AppendEntryCommand::debit("loan_kitty", TransactionKind::LoanDisbursement, dec!(0.01), "ok")
            .with_reference(EntryReference::Loan(Arc::from("LN-1")))
            .with_actor(Some("treasurer"));
        assert!(cmd.validate().is_ok());
        assert_eq!(cmd.direction, Direction::Debit);
        assert_eq!(cmd.actor.as_deref(), Some("treasurer"));
    }
}
