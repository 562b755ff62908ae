use uuid::Uuid;

use crate::models::{
    loan::{Loan, LoanRepayment},
    read::{FundSummary, LedgerEntry},
    write::{AppendEntryCommand, AppendRepaymentCommand, CreateFundCommand},
    Fund, UnknownVariant,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("corrupt stored value: {0}")]
    Decode(#[from] UnknownVariant),
    #[error("fund not found: {0}")]
    FundNotFound(String),
    #[error("fund already exists: {0}")]
    FundAlreadyExists(String),
    #[error("ledger entry not found: {0}")]
    EntryNotFound(Uuid),
    #[error("loan not found: {0}")]
    LoanNotFound(String),
    #[error("loan already exists: {0}")]
    LoanAlreadyExists(String),
    #[error("no active transaction")]
    NoActiveTransaction,
}

pub type TransactionId = u64;

/// Persistence for funds, the append-only entry log, loans and repayments.
///
/// No method updates or deletes a ledger entry or a repayment; loans are
/// the only mutable rows.
pub trait StorageBackend: Send + Sync {
    // Funds
    fn create_fund(&self, command: &CreateFundCommand) -> Result<Fund, StorageError>;
    fn get_fund(&self, fund_id: &str) -> Result<Fund, StorageError>;
    fn list_funds(&self) -> Result<Vec<Fund>, StorageError>;
    fn fund_exists(&self, fund_id: &str) -> bool;

    // Ledger entries
    fn append_entry(&self, command: &AppendEntryCommand) -> Result<LedgerEntry, StorageError>;
    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry, StorageError>;
    /// Entries of one fund in insertion order.
    fn list_entries(&self, fund_id: &str) -> Result<Vec<LedgerEntry>, StorageError>;
    /// The entry recorded to offset `entry_id`, if any.
    fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StorageError>;
    /// Credit and debit totals summed over the full history of the fund.
    fn fund_summary(&self, fund_id: &str) -> Result<FundSummary, StorageError>;

    // Loans
    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError>;
    fn update_loan(&self, loan: &Loan) -> Result<(), StorageError>;
    fn get_loan(&self, loan_id: &str) -> Result<Loan, StorageError>;
    fn list_loans(&self) -> Result<Vec<Loan>, StorageError>;
    fn append_repayment(&self, command: &AppendRepaymentCommand) -> Result<LoanRepayment, StorageError>;
    fn list_repayments(&self, loan_id: &str) -> Result<Vec<LoanRepayment>, StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}
