//! Core types and traits for welfund storage backends.
//!
//! This crate provides the `StorageBackend` trait, the fund/loan models,
//! the error taxonomy and the amortization calculator, so storage
//! implementations can live in separate crates.

pub mod amortization;
pub mod codec;
pub mod error;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use amortization::{Amortization, Installment, RateBasis};
pub use error::LedgerError;
pub use models::{Direction, EntryReference, Fund, FundKind, TransactionKind, UnknownVariant};
pub use models::loan::{Loan, LoanPosition, LoanRepayment, LoanStatus, LoanType, PaymentMethod};
pub use models::read::{FundSummary, LedgerEntry, Statement, StatementLine};
pub use models::write::{AppendEntryCommand, AppendRepaymentCommand, CreateFundCommand};
pub use storage::{StorageBackend, StorageError, TransactionId};
