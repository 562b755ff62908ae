//! The same behavioural checks run against every storage backend.

use std::sync::Arc;

use rust_decimal_macros::dec;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;
use welfund::storage::{StorageBackend, StorageError};
use welfund_core::{
    AppendEntryCommand, AppendRepaymentCommand, CreateFundCommand, EntryReference, FundKind, Loan,
    LoanStatus, LoanType, PaymentMethod, RateBasis, TransactionKind,
};
use welfund_memory::InMemoryStorage;
use welfund_sqlite::SqliteStorage;

fn fund(storage: &dyn StorageBackend, id: &str) {
    storage
        .create_fund(&CreateFundCommand {
            id: Arc::from(id),
            name: Arc::from(id),
            kind: FundKind::Other,
        })
        .unwrap();
}

fn sample_loan(id: &str) -> Loan {
    Loan {
        id: Arc::from(id),
        member_id: Arc::from("m-9"),
        loan_type: LoanType::SchoolFees,
        status: LoanStatus::Applied,
        requested_amount: dec!(15000),
        approved_amount: None,
        disbursed_amount: None,
        interest_rate: dec!(2.50),
        rate_basis: RateBasis::Annual,
        term_months: 10,
        monthly_payment: None,
        total_interest: None,
        total_amount: None,
        purpose: Arc::from("Term two fees"),
        guarantors: vec![Arc::from("m-1"), Arc::from("m-2")],
        approved_by: None,
        rejection_reason: None,
        applied_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        approved_at: None,
        disbursed_at: None,
        expected_completion_date: None,
    }
}

fn repayment(loan_id: &str, principal: rust_decimal::Decimal) -> AppendRepaymentCommand {
    AppendRepaymentCommand {
        loan_id: Arc::from(loan_id),
        amount: principal + dec!(10),
        payment_method: PaymentMethod::Mpesa,
        transaction_reference: Some(Arc::from("QWE123")),
        principal_amount: principal,
        interest_amount: dec!(10),
        collected_by: None,
        notes: Arc::from(""),
    }
}

macro_rules! storage_conformance {
    ($backend:ident, $ctor:expr) => {
        paste::paste! {
            #[test]
            fn [<$backend _funds>]() {
                let storage = $ctor;
                fund(&storage, "b_fund");
                fund(&storage, "a_fund");

                assert!(storage.fund_exists("a_fund"));
                assert!(!storage.fund_exists("z_fund"));
                assert_eq!(storage.get_fund("a_fund").unwrap().kind, FundKind::Other);

                let ids: Vec<String> = storage.list_funds().unwrap().iter().map(|f| f.id.to_string()).collect();
                assert_eq!(ids, vec!["a_fund", "b_fund"]);

                let dup = storage.create_fund(&CreateFundCommand {
                    id: Arc::from("a_fund"),
                    name: Arc::from("again"),
                    kind: FundKind::Welfare,
                });
                assert!(matches!(dup, Err(StorageError::FundAlreadyExists(_))));
                assert!(matches!(storage.get_fund("z_fund"), Err(StorageError::FundNotFound(_))));
            }

            #[test]
            fn [<$backend _entries_keep_insertion_order>]() {
                let storage = $ctor;
                fund(&storage, "f");
                let first = storage
                    .append_entry(&AppendEntryCommand::credit("f", TransactionKind::Contribution, dec!(10), "one"))
                    .unwrap();
                let second = storage
                    .append_entry(
                        &AppendEntryCommand::debit("f", TransactionKind::Penalty, dec!(2.5), "two")
                            .with_reference(EntryReference::Contribution(Arc::from("c-7"))),
                    )
                    .unwrap();
                assert!(second.sequence > first.sequence);

                let entries = storage.list_entries("f").unwrap();
                assert_eq!(entries, vec![first.clone(), second.clone()]);
                assert_eq!(storage.get_entry(second.id).unwrap(), second);

                let missing = Uuid::new_v4();
                assert!(matches!(storage.get_entry(missing), Err(StorageError::EntryNotFound(id)) if id == missing));
            }

            #[test]
            fn [<$backend _summary_is_exact>]() {
                let storage = $ctor;
                fund(&storage, "f");
                for _ in 0..3 {
                    storage
                        .append_entry(&AppendEntryCommand::credit("f", TransactionKind::Contribution, dec!(0.1), "dime"))
                        .unwrap();
                }
                storage
                    .append_entry(&AppendEntryCommand::debit("f", TransactionKind::Expense, dec!(0.3), "spend"))
                    .unwrap();

                let summary = storage.fund_summary("f").unwrap();
                assert_eq!(summary.total_credits, dec!(0.3));
                assert_eq!(summary.total_debits, dec!(0.3));
                assert!(summary.balance().is_zero());
                assert_eq!(summary.entry_count, 4);
            }

            #[test]
            fn [<$backend _unknown_fund>]() {
                let storage = $ctor;
                let cmd = AppendEntryCommand::credit("ghost", TransactionKind::Contribution, dec!(1), "x");
                assert!(matches!(storage.append_entry(&cmd), Err(StorageError::FundNotFound(_))));
                assert!(matches!(storage.list_entries("ghost"), Err(StorageError::FundNotFound(_))));
                assert!(matches!(storage.fund_summary("ghost"), Err(StorageError::FundNotFound(_))));
            }

            #[test]
            fn [<$backend _find_reversal>]() {
                let storage = $ctor;
                fund(&storage, "f");
                let original = storage
                    .append_entry(&AppendEntryCommand::credit("f", TransactionKind::Contribution, dec!(40), "x"))
                    .unwrap();
                assert!(storage.find_reversal(original.id).unwrap().is_none());

                let offset = storage
                    .append_entry(
                        &AppendEntryCommand::debit("f", TransactionKind::Contribution, dec!(40), "undo")
                            .with_reference(EntryReference::Entry(original.id)),
                    )
                    .unwrap();
                assert_eq!(storage.find_reversal(original.id).unwrap(), Some(offset));
            }

            #[test]
            fn [<$backend _loans>]() {
                let storage = $ctor;
                let mut loan = sample_loan("LN-0000000B");
                storage.create_loan(&loan).unwrap();
                storage.create_loan(&sample_loan("LN-0000000A")).unwrap();
                assert!(matches!(storage.create_loan(&loan), Err(StorageError::LoanAlreadyExists(_))));
                assert_eq!(storage.get_loan("LN-0000000B").unwrap(), loan);

                loan.status = LoanStatus::Disbursed;
                loan.approved_amount = Some(dec!(12000));
                loan.monthly_payment = Some(dec!(1213.97));
                loan.approved_by = Some(Arc::from("chair"));
                loan.guarantors = vec![Arc::from("m-3")];
                loan.disbursed_at = Some(OffsetDateTime::from_unix_timestamp(1_700_086_400).unwrap());
                loan.expected_completion_date = Some(Date::from_calendar_date(2024, Month::September, 15).unwrap());
                storage.update_loan(&loan).unwrap();
                assert_eq!(storage.get_loan("LN-0000000B").unwrap(), loan);

                assert_eq!(storage.list_loans().unwrap().len(), 2);
                assert!(matches!(storage.get_loan("LN-NOPE"), Err(StorageError::LoanNotFound(_))));
                assert!(matches!(storage.update_loan(&sample_loan("LN-NOPE")), Err(StorageError::LoanNotFound(_))));
            }

            #[test]
            fn [<$backend _repayments>]() {
                let storage = $ctor;
                storage.create_loan(&sample_loan("LN-1")).unwrap();
                let a = storage.append_repayment(&repayment("LN-1", dec!(100))).unwrap();
                let b = storage.append_repayment(&repayment("LN-1", dec!(200))).unwrap();
                assert!(b.sequence > a.sequence);

                let listed = storage.list_repayments("LN-1").unwrap();
                assert_eq!(listed, vec![a, b]);
                assert_eq!(listed[1].transaction_reference.as_deref(), Some("QWE123"));

                assert!(matches!(
                    storage.append_repayment(&repayment("LN-2", dec!(1))),
                    Err(StorageError::LoanNotFound(_))
                ));
            }

            #[test]
            fn [<$backend _transactions>]() {
                let storage = $ctor;
                fund(&storage, "f");

                let tx = storage.begin_transaction().unwrap();
                storage
                    .append_entry(&AppendEntryCommand::credit("f", TransactionKind::Contribution, dec!(5), "kept"))
                    .unwrap();
                storage.commit_transaction(tx).unwrap();

                let tx = storage.begin_transaction().unwrap();
                storage
                    .append_entry(&AppendEntryCommand::credit("f", TransactionKind::Contribution, dec!(7), "dropped"))
                    .unwrap();
                storage.create_loan(&sample_loan("LN-TX")).unwrap();
                storage.rollback_transaction(tx).unwrap();

                assert_eq!(storage.fund_summary("f").unwrap().balance(), dec!(5));
                assert!(matches!(storage.get_loan("LN-TX"), Err(StorageError::LoanNotFound(_))));
                assert!(matches!(storage.commit_transaction(tx), Err(StorageError::NoActiveTransaction)));
            }
        }
    };
}

storage_conformance!(memory, InMemoryStorage::new());
storage_conformance!(sqlite, SqliteStorage::new(":memory:").unwrap());
