use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use welfund::ledger::Ledger;
use welfund::loans::{LoanApplication, LoanBook, LoanPolicy, RepaymentRequest};
use welfund::storage::StorageBackend;
use welfund_core::{
    amortization, AppendEntryCommand, Direction, EntryReference, FundKind, LedgerError,
    LoanStatus, LoanType, PaymentMethod, RateBasis, TransactionKind,
};
use welfund_memory::InMemoryStorage;
use welfund_sqlite::SqliteStorage;

fn backends() -> Vec<(&'static str, Arc<dyn StorageBackend>)> {
    vec![
        ("memory", Arc::new(InMemoryStorage::new())),
        ("sqlite", Arc::new(SqliteStorage::new(":memory:").unwrap())),
    ]
}

fn setup(storage: Arc<dyn StorageBackend>) -> (Ledger, LoanBook) {
    let ledger = Ledger::new(storage);
    ledger.create_fund("welfare", "Welfare Fund", FundKind::Welfare).unwrap();
    ledger.create_fund("loan_kitty", "Loan Kitty", FundKind::LoanKitty).unwrap();
    let book = LoanBook::new(ledger.clone(), LoanPolicy::default());
    (ledger, book)
}

fn application(amount: Decimal, rate: Decimal, term: u32) -> LoanApplication {
    LoanApplication {
        member_id: "m-001".to_string(),
        loan_type: LoanType::BikeRepair,
        amount,
        interest_rate: Some(rate),
        term_months: Some(term),
        rate_basis: Some(RateBasis::Monthly),
        purpose: "Replace clutch".to_string(),
        guarantors: vec!["m-002".to_string(), "m-003".to_string()],
    }
}

#[test]
fn test_fund_end_to_end() {
    for (name, storage) in backends() {
        let (ledger, _) = setup(storage);
        ledger
            .record(&AppendEntryCommand::credit("welfare", TransactionKind::Contribution, dec!(5000), "Monthly dues"))
            .unwrap();
        ledger
            .record(&AppendEntryCommand::debit("welfare", TransactionKind::Disbursement, dec!(2000), "Medical support"))
            .unwrap();

        assert_eq!(ledger.current_balance("welfare").unwrap(), dec!(3000), "backend {}", name);
        assert_eq!(ledger.current_balance("loan_kitty").unwrap(), Decimal::ZERO, "backend {}", name);

        let statement = ledger.statement("welfare").unwrap();
        assert_eq!(statement.lines.len(), 2);
        assert_eq!(statement.closing_balance(), dec!(3000));
    }
}

#[test]
fn test_balance_is_order_independent() {
    let movements = [
        (dec!(1200), Direction::Credit),
        (dec!(300.25), Direction::Debit),
        (dec!(75.75), Direction::Credit),
        (dec!(500), Direction::Debit),
        (dec!(0.01), Direction::Credit),
    ];

    for (name, storage) in backends() {
        let (ledger, _) = setup(storage);
        for (amount, direction) in movements.iter() {
            ledger
                .record(&AppendEntryCommand::new("welfare", TransactionKind::Contribution, *amount, *direction, "forward"))
                .unwrap();
        }
        for (amount, direction) in movements.iter().rev() {
            ledger
                .record(&AppendEntryCommand::new("loan_kitty", TransactionKind::Contribution, *amount, *direction, "reverse"))
                .unwrap();
        }

        let forward = ledger.current_balance("welfare").unwrap();
        assert_eq!(forward, dec!(475.51), "backend {}", name);
        assert_eq!(forward, ledger.current_balance("loan_kitty").unwrap(), "backend {}", name);
    }
}

#[test]
fn test_rejected_amount_leaves_ledger_untouched() {
    for (name, storage) in backends() {
        let (ledger, _) = setup(storage);
        ledger
            .record(&AppendEntryCommand::credit("welfare", TransactionKind::Contribution, dec!(10), "ok"))
            .unwrap();

        for amount in [dec!(0), dec!(-25)] {
            let err = ledger
                .record(&AppendEntryCommand::credit("welfare", TransactionKind::Penalty, amount, "bad"))
                .unwrap_err();
            assert!(matches!(err, LedgerError::NonPositiveAmount(_)), "backend {}", name);
        }
        assert_eq!(ledger.entries("welfare").unwrap().len(), 1, "backend {}", name);
    }
}

#[test]
fn test_reversal_round_trip() {
    for (name, storage) in backends() {
        let (ledger, _) = setup(storage);
        ledger
            .record(&AppendEntryCommand::credit("welfare", TransactionKind::Contribution, dec!(800), "dues"))
            .unwrap();
        let mistake = ledger
            .record(&AppendEntryCommand::debit("welfare", TransactionKind::Expense, dec!(120), "double entry"))
            .unwrap();

        let reversal = ledger.reverse(mistake.id, "Reverse double entry", Some("auditor")).unwrap();
        assert_eq!(reversal.reference, Some(EntryReference::Entry(mistake.id)), "backend {}", name);
        assert_eq!(ledger.current_balance("welfare").unwrap(), dec!(800), "backend {}", name);
        assert!(matches!(
            ledger.reverse(mistake.id, "again", None),
            Err(LedgerError::AlreadyReversed(_))
        ));

        // A reversal is itself an ordinary entry.
        ledger.reverse(reversal.id, "Reinstate", None).unwrap();
        assert_eq!(ledger.current_balance("welfare").unwrap(), dec!(680), "backend {}", name);
    }
}

#[test]
fn test_loan_lifecycle_to_completion() {
    for (name, storage) in backends() {
        let (ledger, book) = setup(storage);
        ledger
            .record(&AppendEntryCommand::credit("loan_kitty", TransactionKind::Contribution, dec!(50000), "Seed capital"))
            .unwrap();

        let loan = book.apply(&application(dec!(10000), dec!(5), 6)).unwrap();
        let approved = book.approve(&loan.id, None, "chairperson").unwrap();
        let expected = amortization::calculate(dec!(10000), dec!(5), 6).unwrap();
        assert_eq!(approved.monthly_payment, Some(expected.monthly_payment), "backend {}", name);

        let disbursement = book.disburse(&loan.id, Some("treasurer")).unwrap();
        assert_eq!(disbursement.loan.status, LoanStatus::Disbursed);
        assert_eq!(disbursement.entry.reference, Some(EntryReference::Loan(loan.id.clone())));
        assert!(disbursement.loan.expected_completion_date.is_some());
        assert_eq!(ledger.current_balance("loan_kitty").unwrap(), dec!(40000), "backend {}", name);

        let installments = amortization::schedule(dec!(10000), dec!(5), 6, RateBasis::Monthly).unwrap();
        let mut paid = Decimal::ZERO;
        for (i, row) in installments.iter().enumerate() {
            let receipt = book
                .record_repayment(&loan.id, &RepaymentRequest::new(row.payment, PaymentMethod::Mpesa))
                .unwrap();
            paid += row.payment;
            assert_eq!(receipt.repayment.interest_amount, row.interest, "backend {} period {}", name, i + 1);
            assert_eq!(receipt.position.balance_remaining, row.remaining_balance);
            let expected_status = if i + 1 == installments.len() {
                LoanStatus::Completed
            } else {
                LoanStatus::Repaying
            };
            assert_eq!(receipt.loan.status, expected_status, "backend {}", name);
        }

        let position = book.position(&loan.id).unwrap();
        assert!(position.is_cleared());
        assert_eq!(position.principal_repaid, dec!(10000));
        assert_eq!(position.total_repaid, paid);
        assert_eq!(position.repayment_count, 6);
        assert_eq!(book.get_loan(&loan.id).unwrap().status, LoanStatus::Completed);
        assert_eq!(
            ledger.current_balance("loan_kitty").unwrap(),
            dec!(40000) + paid,
            "backend {}",
            name
        );

        assert!(matches!(
            book.record_repayment(&loan.id, &RepaymentRequest::new(dec!(10), PaymentMethod::Cash)),
            Err(LedgerError::InvalidStatusTransition { .. })
        ));
    }
}

#[test]
fn test_bad_repayments_write_nothing() {
    for (name, storage) in backends() {
        let (ledger, book) = setup(storage);
        let loan = book.apply(&application(dec!(3000), dec!(0), 3)).unwrap();
        book.approve(&loan.id, None, "chairperson").unwrap();
        book.disburse(&loan.id, None).unwrap();
        let entries_before = ledger.entries("loan_kitty").unwrap().len();

        let mismatch = RepaymentRequest::new(dec!(1000), PaymentMethod::Mpesa).with_split(dec!(600), dec!(300));
        assert!(matches!(
            book.record_repayment(&loan.id, &mismatch),
            Err(LedgerError::RepaymentSplitMismatch { .. })
        ));

        let too_much = RepaymentRequest::new(dec!(5000), PaymentMethod::Cash);
        match book.record_repayment(&loan.id, &too_much) {
            Err(LedgerError::Overpayment { principal, outstanding }) => {
                assert_eq!(principal, dec!(5000));
                assert_eq!(outstanding, dec!(3000));
            }
            other => panic!("Expected Overpayment on {}, got {:?}", name, other),
        }

        assert!(book.repayments(&loan.id).unwrap().is_empty(), "backend {}", name);
        assert_eq!(ledger.entries("loan_kitty").unwrap().len(), entries_before, "backend {}", name);
        assert_eq!(book.get_loan(&loan.id).unwrap().status, LoanStatus::Disbursed);
    }
}

#[test]
fn test_failed_repayment_rolls_back() {
    for (name, storage) in backends() {
        let (ledger, book) = setup(storage);
        let loan = book.apply(&application(dec!(2000), dec!(2), 4)).unwrap();
        book.approve(&loan.id, None, "chairperson").unwrap();
        book.disburse(&loan.id, None).unwrap();

        // Same store, but repayments would post to a fund that does not exist.
        let misconfigured = LoanBook::new(
            ledger.clone(),
            LoanPolicy {
                loan_fund: Arc::from("missing_fund"),
                ..LoanPolicy::default()
            },
        );
        let err = misconfigured
            .record_repayment(&loan.id, &RepaymentRequest::new(dec!(500), PaymentMethod::Cash))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)), "backend {}", name);

        assert!(book.repayments(&loan.id).unwrap().is_empty(), "backend {}", name);
        assert_eq!(book.get_loan(&loan.id).unwrap().status, LoanStatus::Disbursed);

        // The store is still usable afterwards.
        book.record_repayment(&loan.id, &RepaymentRequest::new(dec!(500), PaymentMethod::Cash))
            .unwrap();
        assert_eq!(book.repayments(&loan.id).unwrap().len(), 1, "backend {}", name);
    }
}

#[test]
fn test_terms_locked_after_approval() {
    for (name, storage) in backends() {
        let (_, book) = setup(storage);
        let loan = book.apply(&application(dec!(5000), dec!(3), 6)).unwrap();
        book.approve(&loan.id, Some(dec!(4000)), "chairperson").unwrap();

        let revision = welfund::loans::TermsRevision {
            amount: Some(dec!(6000)),
            ..Default::default()
        };
        assert!(
            matches!(book.revise_terms(&loan.id, &revision), Err(LedgerError::TermsLocked(_))),
            "backend {}",
            name
        );

        let stored = book.get_loan(&loan.id).unwrap();
        assert_eq!(stored.approved_amount, Some(dec!(4000)));
        assert_eq!(stored.guarantors.len(), 2);
        let expected = amortization::calculate(dec!(4000), dec!(3), 6).unwrap();
        assert_eq!(stored.total_amount, Some(expected.total_amount));
    }
}
