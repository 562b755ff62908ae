//! Loan book: applications, approval, disbursement and repayments.
//!
//! Amortization figures are computed once, when a loan is approved, and the
//! loan's amount, rate and term cannot change after that. Repaid totals and
//! the outstanding balance are projected from the repayment history.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use welfund_core::{
    amortization::{self, add_months, round_currency},
    AppendEntryCommand, AppendRepaymentCommand, EntryReference, LedgerEntry, LedgerError, Loan,
    LoanPosition, LoanRepayment, LoanStatus, LoanType, PaymentMethod, RateBasis, TransactionKind,
};

use crate::{config::Config, ledger::reject, ledger::Ledger, telemetry::LOAN_TRANSITIONS};

#[derive(Debug, Clone)]
pub struct LoanPolicy {
    /// Fund that disbursements are paid from and repayments paid into.
    pub loan_fund: Arc<str>,
    pub default_interest_rate: Decimal,
    pub default_term_months: u32,
    pub rate_basis: RateBasis,
    pub max_guarantors: usize,
}

impl Default for LoanPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl LoanPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            loan_fund: Arc::from(config.funds.loan_fund.as_str()),
            default_interest_rate: config.loans.default_interest_rate,
            default_term_months: config.loans.default_term_months,
            rate_basis: config.loans.rate_basis,
            max_guarantors: config.loans.max_guarantors,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoanApplication {
    pub member_id: String,
    pub loan_type: LoanType,
    pub amount: Decimal,
    #[serde(default)]
    pub interest_rate: Option<Decimal>,
    #[serde(default)]
    pub term_months: Option<u32>,
    #[serde(default)]
    pub rate_basis: Option<RateBasis>,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub guarantors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TermsRevision {
    pub amount: Option<Decimal>,
    pub interest_rate: Option<Decimal>,
    pub term_months: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepaymentRequest {
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub transaction_reference: Option<String>,
    /// Leave both portions unset to split by one period's interest.
    #[serde(default)]
    pub principal_amount: Option<Decimal>,
    #[serde(default)]
    pub interest_amount: Option<Decimal>,
    #[serde(default)]
    pub collected_by: Option<String>,
    #[serde(default)]
    pub notes: String,
}

impl RepaymentRequest {
    pub fn new(amount: Decimal, payment_method: PaymentMethod) -> Self {
        Self {
            amount,
            payment_method,
            transaction_reference: None,
            principal_amount: None,
            interest_amount: None,
            collected_by: None,
            notes: String::new(),
        }
    }

    pub fn with_split(mut self, principal: Decimal, interest: Decimal) -> Self {
        self.principal_amount = Some(principal);
        self.interest_amount = Some(interest);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Disbursement {
    pub loan: Loan,
    pub entry: LedgerEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepaymentReceipt {
    pub repayment: LoanRepayment,
    pub entry: LedgerEntry,
    pub loan: Loan,
    pub position: LoanPosition,
}

fn new_loan_id() -> Arc<str> {
    let hex = Uuid::new_v4().simple().to_string();
    Arc::from(format!("LN-{}", hex[..8].to_ascii_uppercase()).as_str())
}

fn invalid(reason: impl Into<String>) -> LedgerError {
    LedgerError::InvalidApplication(reason.into())
}

/// Splits a repayment into principal and interest portions.
fn split_repayment(
    request: &RepaymentRequest,
    outstanding: Decimal,
    periodic_rate: Decimal,
) -> Result<(Decimal, Decimal), LedgerError> {
    let amount = request.amount;
    let mismatch = |principal, interest| LedgerError::RepaymentSplitMismatch {
        amount,
        principal,
        interest,
    };

    let (principal, interest) = match (request.principal_amount, request.interest_amount) {
        (Some(p), Some(i)) => (p, i),
        (Some(p), None) => (p, amount - p),
        (None, Some(i)) => (amount - i, i),
        (None, None) => {
            let interest = round_currency(outstanding * periodic_rate).min(amount);
            (amount - interest, interest)
        }
    };

    if principal < Decimal::ZERO || interest < Decimal::ZERO || principal + interest != amount {
        return Err(mismatch(principal, interest));
    }
    if principal > outstanding {
        return Err(LedgerError::Overpayment {
            principal,
            outstanding,
        });
    }
    Ok((principal, interest))
}

#[derive(Clone)]
pub struct LoanBook {
    ledger: Ledger,
    policy: LoanPolicy,
}

impl LoanBook {
    pub fn new(ledger: Ledger, policy: LoanPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &LoanPolicy {
        &self.policy
    }

    /// Runs `f` inside a storage transaction, rolling back on any error.
    fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        let storage = self.ledger.storage();
        let tx_id = storage.begin_transaction()?;
        match f() {
            Ok(value) => {
                storage.commit_transaction(tx_id)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = storage.rollback_transaction(tx_id) {
                    tracing::error!(tx_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn transition(&self, loan: &mut Loan, next: LoanStatus) -> Result<(), LedgerError> {
        if !loan.status.can_transition_to(next) {
            return Err(LedgerError::InvalidStatusTransition {
                loan_id: loan.id.to_string(),
                from: loan.status,
                to: next,
            });
        }
        tracing::info!(loan_id = %loan.id, from = loan.status.as_str(), to = next.as_str(), "Loan status changed");
        metrics::increment_counter!(LOAN_TRANSITIONS, "to" => next.as_str());
        loan.status = next;
        Ok(())
    }

    fn validate_guarantors(&self, member_id: &str, guarantors: &[String]) -> Result<(), LedgerError> {
        if guarantors.len() > self.policy.max_guarantors {
            return Err(invalid(format!(
                "at most {} guarantors allowed, got {}",
                self.policy.max_guarantors,
                guarantors.len()
            )));
        }
        for (i, g) in guarantors.iter().enumerate() {
            if g.trim().is_empty() {
                return Err(invalid("guarantor id cannot be empty"));
            }
            if g == member_id {
                return Err(invalid("a borrower cannot guarantee their own loan"));
            }
            if guarantors[..i].contains(g) {
                return Err(invalid(format!("guarantor {} listed twice", g)));
            }
        }
        Ok(())
    }

    pub fn apply(&self, application: &LoanApplication) -> Result<Loan, LedgerError> {
        let rate = application
            .interest_rate
            .unwrap_or(self.policy.default_interest_rate);
        let term = application
            .term_months
            .unwrap_or(self.policy.default_term_months);
        let basis = application.rate_basis.unwrap_or(self.policy.rate_basis);

        let checked = (|| {
            if application.member_id.trim().is_empty() {
                return Err(invalid("member id cannot be empty"));
            }
            self.validate_guarantors(&application.member_id, &application.guarantors)?;
            amortization::calculate_with_basis(application.amount, rate, term, basis).map(|_| ())
        })();
        checked.map_err(|e| reject("apply", e))?;

        let loan = Loan {
            id: new_loan_id(),
            member_id: Arc::from(application.member_id.as_str()),
            loan_type: application.loan_type,
            status: LoanStatus::Applied,
            requested_amount: application.amount,
            approved_amount: None,
            disbursed_amount: None,
            interest_rate: rate,
            rate_basis: basis,
            term_months: term,
            monthly_payment: None,
            total_interest: None,
            total_amount: None,
            purpose: Arc::from(application.purpose.as_str()),
            guarantors: application
                .guarantors
                .iter()
                .map(|g| Arc::from(g.as_str()))
                .collect(),
            approved_by: None,
            rejection_reason: None,
            applied_at: OffsetDateTime::now_utc(),
            approved_at: None,
            disbursed_at: None,
            expected_completion_date: None,
        };

        let _guard = self.ledger.lock_writes()?;
        self.ledger.storage().create_loan(&loan)?;
        tracing::info!(loan_id = %loan.id, member_id = %loan.member_id, amount = %loan.requested_amount, "Loan application received");
        Ok(loan)
    }

    /// Changes amount, rate or term of a loan that has not been decided yet.
    pub fn revise_terms(&self, loan_id: &str, revision: &TermsRevision) -> Result<Loan, LedgerError> {
        let _guard = self.ledger.lock_writes()?;
        let mut loan = self.ledger.storage().get_loan(loan_id)?;
        if loan.status != LoanStatus::Applied {
            return Err(LedgerError::TermsLocked(loan.id.to_string()));
        }

        let amount = revision.amount.unwrap_or(loan.requested_amount);
        let rate = revision.interest_rate.unwrap_or(loan.interest_rate);
        let term = revision.term_months.unwrap_or(loan.term_months);
        amortization::calculate_with_basis(amount, rate, term, loan.rate_basis)
            .map_err(|e| reject("revise_terms", e))?;

        loan.requested_amount = amount;
        loan.interest_rate = rate;
        loan.term_months = term;
        self.ledger.storage().update_loan(&loan)?;
        tracing::info!(loan_id = %loan.id, amount = %amount, rate = %rate, term, "Loan terms revised");
        Ok(loan)
    }

    pub fn approve(
        &self,
        loan_id: &str,
        approved_amount: Option<Decimal>,
        approver: &str,
    ) -> Result<Loan, LedgerError> {
        let _guard = self.ledger.lock_writes()?;
        let mut loan = self.ledger.storage().get_loan(loan_id)?;
        self.transition(&mut loan, LoanStatus::Approved)?;

        let principal = approved_amount.unwrap_or(loan.requested_amount);
        let figures = amortization::calculate_with_basis(
            principal,
            loan.interest_rate,
            loan.term_months,
            loan.rate_basis,
        )
        .map_err(|e| reject("approve", e))?;

        loan.approved_amount = Some(principal);
        loan.monthly_payment = Some(figures.monthly_payment);
        loan.total_interest = Some(figures.total_interest);
        loan.total_amount = Some(figures.total_amount);
        loan.approved_by = Some(Arc::from(approver));
        loan.approved_at = Some(OffsetDateTime::now_utc());
        self.ledger.storage().update_loan(&loan)?;
        Ok(loan)
    }

    pub fn reject(&self, loan_id: &str, reason: &str) -> Result<Loan, LedgerError> {
        let _guard = self.ledger.lock_writes()?;
        let mut loan = self.ledger.storage().get_loan(loan_id)?;
        self.transition(&mut loan, LoanStatus::Rejected)?;
        loan.rejection_reason = Some(Arc::from(reason));
        self.ledger.storage().update_loan(&loan)?;
        Ok(loan)
    }

    /// Pays the approved amount out of the loan fund.
    pub fn disburse(&self, loan_id: &str, actor: Option<&str>) -> Result<Disbursement, LedgerError> {
        let _guard = self.ledger.lock_writes()?;
        let mut loan = self.ledger.storage().get_loan(loan_id)?;
        self.transition(&mut loan, LoanStatus::Disbursed)?;

        let amount = loan.principal();
        let now = OffsetDateTime::now_utc();
        loan.disbursed_amount = Some(amount);
        loan.disbursed_at = Some(now);
        loan.expected_completion_date = add_months(now.date(), loan.term_months);

        let command = AppendEntryCommand::debit(
            &self.policy.loan_fund,
            TransactionKind::LoanDisbursement,
            amount,
            &format!("Loan disbursement {}", loan.id),
        )
        .with_reference(EntryReference::Loan(loan.id.clone()))
        .with_actor(actor);

        let entry = self.in_transaction(|| {
            let entry = self.ledger.append(&command)?;
            self.ledger.storage().update_loan(&loan)?;
            Ok(entry)
        })?;

        Ok(Disbursement { loan, entry })
    }

    pub fn record_repayment(
        &self,
        loan_id: &str,
        request: &RepaymentRequest,
    ) -> Result<RepaymentReceipt, LedgerError> {
        let _guard = self.ledger.lock_writes()?;
        let storage = self.ledger.storage();
        let mut loan = storage.get_loan(loan_id)?;
        if !loan.status.accepts_repayments() {
            return Err(LedgerError::InvalidStatusTransition {
                loan_id: loan.id.to_string(),
                from: loan.status,
                to: LoanStatus::Repaying,
            });
        }
        if request.amount <= Decimal::ZERO {
            return Err(reject("record_repayment", LedgerError::NonPositiveAmount(request.amount)));
        }

        let history = storage.list_repayments(loan_id)?;
        let before = LoanPosition::project(&loan, &history);
        let (principal, interest) = split_repayment(
            request,
            before.balance_remaining,
            loan.rate_basis.periodic_rate(loan.interest_rate),
        )
        .map_err(|e| reject("record_repayment", e))?;

        let command = AppendRepaymentCommand {
            loan_id: loan.id.clone(),
            amount: request.amount,
            payment_method: request.payment_method,
            transaction_reference: request.transaction_reference.as_deref().map(Arc::from),
            principal_amount: principal,
            interest_amount: interest,
            collected_by: request.collected_by.as_deref().map(Arc::from),
            notes: Arc::from(request.notes.as_str()),
        };

        let (repayment, entry, position) = self.in_transaction(|| {
            let repayment = storage.append_repayment(&command)?;
            let entry = self.ledger.append(
                &AppendEntryCommand::credit(
                    &self.policy.loan_fund,
                    TransactionKind::LoanRepayment,
                    repayment.amount,
                    &format!("Repayment for loan {}", loan.id),
                )
                .with_reference(EntryReference::Repayment(Arc::from(repayment.id.to_string().as_str())))
                .with_actor(request.collected_by.as_deref()),
            )?;

            let mut all = history.clone();
            all.push(repayment.clone());
            let position = LoanPosition::project(&loan, &all);

            let status_before = loan.status;
            if loan.status != LoanStatus::Repaying {
                self.transition(&mut loan, LoanStatus::Repaying)?;
            }
            if position.is_cleared() {
                self.transition(&mut loan, LoanStatus::Completed)?;
            }
            if loan.status != status_before {
                storage.update_loan(&loan)?;
            }
            Ok((repayment, entry, position))
        })?;

        tracing::info!(
            loan_id = %loan.id,
            repayment_id = %repayment.id,
            principal = %repayment.principal_amount,
            interest = %repayment.interest_amount,
            balance = %position.balance_remaining,
            "Repayment recorded"
        );

        Ok(RepaymentReceipt {
            repayment,
            entry,
            loan,
            position,
        })
    }

    pub fn mark_defaulted(&self, loan_id: &str) -> Result<Loan, LedgerError> {
        self.change_status(loan_id, LoanStatus::Defaulted)
    }

    /// Closes a defaulted loan. The ledger is untouched: the money left the
    /// fund at disbursement.
    pub fn write_off(&self, loan_id: &str) -> Result<Loan, LedgerError> {
        self.change_status(loan_id, LoanStatus::WrittenOff)
    }

    fn change_status(&self, loan_id: &str, next: LoanStatus) -> Result<Loan, LedgerError> {
        let _guard = self.ledger.lock_writes()?;
        let mut loan = self.ledger.storage().get_loan(loan_id)?;
        self.transition(&mut loan, next)?;
        self.ledger.storage().update_loan(&loan)?;
        Ok(loan)
    }

    pub fn position(&self, loan_id: &str) -> Result<LoanPosition, LedgerError> {
        let _guard = self.ledger.lock_reads()?;
        let loan = self.ledger.storage().get_loan(loan_id)?;
        let repayments = self.ledger.storage().list_repayments(loan_id)?;
        Ok(LoanPosition::project(&loan, &repayments))
    }

    pub fn get_loan(&self, loan_id: &str) -> Result<Loan, LedgerError> {
        let _guard = self.ledger.lock_reads()?;
        Ok(self.ledger.storage().get_loan(loan_id)?)
    }

    pub fn list_loans(&self) -> Result<Vec<Loan>, LedgerError> {
        let _guard = self.ledger.lock_reads()?;
        Ok(self.ledger.storage().list_loans()?)
    }

    pub fn repayments(&self, loan_id: &str) -> Result<Vec<LoanRepayment>, LedgerError> {
        let _guard = self.ledger.lock_reads()?;
        Ok(self.ledger.storage().list_repayments(loan_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use welfund_core::FundKind;
    use welfund_memory::InMemoryStorage;

    fn book() -> LoanBook {
        let ledger = Ledger::new(Arc::new(InMemoryStorage::new()));
        ledger.create_fund("loan_kitty", "Loan Kitty", FundKind::LoanKitty).unwrap();
        LoanBook::new(ledger, LoanPolicy::default())
    }

    fn application(amount: Decimal) -> LoanApplication {
        LoanApplication {
            member_id: "m-100".to_string(),
            loan_type: LoanType::BikeRepair,
            amount,
            interest_rate: Some(dec!(5)),
            term_months: Some(6),
            rate_basis: None,
            purpose: "engine overhaul".to_string(),
            guarantors: vec!["m-200".to_string()],
        }
    }

    #[test]
    fn test_loan_ids_are_prefixed() {
        let id = new_loan_id();
        assert!(id.starts_with("LN-"));
        assert_eq!(id.len(), 11);
    }

    #[test]
    fn test_apply_rejects_bad_guarantors() {
        let book = book();
        let mut app = application(dec!(1000));
        app.guarantors = vec!["m-100".to_string()];
        assert!(matches!(book.apply(&app), Err(LedgerError::InvalidApplication(_))));

        app.guarantors = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(matches!(book.apply(&app), Err(LedgerError::InvalidApplication(_))));

        app.guarantors = vec!["a".to_string(), "a".to_string()];
        assert!(matches!(book.apply(&app), Err(LedgerError::InvalidApplication(_))));

        assert!(book.list_loans().unwrap().is_empty());
    }

    #[test]
    fn test_apply_rejects_zero_term() {
        let book = book();
        let mut app = application(dec!(1000));
        app.term_months = Some(0);
        assert!(matches!(book.apply(&app), Err(LedgerError::InvalidLoanParameters(_))));
    }

    #[test]
    fn test_approval_computes_figures_once() {
        let book = book();
        let loan = book.apply(&application(dec!(12000))).unwrap();
        assert_eq!(loan.status, LoanStatus::Applied);
        assert_eq!(loan.monthly_payment, None);

        let revised = book
            .revise_terms(&loan.id, &TermsRevision { amount: Some(dec!(10000)), ..Default::default() })
            .unwrap();
        assert_eq!(revised.requested_amount, dec!(10000));

        let approved = book.approve(&loan.id, None, "chair").unwrap();
        let expected = amortization::calculate(dec!(10000), dec!(5), 6).unwrap();
        assert_eq!(approved.monthly_payment, Some(expected.monthly_payment));
        assert_eq!(approved.total_amount, Some(expected.total_amount));
        assert_eq!(approved.approved_by.as_deref(), Some("chair"));

        match book.revise_terms(&loan.id, &TermsRevision { term_months: Some(12), ..Default::default() }) {
            Err(LedgerError::TermsLocked(id)) => assert_eq!(id, loan.id.to_string()),
            other => panic!("Expected TermsLocked, got {:?}", other),
        }
    }

    #[test]
    fn test_default_split_takes_one_period_interest() {
        let request = RepaymentRequest::new(dec!(2000), PaymentMethod::Cash);
        let (principal, interest) = split_repayment(&request, dec!(10000), dec!(0.05)).unwrap();
        assert_eq!(interest, dec!(500.00));
        assert_eq!(principal, dec!(1500.00));

        // Interest is capped at the amount paid.
        let small = RepaymentRequest::new(dec!(100), PaymentMethod::Cash);
        assert_eq!(split_repayment(&small, dec!(10000), dec!(0.05)).unwrap(), (dec!(0), dec!(100)));
    }

    #[test]
    fn test_split_with_one_portion() {
        let mut request = RepaymentRequest::new(dec!(2000), PaymentMethod::Mpesa);
        request.interest_amount = Some(dec!(300));
        assert_eq!(split_repayment(&request, dec!(5000), dec!(0.05)).unwrap(), (dec!(1700), dec!(300)));

        request.interest_amount = Some(dec!(2500));
        assert!(matches!(
            split_repayment(&request, dec!(5000), dec!(0.05)),
            Err(LedgerError::RepaymentSplitMismatch { .. })
        ));
    }

    #[test]
    fn test_reject_and_write_off_paths() {
        let book = book();
        let loan = book.apply(&application(dec!(1000))).unwrap();
        let rejected = book.reject(&loan.id, "insufficient contributions").unwrap();
        assert_eq!(rejected.status, LoanStatus::Rejected);
        assert!(matches!(
            book.approve(&loan.id, None, "chair"),
            Err(LedgerError::InvalidStatusTransition { .. })
        ));

        let loan = book.apply(&application(dec!(1000))).unwrap();
        book.approve(&loan.id, None, "chair").unwrap();
        assert!(matches!(book.write_off(&loan.id), Err(LedgerError::InvalidStatusTransition { .. })));
        book.disburse(&loan.id, None).unwrap();
        book.mark_defaulted(&loan.id).unwrap();
        let written_off = book.write_off(&loan.id).unwrap();
        assert_eq!(written_off.status, LoanStatus::WrittenOff);
    }
}
