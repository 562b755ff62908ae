use std::{fmt::Display, sync::Arc};

use prettytable::{row, Table};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Direction, EntryReference, TransactionKind};

/// One immutable record of money moving into or out of a fund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Store-wide insertion order.
    pub sequence: u64,
    pub fund_id: Arc<str>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub direction: Direction,
    pub reference: Option<EntryReference>,
    pub description: Arc<str>,
    pub actor: Option<Arc<str>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    pub fn is_credit(&self) -> bool {
        self.direction.is_credit()
    }

    pub fn signed_amount(&self) -> Decimal {
        self.direction.signed(self.amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundSummary {
    pub fund_id: Arc<str>,
    pub total_credits: Decimal,
    pub total_debits: Decimal,
    pub entry_count: u64,
}

impl FundSummary {
    pub fn empty(fund_id: Arc<str>) -> Self {
        Self {
            fund_id,
            total_credits: Decimal::ZERO,
            total_debits: Decimal::ZERO,
            entry_count: 0,
        }
    }

    pub fn add(&mut self, direction: Direction, amount: Decimal) {
        match direction {
            Direction::Credit => self.total_credits += amount,
            Direction::Debit => self.total_debits += amount,
        }
        self.entry_count += 1;
    }

    pub fn balance(&self) -> Decimal {
        self.total_credits - self.total_debits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub entry_id: Uuid,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub kind: TransactionKind,
    pub description: Arc<str>,
    pub credit: Option<Decimal>,
    pub debit: Option<Decimal>,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub fund_id: Arc<str>,
    pub lines: Vec<StatementLine>,
}

impl Statement {
    /// Builds the running-balance view of entries already in insertion order.
    pub fn from_entries(fund_id: Arc<str>, entries: &[LedgerEntry]) -> Self {
        let mut balance = Decimal::ZERO;
        let lines = entries
            .iter()
            .map(|e| {
                balance += e.signed_amount();
                StatementLine {
                    entry_id: e.id,
                    sequence: e.sequence,
                    created_at: e.created_at,
                    kind: e.kind,
                    description: e.description.clone(),
                    credit: e.is_credit().then_some(e.amount),
                    debit: (!e.is_credit()).then_some(e.amount),
                    balance,
                }
            })
            .collect();

        Self { fund_id, lines }
    }

    pub fn closing_balance(&self) -> Decimal {
        self.lines.last().map(|l| l.balance).unwrap_or(Decimal::ZERO)
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["#", "Date", "Kind", "Description", "Credit", "Debit", "Balance"]);
        table.add_empty_row();

        for line in &self.lines {
            let credit = line.credit.map(|c| c.to_string()).unwrap_or_default();
            let debit = line.debit.map(|d| d.to_string()).unwrap_or_default();
            table.add_row(row![
                line.sequence,
                line.created_at.date(),
                line.kind,
                line.description,
                credit,
                debit,
                line.balance
            ]);
        }

        write!(f, "\nFund: {}\n{}\n", self.fund_id, table)
    }
}
