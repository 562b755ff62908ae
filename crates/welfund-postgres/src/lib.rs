//! PostgreSQL storage backend for welfund.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use postgres::{Client, NoTls, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use welfund_core::{
    codec::{
        date_to_str, opt_str_to_decimal, opt_str_to_timestamp, str_to_date, str_to_decimal,
        str_to_timestamp, timestamp_to_str,
    },
    AppendEntryCommand, AppendRepaymentCommand, CreateFundCommand, Direction, EntryReference,
    Fund, FundSummary, LedgerEntry, Loan, LoanRepayment, StorageBackend, StorageError,
    TransactionId,
};

pub struct PostgresStorage {
    // `None` only while the storage is being dropped.
    client: Mutex<Option<Client>>,
    tx_counter: AtomicU64,
    active_tx: Mutex<Option<TransactionId>>,
}

fn pg_err(e: postgres::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

/// Runs `f` on a plain OS thread.
///
/// The blocking client drives its own runtime, which cannot block inside an
/// async executor thread such as the ones serving the HTTP API.
fn off_runtime<T: Send>(f: impl FnOnce() -> T + Send) -> Result<T, StorageError> {
    std::thread::scope(|scope| scope.spawn(f).join())
        .map_err(|_| StorageError::Other("PostgreSQL worker thread panicked".to_string()))
}

const ENTRY_COLUMNS: &str = "id, sequence, fund_id, kind, amount, is_credit, reference_type, reference_id, description, actor, created_at";

const LOAN_COLUMNS: &str = "id, member_id, loan_type, status, requested_amount, approved_amount, disbursed_amount, \
     interest_rate, rate_basis, term_months, monthly_payment, total_interest, total_amount, purpose, \
     approved_by, rejection_reason, applied_at, approved_at, disbursed_at, expected_completion_date";

const REPAYMENT_COLUMNS: &str = "id, sequence, loan_id, amount, payment_method, transaction_reference, \
     principal_amount, interest_amount, collected_by, notes, paid_at";

impl PostgresStorage {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = off_runtime(|| Client::connect(connection_string, NoTls))?
            .map_err(|e| StorageError::Other(format!("PostgreSQL connection failed: {}", e)))?;

        let storage = Self {
            client: Mutex::new(Some(client)),
            tx_counter: AtomicU64::new(1),
            active_tx: Mutex::new(None),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn with_client<T: Send>(
        &self,
        f: impl FnOnce(&mut Client) -> Result<T, StorageError> + Send,
    ) -> Result<T, StorageError> {
        let mut guard = self
            .client
            .lock()
            .map_err(|_| StorageError::Other("client lock poisoned".to_string()))?;
        let client = guard
            .as_mut()
            .ok_or_else(|| StorageError::Other("client is closed".to_string()))?;
        off_runtime(move || f(client))?
    }

    fn active_tx(&self) -> Result<MutexGuard<'_, Option<TransactionId>>, StorageError> {
        self.active_tx
            .lock()
            .map_err(|_| StorageError::Other("transaction lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_client(|client| {
            client
                .batch_execute(
                    "
            CREATE TABLE IF NOT EXISTS funds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                fund_id TEXT NOT NULL REFERENCES funds(id),
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                is_credit BOOLEAN NOT NULL,
                reference_type TEXT,
                reference_id TEXT,
                description TEXT NOT NULL,
                actor TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pg_ledger_fund_seq
                ON ledger_entries(fund_id, sequence);

            CREATE INDEX IF NOT EXISTS idx_pg_ledger_reference
                ON ledger_entries(reference_type, reference_id);

            CREATE TABLE IF NOT EXISTS loans (
                id TEXT PRIMARY KEY,
                member_id TEXT NOT NULL,
                loan_type TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_amount TEXT NOT NULL,
                approved_amount TEXT,
                disbursed_amount TEXT,
                interest_rate TEXT NOT NULL,
                rate_basis TEXT NOT NULL,
                term_months BIGINT NOT NULL,
                monthly_payment TEXT,
                total_interest TEXT,
                total_amount TEXT,
                purpose TEXT NOT NULL,
                approved_by TEXT,
                rejection_reason TEXT,
                applied_at TEXT NOT NULL,
                approved_at TEXT,
                disbursed_at TEXT,
                expected_completion_date TEXT
            );

            CREATE TABLE IF NOT EXISTS loan_guarantors (
                loan_id TEXT NOT NULL REFERENCES loans(id),
                position BIGINT NOT NULL,
                member_id TEXT NOT NULL,
                PRIMARY KEY (loan_id, position)
            );

            CREATE TABLE IF NOT EXISTS loan_repayments (
                id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                loan_id TEXT NOT NULL REFERENCES loans(id),
                amount TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                transaction_reference TEXT,
                principal_amount TEXT NOT NULL,
                interest_amount TEXT NOT NULL,
                collected_by TEXT,
                notes TEXT NOT NULL,
                paid_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pg_repayments_loan
                ON loan_repayments(loan_id, sequence);

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value BIGINT NOT NULL
            );

            INSERT INTO sequence_counter (id, value) VALUES (1, 0)
                ON CONFLICT (id) DO NOTHING;

            CREATE OR REPLACE FUNCTION welfund_reject_ledger_change() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'ledger entries are append-only';
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS ledger_entries_no_update ON ledger_entries;
            CREATE TRIGGER ledger_entries_no_update
                BEFORE UPDATE OR DELETE ON ledger_entries
                FOR EACH ROW EXECUTE FUNCTION welfund_reject_ledger_change();
            ",
                )
                .map_err(pg_err)
        })
    }

    fn next_sequence(client: &mut Client) -> Result<u64, StorageError> {
        let row = client
            .query_one(
                "UPDATE sequence_counter SET value = value + 1 WHERE id = 1 RETURNING value",
                &[],
            )
            .map_err(pg_err)?;
        let seq: i64 = row.try_get(0).map_err(pg_err)?;
        Ok(seq as u64)
    }

    fn fund_exists_in(client: &mut Client, fund_id: &str) -> Result<bool, StorageError> {
        let row = client
            .query_one("SELECT EXISTS(SELECT 1 FROM funds WHERE id = $1)", &[&fund_id])
            .map_err(pg_err)?;
        row.try_get(0).map_err(pg_err)
    }

    fn loan_exists_in(client: &mut Client, loan_id: &str) -> Result<bool, StorageError> {
        let row = client
            .query_one("SELECT EXISTS(SELECT 1 FROM loans WHERE id = $1)", &[&loan_id])
            .map_err(pg_err)?;
        row.try_get(0).map_err(pg_err)
    }

    fn load_guarantors(client: &mut Client, loan_id: &str) -> Result<Vec<Arc<str>>, StorageError> {
        let rows = client
            .query(
                "SELECT member_id FROM loan_guarantors WHERE loan_id = $1 ORDER BY position",
                &[&loan_id],
            )
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                let member: String = row.try_get(0).map_err(pg_err)?;
                Ok(Arc::from(member.as_str()))
            })
            .collect()
    }

    fn write_guarantors(client: &mut Client, loan: &Loan) -> Result<(), StorageError> {
        let loan_id: &str = &loan.id;
        client
            .execute("DELETE FROM loan_guarantors WHERE loan_id = $1", &[&loan_id])
            .map_err(pg_err)?;
        for (position, member_id) in loan.guarantors.iter().enumerate() {
            let position = position as i64;
            let member_id: &str = member_id;
            client
                .execute(
                    "INSERT INTO loan_guarantors (loan_id, position, member_id) VALUES ($1, $2, $3)",
                    &[&loan_id, &position, &member_id],
                )
                .map_err(pg_err)?;
        }
        Ok(())
    }

    fn write_loan(client: &mut Client, loan: &Loan, insert: bool) -> Result<u64, StorageError> {
        let id: &str = &loan.id;
        let member_id: &str = &loan.member_id;
        let requested = loan.requested_amount.to_string();
        let approved = loan.approved_amount.map(|d| d.to_string());
        let disbursed = loan.disbursed_amount.map(|d| d.to_string());
        let rate = loan.interest_rate.to_string();
        let term = i64::from(loan.term_months);
        let monthly = loan.monthly_payment.map(|d| d.to_string());
        let total_interest = loan.total_interest.map(|d| d.to_string());
        let total_amount = loan.total_amount.map(|d| d.to_string());
        let purpose: &str = &loan.purpose;
        let approved_by = loan.approved_by.as_deref();
        let rejection_reason = loan.rejection_reason.as_deref();
        let applied_at = timestamp_to_str(loan.applied_at)?;
        let approved_at = loan.approved_at.map(timestamp_to_str).transpose()?;
        let disbursed_at = loan.disbursed_at.map(timestamp_to_str).transpose()?;
        let completion = loan.expected_completion_date.map(date_to_str);

        let sql = if insert {
            format!(
                "INSERT INTO loans ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
                LOAN_COLUMNS
            )
        } else {
            "UPDATE loans SET member_id = $2, loan_type = $3, status = $4, requested_amount = $5,
                approved_amount = $6, disbursed_amount = $7, interest_rate = $8, rate_basis = $9,
                term_months = $10, monthly_payment = $11, total_interest = $12, total_amount = $13,
                purpose = $14, approved_by = $15, rejection_reason = $16, applied_at = $17,
                approved_at = $18, disbursed_at = $19, expected_completion_date = $20
             WHERE id = $1"
                .to_string()
        };

        client
            .execute(
                sql.as_str(),
                &[
                    &id,
                    &member_id,
                    &loan.loan_type.as_str(),
                    &loan.status.as_str(),
                    &requested,
                    &approved,
                    &disbursed,
                    &rate,
                    &loan.rate_basis.as_str(),
                    &term,
                    &monthly,
                    &total_interest,
                    &total_amount,
                    &purpose,
                    &approved_by,
                    &rejection_reason,
                    &applied_at,
                    &approved_at,
                    &disbursed_at,
                    &completion,
                ],
            )
            .map_err(pg_err)
    }

    fn query_loans(client: &mut Client, filter: Option<&str>) -> Result<Vec<Loan>, StorageError> {
        let rows = match filter {
            Some(loan_id) => client
                .query(
                    format!("SELECT {} FROM loans WHERE id = $1", LOAN_COLUMNS).as_str(),
                    &[&loan_id],
                )
                .map_err(pg_err)?,
            None => client
                .query(
                    format!("SELECT {} FROM loans ORDER BY applied_at, id", LOAN_COLUMNS).as_str(),
                    &[],
                )
                .map_err(pg_err)?,
        };

        let mut loans = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get(0).map_err(pg_err)?;
            let guarantors = Self::load_guarantors(client, &id)?;
            loans.push(loan_from_row(row, guarantors)?);
        }
        Ok(loans)
    }
}

fn entry_from_row(row: &Row) -> Result<LedgerEntry, StorageError> {
    let id: String = row.try_get(0).map_err(pg_err)?;
    let sequence: i64 = row.try_get(1).map_err(pg_err)?;
    let fund_id: String = row.try_get(2).map_err(pg_err)?;
    let kind: String = row.try_get(3).map_err(pg_err)?;
    let amount: String = row.try_get(4).map_err(pg_err)?;
    let is_credit: bool = row.try_get(5).map_err(pg_err)?;
    let reference_type: Option<String> = row.try_get(6).map_err(pg_err)?;
    let reference_id: Option<String> = row.try_get(7).map_err(pg_err)?;
    let description: String = row.try_get(8).map_err(pg_err)?;
    let actor: Option<String> = row.try_get(9).map_err(pg_err)?;
    let created_at: String = row.try_get(10).map_err(pg_err)?;

    let reference = match (reference_type, reference_id) {
        (Some(t), Some(rid)) => Some(EntryReference::from_parts(&t, &rid)?),
        _ => None,
    };

    Ok(LedgerEntry {
        id: Uuid::parse_str(&id).map_err(|e| StorageError::Other(e.to_string()))?,
        sequence: sequence as u64,
        fund_id: Arc::from(fund_id.as_str()),
        kind: kind.parse()?,
        amount: str_to_decimal(&amount)?,
        direction: Direction::from_credit_flag(is_credit),
        reference,
        description: Arc::from(description.as_str()),
        actor: actor.as_deref().map(Arc::from),
        created_at: str_to_timestamp(&created_at)?,
    })
}

fn loan_from_row(row: &Row, guarantors: Vec<Arc<str>>) -> Result<Loan, StorageError> {
    let text = |idx: usize| -> Result<String, StorageError> { row.try_get(idx).map_err(pg_err) };
    let opt_text =
        |idx: usize| -> Result<Option<String>, StorageError> { row.try_get(idx).map_err(pg_err) };

    let term: i64 = row.try_get(9).map_err(pg_err)?;

    Ok(Loan {
        id: Arc::from(text(0)?.as_str()),
        member_id: Arc::from(text(1)?.as_str()),
        loan_type: text(2)?.parse()?,
        status: text(3)?.parse()?,
        requested_amount: str_to_decimal(&text(4)?)?,
        approved_amount: opt_str_to_decimal(opt_text(5)?)?,
        disbursed_amount: opt_str_to_decimal(opt_text(6)?)?,
        interest_rate: str_to_decimal(&text(7)?)?,
        rate_basis: text(8)?.parse()?,
        term_months: u32::try_from(term)
            .map_err(|_| StorageError::Other(format!("Invalid term: {}", term)))?,
        monthly_payment: opt_str_to_decimal(opt_text(10)?)?,
        total_interest: opt_str_to_decimal(opt_text(11)?)?,
        total_amount: opt_str_to_decimal(opt_text(12)?)?,
        purpose: Arc::from(text(13)?.as_str()),
        guarantors,
        approved_by: opt_text(14)?.as_deref().map(Arc::from),
        rejection_reason: opt_text(15)?.as_deref().map(Arc::from),
        applied_at: str_to_timestamp(&text(16)?)?,
        approved_at: opt_str_to_timestamp(opt_text(17)?)?,
        disbursed_at: opt_str_to_timestamp(opt_text(18)?)?,
        expected_completion_date: opt_text(19)?.as_deref().map(str_to_date).transpose()?,
    })
}

fn repayment_from_row(row: &Row) -> Result<LoanRepayment, StorageError> {
    let text = |idx: usize| -> Result<String, StorageError> { row.try_get(idx).map_err(pg_err) };
    let opt_text =
        |idx: usize| -> Result<Option<String>, StorageError> { row.try_get(idx).map_err(pg_err) };

    let sequence: i64 = row.try_get(1).map_err(pg_err)?;

    Ok(LoanRepayment {
        id: Uuid::parse_str(&text(0)?).map_err(|e| StorageError::Other(e.to_string()))?,
        sequence: sequence as u64,
        loan_id: Arc::from(text(2)?.as_str()),
        amount: str_to_decimal(&text(3)?)?,
        payment_method: text(4)?.parse()?,
        transaction_reference: opt_text(5)?.as_deref().map(Arc::from),
        principal_amount: str_to_decimal(&text(6)?)?,
        interest_amount: str_to_decimal(&text(7)?)?,
        collected_by: opt_text(8)?.as_deref().map(Arc::from),
        notes: Arc::from(text(9)?.as_str()),
        paid_at: str_to_timestamp(&text(10)?)?,
    })
}

fn fund_from_row(row: &Row) -> Result<Fund, StorageError> {
    let id: String = row.try_get(0).map_err(pg_err)?;
    let name: String = row.try_get(1).map_err(pg_err)?;
    let kind: String = row.try_get(2).map_err(pg_err)?;
    let created_at: String = row.try_get(3).map_err(pg_err)?;
    Ok(Fund {
        id: Arc::from(id.as_str()),
        name: Arc::from(name.as_str()),
        kind: kind.parse()?,
        created_at: str_to_timestamp(&created_at)?,
    })
}

impl Drop for PostgresStorage {
    fn drop(&mut self) {
        // Closing the client shuts down its runtime, which must also happen off
        // any async executor thread.
        if let Some(client) = self.client.get_mut().ok().and_then(Option::take) {
            if off_runtime(move || drop(client)).is_err() {
                tracing::warn!("PostgreSQL client did not close cleanly");
            }
        }
    }
}

impl StorageBackend for PostgresStorage {
    fn create_fund(&self, command: &CreateFundCommand) -> Result<Fund, StorageError> {
        self.with_client(|client| {
            if Self::fund_exists_in(client, &command.id)? {
                return Err(StorageError::FundAlreadyExists(command.id.to_string()));
            }
            let fund = Fund {
                id: command.id.clone(),
                name: command.name.clone(),
                kind: command.kind,
                created_at: OffsetDateTime::now_utc(),
            };
            let id: &str = &fund.id;
            let name: &str = &fund.name;
            let created_at = timestamp_to_str(fund.created_at)?;
            client
                .execute(
                    "INSERT INTO funds (id, name, kind, created_at) VALUES ($1, $2, $3, $4)",
                    &[&id, &name, &fund.kind.as_str(), &created_at],
                )
                .map_err(pg_err)?;
            Ok(fund)
        })
    }

    fn get_fund(&self, fund_id: &str) -> Result<Fund, StorageError> {
        self.with_client(|client| {
            let row = client
                .query_opt("SELECT id, name, kind, created_at FROM funds WHERE id = $1", &[&fund_id])
                .map_err(pg_err)?
                .ok_or_else(|| StorageError::FundNotFound(fund_id.to_string()))?;
            fund_from_row(&row)
        })
    }

    fn list_funds(&self) -> Result<Vec<Fund>, StorageError> {
        self.with_client(|client| {
            let rows = client
                .query("SELECT id, name, kind, created_at FROM funds ORDER BY id", &[])
                .map_err(pg_err)?;
            rows.iter().map(fund_from_row).collect()
        })
    }

    fn fund_exists(&self, fund_id: &str) -> bool {
        self.with_client(|client| Self::fund_exists_in(client, fund_id)).unwrap_or(false)
    }

    fn append_entry(&self, command: &AppendEntryCommand) -> Result<LedgerEntry, StorageError> {
        self.with_client(|client| {
            if !Self::fund_exists_in(client, &command.fund_id)? {
                return Err(StorageError::FundNotFound(command.fund_id.to_string()));
            }

            let entry = LedgerEntry {
                id: Uuid::new_v4(),
                sequence: Self::next_sequence(client)?,
                fund_id: command.fund_id.clone(),
                kind: command.kind,
                amount: command.amount,
                direction: command.direction,
                reference: command.reference.clone(),
                description: command.description.clone(),
                actor: command.actor.clone(),
                created_at: OffsetDateTime::now_utc(),
            };

            let id = entry.id.to_string();
            let sequence = entry.sequence as i64;
            let fund_id: &str = &entry.fund_id;
            let amount = entry.amount.to_string();
            let is_credit = entry.direction.is_credit();
            let reference_type = entry.reference.as_ref().map(|r| r.type_str());
            let reference_id = entry.reference.as_ref().map(|r| r.id_string());
            let description: &str = &entry.description;
            let actor = entry.actor.as_deref();
            let created_at = timestamp_to_str(entry.created_at)?;

            client
                .execute(
                    format!(
                        "INSERT INTO ledger_entries ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                        ENTRY_COLUMNS
                    )
                    .as_str(),
                    &[
                        &id,
                        &sequence,
                        &fund_id,
                        &entry.kind.as_str(),
                        &amount,
                        &is_credit,
                        &reference_type,
                        &reference_id,
                        &description,
                        &actor,
                        &created_at,
                    ],
                )
                .map_err(pg_err)?;

            Ok(entry)
        })
    }

    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry, StorageError> {
        self.with_client(|client| {
            let id = entry_id.to_string();
            let row = client
                .query_opt(
                    format!("SELECT {} FROM ledger_entries WHERE id = $1", ENTRY_COLUMNS).as_str(),
                    &[&id],
                )
                .map_err(pg_err)?
                .ok_or(StorageError::EntryNotFound(entry_id))?;
            entry_from_row(&row)
        })
    }

    fn list_entries(&self, fund_id: &str) -> Result<Vec<LedgerEntry>, StorageError> {
        self.with_client(|client| {
            if !Self::fund_exists_in(client, fund_id)? {
                return Err(StorageError::FundNotFound(fund_id.to_string()));
            }
            let rows = client
                .query(
                    format!(
                        "SELECT {} FROM ledger_entries WHERE fund_id = $1 ORDER BY sequence",
                        ENTRY_COLUMNS
                    )
                    .as_str(),
                    &[&fund_id],
                )
                .map_err(pg_err)?;
            rows.iter().map(entry_from_row).collect()
        })
    }

    fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StorageError> {
        self.with_client(|client| {
            let id = entry_id.to_string();
            let row = client
                .query_opt(
                    format!(
                        "SELECT {} FROM ledger_entries WHERE reference_type = 'entry' AND reference_id = $1 ORDER BY sequence LIMIT 1",
                        ENTRY_COLUMNS
                    )
                    .as_str(),
                    &[&id],
                )
                .map_err(pg_err)?;
            row.as_ref().map(entry_from_row).transpose()
        })
    }

    fn fund_summary(&self, fund_id: &str) -> Result<FundSummary, StorageError> {
        self.with_client(|client| {
            if !Self::fund_exists_in(client, fund_id)? {
                return Err(StorageError::FundNotFound(fund_id.to_string()));
            }

            let row = client
                .query_one(
                    "SELECT
                        COALESCE(SUM(amount::numeric) FILTER (WHERE is_credit), 0)::text,
                        COALESCE(SUM(amount::numeric) FILTER (WHERE NOT is_credit), 0)::text,
                        COUNT(*)
                     FROM ledger_entries WHERE fund_id = $1",
                    &[&fund_id],
                )
                .map_err(pg_err)?;

            let credits: String = row.try_get(0).map_err(pg_err)?;
            let debits: String = row.try_get(1).map_err(pg_err)?;
            let count: i64 = row.try_get(2).map_err(pg_err)?;

            Ok(FundSummary {
                fund_id: Arc::from(fund_id),
                total_credits: str_to_decimal(&credits)?,
                total_debits: str_to_decimal(&debits)?,
                entry_count: count as u64,
            })
        })
    }

    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        self.with_client(|client| {
            if Self::loan_exists_in(client, &loan.id)? {
                return Err(StorageError::LoanAlreadyExists(loan.id.to_string()));
            }
            Self::write_loan(client, loan, true)?;
            Self::write_guarantors(client, loan)
        })
    }

    fn update_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        self.with_client(|client| {
            if Self::write_loan(client, loan, false)? == 0 {
                return Err(StorageError::LoanNotFound(loan.id.to_string()));
            }
            Self::write_guarantors(client, loan)
        })
    }

    fn get_loan(&self, loan_id: &str) -> Result<Loan, StorageError> {
        self.with_client(|client| {
            Self::query_loans(client, Some(loan_id))?
                .pop()
                .ok_or_else(|| StorageError::LoanNotFound(loan_id.to_string()))
        })
    }

    fn list_loans(&self) -> Result<Vec<Loan>, StorageError> {
        self.with_client(|client| Self::query_loans(client, None))
    }

    fn append_repayment(&self, command: &AppendRepaymentCommand) -> Result<LoanRepayment, StorageError> {
        self.with_client(|client| {
            if !Self::loan_exists_in(client, &command.loan_id)? {
                return Err(StorageError::LoanNotFound(command.loan_id.to_string()));
            }

            let repayment = LoanRepayment {
                id: Uuid::new_v4(),
                sequence: Self::next_sequence(client)?,
                loan_id: command.loan_id.clone(),
                amount: command.amount,
                payment_method: command.payment_method,
                transaction_reference: command.transaction_reference.clone(),
                principal_amount: command.principal_amount,
                interest_amount: command.interest_amount,
                collected_by: command.collected_by.clone(),
                notes: command.notes.clone(),
                paid_at: OffsetDateTime::now_utc(),
            };

            let id = repayment.id.to_string();
            let sequence = repayment.sequence as i64;
            let loan_id: &str = &repayment.loan_id;
            let amount = repayment.amount.to_string();
            let reference = repayment.transaction_reference.as_deref();
            let principal = repayment.principal_amount.to_string();
            let interest = repayment.interest_amount.to_string();
            let collected_by = repayment.collected_by.as_deref();
            let notes: &str = &repayment.notes;
            let paid_at = timestamp_to_str(repayment.paid_at)?;

            client
                .execute(
                    format!(
                        "INSERT INTO loan_repayments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                        REPAYMENT_COLUMNS
                    )
                    .as_str(),
                    &[
                        &id,
                        &sequence,
                        &loan_id,
                        &amount,
                        &repayment.payment_method.as_str(),
                        &reference,
                        &principal,
                        &interest,
                        &collected_by,
                        &notes,
                        &paid_at,
                    ],
                )
                .map_err(pg_err)?;

            Ok(repayment)
        })
    }

    fn list_repayments(&self, loan_id: &str) -> Result<Vec<LoanRepayment>, StorageError> {
        self.with_client(|client| {
            if !Self::loan_exists_in(client, loan_id)? {
                return Err(StorageError::LoanNotFound(loan_id.to_string()));
            }
            let rows = client
                .query(
                    format!(
                        "SELECT {} FROM loan_repayments WHERE loan_id = $1 ORDER BY sequence",
                        REPAYMENT_COLUMNS
                    )
                    .as_str(),
                    &[&loan_id],
                )
                .map_err(pg_err)?;
            rows.iter().map(repayment_from_row).collect()
        })
    }

    // Savepoints need an enclosing transaction block in PostgreSQL, so the
    // outer transaction is opened directly.
    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut active = self.active_tx()?;
        self.with_client(|client| client.batch_execute("BEGIN").map_err(pg_err))?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *active = Some(tx_id);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx()?;
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        self.with_client(|client| client.batch_execute("COMMIT").map_err(pg_err))?;
        *active = None;
        tracing::debug!(tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx()?;
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        self.with_client(|client| client.batch_execute("ROLLBACK").map_err(pg_err))?;
        *active = None;
        tracing::debug!(tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}
