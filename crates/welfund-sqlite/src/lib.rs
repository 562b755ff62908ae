//! SQLite storage backend for welfund.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use rusqlite::{params, Connection, OptionalExtension, Row};
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

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
    active_tx: Mutex<Option<TransactionId>>,
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

const ENTRY_COLUMNS: &str = "id, sequence, fund_id, kind, amount, is_credit, reference_type, reference_id, description, actor, created_at";

const LOAN_COLUMNS: &str = "id, member_id, loan_type, status, requested_amount, approved_amount, disbursed_amount, \
     interest_rate, rate_basis, term_months, monthly_payment, total_interest, total_amount, purpose, \
     approved_by, rejection_reason, applied_at, approved_at, disbursed_at, expected_completion_date";

const REPAYMENT_COLUMNS: &str = "id, sequence, loan_id, amount, payment_method, transaction_reference, \
     principal_amount, interest_amount, collected_by, notes, paid_at";

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(sql_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
            active_tx: Mutex::new(None),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Other("connection lock poisoned".to_string()))
    }

    fn active_tx(&self) -> Result<MutexGuard<'_, Option<TransactionId>>, StorageError> {
        self.active_tx
            .lock()
            .map_err(|_| StorageError::Other("transaction lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS funds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL UNIQUE,
                fund_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                is_credit INTEGER NOT NULL,
                reference_type TEXT,
                reference_id TEXT,
                description TEXT NOT NULL,
                actor TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (fund_id) REFERENCES funds(id)
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_fund_seq
                ON ledger_entries(fund_id, sequence);

            CREATE INDEX IF NOT EXISTS idx_ledger_reference
                ON ledger_entries(reference_type, reference_id);

            CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
                BEFORE UPDATE ON ledger_entries
                BEGIN SELECT RAISE(ABORT, 'ledger entries are append-only'); END;

            CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
                BEFORE DELETE ON ledger_entries
                BEGIN SELECT RAISE(ABORT, 'ledger entries are append-only'); END;

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
                term_months INTEGER NOT NULL,
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
                loan_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                member_id TEXT NOT NULL,
                PRIMARY KEY (loan_id, position),
                FOREIGN KEY (loan_id) REFERENCES loans(id)
            );

            CREATE TABLE IF NOT EXISTS loan_repayments (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL UNIQUE,
                loan_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                transaction_reference TEXT,
                principal_amount TEXT NOT NULL,
                interest_amount TEXT NOT NULL,
                collected_by TEXT,
                notes TEXT NOT NULL,
                paid_at TEXT NOT NULL,
                FOREIGN KEY (loan_id) REFERENCES loans(id)
            );

            CREATE INDEX IF NOT EXISTS idx_repayments_loan
                ON loan_repayments(loan_id, sequence);

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO sequence_counter (id, value) VALUES (1, 0);
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn next_sequence(conn: &Connection) -> Result<u64, StorageError> {
        conn.execute("UPDATE sequence_counter SET value = value + 1 WHERE id = 1", [])
            .map_err(sql_err)?;
        let seq: i64 = conn
            .query_row("SELECT value FROM sequence_counter WHERE id = 1", [], |r| r.get(0))
            .map_err(sql_err)?;
        Ok(seq as u64)
    }

    fn fund_exists_in(conn: &Connection, fund_id: &str) -> Result<bool, StorageError> {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM funds WHERE id = ?1",
            params![fund_id],
            |row| row.get(0),
        )
        .map_err(sql_err)
    }

    fn load_guarantors(conn: &Connection, loan_id: &str) -> Result<Vec<Arc<str>>, StorageError> {
        let mut stmt = conn
            .prepare("SELECT member_id FROM loan_guarantors WHERE loan_id = ?1 ORDER BY position")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![loan_id], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(Arc::from(row.map_err(sql_err)?.as_str()));
        }
        Ok(result)
    }

    fn write_guarantors(conn: &Connection, loan: &Loan) -> Result<(), StorageError> {
        conn.execute("DELETE FROM loan_guarantors WHERE loan_id = ?1", params![loan.id.as_ref()])
            .map_err(sql_err)?;
        for (position, member_id) in loan.guarantors.iter().enumerate() {
            conn.execute(
                "INSERT INTO loan_guarantors (loan_id, position, member_id) VALUES (?1, ?2, ?3)",
                params![loan.id.as_ref(), position as i64, member_id.as_ref()],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    fn query_loans(conn: &Connection, filter: Option<&str>) -> Result<Vec<Loan>, StorageError> {
        let raw: Vec<RawLoan> = match filter {
            Some(loan_id) => {
                let sql = format!("SELECT {} FROM loans WHERE id = ?1", LOAN_COLUMNS);
                let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                let rows = stmt.query_map(params![loan_id], RawLoan::from_row).map_err(sql_err)?;
                let loans = rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)?;
                loans
            }
            None => {
                let sql = format!("SELECT {} FROM loans ORDER BY applied_at, id", LOAN_COLUMNS);
                let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                let rows = stmt.query_map([], RawLoan::from_row).map_err(sql_err)?;
                let loans = rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)?;
                loans
            }
        };

        let mut loans = Vec::with_capacity(raw.len());
        for r in raw {
            let guarantors = Self::load_guarantors(conn, &r.id)?;
            loans.push(r.into_loan(guarantors)?);
        }
        Ok(loans)
    }
}

struct RawEntry {
    id: String,
    sequence: i64,
    fund_id: String,
    kind: String,
    amount: String,
    is_credit: bool,
    reference_type: Option<String>,
    reference_id: Option<String>,
    description: String,
    actor: Option<String>,
    created_at: String,
}

impl RawEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            fund_id: row.get(2)?,
            kind: row.get(3)?,
            amount: row.get(4)?,
            is_credit: row.get(5)?,
            reference_type: row.get(6)?,
            reference_id: row.get(7)?,
            description: row.get(8)?,
            actor: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry, StorageError> {
        let reference = match (self.reference_type, self.reference_id) {
            (Some(t), Some(id)) => Some(EntryReference::from_parts(&t, &id)?),
            _ => None,
        };
        Ok(LedgerEntry {
            id: Uuid::parse_str(&self.id).map_err(|e| StorageError::Other(e.to_string()))?,
            sequence: self.sequence as u64,
            fund_id: Arc::from(self.fund_id.as_str()),
            kind: self.kind.parse()?,
            amount: str_to_decimal(&self.amount)?,
            direction: Direction::from_credit_flag(self.is_credit),
            reference,
            description: Arc::from(self.description.as_str()),
            actor: self.actor.as_deref().map(Arc::from),
            created_at: str_to_timestamp(&self.created_at)?,
        })
    }
}

struct RawLoan {
    id: String,
    member_id: String,
    loan_type: String,
    status: String,
    requested_amount: String,
    approved_amount: Option<String>,
    disbursed_amount: Option<String>,
    interest_rate: String,
    rate_basis: String,
    term_months: i64,
    monthly_payment: Option<String>,
    total_interest: Option<String>,
    total_amount: Option<String>,
    purpose: String,
    approved_by: Option<String>,
    rejection_reason: Option<String>,
    applied_at: String,
    approved_at: Option<String>,
    disbursed_at: Option<String>,
    expected_completion_date: Option<String>,
}

impl RawLoan {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            member_id: row.get(1)?,
            loan_type: row.get(2)?,
            status: row.get(3)?,
            requested_amount: row.get(4)?,
            approved_amount: row.get(5)?,
            disbursed_amount: row.get(6)?,
            interest_rate: row.get(7)?,
            rate_basis: row.get(8)?,
            term_months: row.get(9)?,
            monthly_payment: row.get(10)?,
            total_interest: row.get(11)?,
            total_amount: row.get(12)?,
            purpose: row.get(13)?,
            approved_by: row.get(14)?,
            rejection_reason: row.get(15)?,
            applied_at: row.get(16)?,
            approved_at: row.get(17)?,
            disbursed_at: row.get(18)?,
            expected_completion_date: row.get(19)?,
        })
    }

    fn into_loan(self, guarantors: Vec<Arc<str>>) -> Result<Loan, StorageError> {
        Ok(Loan {
            id: Arc::from(self.id.as_str()),
            member_id: Arc::from(self.member_id.as_str()),
            loan_type: self.loan_type.parse()?,
            status: self.status.parse()?,
            requested_amount: str_to_decimal(&self.requested_amount)?,
            approved_amount: opt_str_to_decimal(self.approved_amount)?,
            disbursed_amount: opt_str_to_decimal(self.disbursed_amount)?,
            interest_rate: str_to_decimal(&self.interest_rate)?,
            rate_basis: self.rate_basis.parse()?,
            term_months: u32::try_from(self.term_months)
                .map_err(|_| StorageError::Other(format!("Invalid term: {}", self.term_months)))?,
            monthly_payment: opt_str_to_decimal(self.monthly_payment)?,
            total_interest: opt_str_to_decimal(self.total_interest)?,
            total_amount: opt_str_to_decimal(self.total_amount)?,
            purpose: Arc::from(self.purpose.as_str()),
            guarantors,
            approved_by: self.approved_by.as_deref().map(Arc::from),
            rejection_reason: self.rejection_reason.as_deref().map(Arc::from),
            applied_at: str_to_timestamp(&self.applied_at)?,
            approved_at: opt_str_to_timestamp(self.approved_at)?,
            disbursed_at: opt_str_to_timestamp(self.disbursed_at)?,
            expected_completion_date: self
                .expected_completion_date
                .as_deref()
                .map(str_to_date)
                .transpose()?,
        })
    }
}

struct RawRepayment {
    id: String,
    sequence: i64,
    loan_id: String,
    amount: String,
    payment_method: String,
    transaction_reference: Option<String>,
    principal_amount: String,
    interest_amount: String,
    collected_by: Option<String>,
    notes: String,
    paid_at: String,
}

impl RawRepayment {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            loan_id: row.get(2)?,
            amount: row.get(3)?,
            payment_method: row.get(4)?,
            transaction_reference: row.get(5)?,
            principal_amount: row.get(6)?,
            interest_amount: row.get(7)?,
            collected_by: row.get(8)?,
            notes: row.get(9)?,
            paid_at: row.get(10)?,
        })
    }

    fn into_repayment(self) -> Result<LoanRepayment, StorageError> {
        Ok(LoanRepayment {
            id: Uuid::parse_str(&self.id).map_err(|e| StorageError::Other(e.to_string()))?,
            sequence: self.sequence as u64,
            loan_id: Arc::from(self.loan_id.as_str()),
            amount: str_to_decimal(&self.amount)?,
            payment_method: self.payment_method.parse()?,
            transaction_reference: self.transaction_reference.as_deref().map(Arc::from),
            principal_amount: str_to_decimal(&self.principal_amount)?,
            interest_amount: str_to_decimal(&self.interest_amount)?,
            collected_by: self.collected_by.as_deref().map(Arc::from),
            notes: Arc::from(self.notes.as_str()),
            paid_at: str_to_timestamp(&self.paid_at)?,
        })
    }
}

impl StorageBackend for SqliteStorage {
    fn create_fund(&self, command: &CreateFundCommand) -> Result<Fund, StorageError> {
        let conn = self.conn()?;
        if Self::fund_exists_in(&conn, &command.id)? {
            return Err(StorageError::FundAlreadyExists(command.id.to_string()));
        }
        let fund = Fund {
            id: command.id.clone(),
            name: command.name.clone(),
            kind: command.kind,
            created_at: OffsetDateTime::now_utc(),
        };
        conn.execute(
            "INSERT INTO funds (id, name, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                fund.id.as_ref(),
                fund.name.as_ref(),
                fund.kind.as_str(),
                timestamp_to_str(fund.created_at)?
            ],
        )
        .map_err(sql_err)?;
        Ok(fund)
    }

    fn get_fund(&self, fund_id: &str) -> Result<Fund, StorageError> {
        let conn = self.conn()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT id, name, kind, created_at FROM funds WHERE id = ?1",
                params![fund_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(sql_err)?;

        let (id, name, kind, created_at) =
            row.ok_or_else(|| StorageError::FundNotFound(fund_id.to_string()))?;
        Ok(Fund {
            id: Arc::from(id.as_str()),
            name: Arc::from(name.as_str()),
            kind: kind.parse()?,
            created_at: str_to_timestamp(&created_at)?,
        })
    }

    fn list_funds(&self) -> Result<Vec<Fund>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, kind, created_at FROM funds ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(sql_err)?;

        let mut result = Vec::new();
        for row in rows {
            let (id, name, kind, created_at) = row.map_err(sql_err)?;
            result.push(Fund {
                id: Arc::from(id.as_str()),
                name: Arc::from(name.as_str()),
                kind: kind.parse()?,
                created_at: str_to_timestamp(&created_at)?,
            });
        }
        Ok(result)
    }

    fn fund_exists(&self, fund_id: &str) -> bool {
        match self.conn() {
            Ok(conn) => Self::fund_exists_in(&conn, fund_id).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn append_entry(&self, command: &AppendEntryCommand) -> Result<LedgerEntry, StorageError> {
        let conn = self.conn()?;
        if !Self::fund_exists_in(&conn, &command.fund_id)? {
            return Err(StorageError::FundNotFound(command.fund_id.to_string()));
        }

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            sequence: Self::next_sequence(&conn)?,
            fund_id: command.fund_id.clone(),
            kind: command.kind,
            amount: command.amount,
            direction: command.direction,
            reference: command.reference.clone(),
            description: command.description.clone(),
            actor: command.actor.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        conn.execute(
            &format!("INSERT INTO ledger_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)", ENTRY_COLUMNS),
            params![
                entry.id.to_string(),
                entry.sequence as i64,
                entry.fund_id.as_ref(),
                entry.kind.as_str(),
                entry.amount.to_string(),
                entry.direction.is_credit(),
                entry.reference.as_ref().map(|r| r.type_str()),
                entry.reference.as_ref().map(|r| r.id_string()),
                entry.description.as_ref(),
                entry.actor.as_deref(),
                timestamp_to_str(entry.created_at)?,
            ],
        )
        .map_err(sql_err)?;

        Ok(entry)
    }

    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry, StorageError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM ledger_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![entry_id.to_string()],
                RawEntry::from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.ok_or(StorageError::EntryNotFound(entry_id))?.into_entry()
    }

    fn list_entries(&self, fund_id: &str) -> Result<Vec<LedgerEntry>, StorageError> {
        let conn = self.conn()?;
        if !Self::fund_exists_in(&conn, fund_id)? {
            return Err(StorageError::FundNotFound(fund_id.to_string()));
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM ledger_entries WHERE fund_id = ?1 ORDER BY sequence",
                ENTRY_COLUMNS
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![fund_id], RawEntry::from_row)
            .map_err(sql_err)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(sql_err)?.into_entry()?);
        }
        Ok(result)
    }

    fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StorageError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM ledger_entries WHERE reference_type = 'entry' AND reference_id = ?1 ORDER BY sequence LIMIT 1",
                    ENTRY_COLUMNS
                ),
                params![entry_id.to_string()],
                RawEntry::from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn fund_summary(&self, fund_id: &str) -> Result<FundSummary, StorageError> {
        let conn = self.conn()?;
        if !Self::fund_exists_in(&conn, fund_id)? {
            return Err(StorageError::FundNotFound(fund_id.to_string()));
        }

        // SQLite would sum TEXT amounts as floats; add them up as decimals here.
        let mut stmt = conn
            .prepare("SELECT amount, is_credit FROM ledger_entries WHERE fund_id = ?1")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![fund_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })
            .map_err(sql_err)?;

        let mut summary = FundSummary::empty(Arc::from(fund_id));
        for row in rows {
            let (amount, is_credit) = row.map_err(sql_err)?;
            summary.add(Direction::from_credit_flag(is_credit), str_to_decimal(&amount)?);
        }
        Ok(summary)
    }

    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let exists: bool = conn
            .query_row("SELECT COUNT(*) > 0 FROM loans WHERE id = ?1", params![loan.id.as_ref()], |row| row.get(0))
            .map_err(sql_err)?;
        if exists {
            return Err(StorageError::LoanAlreadyExists(loan.id.to_string()));
        }

        conn.execute(
            &format!(
                "INSERT INTO loans ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                LOAN_COLUMNS
            ),
            params![
                loan.id.as_ref(),
                loan.member_id.as_ref(),
                loan.loan_type.as_str(),
                loan.status.as_str(),
                loan.requested_amount.to_string(),
                loan.approved_amount.map(|d| d.to_string()),
                loan.disbursed_amount.map(|d| d.to_string()),
                loan.interest_rate.to_string(),
                loan.rate_basis.as_str(),
                i64::from(loan.term_months),
                loan.monthly_payment.map(|d| d.to_string()),
                loan.total_interest.map(|d| d.to_string()),
                loan.total_amount.map(|d| d.to_string()),
                loan.purpose.as_ref(),
                loan.approved_by.as_deref(),
                loan.rejection_reason.as_deref(),
                timestamp_to_str(loan.applied_at)?,
                loan.approved_at.map(timestamp_to_str).transpose()?,
                loan.disbursed_at.map(timestamp_to_str).transpose()?,
                loan.expected_completion_date.map(date_to_str),
            ],
        )
        .map_err(sql_err)?;
        Self::write_guarantors(&conn, loan)
    }

    fn update_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE loans SET member_id = ?2, loan_type = ?3, status = ?4, requested_amount = ?5,
                    approved_amount = ?6, disbursed_amount = ?7, interest_rate = ?8, rate_basis = ?9,
                    term_months = ?10, monthly_payment = ?11, total_interest = ?12, total_amount = ?13,
                    purpose = ?14, approved_by = ?15, rejection_reason = ?16, applied_at = ?17,
                    approved_at = ?18, disbursed_at = ?19, expected_completion_date = ?20
                 WHERE id = ?1",
                params![
                    loan.id.as_ref(),
                    loan.member_id.as_ref(),
                    loan.loan_type.as_str(),
                    loan.status.as_str(),
                    loan.requested_amount.to_string(),
                    loan.approved_amount.map(|d| d.to_string()),
                    loan.disbursed_amount.map(|d| d.to_string()),
                    loan.interest_rate.to_string(),
                    loan.rate_basis.as_str(),
                    i64::from(loan.term_months),
                    loan.monthly_payment.map(|d| d.to_string()),
                    loan.total_interest.map(|d| d.to_string()),
                    loan.total_amount.map(|d| d.to_string()),
                    loan.purpose.as_ref(),
                    loan.approved_by.as_deref(),
                    loan.rejection_reason.as_deref(),
                    timestamp_to_str(loan.applied_at)?,
                    loan.approved_at.map(timestamp_to_str).transpose()?,
                    loan.disbursed_at.map(timestamp_to_str).transpose()?,
                    loan.expected_completion_date.map(date_to_str),
                ],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StorageError::LoanNotFound(loan.id.to_string()));
        }
        Self::write_guarantors(&conn, loan)
    }

    fn get_loan(&self, loan_id: &str) -> Result<Loan, StorageError> {
        let conn = self.conn()?;
        Self::query_loans(&conn, Some(loan_id))?
            .pop()
            .ok_or_else(|| StorageError::LoanNotFound(loan_id.to_string()))
    }

    fn list_loans(&self) -> Result<Vec<Loan>, StorageError> {
        let conn = self.conn()?;
        Self::query_loans(&conn, None)
    }

    fn append_repayment(&self, command: &AppendRepaymentCommand) -> Result<LoanRepayment, StorageError> {
        let conn = self.conn()?;
        let exists: bool = conn
            .query_row("SELECT COUNT(*) > 0 FROM loans WHERE id = ?1", params![command.loan_id.as_ref()], |row| row.get(0))
            .map_err(sql_err)?;
        if !exists {
            return Err(StorageError::LoanNotFound(command.loan_id.to_string()));
        }

        let repayment = LoanRepayment {
            id: Uuid::new_v4(),
            sequence: Self::next_sequence(&conn)?,
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

        conn.execute(
            &format!("INSERT INTO loan_repayments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)", REPAYMENT_COLUMNS),
            params![
                repayment.id.to_string(),
                repayment.sequence as i64,
                repayment.loan_id.as_ref(),
                repayment.amount.to_string(),
                repayment.payment_method.as_str(),
                repayment.transaction_reference.as_deref(),
                repayment.principal_amount.to_string(),
                repayment.interest_amount.to_string(),
                repayment.collected_by.as_deref(),
                repayment.notes.as_ref(),
                timestamp_to_str(repayment.paid_at)?,
            ],
        )
        .map_err(sql_err)?;

        Ok(repayment)
    }

    fn list_repayments(&self, loan_id: &str) -> Result<Vec<LoanRepayment>, StorageError> {
        let conn = self.conn()?;
        let exists: bool = conn
            .query_row("SELECT COUNT(*) > 0 FROM loans WHERE id = ?1", params![loan_id], |row| row.get(0))
            .map_err(sql_err)?;
        if !exists {
            return Err(StorageError::LoanNotFound(loan_id.to_string()));
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM loan_repayments WHERE loan_id = ?1 ORDER BY sequence",
                REPAYMENT_COLUMNS
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![loan_id], RawRepayment::from_row)
            .map_err(sql_err)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(sql_err)?.into_repayment()?);
        }
        Ok(result)
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut active = self.active_tx()?;
        let conn = self.conn()?;
        conn.execute_batch("SAVEPOINT welfund_tx").map_err(sql_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *active = Some(tx_id);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx()?;
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn()?;
        conn.execute_batch("RELEASE SAVEPOINT welfund_tx").map_err(sql_err)?;
        *active = None;
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx()?;
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn()?;
        // ROLLBACK TO keeps the savepoint open; release it so the outer transaction ends.
        conn.execute_batch("ROLLBACK TO SAVEPOINT welfund_tx; RELEASE SAVEPOINT welfund_tx")
            .map_err(sql_err)?;
        *active = None;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}
