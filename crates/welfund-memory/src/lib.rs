//! In-memory storage backend for welfund.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use time::OffsetDateTime;
use uuid::Uuid;

use welfund_core::{
    AppendEntryCommand, AppendRepaymentCommand, CreateFundCommand, EntryReference, Fund,
    FundSummary, LedgerEntry, Loan, LoanRepayment, StorageBackend, StorageError, TransactionId,
};

#[derive(Clone)]
struct FundData {
    fund: Fund,
    entries: Vec<LedgerEntry>,
}

#[derive(Clone)]
struct LoanData {
    loan: Loan,
    repayments: Vec<LoanRepayment>,
}

#[derive(Clone, Default)]
struct State {
    funds: BTreeMap<Arc<str>, FundData>,
    /// entry id -> (fund id, position in that fund's entries)
    entry_index: HashMap<Uuid, (Arc<str>, usize)>,
    /// original entry id -> offsetting entry id
    reversals: HashMap<Uuid, Uuid>,
    loans: BTreeMap<Arc<str>, LoanData>,
}

struct Snapshot {
    state: State,
    sequence_value: u64,
}

pub struct InMemoryStorage {
    state: RwLock<State>,
    sequence_counter: AtomicU64,
    tx_counter: AtomicU64,
    snapshots: RwLock<HashMap<TransactionId, Snapshot>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            sequence_counter: AtomicU64::new(1),
            tx_counter: AtomicU64::new(1),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Other("storage lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Other("storage lock poisoned".to_string()))
    }

    fn snapshots(&self) -> Result<RwLockWriteGuard<'_, HashMap<TransactionId, Snapshot>>, StorageError> {
        self.snapshots
            .write()
            .map_err(|_| StorageError::Other("snapshot lock poisoned".to_string()))
    }
}

impl StorageBackend for InMemoryStorage {
    fn create_fund(&self, command: &CreateFundCommand) -> Result<Fund, StorageError> {
        let mut state = self.write()?;
        if state.funds.contains_key(&command.id) {
            return Err(StorageError::FundAlreadyExists(command.id.to_string()));
        }
        let fund = Fund {
            id: command.id.clone(),
            name: command.name.clone(),
            kind: command.kind,
            created_at: OffsetDateTime::now_utc(),
        };
        state.funds.insert(
            command.id.clone(),
            FundData {
                fund: fund.clone(),
                entries: Vec::new(),
            },
        );
        Ok(fund)
    }

    fn get_fund(&self, fund_id: &str) -> Result<Fund, StorageError> {
        self.read()?
            .funds
            .get(fund_id)
            .map(|f| f.fund.clone())
            .ok_or_else(|| StorageError::FundNotFound(fund_id.to_string()))
    }

    fn list_funds(&self) -> Result<Vec<Fund>, StorageError> {
        Ok(self.read()?.funds.values().map(|f| f.fund.clone()).collect())
    }

    fn fund_exists(&self, fund_id: &str) -> bool {
        self.read()
            .map(|s| s.funds.contains_key(fund_id))
            .unwrap_or(false)
    }

    fn append_entry(&self, command: &AppendEntryCommand) -> Result<LedgerEntry, StorageError> {
        let mut state = self.write()?;
        if !state.funds.contains_key(&command.fund_id) {
            return Err(StorageError::FundNotFound(command.fund_id.to_string()));
        }

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            sequence: self.next_sequence(),
            fund_id: command.fund_id.clone(),
            kind: command.kind,
            amount: command.amount,
            direction: command.direction,
            reference: command.reference.clone(),
            description: command.description.clone(),
            actor: command.actor.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        if let Some(EntryReference::Entry(original)) = &entry.reference {
            state.reversals.entry(*original).or_insert(entry.id);
        }

        let fund = state
            .funds
            .get_mut(&command.fund_id)
            .ok_or_else(|| StorageError::FundNotFound(command.fund_id.to_string()))?;
        let position = fund.entries.len();
        fund.entries.push(entry.clone());
        state.entry_index.insert(entry.id, (command.fund_id.clone(), position));

        Ok(entry)
    }

    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry, StorageError> {
        let state = self.read()?;
        let (fund_id, position) = state
            .entry_index
            .get(&entry_id)
            .ok_or(StorageError::EntryNotFound(entry_id))?;
        state
            .funds
            .get(fund_id)
            .and_then(|f| f.entries.get(*position))
            .cloned()
            .ok_or(StorageError::EntryNotFound(entry_id))
    }

    fn list_entries(&self, fund_id: &str) -> Result<Vec<LedgerEntry>, StorageError> {
        self.read()?
            .funds
            .get(fund_id)
            .map(|f| f.entries.clone())
            .ok_or_else(|| StorageError::FundNotFound(fund_id.to_string()))
    }

    fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StorageError> {
        let reversal_id = match self.read()?.reversals.get(&entry_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_entry(reversal_id).map(Some)
    }

    fn fund_summary(&self, fund_id: &str) -> Result<FundSummary, StorageError> {
        let state = self.read()?;
        let fund = state
            .funds
            .get(fund_id)
            .ok_or_else(|| StorageError::FundNotFound(fund_id.to_string()))?;

        let mut summary = FundSummary::empty(fund.fund.id.clone());
        for entry in &fund.entries {
            summary.add(entry.direction, entry.amount);
        }
        Ok(summary)
    }

    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.loans.contains_key(&loan.id) {
            return Err(StorageError::LoanAlreadyExists(loan.id.to_string()));
        }
        state.loans.insert(
            loan.id.clone(),
            LoanData {
                loan: loan.clone(),
                repayments: Vec::new(),
            },
        );
        Ok(())
    }

    fn update_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        let mut state = self.write()?;
        let data = state
            .loans
            .get_mut(&loan.id)
            .ok_or_else(|| StorageError::LoanNotFound(loan.id.to_string()))?;
        data.loan = loan.clone();
        Ok(())
    }

    fn get_loan(&self, loan_id: &str) -> Result<Loan, StorageError> {
        self.read()?
            .loans
            .get(loan_id)
            .map(|l| l.loan.clone())
            .ok_or_else(|| StorageError::LoanNotFound(loan_id.to_string()))
    }

    fn list_loans(&self) -> Result<Vec<Loan>, StorageError> {
        Ok(self.read()?.loans.values().map(|l| l.loan.clone()).collect())
    }

    fn append_repayment(&self, command: &AppendRepaymentCommand) -> Result<LoanRepayment, StorageError> {
        let mut state = self.write()?;
        let data = state
            .loans
            .get_mut(&command.loan_id)
            .ok_or_else(|| StorageError::LoanNotFound(command.loan_id.to_string()))?;

        let repayment = LoanRepayment {
            id: Uuid::new_v4(),
            sequence: self.next_sequence(),
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
        data.repayments.push(repayment.clone());
        Ok(repayment)
    }

    fn list_repayments(&self, loan_id: &str) -> Result<Vec<LoanRepayment>, StorageError> {
        self.read()?
            .loans
            .get(loan_id)
            .map(|l| l.repayments.clone())
            .ok_or_else(|| StorageError::LoanNotFound(loan_id.to_string()))
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let snapshot = Snapshot {
            state: self.read()?.clone(),
            sequence_value: self.sequence_counter.load(Ordering::SeqCst),
        };
        self.snapshots()?.insert(tx_id, snapshot);
        tracing::debug!(tx_id, "Transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.snapshots()?
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)?;
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let snapshot = self
            .snapshots()?
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)?;
        *self.write()? = snapshot.state;
        self.sequence_counter.store(snapshot.sequence_value, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}
