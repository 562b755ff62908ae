//! Fund ledger service.
//!
//! Every write appends exactly one entry. Balances are never stored; they
//! are summed from the full entry history on each call.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rust_decimal::Decimal;
use uuid::Uuid;

use welfund_core::{
    AppendEntryCommand, CreateFundCommand, EntryReference, Fund, FundKind, FundSummary,
    LedgerEntry, LedgerError, Statement, StorageBackend, StorageError,
};

use crate::telemetry::{ENTRIES_RECORDED, VALIDATION_FAILURES};

#[derive(Clone)]
pub struct Ledger {
    storage: Arc<dyn StorageBackend>,
    // Writers hold this exclusively for the whole of a storage transaction and
    // readers share it, so no read observes rows that may still be rolled back.
    access: Arc<RwLock<()>>,
}

fn poisoned() -> LedgerError {
    StorageError::Other("ledger access lock poisoned".to_string()).into()
}

pub(crate) fn reject(operation: &'static str, err: LedgerError) -> LedgerError {
    if err.is_validation() {
        tracing::warn!(operation, error = %err, "Rejected input");
        metrics::increment_counter!(VALIDATION_FAILURES, "operation" => operation);
    }
    err
}

impl Ledger {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            access: Arc::new(RwLock::new(())),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub(crate) fn lock_writes(&self) -> Result<RwLockWriteGuard<'_, ()>, LedgerError> {
        self.access.write().map_err(|_| poisoned())
    }

    pub(crate) fn lock_reads(&self) -> Result<RwLockReadGuard<'_, ()>, LedgerError> {
        self.access.read().map_err(|_| poisoned())
    }

    pub fn create_fund(&self, id: &str, name: &str, kind: FundKind) -> Result<Fund, LedgerError> {
        let _guard = self.lock_writes()?;
        let fund = self.storage.create_fund(&CreateFundCommand {
            id: Arc::from(id),
            name: Arc::from(name),
            kind,
        })?;
        tracing::info!(fund_id = %fund.id, kind = fund.kind.as_str(), "Fund created");
        Ok(fund)
    }

    /// Returns the fund, creating it first if it does not exist yet.
    pub fn ensure_fund(&self, id: &str, name: &str, kind: FundKind) -> Result<Fund, LedgerError> {
        let existing = {
            let _guard = self.lock_reads()?;
            self.storage.get_fund(id)
        };
        match existing {
            Ok(fund) => Ok(fund),
            Err(StorageError::FundNotFound(_)) => self.create_fund(id, name, kind),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_fund(&self, fund_id: &str) -> Result<Fund, LedgerError> {
        let _guard = self.lock_reads()?;
        Ok(self.storage.get_fund(fund_id)?)
    }

    pub fn list_funds(&self) -> Result<Vec<Fund>, LedgerError> {
        let _guard = self.lock_reads()?;
        Ok(self.storage.list_funds()?)
    }

    /// Appends one entry to the fund named in the command.
    ///
    /// Entry references are reserved for `reverse`.
    pub fn record(&self, command: &AppendEntryCommand) -> Result<LedgerEntry, LedgerError> {
        if let Some(EntryReference::Entry(target)) = &command.reference {
            return Err(reject("record", LedgerError::ReservedReference(*target)));
        }
        let _guard = self.lock_writes()?;
        self.append(command)
    }

    /// `record` for callers already holding the write lock.
    pub(crate) fn append(&self, command: &AppendEntryCommand) -> Result<LedgerEntry, LedgerError> {
        command.validate().map_err(|e| reject("record", e))?;

        let entry = self.storage.append_entry(command)?;
        tracing::info!(
            entry_id = %entry.id,
            fund_id = %entry.fund_id,
            kind = entry.kind.as_str(),
            direction = %entry.direction,
            amount = %entry.amount,
            "Ledger entry recorded"
        );
        metrics::increment_counter!(
            ENTRIES_RECORDED,
            "fund" => entry.fund_id.to_string(),
            "kind" => entry.kind.as_str()
        );
        Ok(entry)
    }

    pub fn current_balance(&self, fund_id: &str) -> Result<Decimal, LedgerError> {
        Ok(self.summary(fund_id)?.balance())
    }

    pub fn summary(&self, fund_id: &str) -> Result<FundSummary, LedgerError> {
        let _guard = self.lock_reads()?;
        Ok(self.storage.fund_summary(fund_id)?)
    }

    /// Summaries of every fund, all taken at the same committed point.
    pub fn summaries(&self) -> Result<Vec<FundSummary>, LedgerError> {
        let _guard = self.lock_reads()?;
        let mut summaries = Vec::new();
        for fund in self.storage.list_funds()? {
            summaries.push(self.storage.fund_summary(&fund.id)?);
        }
        Ok(summaries)
    }

    pub fn entries(&self, fund_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let _guard = self.lock_reads()?;
        Ok(self.storage.list_entries(fund_id)?)
    }

    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        let _guard = self.lock_reads()?;
        Ok(self.storage.get_entry(entry_id)?)
    }

    pub fn statement(&self, fund_id: &str) -> Result<Statement, LedgerError> {
        let _guard = self.lock_reads()?;
        let fund = self.storage.get_fund(fund_id)?;
        let entries = self.storage.list_entries(fund_id)?;
        Ok(Statement::from_entries(fund.id, &entries))
    }

    /// Records the entry that cancels `entry_id` out of its fund's balance.
    pub fn reverse(
        &self,
        entry_id: Uuid,
        description: &str,
        actor: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        let _guard = self.lock_writes()?;
        let original = self.storage.get_entry(entry_id)?;
        if self.storage.find_reversal(entry_id)?.is_some() {
            return Err(LedgerError::AlreadyReversed(entry_id));
        }

        let command = AppendEntryCommand::new(
            &original.fund_id,
            original.kind,
            original.amount,
            original.direction.opposite(),
            description,
        )
        .with_reference(EntryReference::Entry(original.id))
        .with_actor(actor);

        let entry = self.append(&command)?;
        tracing::info!(original = %entry_id, reversal = %entry.id, "Ledger entry reversed");
        Ok(entry)
    }
}
