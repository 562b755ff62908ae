//! Periodically reconciled fund balances for dashboards.
//!
//! The ledger never reads from this cache; it is refreshed from the ledger.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use welfund_core::{LedgerError, StorageError};

use crate::ledger::Ledger;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedBalance {
    pub fund_id: Arc<str>,
    pub balance: Decimal,
    pub entry_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub reconciled_at: OffsetDateTime,
}

#[derive(Clone, Default)]
pub struct BalanceCache {
    balances: Arc<RwLock<HashMap<Arc<str>, CachedBalance>>>,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fund_id: &str) -> Option<CachedBalance> {
        self.balances.read().ok()?.get(fund_id).cloned()
    }

    /// Recomputes every fund from the ledger. Returns the number of funds refreshed.
    pub fn reconcile_all(&self, ledger: &Ledger) -> Result<usize, LedgerError> {
        let reconciled_at = OffsetDateTime::now_utc();
        let mut fresh = HashMap::new();
        for summary in ledger.summaries()? {
            fresh.insert(
                summary.fund_id.clone(),
                CachedBalance {
                    balance: summary.balance(),
                    fund_id: summary.fund_id,
                    entry_count: summary.entry_count,
                    reconciled_at,
                },
            );
        }

        let count = fresh.len();
        let mut balances = self
            .balances
            .write()
            .map_err(|_| StorageError::Other("balance cache lock poisoned".to_string()))?;
        *balances = fresh;
        Ok(count)
    }
}

/// Spawns the background task that refreshes `cache` every `interval`.
pub fn spawn_reconciler(cache: BalanceCache, ledger: Ledger, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            let ledger = ledger.clone();
            match tokio::task::spawn_blocking(move || cache.reconcile_all(&ledger)).await {
                Ok(Ok(funds)) => tracing::debug!(funds, "Balances reconciled"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Balance reconciliation failed"),
                Err(e) => tracing::error!(error = %e, "Reconciler task panicked"),
            }
        }
    })
}
