//! Welfund: an append-only fund ledger, a loan book and an amortization
//! calculator for community welfare groups, served over HTTP.

pub mod api;
pub mod config;
pub mod ledger;
pub mod loans;
pub mod reconcile;
pub mod storage;
pub mod telemetry;

use thiserror::Error;
use welfund_core::LedgerError;

use crate::{
    api::AppState,
    config::Config,
    ledger::Ledger,
    loans::{LoanBook, LoanPolicy},
    reconcile::BalanceCache,
    storage::StorageError,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("server: {0}")]
    Server(#[from] hyper::Error),
}

/// Opens storage, seeds the configured funds and wires up the services.
pub fn build_state(config: &Config) -> Result<AppState, StartupError> {
    let storage = storage::open_storage(&config.storage)?;
    let ledger = Ledger::new(storage);

    for seed in &config.funds.defaults {
        ledger.ensure_fund(&seed.id, &seed.name, seed.kind)?;
    }
    if ledger.get_fund(&config.funds.loan_fund).is_err() {
        tracing::warn!(fund_id = %config.funds.loan_fund, "Loan fund is not among the configured funds");
    }

    let loans = LoanBook::new(ledger.clone(), LoanPolicy::from_config(config));
    Ok(AppState {
        ledger,
        loans,
        cache: BalanceCache::new(),
        metrics: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageKind;

    fn postgres_config(url: &str) -> Config {
        let mut config = Config::default();
        config.storage.backend = StorageKind::Postgres;
        config.storage.url = Some(url.to_string());
        config
    }

    #[tokio::test]
    async fn test_unreachable_postgres_fails_startup() {
        match build_state(&postgres_config("postgres://nobody@127.0.0.1:1/nodb")) {
            Err(StartupError::Storage(_)) => {}
            other => panic!("Expected a storage error, got {:?}", other.map(|_| ())),
        }
    }

    // Needs a live server; skipped unless WELFUND_TEST_POSTGRES_URL is set.
    #[tokio::test]
    async fn test_postgres_state_works_inside_runtime() {
        let Ok(url) = std::env::var("WELFUND_TEST_POSTGRES_URL") else {
            return;
        };
        let state = build_state(&postgres_config(&url)).unwrap();
        let loan_fund = state.loans.policy().loan_fund.clone();
        state.ledger.current_balance(&loan_fund).unwrap();
        assert!(!state.ledger.list_funds().unwrap().is_empty());
        drop(state);
    }
}
