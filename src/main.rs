use std::{process::ExitCode, time::Duration};

use clap::Parser;
use welfund::{
    api, build_state,
    config::{CliArgs, Config},
    reconcile::spawn_reconciler,
    telemetry, StartupError,
};

async fn run(config: Config) -> Result<(), StartupError> {
    let addr = config.listen_addr()?;
    let mut state = build_state(&config)?;
    state.metrics = Some(telemetry::install_metrics()?);

    if config.reconcile.interval_secs > 0 {
        state.cache.reconcile_all(&state.ledger)?;
        spawn_reconciler(
            state.cache.clone(),
            state.ledger.clone(),
            Duration::from_secs(config.reconcile.interval_secs),
        );
    }

    let app = api::router(state);
    tracing::info!(%addr, "API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    telemetry::init_tracing(&config.logging);

    tracing::info!(
        config_file = %cli.config,
        storage = ?config.storage.backend,
        loan_fund = %config.funds.loan_fund,
        "Welfund starting"
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Welfund failed to start");
            ExitCode::FAILURE
        }
    }
}
