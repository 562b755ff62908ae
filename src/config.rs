use std::net::{AddrParseError, SocketAddr};

use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use welfund_core::{FundKind, RateBasis};

#[derive(Parser, Debug)]
#[command(name = "welfund", about = "Welfund - fund ledger and loan book for welfare groups")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "welfund.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage backend: memory, sqlite or postgres (overrides config file)
    #[arg(short, long)]
    pub storage: Option<StorageKind>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub funds: FundsConfig,

    #[serde(default)]
    pub loans: LoansConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    /// SQLite database file; ":memory:" keeps it in process.
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// PostgreSQL connection string.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FundSeed {
    pub id: String,
    pub name: String,
    pub kind: FundKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FundsConfig {
    /// Funds created at start-up when missing.
    #[serde(default = "default_fund_seeds")]
    pub defaults: Vec<FundSeed>,

    /// Fund that loan disbursements and repayments are posted to.
    #[serde(default = "default_loan_fund")]
    pub loan_fund: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoansConfig {
    #[serde(default = "default_interest_rate")]
    pub default_interest_rate: Decimal,

    #[serde(default = "default_term_months")]
    pub default_term_months: u32,

    #[serde(default)]
    pub rate_basis: RateBasis,

    #[serde(default = "default_max_guarantors")]
    pub max_guarantors: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Zero disables the background reconciler.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sqlite_path() -> String {
    "welfund.db".to_string()
}

fn default_fund_seeds() -> Vec<FundSeed> {
    vec![
        FundSeed {
            id: "welfare".to_string(),
            name: "Welfare Fund".to_string(),
            kind: FundKind::Welfare,
        },
        FundSeed {
            id: "loan_kitty".to_string(),
            name: "Loan Kitty".to_string(),
            kind: FundKind::LoanKitty,
        },
    ]
}

fn default_loan_fund() -> String {
    "loan_kitty".to_string()
}

fn default_interest_rate() -> Decimal {
    dec!(5.00)
}

fn default_term_months() -> u32 {
    6
}

fn default_max_guarantors() -> usize {
    2
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageKind::Memory,
            path: default_sqlite_path(),
            url: None,
        }
    }
}

impl Default for FundsConfig {
    fn default() -> Self {
        FundsConfig {
            defaults: default_fund_seeds(),
            loan_fund: default_loan_fund(),
        }
    }
}

impl Default for LoansConfig {
    fn default() -> Self {
        LoansConfig {
            default_interest_rate: default_interest_rate(),
            default_term_months: default_term_months(),
            rate_basis: RateBasis::default(),
            max_guarantors: default_max_guarantors(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(kind) = cli.storage {
            config.storage.backend = kind;
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert_eq!(config.funds.loan_fund, "loan_kitty");
        assert_eq!(config.funds.defaults.len(), 2);
        assert_eq!(config.loans.default_interest_rate, dec!(5.00));
        assert_eq!(config.loans.rate_basis, RateBasis::Monthly);
        assert_eq!(config.reconcile.interval_secs, 60);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::parse(
            r#"
            [server]
            port = 8080

            [logging]
            json = true

            [storage]
            backend = "sqlite"
            path = ":memory:"

            [loans]
            default_interest_rate = "1.5"
            rate_basis = "annual"

            [[funds.defaults]]
            id = "kitty"
            name = "Kitty"
            kind = "loan_kitty"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap().port(), 8080);
        assert!(config.logging.json);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.storage.path, ":memory:");
        assert_eq!(config.loans.default_interest_rate, dec!(1.5));
        assert_eq!(config.loans.rate_basis, RateBasis::Annual);
        assert_eq!(config.funds.defaults[0].kind, FundKind::LoanKitty);
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from([
            "welfund",
            "--config",
            "does-not-exist.toml",
            "--port",
            "9000",
            "--storage",
            "sqlite",
        ]);
        let config = Config::load(&cli);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
    }
}
