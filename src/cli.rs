//! CLI definition and dispatch.

use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use uuid::Uuid;

use crate::adapters::csv_adapter::CsvQuoteAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::memory_adapter::MemoryLedgerAdapter;
use crate::domain::config::{LedgerConfig, SettlementPolicy};
use crate::domain::config_validation::{backend, parse_initial_buying_power, validate_ledger_config};
use crate::domain::error::LedgerError;
use crate::domain::executor::TradeExecutor;
use crate::domain::identifiers::{Ticker, UserId};
use crate::domain::reader::LedgerReader;
use crate::domain::retry::RetryPolicy;
use crate::domain::transaction::{BankDetails, Transaction, TransactionKind, TransactionStatus};
use crate::domain::transfer::CashTransferProcessor;
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::LedgerStore;

#[derive(Parser, Debug)]
#[command(name = "tradeledger", about = "Brokerage ledger for cash, positions and transfers")]
pub struct Cli {
    /// INI configuration file
    #[arg(short, long)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a buying power account
    OpenAccount {
        user: String,
        /// Opening balance; defaults to [ledger] initial_buying_power
        #[arg(long)]
        amount: Option<Decimal>,
    },
    /// Show current buying power
    Balance { user: String },
    /// Move cash in from a bank account
    Deposit {
        user: String,
        amount: Decimal,
        #[command(flatten)]
        bank: BankArgs,
    },
    /// Move cash out to a bank account
    Withdraw {
        user: String,
        amount: Decimal,
        #[command(flatten)]
        bank: BankArgs,
    },
    /// Record the outcome of a pending transfer
    Settle {
        user: String,
        transaction_id: Uuid,
        #[arg(long, value_enum)]
        outcome: SettleOutcome,
    },
    /// Buy shares; without --price the [pricing] quote file is used
    Buy {
        user: String,
        ticker: String,
        shares: u64,
        #[arg(long)]
        price: Option<Decimal>,
    },
    /// Sell shares; without --price the [pricing] quote file is used
    Sell {
        user: String,
        ticker: String,
        shares: u64,
        #[arg(long)]
        price: Option<Decimal>,
    },
    /// List open positions
    Positions { user: String },
    /// List ledger entries, newest first
    History { user: String },
    /// Replay the ledger against buying power
    Reconcile { user: String },
    /// Value the portfolio against the quote file
    Valuation { user: String },
    /// Validate the configuration file
    Validate,
}

#[derive(clap::Args, Debug)]
pub struct BankArgs {
    #[arg(long)]
    pub bank_name: String,
    #[arg(long)]
    pub routing_number: String,
    #[arg(long)]
    pub bank_account: String,
}

impl BankArgs {
    fn details(&self) -> Result<BankDetails, LedgerError> {
        BankDetails::new(&self.bank_name, &self.routing_number, &self.bank_account)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Completed,
    Failed,
}

impl From<SettleOutcome> for TransactionStatus {
    fn from(outcome: SettleOutcome) -> Self {
        match outcome {
            SettleOutcome::Completed => TransactionStatus::Completed,
            SettleOutcome::Failed => TransactionStatus::Failed,
        }
    }
}

pub fn run(cli: Cli) -> ExitCode {
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(code) => return code,
    };

    if let Err(e) = validate_ledger_config(&config) {
        eprintln!("error: {e}");
        return (&e).into();
    }

    if let Command::Validate = cli.command {
        println!("{} is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }

    let ledger_config = match build_ledger_config(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return (&e).into();
        }
    };

    let store = match open_store(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return (&e).into();
        }
    };

    match execute(cli.command, store.as_ref(), &ledger_config, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &PathBuf) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

pub fn build_ledger_config(config: &dyn ConfigPort) -> Result<LedgerConfig, LedgerError> {
    let defaults = LedgerConfig::default();

    let initial_buying_power =
        parse_initial_buying_power(config)?.unwrap_or(defaults.initial_buying_power);

    let settlement = match config.get_string("ledger", "settlement") {
        Some(raw) => SettlementPolicy::parse(&raw).ok_or_else(|| LedgerError::ConfigInvalid {
            section: "ledger".into(),
            key: "settlement".into(),
            reason: format!("unknown settlement policy {raw}"),
        })?,
        None => defaults.settlement,
    };

    let max_retries = config.get_int(
        "ledger",
        "max_retries",
        i64::from(defaults.retry.max_attempts),
    );
    let backoff_ms = config.get_int(
        "ledger",
        "retry_backoff_ms",
        defaults.retry.backoff.as_millis() as i64,
    );

    Ok(LedgerConfig {
        initial_buying_power,
        settlement,
        retry: RetryPolicy {
            max_attempts: u32::try_from(max_retries.max(1)).unwrap_or(u32::MAX),
            backoff: Duration::from_millis(backoff_ms.max(0) as u64),
        },
    })
}

/// Opens the configured backend and makes sure its schema exists.
pub fn open_store(config: &dyn ConfigPort) -> Result<Box<dyn LedgerStore>, LedgerError> {
    let name = backend(config);
    tracing::debug!(backend = %name, "opening ledger store");
    match name.as_str() {
        "memory" => Ok(Box::new(MemoryLedgerAdapter::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            use crate::adapters::sqlite_adapter::SqliteLedgerAdapter;
            let store = SqliteLedgerAdapter::from_config(config)?;
            store.initialize_schema()?;
            Ok(Box::new(store))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            use crate::adapters::postgres_adapter::PostgresLedgerAdapter;
            let store = PostgresLedgerAdapter::from_config(config)?;
            store.initialize_schema()?;
            Ok(Box::new(store))
        }
        other => Err(LedgerError::ConfigInvalid {
            section: "database".into(),
            key: "backend".into(),
            reason: format!("backend {other} is not enabled in this build"),
        }),
    }
}

/// Loads `[pricing] quotes_path`, failing with `ConfigMissing` when unset.
pub fn load_quotes(config: &dyn ConfigPort) -> Result<CsvQuoteAdapter, LedgerError> {
    let path = config
        .get_string("pricing", "quotes_path")
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| LedgerError::ConfigMissing {
            section: "pricing".into(),
            key: "quotes_path".into(),
        })?;
    CsvQuoteAdapter::from_file(path)
}

/// Runs one ledger command against an open store, printing results to stdout.
pub fn execute(
    command: Command,
    store: &dyn LedgerStore,
    ledger_config: &LedgerConfig,
    config: &dyn ConfigPort,
) -> Result<(), LedgerError> {
    let transfers = CashTransferProcessor::new(store, ledger_config.clone());
    let executor = TradeExecutor::new(store, ledger_config.retry);
    let reader = LedgerReader::new(store);

    match command {
        Command::OpenAccount { user, amount } => {
            let account = transfers.open_account(&UserId::new(user)?, amount)?;
            println!("opened {} with {}", account.user_id, account.amount);
        }
        Command::Balance { user } => {
            let account = reader.buying_power(&UserId::new(user)?)?;
            println!("{}", account.amount);
        }
        Command::Deposit { user, amount, bank } => {
            let receipt = transfers.deposit(&UserId::new(user)?, amount, bank.details()?)?;
            println!("{}", format_transaction(&receipt.transaction));
            println!("buying power {}", receipt.buying_power.amount);
        }
        Command::Withdraw { user, amount, bank } => {
            let receipt = transfers.withdraw(&UserId::new(user)?, amount, bank.details()?)?;
            println!("{}", format_transaction(&receipt.transaction));
            println!("buying power {}", receipt.buying_power.amount);
        }
        Command::Settle {
            user,
            transaction_id,
            outcome,
        } => {
            let receipt =
                transfers.settle(&UserId::new(user)?, transaction_id, outcome.into())?;
            println!("{}", format_transaction(&receipt.transaction));
            println!("buying power {}", receipt.buying_power.amount);
        }
        Command::Buy {
            user,
            ticker,
            shares,
            price,
        } => {
            let user_id = UserId::new(user)?;
            let ticker = Ticker::new(&ticker)?;
            let receipt = match price {
                Some(price) => executor.buy(&user_id, &ticker, shares, price)?,
                None => executor.buy_at_market(&load_quotes(config)?, &user_id, &ticker, shares)?,
            };
            println!("{}", format_transaction(&receipt.transaction));
            println!(
                "holding {} {} @ {}",
                receipt.position.shares, receipt.position.ticker, receipt.position.avg_cost
            );
        }
        Command::Sell {
            user,
            ticker,
            shares,
            price,
        } => {
            let user_id = UserId::new(user)?;
            let ticker = Ticker::new(&ticker)?;
            let receipt = match price {
                Some(price) => executor.sell(&user_id, &ticker, shares, price)?,
                None => {
                    executor.sell_at_market(&load_quotes(config)?, &user_id, &ticker, shares)?
                }
            };
            println!("{}", format_transaction(&receipt.transaction));
            match &receipt.remaining {
                Some(position) => println!(
                    "holding {} {} @ {}",
                    position.shares, position.ticker, position.avg_cost
                ),
                None => println!("position in {ticker} closed"),
            }
            println!("realized P&L {}", receipt.realized_pnl);
        }
        Command::Positions { user } => {
            let positions = reader.positions(&UserId::new(user)?)?;
            if positions.is_empty() {
                println!("no open positions");
            }
            for p in &positions {
                println!(
                    "{:<12} {:>10} @ {:>12}  cost {}",
                    p.ticker.as_str(),
                    p.shares,
                    p.avg_cost,
                    p.cost_basis()
                );
            }
        }
        Command::History { user } => {
            for transaction in reader.transactions(&UserId::new(user)?)? {
                println!("{}", format_transaction(&transaction));
            }
        }
        Command::Reconcile { user } => {
            let r = reader.reconcile(&UserId::new(user)?)?;
            println!("opening      {}", r.opening_amount);
            println!("ledger delta {}", r.ledger_delta);
            println!("expected     {}", r.expected);
            println!("actual       {}", r.actual);
            println!("entries      {}", r.transaction_count);
            if !r.is_balanced() {
                println!("DISCREPANCY  {}", r.discrepancy());
                return Err(LedgerError::StoreQuery {
                    reason: format!("ledger is out of balance by {}", r.discrepancy()),
                });
            }
            println!("balanced");
        }
        Command::Valuation { user } => {
            let quotes = load_quotes(config)?;
            let valuation = reader.valuation(&UserId::new(user)?, &quotes)?;
            println!("cash         {}", valuation.cash);
            for v in &valuation.positions {
                match (v.last_price, v.market_value, v.unrealized_pnl) {
                    (Some(price), Some(value), Some(pnl)) => println!(
                        "{:<12} {:>10} @ {:>12}  value {}  unrealized {}",
                        v.position.ticker.as_str(),
                        v.position.shares,
                        price,
                        value,
                        pnl
                    ),
                    _ => println!(
                        "{:<12} {:>10}  no quote, at cost {}",
                        v.position.ticker.as_str(),
                        v.position.shares,
                        v.position.cost_basis()
                    ),
                }
            }
            println!("total equity {}", valuation.total_equity);
        }
        Command::Validate => {}
    }
    Ok(())
}

pub fn format_transaction(t: &Transaction) -> String {
    let detail = match &t.kind {
        TransactionKind::Buy(trade) | TransactionKind::Sell(trade) => {
            format!("{} x {} @ {}", trade.shares, trade.ticker, trade.price_per_share)
        }
        TransactionKind::Deposit(bank) | TransactionKind::Withdrawal(bank) => {
            format!("{} {}", bank.bank_name, bank.bank_account)
        }
    };
    format!(
        "{} {} {:<10} {:>12} {:<9} {}",
        t.created_at.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
        t.id,
        t.kind.as_str(),
        t.amount,
        t.status.as_str(),
        detail
    )
}
