//! SQLite ledger store.
//!
//! Every unit-of-work runs inside `BEGIN IMMEDIATE`, which takes the database
//! write lock up front, so two units can never both read a stale balance.
//! File databases use WAL so reads proceed while a unit holds the lock.

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::account::BuyingPower;
use crate::domain::error::LedgerError;
use crate::domain::identifiers::{Ticker, UserId, now};
use crate::domain::position::Position;
use crate::domain::transaction::{
    BankDetails, TradeDetails, Transaction, TransactionKind, TransactionStatus,
};
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::{LedgerStore, UnitOfWork, Work};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS buying_power (
    user_id TEXT PRIMARY KEY,
    amount TEXT NOT NULL,
    opening_amount TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS positions (
    user_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    shares INTEGER NOT NULL CHECK (shares > 0),
    avg_cost TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, ticker)
);
CREATE TABLE IF NOT EXISTS transactions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('deposit', 'withdrawal', 'buy', 'sell')),
    amount TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    ticker TEXT,
    shares INTEGER,
    price_per_share TEXT,
    bank_name TEXT,
    routing_number TEXT,
    bank_account TEXT,
    created_at TEXT NOT NULL,
    CHECK (
        (kind IN ('buy', 'sell')
            AND ticker IS NOT NULL AND shares > 0 AND price_per_share IS NOT NULL
            AND bank_name IS NULL AND routing_number IS NULL AND bank_account IS NULL)
        OR
        (kind IN ('deposit', 'withdrawal')
            AND bank_name IS NOT NULL AND routing_number IS NOT NULL AND bank_account IS NOT NULL
            AND ticker IS NULL AND shares IS NULL AND price_per_share IS NULL)
    )
);
CREATE INDEX IF NOT EXISTS idx_transactions_user_created
    ON transactions(user_id, created_at);";

const TRANSACTION_COLUMNS: &str = "id, kind, amount, status, ticker, shares, price_per_share, \
     bank_name, routing_number, bank_account, created_at";

pub struct SqliteLedgerAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, LedgerError> {
        let db_path = config
            .get_string("sqlite", "path")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| LedgerError::ConfigMissing {
                section: "sqlite".into(),
                key: "path".into(),
            })?;
        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        let busy_timeout = config.get_int("sqlite", "busy_timeout_ms", 5000).max(0) as u64;

        Self::open(db_path, pool_size, Duration::from_millis(busy_timeout))
    }

    /// Opens a file database, switching it to WAL.
    pub fn open(
        path: impl AsRef<Path>,
        pool_size: u32,
        busy_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e: r2d2::Error| LedgerError::StoreUnavailable {
                reason: e.to_string(),
            })?;

        tracing::debug!(path = %path.as_ref().display(), pool_size, "sqlite ledger opened");
        Ok(Self { pool })
    }

    /// A private in-memory database. The pool holds one connection so every
    /// unit sees the same data. That connection is never expired or reaped:
    /// replacing it would silently swap in an empty database.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)
            .map_err(|e: r2d2::Error| LedgerError::StoreUnavailable {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), LedgerError> {
        let conn = self.connection()?;
        conn.execute_batch(SCHEMA).map_err(query_error)?;
        Ok(())
    }

    /// Releases every pooled connection.
    pub fn close(self) {
        tracing::debug!("sqlite ledger closed");
        drop(self.pool);
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, LedgerError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| LedgerError::StoreUnavailable {
                reason: e.to_string(),
            })
    }
}

/// Lock contention is a lost race, not a broken store.
fn query_error(e: rusqlite::Error) -> LedgerError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            LedgerError::ConcurrencyConflict { attempts: 1 }
        }
        Some(ErrorCode::SystemIoFailure)
        | Some(ErrorCode::DiskFull)
        | Some(ErrorCode::CannotOpen) => LedgerError::StoreUnavailable {
            reason: e.to_string(),
        },
        _ => LedgerError::StoreQuery {
            reason: e.to_string(),
        },
    }
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> LedgerError {
    LedgerError::StoreQuery {
        reason: format!("corrupt {what}: {detail}"),
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", e))
}

fn parse_decimal(raw: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(raw).map_err(|e| corrupt("decimal", e))
}

fn shares_to_sql(shares: u64) -> Result<i64, LedgerError> {
    i64::try_from(shares).map_err(|_| LedgerError::validation("share count is too large"))
}

fn shares_from_sql(shares: i64) -> Result<u64, LedgerError> {
    u64::try_from(shares).map_err(|e| corrupt("share count", e))
}

type BuyingPowerRow = (String, String, String, String);
type PositionRow = (String, i64, String, String, String);

#[derive(Debug)]
struct TransactionRow {
    id: String,
    kind: String,
    amount: String,
    status: String,
    ticker: Option<String>,
    shares: Option<i64>,
    price_per_share: Option<String>,
    bank_name: Option<String>,
    routing_number: Option<String>,
    bank_account: Option<String>,
    created_at: String,
}

impl TransactionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(TransactionRow {
            id: row.get(0)?,
            kind: row.get(1)?,
            amount: row.get(2)?,
            status: row.get(3)?,
            ticker: row.get(4)?,
            shares: row.get(5)?,
            price_per_share: row.get(6)?,
            bank_name: row.get(7)?,
            routing_number: row.get(8)?,
            bank_account: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_transaction(self, user_id: &UserId) -> Result<Transaction, LedgerError> {
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt("transaction id", e))?;
        let status = TransactionStatus::parse(&self.status)
            .ok_or_else(|| corrupt("transaction status", &self.status))?;
        let kind = match self.kind.as_str() {
            "buy" | "sell" => {
                let (Some(ticker), Some(shares), Some(price)) =
                    (self.ticker, self.shares, self.price_per_share)
                else {
                    return Err(corrupt("trade row", id));
                };
                let trade = TradeDetails::new(
                    Ticker::new(&ticker)?,
                    shares_from_sql(shares)?,
                    parse_decimal(&price)?,
                )?;
                if self.kind == "buy" {
                    TransactionKind::Buy(trade)
                } else {
                    TransactionKind::Sell(trade)
                }
            }
            "deposit" | "withdrawal" => {
                let (Some(name), Some(routing), Some(account)) =
                    (self.bank_name, self.routing_number, self.bank_account)
                else {
                    return Err(corrupt("transfer row", id));
                };
                let bank = BankDetails::new(&name, &routing, &account)?;
                if self.kind == "deposit" {
                    TransactionKind::Deposit(bank)
                } else {
                    TransactionKind::Withdrawal(bank)
                }
            }
            other => return Err(corrupt("transaction kind", other)),
        };
        Ok(Transaction::restore(
            id,
            user_id.clone(),
            kind,
            parse_decimal(&self.amount)?,
            status,
            parse_timestamp(&self.created_at)?,
        ))
    }
}

fn read_buying_power(
    conn: &Connection,
    user_id: &UserId,
) -> Result<Option<BuyingPower>, LedgerError> {
    let row: Option<BuyingPowerRow> = conn
        .query_row(
            "SELECT amount, opening_amount, created_at, updated_at
             FROM buying_power WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(query_error)?;

    row.map(|(amount, opening, created, updated)| -> Result<BuyingPower, LedgerError> {
        Ok(BuyingPower {
            user_id: user_id.clone(),
            amount: parse_decimal(&amount)?,
            opening_amount: parse_decimal(&opening)?,
            created_at: parse_timestamp(&created)?,
            updated_at: parse_timestamp(&updated)?,
        })
    })
    .transpose()
}

fn position_from_row(user_id: &UserId, row: PositionRow) -> Result<Position, LedgerError> {
    let (ticker, shares, avg_cost, opened, updated) = row;
    Ok(Position {
        user_id: user_id.clone(),
        ticker: Ticker::new(&ticker)?,
        shares: shares_from_sql(shares)?,
        avg_cost: parse_decimal(&avg_cost)?,
        opened_at: parse_timestamp(&opened)?,
        updated_at: parse_timestamp(&updated)?,
    })
}

struct SqliteUnit<'a> {
    conn: &'a Connection,
    user_id: &'a UserId,
}

impl UnitOfWork for SqliteUnit<'_> {
    fn get_buying_power(&mut self) -> Result<Option<BuyingPower>, LedgerError> {
        read_buying_power(self.conn, self.user_id)
    }

    fn create_buying_power(&mut self, account: &BuyingPower) -> Result<(), LedgerError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO buying_power (user_id, amount, opening_amount, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO NOTHING",
                params![
                    self.user_id.as_str(),
                    account.amount.to_string(),
                    account.opening_amount.to_string(),
                    format_timestamp(&account.created_at),
                    format_timestamp(&account.updated_at),
                ],
            )
            .map_err(query_error)?;
        if inserted == 0 {
            return Err(LedgerError::AccountExists {
                user: self.user_id.to_string(),
            });
        }
        Ok(())
    }

    fn adjust_buying_power(&mut self, delta: Decimal) -> Result<BuyingPower, LedgerError> {
        let current =
            read_buying_power(self.conn, self.user_id)?.ok_or_else(|| LedgerError::NoSuchAccount {
                user: self.user_id.to_string(),
            })?;
        let adjusted = current.adjusted(delta, now())?;
        self.conn
            .execute(
                "UPDATE buying_power SET amount = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![
                    adjusted.amount.to_string(),
                    format_timestamp(&adjusted.updated_at),
                    self.user_id.as_str(),
                ],
            )
            .map_err(query_error)?;
        Ok(adjusted)
    }

    fn get_position(&mut self, ticker: &Ticker) -> Result<Option<Position>, LedgerError> {
        let row: Option<PositionRow> = self
            .conn
            .query_row(
                "SELECT ticker, shares, avg_cost, opened_at, updated_at
                 FROM positions WHERE user_id = ?1 AND ticker = ?2",
                params![self.user_id.as_str(), ticker.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(query_error)?;
        row.map(|row| position_from_row(self.user_id, row))
            .transpose()
    }

    fn upsert_position(&mut self, position: &Position) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "INSERT INTO positions (user_id, ticker, shares, avg_cost, opened_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, ticker) DO UPDATE SET
                     shares = excluded.shares,
                     avg_cost = excluded.avg_cost,
                     updated_at = excluded.updated_at",
                params![
                    self.user_id.as_str(),
                    position.ticker.as_str(),
                    shares_to_sql(position.shares)?,
                    position.avg_cost.to_string(),
                    format_timestamp(&position.opened_at),
                    format_timestamp(&position.updated_at),
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn delete_position(&mut self, ticker: &Ticker) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "DELETE FROM positions WHERE user_id = ?1 AND ticker = ?2",
                params![self.user_id.as_str(), ticker.as_str()],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn append_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        let trade = transaction.kind.trade();
        let bank = transaction.kind.bank();
        self.conn
            .execute(
                "INSERT INTO transactions (id, user_id, kind, amount, status, ticker, shares,
                     price_per_share, bank_name, routing_number, bank_account, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    transaction.id.to_string(),
                    self.user_id.as_str(),
                    transaction.kind.as_str(),
                    transaction.amount.to_string(),
                    transaction.status.as_str(),
                    trade.map(|t| t.ticker.as_str()),
                    trade.map(|t| shares_to_sql(t.shares)).transpose()?,
                    trade.map(|t| t.price_per_share.to_string()),
                    bank.map(|b| b.bank_name.as_str()),
                    bank.map(|b| b.routing_number.as_str()),
                    bank.map(|b| b.bank_account.as_str()),
                    format_timestamp(&transaction.created_at),
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn get_transaction(&mut self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1 AND user_id = ?2"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![id.to_string(), self.user_id.as_str()],
                TransactionRow::from_row,
            )
            .optional()
            .map_err(query_error)?;
        row.map(|row| row.into_transaction(self.user_id)).transpose()
    }

    fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let updated = self
            .conn
            .execute(
                "UPDATE transactions SET status = ?1 WHERE id = ?2 AND user_id = ?3",
                params![status.as_str(), id.to_string(), self.user_id.as_str()],
            )
            .map_err(query_error)?;
        if updated == 0 {
            return Err(LedgerError::NoSuchTransaction { id });
        }
        Ok(())
    }
}

impl LedgerStore for SqliteLedgerAdapter {
    fn transact(&self, user_id: &UserId, work: &mut Work<'_>) -> Result<(), LedgerError> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_error)?;

        let mut unit = SqliteUnit {
            conn: &tx,
            user_id,
        };
        // Dropping `tx` on error rolls it back.
        work(&mut unit)?;

        tx.commit().map_err(query_error)?;
        tracing::debug!(user = %user_id, "sqlite unit-of-work committed");
        Ok(())
    }

    fn buying_power(&self, user_id: &UserId) -> Result<Option<BuyingPower>, LedgerError> {
        let conn = self.connection()?;
        read_buying_power(&conn, user_id)
    }

    fn positions(&self, user_id: &UserId) -> Result<Vec<Position>, LedgerError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT ticker, shares, avg_cost, opened_at, updated_at
                 FROM positions WHERE user_id = ?1 ORDER BY ticker",
            )
            .map_err(query_error)?;
        let rows = stmt
            .query_map(params![user_id.as_str()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .map_err(query_error)?;

        let mut positions = Vec::new();
        for row in rows {
            let row: PositionRow = row.map_err(query_error)?;
            positions.push(position_from_row(user_id, row)?);
        }
        Ok(positions)
    }

    fn transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>, LedgerError> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE user_id = ?1 ORDER BY created_at DESC, seq DESC"
        );
        let mut stmt = conn.prepare(&sql).map_err(query_error)?;
        let rows = stmt
            .query_map(params![user_id.as_str()], TransactionRow::from_row)
            .map_err(query_error)?;

        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row.map_err(query_error)?.into_transaction(user_id)?);
        }
        Ok(transactions)
    }
}
