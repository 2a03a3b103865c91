//! PostgreSQL ledger store.
//!
//! Units run at `SERIALIZABLE` and begin by locking the user's buying-power
//! row, so units for one user queue on that lock while other users proceed.
//! Serialization failures and deadlocks come back as `ConcurrencyConflict`.

use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::{IsolationLevel, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use rust_decimal::Decimal;
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
    amount NUMERIC NOT NULL CHECK (amount >= 0),
    opening_amount NUMERIC NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS positions (
    user_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    shares BIGINT NOT NULL CHECK (shares > 0),
    avg_cost NUMERIC NOT NULL,
    opened_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, ticker)
);
CREATE TABLE IF NOT EXISTS transactions (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('deposit', 'withdrawal', 'buy', 'sell')),
    amount NUMERIC NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    ticker TEXT,
    shares BIGINT,
    price_per_share NUMERIC,
    bank_name TEXT,
    routing_number TEXT,
    bank_account TEXT,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_user_created
    ON transactions(user_id, created_at);";

const TRANSACTION_COLUMNS: &str = "id, kind, amount, status, ticker, shares, price_per_share, \
     bank_name, routing_number, bank_account, created_at";

type Manager = PostgresConnectionManager<NoTls>;

pub struct PostgresLedgerAdapter {
    pool: Pool<Manager>,
}

impl PostgresLedgerAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, LedgerError> {
        let connection_string = config
            .get_string("postgres", "connection_string")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| LedgerError::ConfigMissing {
                section: "postgres".into(),
                key: "connection_string".into(),
            })?;
        let pool_size = config.get_int("postgres", "pool_size", 4).max(1) as u32;

        Self::open(&connection_string, pool_size)
    }

    pub fn open(connection_string: &str, pool_size: u32) -> Result<Self, LedgerError> {
        let pg_config = connection_string
            .parse::<postgres::Config>()
            .map_err(|e| LedgerError::ConfigInvalid {
                section: "postgres".into(),
                key: "connection_string".into(),
                reason: e.to_string(),
            })?;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e: r2d2::Error| LedgerError::StoreUnavailable {
                reason: e.to_string(),
            })?;

        tracing::debug!(pool_size, "postgres ledger opened");
        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), LedgerError> {
        let mut conn = self.connection()?;
        conn.batch_execute(SCHEMA).map_err(query_error)?;
        Ok(())
    }

    pub fn close(self) {
        tracing::debug!("postgres ledger closed");
        drop(self.pool);
    }

    fn connection(&self) -> Result<PooledConnection<Manager>, LedgerError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| LedgerError::StoreUnavailable {
                reason: e.to_string(),
            })
    }
}

fn query_error(e: postgres::Error) -> LedgerError {
    if let Some(code) = e.code() {
        if is_conflict_state(code) {
            return LedgerError::ConcurrencyConflict { attempts: 1 };
        }
        if is_unavailable_state(code) {
            return LedgerError::StoreUnavailable {
                reason: e.to_string(),
            };
        }
    }
    let io_failure = std::error::Error::source(&e)
        .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if e.is_closed() || (e.code().is_none() && io_failure) {
        return LedgerError::StoreUnavailable {
            reason: e.to_string(),
        };
    }
    LedgerError::StoreQuery {
        reason: e.to_string(),
    }
}

fn is_conflict_state(code: &SqlState) -> bool {
    *code == SqlState::T_R_SERIALIZATION_FAILURE || *code == SqlState::T_R_DEADLOCK_DETECTED
}

/// Connection exceptions (class 08) and operator intervention (57P).
fn is_unavailable_state(code: &SqlState) -> bool {
    let code = code.code();
    code.starts_with("08") || code.starts_with("57P")
}

fn column<'a, T: postgres::types::FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T, LedgerError> {
    row.try_get(idx).map_err(query_error)
}

fn shares_to_sql(shares: u64) -> Result<i64, LedgerError> {
    i64::try_from(shares).map_err(|_| LedgerError::validation("share count is too large"))
}

fn shares_from_sql(shares: i64) -> Result<u64, LedgerError> {
    u64::try_from(shares).map_err(|e| LedgerError::StoreQuery {
        reason: format!("corrupt share count: {e}"),
    })
}

fn buying_power_from_row(user_id: &UserId, row: &Row) -> Result<BuyingPower, LedgerError> {
    Ok(BuyingPower {
        user_id: user_id.clone(),
        amount: column(row, 0)?,
        opening_amount: column(row, 1)?,
        created_at: column(row, 2)?,
        updated_at: column(row, 3)?,
    })
}

fn position_from_row(user_id: &UserId, row: &Row) -> Result<Position, LedgerError> {
    let ticker: String = column(row, 0)?;
    Ok(Position {
        user_id: user_id.clone(),
        ticker: Ticker::new(&ticker)?,
        shares: shares_from_sql(column(row, 1)?)?,
        avg_cost: column(row, 2)?,
        opened_at: column(row, 3)?,
        updated_at: column(row, 4)?,
    })
}

fn transaction_from_row(user_id: &UserId, row: &Row) -> Result<Transaction, LedgerError> {
    let id: Uuid = column(row, 0)?;
    let kind: String = column(row, 1)?;
    let status: String = column(row, 3)?;
    let status = TransactionStatus::parse(&status).ok_or_else(|| LedgerError::StoreQuery {
        reason: format!("corrupt status {status} on transaction {id}"),
    })?;

    let kind = match kind.as_str() {
        "buy" | "sell" => {
            let ticker: String = column(row, 4)?;
            let shares: i64 = column(row, 5)?;
            let trade = TradeDetails::new(
                Ticker::new(&ticker)?,
                shares_from_sql(shares)?,
                column(row, 6)?,
            )?;
            if kind == "buy" {
                TransactionKind::Buy(trade)
            } else {
                TransactionKind::Sell(trade)
            }
        }
        "deposit" | "withdrawal" => {
            let name: String = column(row, 7)?;
            let routing: String = column(row, 8)?;
            let account: String = column(row, 9)?;
            let bank = BankDetails::new(&name, &routing, &account)?;
            if kind == "deposit" {
                TransactionKind::Deposit(bank)
            } else {
                TransactionKind::Withdrawal(bank)
            }
        }
        other => {
            return Err(LedgerError::StoreQuery {
                reason: format!("corrupt kind {other} on transaction {id}"),
            });
        }
    };

    let amount: Decimal = column(row, 2)?;
    let created_at: DateTime<Utc> = column(row, 10)?;
    Ok(Transaction::restore(
        id,
        user_id.clone(),
        kind,
        amount,
        status,
        created_at,
    ))
}

struct PostgresUnit<'a> {
    tx: postgres::Transaction<'a>,
    user_id: &'a UserId,
}

impl UnitOfWork for PostgresUnit<'_> {
    fn get_buying_power(&mut self) -> Result<Option<BuyingPower>, LedgerError> {
        let row = self
            .tx
            .query_opt(
                "SELECT amount, opening_amount, created_at, updated_at
                 FROM buying_power WHERE user_id = $1",
                &[&self.user_id.as_str()],
            )
            .map_err(query_error)?;
        row.map(|row| buying_power_from_row(self.user_id, &row))
            .transpose()
    }

    fn create_buying_power(&mut self, account: &BuyingPower) -> Result<(), LedgerError> {
        let inserted = self
            .tx
            .execute(
                "INSERT INTO buying_power (user_id, amount, opening_amount, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (user_id) DO NOTHING",
                &[
                    &self.user_id.as_str(),
                    &account.amount,
                    &account.opening_amount,
                    &account.created_at,
                    &account.updated_at,
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
        let current = self
            .get_buying_power()?
            .ok_or_else(|| LedgerError::NoSuchAccount {
                user: self.user_id.to_string(),
            })?;
        let adjusted = current.adjusted(delta, now())?;
        self.tx
            .execute(
                "UPDATE buying_power SET amount = $1, updated_at = $2 WHERE user_id = $3",
                &[&adjusted.amount, &adjusted.updated_at, &self.user_id.as_str()],
            )
            .map_err(query_error)?;
        Ok(adjusted)
    }

    fn get_position(&mut self, ticker: &Ticker) -> Result<Option<Position>, LedgerError> {
        let row = self
            .tx
            .query_opt(
                "SELECT ticker, shares, avg_cost, opened_at, updated_at
                 FROM positions WHERE user_id = $1 AND ticker = $2",
                &[&self.user_id.as_str(), &ticker.as_str()],
            )
            .map_err(query_error)?;
        row.map(|row| position_from_row(self.user_id, &row))
            .transpose()
    }

    fn upsert_position(&mut self, position: &Position) -> Result<(), LedgerError> {
        let shares = shares_to_sql(position.shares)?;
        self.tx
            .execute(
                "INSERT INTO positions (user_id, ticker, shares, avg_cost, opened_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (user_id, ticker) DO UPDATE SET
                     shares = EXCLUDED.shares,
                     avg_cost = EXCLUDED.avg_cost,
                     updated_at = EXCLUDED.updated_at",
                &[
                    &self.user_id.as_str(),
                    &position.ticker.as_str(),
                    &shares,
                    &position.avg_cost,
                    &position.opened_at,
                    &position.updated_at,
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn delete_position(&mut self, ticker: &Ticker) -> Result<(), LedgerError> {
        self.tx
            .execute(
                "DELETE FROM positions WHERE user_id = $1 AND ticker = $2",
                &[&self.user_id.as_str(), &ticker.as_str()],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn append_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        let trade = transaction.kind.trade();
        let bank = transaction.kind.bank();
        let ticker = trade.map(|t| t.ticker.as_str());
        let shares = trade.map(|t| shares_to_sql(t.shares)).transpose()?;
        let price = trade.map(|t| t.price_per_share);
        let bank_name = bank.map(|b| b.bank_name.as_str());
        let routing_number = bank.map(|b| b.routing_number.as_str());
        let bank_account = bank.map(|b| b.bank_account.as_str());

        self.tx
            .execute(
                "INSERT INTO transactions (id, user_id, kind, amount, status, ticker, shares,
                     price_per_share, bank_name, routing_number, bank_account, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &transaction.id,
                    &self.user_id.as_str(),
                    &transaction.kind.as_str(),
                    &transaction.amount,
                    &transaction.status.as_str(),
                    &ticker,
                    &shares,
                    &price,
                    &bank_name,
                    &routing_number,
                    &bank_account,
                    &transaction.created_at,
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn get_transaction(&mut self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 AND user_id = $2"
        );
        let row = self
            .tx
            .query_opt(sql.as_str(), &[&id, &self.user_id.as_str()])
            .map_err(query_error)?;
        row.map(|row| transaction_from_row(self.user_id, &row))
            .transpose()
    }

    fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let updated = self
            .tx
            .execute(
                "UPDATE transactions SET status = $1 WHERE id = $2 AND user_id = $3",
                &[&status.as_str(), &id, &self.user_id.as_str()],
            )
            .map_err(query_error)?;
        if updated == 0 {
            return Err(LedgerError::NoSuchTransaction { id });
        }
        Ok(())
    }
}

impl LedgerStore for PostgresLedgerAdapter {
    fn transact(&self, user_id: &UserId, work: &mut Work<'_>) -> Result<(), LedgerError> {
        let mut conn = self.connection()?;
        let mut tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .map_err(query_error)?;
        tx.execute(
            "SELECT 1 FROM buying_power WHERE user_id = $1 FOR UPDATE",
            &[&user_id.as_str()],
        )
        .map_err(query_error)?;

        let mut unit = PostgresUnit { tx, user_id };
        // An uncommitted transaction rolls back when dropped.
        work(&mut unit)?;

        unit.tx.commit().map_err(query_error)?;
        tracing::debug!(user = %user_id, "postgres unit-of-work committed");
        Ok(())
    }

    fn buying_power(&self, user_id: &UserId) -> Result<Option<BuyingPower>, LedgerError> {
        let mut conn = self.connection()?;
        let row = conn
            .query_opt(
                "SELECT amount, opening_amount, created_at, updated_at
                 FROM buying_power WHERE user_id = $1",
                &[&user_id.as_str()],
            )
            .map_err(query_error)?;
        row.map(|row| buying_power_from_row(user_id, &row))
            .transpose()
    }

    fn positions(&self, user_id: &UserId) -> Result<Vec<Position>, LedgerError> {
        let mut conn = self.connection()?;
        let rows = conn
            .query(
                "SELECT ticker, shares, avg_cost, opened_at, updated_at
                 FROM positions WHERE user_id = $1 ORDER BY ticker",
                &[&user_id.as_str()],
            )
            .map_err(query_error)?;
        rows.iter()
            .map(|row| position_from_row(user_id, row))
            .collect()
    }

    fn transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>, LedgerError> {
        let mut conn = self.connection()?;
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE user_id = $1 ORDER BY created_at DESC, seq DESC"
        );
        let rows = conn
            .query(sql.as_str(), &[&user_id.as_str()])
            .map_err(query_error)?;
        rows.iter()
            .map(|row| transaction_from_row(user_id, row))
            .collect()
    }
}
