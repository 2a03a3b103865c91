//! Domain error types.

use rust_decimal::Decimal;
use uuid::Uuid;

use super::transaction::TransactionStatus;

/// Top-level error type for tradeledger.
///
/// Business rejections (`InsufficientFunds`, `InsufficientShares`,
/// `NoSuchPosition`, ...) are raised inside a unit-of-work before anything
/// is written, so the store is left untouched whenever one is returned.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("insufficient shares of {ticker}: requested {requested}, held {held}")]
    InsufficientShares {
        ticker: String,
        requested: u64,
        held: u64,
    },

    #[error("no position in {ticker}")]
    NoSuchPosition { ticker: String },

    #[error("no buying power account for user {user}")]
    NoSuchAccount { user: String },

    #[error("buying power account already exists for user {user}")]
    AccountExists { user: String },

    #[error("no transaction {id}")]
    NoSuchTransaction { id: Uuid },

    #[error("transaction {id} is already {status}")]
    TransactionNotPending { id: Uuid, status: TransactionStatus },

    #[error("price unavailable for {ticker}")]
    PriceUnavailable { ticker: String },

    #[error("concurrency conflict: gave up after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("store query error: {reason}")]
    StoreQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn validation(reason: impl Into<String>) -> Self {
        LedgerError::Validation {
            reason: reason.into(),
        }
    }

    /// True when the caller may safely repeat the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrencyConflict { .. } | LedgerError::StoreUnavailable { .. }
        )
    }

    /// True for rejections caused by account state rather than by the request shape
    /// or the infrastructure.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds { .. }
                | LedgerError::InsufficientShares { .. }
                | LedgerError::NoSuchPosition { .. }
                | LedgerError::NoSuchAccount { .. }
                | LedgerError::AccountExists { .. }
                | LedgerError::NoSuchTransaction { .. }
                | LedgerError::TransactionNotPending { .. }
                | LedgerError::PriceUnavailable { .. }
        )
    }
}

impl LedgerError {
    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            LedgerError::Io(_) => 1,
            LedgerError::ConfigParse { .. }
            | LedgerError::ConfigMissing { .. }
            | LedgerError::ConfigInvalid { .. } => 2,
            LedgerError::StoreUnavailable { .. } | LedgerError::StoreQuery { .. } => 3,
            LedgerError::Validation { .. } => 4,
            LedgerError::ConcurrencyConflict { .. } => 6,
            _ => 5,
        }
    }
}

impl From<&LedgerError> for std::process::ExitCode {
    fn from(err: &LedgerError) -> Self {
        std::process::ExitCode::from(err.exit_code())
    }
}
