//! Configuration validation.
//!
//! Validates every config field before a store is opened.

use rust_decimal::Decimal;
use std::str::FromStr;

use super::config::SettlementPolicy;
use crate::domain::error::LedgerError;
use crate::ports::config_port::ConfigPort;

pub const BACKENDS: [&str; 3] = ["memory", "sqlite", "postgres"];
const MAX_RETRIES: i64 = 50;

pub fn validate_ledger_config(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    validate_backend(config)?;
    validate_initial_buying_power(config)?;
    validate_settlement(config)?;
    validate_retries(config)?;
    validate_pool_sizes(config)?;
    Ok(())
}

/// The configured backend name, defaulting to `sqlite`.
pub fn backend(config: &dyn ConfigPort) -> String {
    config
        .get_string("database", "backend")
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "sqlite".to_string())
}

fn validate_backend(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    let name = backend(config);
    if !BACKENDS.contains(&name.as_str()) {
        return Err(LedgerError::ConfigInvalid {
            section: "database".to_string(),
            key: "backend".to_string(),
            reason: format!("unknown backend {name}, expected one of {}", BACKENDS.join(", ")),
        });
    }
    match name.as_str() {
        "sqlite" => require_key(config, "sqlite", "path"),
        "postgres" => require_key(config, "postgres", "connection_string"),
        _ => Ok(()),
    }
}

fn require_key(config: &dyn ConfigPort, section: &str, key: &str) -> Result<(), LedgerError> {
    match config.get_string(section, key) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(LedgerError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Parses `[ledger] initial_buying_power`, `None` when unset.
pub fn parse_initial_buying_power(config: &dyn ConfigPort) -> Result<Option<Decimal>, LedgerError> {
    let Some(raw) = config.get_string("ledger", "initial_buying_power") else {
        return Ok(None);
    };
    let value = Decimal::from_str(raw.trim()).map_err(|_| LedgerError::ConfigInvalid {
        section: "ledger".to_string(),
        key: "initial_buying_power".to_string(),
        reason: format!("{raw} is not a decimal amount"),
    })?;
    Ok(Some(value))
}

fn validate_initial_buying_power(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    if let Some(value) = parse_initial_buying_power(config)? {
        if value < Decimal::ZERO {
            return Err(LedgerError::ConfigInvalid {
                section: "ledger".to_string(),
                key: "initial_buying_power".to_string(),
                reason: "initial_buying_power must be non-negative".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_settlement(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    match config.get_string("ledger", "settlement") {
        None => Ok(()),
        Some(s) if SettlementPolicy::parse(&s).is_some() => Ok(()),
        Some(s) => Err(LedgerError::ConfigInvalid {
            section: "ledger".to_string(),
            key: "settlement".to_string(),
            reason: format!("unknown settlement policy {s}, expected immediate or deferred"),
        }),
    }
}

fn validate_retries(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    let max_retries = config.get_int("ledger", "max_retries", 5);
    if !(1..=MAX_RETRIES).contains(&max_retries) {
        return Err(LedgerError::ConfigInvalid {
            section: "ledger".to_string(),
            key: "max_retries".to_string(),
            reason: format!("max_retries must be between 1 and {MAX_RETRIES}"),
        });
    }
    let backoff = config.get_int("ledger", "retry_backoff_ms", 10);
    if backoff < 0 {
        return Err(LedgerError::ConfigInvalid {
            section: "ledger".to_string(),
            key: "retry_backoff_ms".to_string(),
            reason: "retry_backoff_ms must be non-negative".to_string(),
        });
    }
    Ok(())
}

fn validate_pool_sizes(config: &dyn ConfigPort) -> Result<(), LedgerError> {
    for section in ["sqlite", "postgres"] {
        let size = config.get_int(section, "pool_size", 4);
        if size < 1 {
            return Err(LedgerError::ConfigInvalid {
                section: section.to_string(),
                key: "pool_size".to_string(),
                reason: "pool_size must be at least 1".to_string(),
            });
        }
    }
    let timeout = config.get_int("sqlite", "busy_timeout_ms", 5000);
    if timeout < 0 {
        return Err(LedgerError::ConfigInvalid {
            section: "sqlite".to_string(),
            key: "busy_timeout_ms".to_string(),
            reason: "busy_timeout_ms must be non-negative".to_string(),
        });
    }
    Ok(())
}
