//! Port traits the domain depends on.

pub mod config_port;
pub mod ledger_port;
pub mod pricing_port;
