//! Core domain types and services.

pub mod account;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod executor;
pub mod identifiers;
pub mod portfolio;
pub mod position;
pub mod reader;
pub mod retry;
pub mod transaction;
pub mod transfer;
