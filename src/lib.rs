//! Contract-ABI-driven ingestion of EVM event logs into PostgreSQL.
//!
//! Logs for the configured contracts are fetched per block range, decoded
//! against each contract's ABI, mapped to a JSON payload and written once
//! per `(tx_hash, log_index)`. Ingestion runs either as a bounded
//! [`backfill::Backfill`] or as a polling [`listener::LiveListener`].

pub mod abi;
pub mod backfill;
pub mod chain;
pub mod config;
pub mod db;
pub mod decoder;
pub mod error;
pub mod listener;
pub mod mapper;
pub mod processor;
pub mod store;

pub use error::{EtlError, Result};
