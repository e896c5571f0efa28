//! Error types for the ingestion core.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors surfaced by the ingestion core.
///
/// Logs that match no known event and inserts that hit the dedup key are
/// not errors; they never reach this type.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ABI load error for contract '{contract}': {reason}")]
    AbiLoad { contract: String, reason: String },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Postgres database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    pub fn abi_load(contract: impl Into<String>, reason: impl ToString) -> Self {
        Self::AbiLoad {
            contract: contract.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors after which re-running the same block range is expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Timeout { .. } | Self::Database(_))
    }
}
