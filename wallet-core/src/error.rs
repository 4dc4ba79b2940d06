//! Error types for the wallet
//!
//! Every failure a caller can observe maps to one [`ErrorKind`] and an
//! HTTP-style status class. Consistency faults have no variant: the verifier
//! heals them and reports them through logs and metrics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Result type for wallet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wallet errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad, missing or out-of-range input
    #[error("{0}")]
    Validation(String),

    /// Missing, expired or invalid credential
    #[error("{0}")]
    Auth(String),

    /// Authenticated principal holds the wrong role
    #[error("{0}")]
    Forbidden(String),

    /// Unknown account or record
    #[error("{0}")]
    NotFound(String),

    /// Redemption intent already consumed, or record already exists
    #[error("{message}")]
    Conflict {
        /// Human readable message
        message: String,
        /// Timestamp of the entry that consumed the intent
        previous_transaction: Option<DateTime<Utc>>,
        /// Absolute amount of that entry
        previous_amount: Option<Decimal>,
    },

    /// Balance below the requested cost
    #[error("Insufficient balance: balance {balance}, required {required}")]
    InsufficientFunds {
        /// Current balance
        balance: Decimal,
        /// Requested cost
        required: Decimal,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Signature creation or decoding failed
    #[error("Signature error: {0}")]
    Signature(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Machine-distinguishable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::Auth`]
    Auth,
    /// See [`Error::Forbidden`]
    Forbidden,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::Conflict`]
    Conflict,
    /// See [`Error::InsufficientFunds`]
    InsufficientFunds,
    /// Storage, serialization, signature, config and IO failures
    Internal,
}

impl Error {
    /// Shorthand for a conflict without prior transaction details
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            previous_transaction: None,
            previous_amount: None,
        }
    }

    /// Error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Signature(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-style status code
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::InsufficientFunds => 400,
            ErrorKind::Auth => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }

    /// Structured response body for the request boundary
    pub fn to_response(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });

        match self {
            Error::Conflict {
                previous_transaction,
                previous_amount,
                ..
            } => {
                if let Some(ts) = previous_transaction {
                    body["previous_transaction"] = serde_json::json!(ts.to_rfc3339());
                }
                if let Some(amount) = previous_amount {
                    body["previous_amount"] = serde_json::json!(amount.to_string());
                }
            }
            Error::InsufficientFunds { balance, required } => {
                body["current_balance"] = serde_json::json!(balance.to_string());
                body["required"] = serde_json::json!(required.to_string());
                body["shortfall"] = serde_json::json!((*required - *balance).to_string());
            }
            _ => {}
        }

        body
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
