//! Campus Wallet Core
//!
//! Prepaid meal wallet ledger for students, vendors and administrators.
//!
//! # Architecture
//!
//! - **Ledger of record**: Every movement is an immutable entry; the cached
//!   balance on an account is derived from it
//! - **Per-account linearization**: All mutations of one account run under
//!   its lock, inside a single atomic `WriteBatch`
//! - **Redemption intents**: Signed, short-lived QR payloads, consumed at most
//!   once through a fingerprint index
//! - **Consistency verifier**: Re-derives balances after every movement and
//!   heals drift
//!
//! # Invariants
//!
//! - Balance equals the sum of the account's entries after every commit
//! - Balance never goes negative
//! - An intent debits at most once
//! - Entries are never modified or deleted

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod locks;
pub mod meal_skip;
pub mod metrics;
pub mod projection;
pub mod qr;
pub mod reports;
pub mod storage;
pub mod types;
pub mod verifier;
pub mod wallet;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use storage::Storage;
pub use types::{Account, AccountId, EntryKind, LedgerEntry, Principal, Role, Source};
pub use wallet::Wallet;
