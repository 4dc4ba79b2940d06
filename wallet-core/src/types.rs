//! Core types for the wallet
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, JSON at the boundary)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds a meal balance
    Student,
    /// Redeems intents at a venue
    Vendor,
    /// Audits and refunds
    Admin,
}

impl Role {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Vendor => "vendor",
            Role::Admin => "admin",
        }
    }

    /// Name shown to people
    pub fn display_name(&self) -> &'static str {
        match self {
            Role::Student => "Student",
            Role::Vendor => "Vendor",
            Role::Admin => "Administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wallet account. `balance` caches the ledger sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub account_id: AccountId,
    /// Role
    pub role: Role,
    /// Cached balance
    pub balance: Decimal,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// New account with zero balance
    pub fn new(account_id: AccountId, role: Role) -> Self {
        Self {
            account_id,
            role,
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }
}

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Credit from the holder or a parent
    #[serde(rename = "top-up")]
    TopUp,
    /// Debit at a vendor
    #[serde(rename = "deduction")]
    Deduction,
    /// Administrative credit
    #[serde(rename = "refund")]
    Refund,
}

impl EntryKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::TopUp => "top-up",
            EntryKind::Deduction => "deduction",
            EntryKind::Refund => "refund",
        }
    }
}

/// Origin of a credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The account holder
    #[default]
    #[serde(rename = "self")]
    Own,
    /// A parent paying remotely
    Parent,
    /// An administrator
    Admin,
}

impl Source {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Own => "self",
            Source::Parent => "parent",
            Source::Admin => "admin",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settlement status of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Settled
    #[default]
    Success,
    /// Awaiting confirmation
    Pending,
    /// Being processed by a payment provider
    Processing,
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,
    /// Owning account
    pub account_id: AccountId,
    /// Signed amount: positive credits, negative debits
    pub amount: Decimal,
    /// Kind of movement
    pub kind: EntryKind,
    /// Free text
    pub description: String,
    /// Venue of a deduction
    pub venue: Option<String>,
    /// Origin of a credit
    pub source: Option<Source>,
    /// Status
    #[serde(default)]
    pub status: EntryStatus,
    /// Skipped-meal marker
    #[serde(default)]
    pub skipped: bool,
    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// Settled entry stamped now
    pub fn new(
        account_id: AccountId,
        amount: Decimal,
        kind: EntryKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::now_v7(),
            account_id,
            amount,
            kind,
            description: description.into(),
            venue: None,
            source: None,
            status: EntryStatus::Success,
            skipped: false,
            timestamp: Utc::now(),
        }
    }

    /// Set venue
    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }

    /// Set source
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Set status
    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    /// True for credits (top-up, refund)
    pub fn is_credit(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

/// Verified identity handed in by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Authenticated account
    pub account_id: AccountId,
    /// Role claimed by the credential
    pub role: Role,
    /// Credential expiry
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    /// Principal valid for 24 hours
    pub fn new(account_id: AccountId, role: Role) -> Self {
        Self {
            account_id,
            role,
            expires_at: Utc::now() + chrono::Duration::hours(24),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&EntryKind::TopUp).unwrap(), "\"top-up\"");
        assert_eq!(serde_json::to_string(&Source::Own).unwrap(), "\"self\"");
        assert_eq!(serde_json::to_string(&Role::Vendor).unwrap(), "\"vendor\"");

        let source: Source = serde_json::from_str("\"parent\"").unwrap();
        assert_eq!(source, Source::Parent);
    }

    #[test]
    fn test_entry_bincode_roundtrip() {
        let entry = LedgerEntry::new(
            AccountId::new("student-1"),
            Decimal::new(-7050, 2),
            EntryKind::Deduction,
            "Lunch",
        )
        .with_venue("North Canteen");

        let bytes = bincode::serialize(&entry).unwrap();
        let decoded: LedgerEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, entry);
        assert!(!decoded.is_credit());
    }
}
