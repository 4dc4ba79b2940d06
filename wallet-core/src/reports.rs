//! Administrative ledger report

use crate::types::{Account, EntryKind, LedgerEntry, Role};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Days covered by the volume trend
pub const TREND_DAYS: i64 = 7;

/// Absolute volume moved on one day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyVolume {
    /// UTC calendar day
    pub date: NaiveDate,
    /// Absolute value of the day's net amount
    pub volume: Decimal,
}

/// Aggregates over all accounts and entries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerReport {
    /// Number of ledger entries
    pub total_transactions: usize,
    /// Absolute value of the net sum of all entries
    pub total_volume: Decimal,
    /// Deduction count per venue
    pub venue_report: BTreeMap<String, usize>,
    /// Top-up count per source
    pub source_report: BTreeMap<String, usize>,
    /// Daily volume over the trend window, ascending by date
    pub growth_trend: Vec<DailyVolume>,
    /// Account count per role
    pub entity_distribution: BTreeMap<String, usize>,
    /// Number of student accounts
    pub active_users: usize,
}

/// Build the report as of `now`
pub fn build_report(
    accounts: &[Account],
    entries: &[LedgerEntry],
    now: DateTime<Utc>,
) -> LedgerReport {
    let mut venue_report = BTreeMap::new();
    let mut source_report = BTreeMap::new();
    let mut daily: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    let window_start = now - Duration::days(TREND_DAYS);

    for entry in entries {
        match entry.kind {
            EntryKind::Deduction => {
                let venue = entry.venue.as_deref().unwrap_or("Unknown Venue");
                *venue_report.entry(venue.to_string()).or_insert(0) += 1;
            }
            EntryKind::TopUp => {
                let source = entry.source.unwrap_or_default();
                *source_report.entry(source.as_str().to_string()).or_insert(0) += 1;
            }
            EntryKind::Refund => {}
        }

        if entry.timestamp >= window_start {
            *daily.entry(entry.timestamp.date_naive()).or_default() += entry.amount;
        }
    }

    let mut entity_distribution = BTreeMap::new();
    for account in accounts {
        *entity_distribution
            .entry(account.role.as_str().to_string())
            .or_insert(0) += 1;
    }

    LedgerReport {
        total_transactions: entries.len(),
        total_volume: entries.iter().map(|e| e.amount).sum::<Decimal>().abs(),
        venue_report,
        source_report,
        growth_trend: daily
            .into_iter()
            .map(|(date, net)| DailyVolume {
                date,
                volume: net.abs(),
            })
            .collect(),
        entity_distribution,
        active_users: accounts.iter().filter(|a| a.role == Role::Student).count(),
    }
}
