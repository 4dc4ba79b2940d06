//! Balance projection for the account holder
//!
//! Estimates what the balance will be after the next meal and suggests a
//! top-up amount from recent spending.

use crate::types::{EntryKind, EntryStatus, LedgerEntry};
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Deductions considered for the suggestion
pub const RECENT_DEDUCTIONS: usize = 5;

/// Suggestion when there is no spending history
const BASELINE_SUGGESTION: i64 = 200;

/// Smallest suggestion
const MIN_SUGGESTION: i64 = 100;

/// Suggestions are multiples of this
const SUGGESTION_STEP: i64 = 50;

/// Projection result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    /// Balance plus pending top-ups minus the next meal
    pub projected_balance: Decimal,
    /// Cost of the next meal
    pub next_meal_cost: Decimal,
    /// Top-ups still being processed
    pub pending_amount: Decimal,
    /// Suggested top-up amount
    pub suggestion_amount: Decimal,
    /// Confidence in the suggestion, 0.5 to 0.95
    pub confidence_score: f64,
}

/// Cost of the next meal for a wall clock hour (0-23)
pub fn next_meal_cost(hour: u32) -> Decimal {
    match hour {
        0..=9 => Decimal::from(30),
        10..=14 => Decimal::from(70),
        15..=20 => Decimal::from(60),
        // Late night, next is breakfast
        _ => Decimal::from(30),
    }
}

/// Project `balance` over the holder's `entries` (any order) at `now`
pub fn project(balance: Decimal, entries: &[LedgerEntry], now: DateTime<Utc>) -> Projection {
    let next_meal_cost = next_meal_cost(now.hour());

    let pending_amount: Decimal = entries
        .iter()
        .filter(|e| e.kind == EntryKind::TopUp && e.status == EntryStatus::Processing)
        .map(|e| e.amount)
        .sum();

    let mut deductions: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Deduction)
        .collect();
    deductions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    deductions.truncate(RECENT_DEDUCTIONS);

    let suggestion_amount = if deductions.is_empty() {
        Decimal::from(BASELINE_SUGGESTION)
    } else {
        let total: Decimal = deductions.iter().map(|e| e.amount.abs()).sum();
        let average = total / Decimal::from(deductions.len());
        let step = Decimal::from(SUGGESTION_STEP);
        ((average / step).round() * step).max(Decimal::from(MIN_SUGGESTION))
    };

    let confidence_score = (0.5 + 0.1 * deductions.len() as f64).min(0.95);

    Projection {
        projected_balance: balance + pending_amount - next_meal_cost,
        next_meal_cost,
        pending_amount,
        suggestion_amount,
        confidence_score,
    }
}
