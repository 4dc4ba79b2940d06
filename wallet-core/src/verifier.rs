//! Consistency verifier
//!
//! Recomputes an account's balance from its ledger entries and compares it
//! with the cached balance, at currency precision. A mismatch is a consistency
//! fault: it is logged, counted, and healed by overwriting the cached balance
//! with the ledger sum. The per-account lock is what keeps balances correct;
//! this only detects and repairs drift.

use crate::{
    error::Result,
    metrics::Metrics,
    types::AccountId,
    Storage,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Decimal places of the currency
pub const CURRENCY_SCALE: u32 = 2;

/// Outcome of verifying one account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    /// Account checked
    pub account_id: AccountId,
    /// Balance after verification (the ledger sum)
    pub balance: Decimal,
    /// Cached balance that was overwritten, if a fault was healed
    pub corrected_from: Option<Decimal>,
}

/// Result of sweeping every account
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Accounts checked
    pub accounts_checked: usize,
    /// Accounts whose cached balance was corrected
    pub corrected: Vec<Verification>,
}

/// Detects and heals cached balance drift
#[derive(Clone)]
pub struct ConsistencyVerifier {
    storage: Arc<Storage>,
    metrics: Metrics,
}

impl ConsistencyVerifier {
    /// Create verifier
    pub fn new(storage: Arc<Storage>, metrics: Metrics) -> Self {
        Self { storage, metrics }
    }

    /// Verified balance of `account_id`
    pub async fn verify(&self, account_id: &AccountId) -> Result<Decimal> {
        Ok(self.check(account_id).await?.balance)
    }

    /// Verify one account and report whether it was corrected
    pub async fn check(&self, account_id: &AccountId) -> Result<Verification> {
        let mut txn = self.storage.begin(account_id).await?;
        let ledger_sum = txn.sum_for_account()?;
        let cached = txn.account().balance;

        if cached.round_dp(CURRENCY_SCALE) == ledger_sum.round_dp(CURRENCY_SCALE) {
            return Ok(Verification {
                account_id: account_id.clone(),
                balance: cached,
                corrected_from: None,
            });
        }

        tracing::error!(
            account_id = %account_id,
            cached_balance = %cached,
            ledger_sum = %ledger_sum,
            "Consistency fault: balance does not match ledger"
        );
        self.metrics.record_consistency_fault();

        txn.update_balance(ledger_sum)?;
        txn.commit()?;

        tracing::info!(account_id = %account_id, balance = %ledger_sum, "Balance corrected from ledger");

        Ok(Verification {
            account_id: account_id.clone(),
            balance: ledger_sum,
            corrected_from: Some(cached),
        })
    }

    /// Verify every account
    pub async fn verify_all(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for account in self.storage.list_accounts()? {
            let verification = self.check(&account.account_id).await?;
            report.accounts_checked += 1;
            if verification.corrected_from.is_some() {
                report.corrected.push(verification);
            }
        }

        tracing::info!(
            accounts_checked = report.accounts_checked,
            corrected = report.corrected.len(),
            "Consistency sweep finished"
        );
        Ok(report)
    }
}
