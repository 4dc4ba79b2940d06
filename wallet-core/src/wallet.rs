//! Wallet orchestration layer
//!
//! Ties together storage, the consistency verifier, redemption intents and
//! metrics into the operations exposed to the request layer.
//!
//! Every money movement follows the same sequence: role gate, input
//! validation, account lock, business rule, staged entry and balance, atomic
//! commit, then re-verification of the balance against the ledger.
//!
//! # Example
//!
//! ```no_run
//! use wallet_core::{Config, Wallet};
//! use wallet_core::types::{AccountId, Principal, Role};
//! use wallet_core::wallet::TopUpRequest;
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> wallet_core::Result<()> {
//!     let wallet = Wallet::open(Config::default())?;
//!     let student = AccountId::new("student-1");
//!     wallet.open_account(student.clone(), Role::Student).await?;
//!
//!     let principal = Principal::new(student, Role::Student);
//!     let update = wallet
//!         .top_up(&principal, TopUpRequest { amount: Some(Decimal::from(200)), ..Default::default() })
//!         .await?;
//!     assert_eq!(update.new_balance, Decimal::from(200));
//!     Ok(())
//! }
//! ```

use crate::{
    auth::authorize,
    crypto::KeyPair,
    error::{Error, ErrorKind, Result},
    meal_skip::MealSkipScheduler,
    metrics::Metrics,
    projection::{self, Projection},
    qr::{IssuedIntent, QrIssuer},
    reports::{self, LedgerReport},
    types::{Account, AccountId, EntryKind, LedgerEntry, Principal, Role, Source},
    verifier::{ConsistencyVerifier, CURRENCY_SCALE},
    Config, Storage,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

const ALL_ROLES: &[Role] = &[Role::Student, Role::Vendor, Role::Admin];

/// Top-up request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopUpRequest {
    /// Amount to credit
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub amount: Option<Decimal>,
    /// Who is paying
    #[serde(default)]
    pub source: Source,
}

/// Meal deduction request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeductRequest {
    /// Redemption intent as scanned
    #[serde(default)]
    pub qr_payload: Option<Value>,
    /// Amount to debit
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub meal_cost: Option<Decimal>,
    /// Entry description, `Meal` when absent
    #[serde(default)]
    pub description: Option<String>,
    /// Venue, `Unknown Venue` when absent
    #[serde(default)]
    pub venue: Option<String>,
}

/// Refund request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundRequest {
    /// Account to credit
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Amount to credit
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub amount: Option<Decimal>,
}

/// Result of a credit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceUpdate {
    /// Human readable outcome
    pub message: String,
    /// Verified balance after the operation
    pub new_balance: Decimal,
}

/// Result of a meal deduction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeductionReceipt {
    /// Human readable outcome
    pub message: String,
    /// Verified balance after the deduction
    pub new_balance: Decimal,
    /// Debited account
    pub account_id: AccountId,
    /// Amount debited
    pub amount_deducted: Decimal,
}

/// Current balance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceView {
    /// Verified balance
    pub balance: Decimal,
}

/// Campus meal wallet
pub struct Wallet {
    storage: Arc<Storage>,
    verifier: ConsistencyVerifier,
    issuer: QrIssuer,
    meal_skips: MealSkipScheduler,
    metrics: Metrics,
    config: Config,
}

impl Wallet {
    /// Open wallet with configuration
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let keypair = match &config.qr.signing_seed {
            Some(seed) => KeyPair::from_hex_seed(seed)?,
            None => {
                tracing::warn!("No signing seed configured, intents will not survive a restart");
                KeyPair::generate()
            }
        };
        let issuer = QrIssuer::new(keypair, Duration::seconds(config.qr.intent_ttl_secs));

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            "Wallet opened"
        );

        Ok(Self {
            verifier: ConsistencyVerifier::new(storage.clone(), metrics.clone()),
            meal_skips: MealSkipScheduler::new(storage.clone()),
            storage,
            issuer,
            metrics,
            config,
        })
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Consistency verifier
    pub fn verifier(&self) -> &ConsistencyVerifier {
        &self.verifier
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Meal skip scheduling
    pub fn meal_skips(&self) -> &MealSkipScheduler {
        &self.meal_skips
    }

    /// Configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }

    // Account administration

    /// Create an account with zero balance
    pub async fn open_account(&self, account_id: AccountId, role: Role) -> Result<Account> {
        if account_id.as_str().trim().is_empty() {
            return Err(Error::Validation("Account id must not be empty".to_string()));
        }
        let account = Account::new(account_id, role);
        self.storage.create_account(&account).await?;
        Ok(account)
    }

    /// All accounts (admin)
    pub fn list_accounts(&self, principal: &Principal) -> Result<Vec<Account>> {
        authorize(principal, &[Role::Admin], Utc::now())?;
        self.storage.list_accounts()
    }

    // Redemption intents

    /// Issue a redemption intent for the principal's own account
    pub fn issue_intent(&self, principal: &Principal) -> Result<IssuedIntent> {
        self.issue_intent_at(principal, Utc::now())
    }

    /// Issue a redemption intent as of `now`
    pub fn issue_intent_at(&self, principal: &Principal, now: DateTime<Utc>) -> Result<IssuedIntent> {
        authorize(principal, &[Role::Student], now)?;
        if self.storage.get_account(&principal.account_id)?.is_none() {
            return Err(Error::NotFound("User not found".to_string()));
        }
        self.issuer.issue(&principal.account_id, now)
    }

    // Money movements

    /// Credit the principal's own account
    pub async fn top_up(&self, principal: &Principal, request: TopUpRequest) -> Result<BalanceUpdate> {
        self.observe(self.top_up_inner(principal, request)).await
    }

    async fn top_up_inner(&self, principal: &Principal, request: TopUpRequest) -> Result<BalanceUpdate> {
        authorize(principal, &[Role::Student], Utc::now())?;

        let amount = validate_amount(request.amount, "Invalid amount")?;
        let source = request.source;
        if source == Source::Admin {
            return Err(Error::Validation("Invalid top-up source".to_string()));
        }
        let ceiling = self.config.limits.top_up_ceiling;
        if amount > ceiling {
            return Err(Error::Validation(format!(
                "Maximum top-up amount is {}",
                ceiling
            )));
        }

        let mut txn = self.storage.begin(&principal.account_id).await?;
        let new_balance = txn.account().balance + amount;
        txn.append(
            LedgerEntry::new(
                principal.account_id.clone(),
                amount,
                EntryKind::TopUp,
                format!("Top-up via {}", source),
            )
            .with_source(source),
        )?;
        txn.update_balance(new_balance)?;
        let (account, _) = txn.commit()?;

        self.metrics.record_movement(EntryKind::TopUp);
        tracing::info!(
            account_id = %principal.account_id,
            amount = %amount,
            source = %source,
            "Top-up committed"
        );

        Ok(BalanceUpdate {
            message: "Top-up successful".to_string(),
            new_balance: self.settled_balance(&account).await,
        })
    }

    /// Redeem an intent for a meal
    pub async fn deduct(&self, principal: &Principal, request: DeductRequest) -> Result<DeductionReceipt> {
        self.deduct_at(principal, request, Utc::now()).await
    }

    /// Redeem an intent for a meal as of `now`
    pub async fn deduct_at(
        &self,
        principal: &Principal,
        request: DeductRequest,
        now: DateTime<Utc>,
    ) -> Result<DeductionReceipt> {
        self.observe(self.deduct_inner(principal, request, now)).await
    }

    async fn deduct_inner(
        &self,
        principal: &Principal,
        request: DeductRequest,
        now: DateTime<Utc>,
    ) -> Result<DeductionReceipt> {
        authorize(principal, &[Role::Vendor], now)?;

        let payload = request.qr_payload.filter(|p| !is_blank(p));
        let (payload, cost) = match (payload, request.meal_cost) {
            (Some(payload), Some(cost)) if !cost.is_zero() => (payload, cost),
            _ => return Err(Error::Validation("Missing data".to_string())),
        };
        let cost = validate_amount(Some(cost), "Invalid meal cost")?;

        let intent = self.issuer.present(&payload)?;
        if intent.is_expired(now) {
            return Err(Error::Validation(
                "QR code expired. Please generate a new QR code.".to_string(),
            ));
        }
        let fingerprint = intent.fingerprint();

        let mut txn = self.storage.begin(&intent.account_id).await?;

        if let Some(previous) = txn.find_fingerprint(&fingerprint)? {
            self.metrics.record_redemption_conflict();
            tracing::warn!(
                account_id = %intent.account_id,
                fingerprint = %fingerprint,
                previous_entry = %previous.entry_id,
                "Redemption intent replayed"
            );
            return Err(Error::Conflict {
                message: "This QR code has already been used for payment".to_string(),
                previous_transaction: Some(previous.timestamp),
                previous_amount: Some(previous.amount.abs()),
            });
        }

        let balance = txn.account().balance;
        if balance < cost {
            return Err(Error::InsufficientFunds {
                balance,
                required: cost,
            });
        }

        let description = request.description.unwrap_or_else(|| "Meal".to_string());
        let venue = request.venue.unwrap_or_else(|| "Unknown Venue".to_string());
        txn.append_redemption(
            LedgerEntry::new(
                intent.account_id.clone(),
                -cost,
                EntryKind::Deduction,
                format!("{} [QR:{}]", description, fingerprint),
            )
            .with_venue(venue.clone()),
            &fingerprint,
        )?;
        txn.update_balance(balance - cost)?;
        let (account, _) = txn.commit()?;

        self.metrics.record_movement(EntryKind::Deduction);
        tracing::info!(
            account_id = %intent.account_id,
            vendor = %principal.account_id,
            amount = %cost,
            venue = %venue,
            fingerprint = %fingerprint,
            "Meal deduction committed"
        );

        Ok(DeductionReceipt {
            message: "Payment successful".to_string(),
            new_balance: self.settled_balance(&account).await,
            account_id: intent.account_id,
            amount_deducted: cost,
        })
    }

    /// Administrative credit to any account
    pub async fn refund(&self, principal: &Principal, request: RefundRequest) -> Result<BalanceUpdate> {
        self.observe(self.refund_inner(principal, request)).await
    }

    async fn refund_inner(&self, principal: &Principal, request: RefundRequest) -> Result<BalanceUpdate> {
        authorize(principal, &[Role::Admin], Utc::now())?;

        let amount = validate_amount(request.amount, "Invalid refund amount")?;
        let ceiling = self.config.limits.refund_ceiling;
        if amount > ceiling {
            return Err(Error::Validation(format!(
                "Maximum refund amount is {}. Contact system administrator for larger refunds.",
                ceiling
            )));
        }
        let account_id = request
            .account_id
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

        let mut txn = self.storage.begin(&account_id).await?;
        let new_balance = txn.account().balance + amount;
        txn.append(
            LedgerEntry::new(
                account_id.clone(),
                amount,
                EntryKind::Refund,
                "Administrative Refund",
            )
            .with_source(Source::Admin),
        )?;
        txn.update_balance(new_balance)?;
        let (account, _) = txn.commit()?;

        self.metrics.record_movement(EntryKind::Refund);
        tracing::info!(
            account_id = %account_id,
            admin = %principal.account_id,
            amount = %amount,
            "Refund committed"
        );

        Ok(BalanceUpdate {
            message: "Refund processed".to_string(),
            new_balance: self.settled_balance(&account).await,
        })
    }

    // Read operations

    /// Verified balance of the principal's own account
    pub async fn balance(&self, principal: &Principal) -> Result<BalanceView> {
        authorize(principal, ALL_ROLES, Utc::now())?;
        Ok(BalanceView {
            balance: self.verifier.verify(&principal.account_id).await?,
        })
    }

    /// The principal's own entries, newest first
    pub fn history(&self, principal: &Principal) -> Result<Vec<LedgerEntry>> {
        authorize(principal, ALL_ROLES, Utc::now())?;
        if self.storage.get_account(&principal.account_id)?.is_none() {
            return Err(Error::NotFound("User not found".to_string()));
        }
        let mut entries = self.storage.entries_for_account(&principal.account_id)?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Aggregate report over the whole ledger (admin)
    pub fn report(&self, principal: &Principal) -> Result<LedgerReport> {
        let now = Utc::now();
        authorize(principal, &[Role::Admin], now)?;
        Ok(reports::build_report(
            &self.storage.list_accounts()?,
            &self.storage.all_entries()?,
            now,
        ))
    }

    /// Balance projection for the principal's own account
    pub async fn projection(&self, principal: &Principal) -> Result<Projection> {
        self.projection_at(principal, Utc::now()).await
    }

    /// Balance projection as of `now`
    pub async fn projection_at(&self, principal: &Principal, now: DateTime<Utc>) -> Result<Projection> {
        authorize(principal, &[Role::Student], now)?;
        let balance = self.verifier.verify(&principal.account_id).await?;
        let entries = self.storage.entries_for_account(&principal.account_id)?;
        Ok(projection::project(balance, &entries, now))
    }

    /// Run `operation`, recording its latency and any rejection
    async fn observe<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let start = Instant::now();
        let result = operation.await;
        self.metrics
            .record_operation_duration(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            self.metrics.record_rejection(e.kind());
            match e.kind() {
                ErrorKind::Internal => tracing::error!(error = %e, "Operation failed"),
                _ => tracing::debug!(error = %e, "Operation rejected"),
            }
        }
        result
    }

    /// Verified balance after a committed movement.
    ///
    /// The movement is durable at this point, so a failed verification falls
    /// back to the committed balance instead of failing the request.
    async fn settled_balance(&self, committed: &Account) -> Decimal {
        match self.verifier.verify(&committed.account_id).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(
                    account_id = %committed.account_id,
                    error = %e,
                    "Post-commit verification failed, reporting committed balance"
                );
                committed.balance
            }
        }
    }
}

/// Positive amount with at most two decimal places
fn validate_amount(amount: Option<Decimal>, message: &str) -> Result<Decimal> {
    let amount = match amount {
        Some(amount) if amount > Decimal::ZERO => amount,
        _ => return Err(Error::Validation(message.to_string())),
    };
    if amount.normalize().scale() > CURRENCY_SCALE {
        return Err(Error::Validation(
            "Amounts are limited to 2 decimal places".to_string(),
        ));
    }
    Ok(amount)
}

fn is_blank(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (Arc<Wallet>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        config.qr.signing_seed = Some(hex::encode([3u8; 32]));
        (Arc::new(Wallet::open(config).unwrap()), temp_dir)
    }

    async fn student(wallet: &Wallet, id: &str) -> Principal {
        wallet
            .open_account(AccountId::new(id), Role::Student)
            .await
            .unwrap();
        Principal::new(AccountId::new(id), Role::Student)
    }

    fn vendor() -> Principal {
        Principal::new(AccountId::new("vendor-1"), Role::Vendor)
    }

    fn admin() -> Principal {
        Principal::new(AccountId::new("admin-1"), Role::Admin)
    }

    fn top_up_request(amount: i64, source: Source) -> TopUpRequest {
        TopUpRequest {
            amount: Some(Decimal::from(amount)),
            source,
        }
    }

    fn deduct_request(payload: &str, cost: i64) -> DeductRequest {
        DeductRequest {
            qr_payload: Some(Value::String(payload.to_string())),
            meal_cost: Some(Decimal::from(cost)),
            description: Some("Lunch".to_string()),
            venue: Some("North Canteen".to_string()),
        }
    }

    fn assert_ledger_invariant(wallet: &Wallet, account_id: &AccountId) {
        let account = wallet.storage().get_account(account_id).unwrap().unwrap();
        let sum = wallet.storage().sum_for_account(account_id).unwrap();
        assert_eq!(account.balance, sum);
        assert!(account.balance >= Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_deduct_then_replay_conflicts() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(500, Source::Own))
            .await
            .unwrap();

        let intent = wallet.issue_intent(&holder).unwrap();
        let receipt = wallet
            .deduct(&vendor(), deduct_request(&intent.payload, 70))
            .await
            .unwrap();
        assert_eq!(receipt.new_balance, Decimal::from(430));
        assert_eq!(receipt.amount_deducted, Decimal::from(70));
        assert_eq!(receipt.account_id, holder.account_id);

        let history = wallet.history(&holder).unwrap();
        let deductions: Vec<_> = history
            .iter()
            .filter(|e| e.kind == EntryKind::Deduction)
            .collect();
        assert_eq!(deductions.len(), 1);
        assert_eq!(deductions[0].amount, Decimal::from(-70));
        assert_eq!(deductions[0].venue.as_deref(), Some("North Canteen"));
        assert!(deductions[0].description.starts_with("Lunch [QR:"));

        let err = wallet
            .deduct(&vendor(), deduct_request(&intent.payload, 70))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        match &err {
            Error::Conflict {
                previous_amount,
                previous_transaction,
                ..
            } => {
                assert_eq!(*previous_amount, Some(Decimal::from(70)));
                assert!(previous_transaction.is_some());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::from(430)
        );
        assert_eq!(wallet.metrics().redemption_conflicts.get(), 1);
        assert_ledger_invariant(&wallet, &holder.account_id);
    }

    #[tokio::test]
    async fn test_parent_top_ups_accumulate() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;

        let first = wallet
            .top_up(&holder, top_up_request(5000, Source::Parent))
            .await
            .unwrap();
        assert_eq!(first.new_balance, Decimal::from(5000));

        let second = wallet
            .top_up(&holder, top_up_request(5000, Source::Parent))
            .await
            .unwrap();
        assert_eq!(second.new_balance, Decimal::from(10000));

        let history = wallet.history(&holder).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|e| e.source == Some(Source::Parent) && e.description == "Top-up via parent"));
    }

    #[tokio::test]
    async fn test_ceilings() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;

        let err = wallet
            .top_up(&holder, top_up_request(5001, Source::Own))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Maximum top-up amount is 5000");
        assert!(wallet.history(&holder).unwrap().is_empty());

        let refund = |amount: i64| RefundRequest {
            account_id: Some(holder.account_id.clone()),
            amount: Some(Decimal::from(amount)),
        };
        let err = wallet.refund(&admin(), refund(10001)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Maximum refund amount is 10000. Contact system administrator for larger refunds."
        );

        let update = wallet.refund(&admin(), refund(10000)).await.unwrap();
        assert_eq!(update.new_balance, Decimal::from(10000));
        let entry = &wallet.history(&holder).unwrap()[0];
        assert_eq!(entry.kind, EntryKind::Refund);
        assert_eq!(entry.source, Some(Source::Admin));
        assert_eq!(entry.description, "Administrative Refund");
    }

    #[tokio::test]
    async fn test_refund_unknown_account() {
        let (wallet, _temp) = setup();

        let err = wallet
            .refund(
                &admin(),
                RefundRequest {
                    account_id: None,
                    amount: Some(Decimal::from(10)),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "User not found");

        let err = wallet
            .refund(
                &admin(),
                RefundRequest {
                    account_id: Some(AccountId::new("ghost")),
                    amount: Some(Decimal::from(10)),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "User not found");
        assert!(wallet.storage().all_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_amounts() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;

        for amount in [None, Some(Decimal::ZERO), Some(Decimal::from(-5))] {
            let err = wallet
                .top_up(&holder, TopUpRequest { amount, source: Source::Own })
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "Invalid amount");
        }

        let err = wallet
            .top_up(
                &holder,
                TopUpRequest {
                    amount: Some(Decimal::new(1001, 3)),
                    source: Source::Own,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = wallet
            .top_up(&holder, top_up_request(10, Source::Admin))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = wallet
            .refund(&admin(), RefundRequest { account_id: Some(holder.account_id.clone()), amount: None })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid refund amount");
    }

    #[tokio::test]
    async fn test_expired_intent_rejected_regardless_of_balance() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(1000, Source::Own))
            .await
            .unwrap();

        let now = Utc::now();
        let intent = wallet
            .issue_intent_at(&holder, now - Duration::minutes(10))
            .unwrap();
        let err = wallet
            .deduct_at(&vendor(), deduct_request(&intent.payload, 30), now)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "QR code expired. Please generate a new QR code.");
        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::from(1000)
        );
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(50, Source::Own))
            .await
            .unwrap();

        let intent = wallet.issue_intent(&holder).unwrap();
        let err = wallet
            .deduct(&vendor(), deduct_request(&intent.payload, 70))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(err.to_response()["shortfall"], json!("20"));
        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::from(50)
        );

        // The intent was not consumed
        wallet
            .top_up(&holder, top_up_request(50, Source::Own))
            .await
            .unwrap();
        assert!(wallet
            .deduct(&vendor(), deduct_request(&intent.payload, 70))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_deduct_input_checks() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        let intent = wallet.issue_intent(&holder).unwrap();

        let mut request = deduct_request(&intent.payload, 70);
        request.qr_payload = None;
        let err = wallet.deduct(&vendor(), request).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing data");

        let mut request = deduct_request(&intent.payload, 70);
        request.meal_cost = None;
        let err = wallet.deduct(&vendor(), request).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing data");

        for blank in [json!([]), json!({}), json!("")] {
            let request = DeductRequest {
                qr_payload: Some(blank),
                meal_cost: Some(Decimal::from(70)),
                ..Default::default()
            };
            let err = wallet.deduct(&vendor(), request).await.unwrap_err();
            assert_eq!(err.to_string(), "Missing data");
        }

        let request = DeductRequest {
            qr_payload: Some(json!([1, 2])),
            meal_cost: Some(Decimal::from(70)),
            ..Default::default()
        };
        let err = wallet.deduct(&vendor(), request).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid QR payload format");

        // Signed intent for an account that was never opened
        let ghost = Principal::new(AccountId::new("ghost"), Role::Student);
        let issued = wallet.issuer.issue(&ghost.account_id, Utc::now()).unwrap();
        let err = wallet
            .deduct(&vendor(), deduct_request(&issued.payload, 10))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "User not found");
    }

    #[tokio::test]
    async fn test_defaults_from_json_body() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;

        let request: TopUpRequest = serde_json::from_value(json!({"amount": 250})).unwrap();
        assert_eq!(request.source, Source::Own);
        wallet.top_up(&holder, request).await.unwrap();

        let intent = wallet.issue_intent(&holder).unwrap();
        let request: DeductRequest = serde_json::from_value(json!({
            "qr_payload": intent.payload,
            "meal_cost": 30.5
        }))
        .unwrap();
        assert_eq!(request.meal_cost, Some(Decimal::new(305, 1)));
        wallet.deduct(&vendor(), request).await.unwrap();

        let entry = &wallet.history(&holder).unwrap()[0];
        assert_eq!(entry.venue.as_deref(), Some("Unknown Venue"));
        assert!(entry.description.starts_with("Meal [QR:"));
        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::new(2195, 1)
        );
    }

    #[tokio::test]
    async fn test_role_gates() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;

        let err = wallet
            .top_up(&vendor(), top_up_request(10, Source::Own))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let intent = wallet.issue_intent(&holder).unwrap();
        let err = wallet
            .deduct(&holder, deduct_request(&intent.payload, 10))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let err = wallet
            .refund(
                &holder,
                RefundRequest { account_id: Some(holder.account_id.clone()), amount: Some(Decimal::ONE) },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        assert!(wallet.report(&holder).is_err());
        assert!(wallet.list_accounts(&vendor()).is_err());
        assert!(wallet.issue_intent(&vendor()).is_err());

        let mut expired = holder.clone();
        expired.expires_at = Utc::now() - Duration::seconds(1);
        let err = wallet.balance(&expired).await.unwrap_err();
        assert_eq!(err.status_code(), 401);

        assert_eq!(
            wallet
                .metrics()
                .rejections_total
                .with_label_values(&["forbidden"])
                .get(),
            3
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_top_ups_lose_no_updates() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        const N: usize = 32;

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let wallet = wallet.clone();
                let holder = holder.clone();
                tokio::spawn(async move {
                    wallet
                        .top_up(&holder, top_up_request(25, Source::Own))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::from(25 * N as i64)
        );
        assert_eq!(wallet.history(&holder).unwrap().len(), N);
        assert_eq!(wallet.metrics().consistency_faults.get(), 0);
        assert_ledger_invariant(&wallet, &holder.account_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_double_spend() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(100, Source::Own))
            .await
            .unwrap();

        let now = Utc::now();
        let first = wallet.issue_intent_at(&holder, now).unwrap();
        let second = wallet
            .issue_intent_at(&holder, now + Duration::seconds(1))
            .unwrap();

        let handles: Vec<_> = [first.payload, second.payload]
            .into_iter()
            .map(|payload| {
                let wallet = wallet.clone();
                tokio::spawn(async move {
                    wallet.deduct(&vendor(), deduct_request(&payload, 70)).await
                })
            })
            .collect();

        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::InsufficientFunds { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((succeeded, insufficient), (1, 1));
        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::from(30)
        );
        assert_ledger_invariant(&wallet, &holder.account_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replay_consumes_once() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(1000, Source::Own))
            .await
            .unwrap();
        let intent = wallet.issue_intent(&holder).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let wallet = wallet.clone();
                let payload = intent.payload.clone();
                tokio::spawn(async move {
                    wallet.deduct(&vendor(), deduct_request(&payload, 70)).await
                })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(
            wallet.balance(&holder).await.unwrap().balance,
            Decimal::from(930)
        );
    }

    #[tokio::test]
    async fn test_report_and_accounts() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        student(&wallet, "s2").await;
        wallet
            .open_account(AccountId::new("vendor-1"), Role::Vendor)
            .await
            .unwrap();

        wallet
            .top_up(&holder, top_up_request(300, Source::Parent))
            .await
            .unwrap();
        let intent = wallet.issue_intent(&holder).unwrap();
        wallet
            .deduct(&vendor(), deduct_request(&intent.payload, 70))
            .await
            .unwrap();

        let report = wallet.report(&admin()).unwrap();
        assert_eq!(report.total_transactions, 2);
        assert_eq!(report.total_volume, Decimal::from(230));
        assert_eq!(report.venue_report["North Canteen"], 1);
        assert_eq!(report.source_report["parent"], 1);
        assert_eq!(report.active_users, 2);
        assert_eq!(report.growth_trend.len(), 1);

        let accounts = wallet.list_accounts(&admin()).unwrap();
        assert_eq!(accounts.len(), 3);

        let err = wallet
            .open_account(AccountId::new("s2"), Role::Student)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_projection() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(500, Source::Own))
            .await
            .unwrap();

        let noon = Utc::now()
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        let projection = wallet.projection_at(&holder, noon).await.unwrap();
        assert_eq!(projection.next_meal_cost, Decimal::from(70));
        assert_eq!(projection.projected_balance, Decimal::from(430));
        assert_eq!(projection.suggestion_amount, Decimal::from(200));
    }

    #[tokio::test]
    async fn test_top_up_heals_prior_drift() {
        let (wallet, _temp) = setup();
        let holder = student(&wallet, "s1").await;
        wallet
            .top_up(&holder, top_up_request(100, Source::Own))
            .await
            .unwrap();

        let mut account = wallet
            .storage()
            .get_account(&holder.account_id)
            .unwrap()
            .unwrap();
        account.balance = Decimal::from(7);
        wallet.storage().put_account(&account).unwrap();

        let update = wallet
            .top_up(&holder, top_up_request(50, Source::Own))
            .await
            .unwrap();
        assert_eq!(update.new_balance, Decimal::from(150));
        assert_eq!(wallet.metrics().consistency_faults.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_verification_reports_committed_balance() {
        let (wallet, _temp) = setup();

        // An id too long to address in the ledger makes verification fail
        let mut account = Account::new(AccountId::new("v".repeat(70_000)), Role::Student);
        account.balance = Decimal::from(42);
        wallet.storage().put_account(&account).unwrap();
        assert!(wallet.verifier().verify(&account.account_id).await.is_err());

        assert_eq!(wallet.settled_balance(&account).await, Decimal::from(42));
    }
}
