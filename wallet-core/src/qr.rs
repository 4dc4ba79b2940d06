//! Redemption intents
//!
//! An account holder is issued a short-lived intent, signed with the service
//! key and rendered as a JSON payload (the content of the QR code). A vendor
//! presents the payload verbatim with a deduction; it is parsed and its
//! signature checked before any balance logic runs.
//!
//! Wire format:
//!
//! ```json
//! {"account_id": "student-1", "expires_at": 1700000300000, "signature": "<hex>"}
//! ```
//!
//! `expires_at` is UTC milliseconds since the epoch.

use crate::{
    crypto::{self, KeyPair},
    error::{Error, Result},
    types::AccountId,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed, signature-checked redemption intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionIntent {
    /// Account to debit
    pub account_id: AccountId,
    /// Expiry, millisecond precision
    pub expires_at: DateTime<Utc>,
}

impl RedemptionIntent {
    /// Deterministic identifier used to detect a second presentation
    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.account_id, self.expires_at.timestamp_millis())
    }

    /// True once `now` is past the expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn signing_bytes(&self) -> Vec<u8> {
        format!("{}:{}", self.account_id, self.expires_at.timestamp_millis()).into_bytes()
    }
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    account_id: AccountId,
    expires_at: i64,
    signature: String,
}

/// Intent handed to the account holder
#[derive(Debug, Clone, Serialize)]
pub struct IssuedIntent {
    /// Opaque payload to encode in the QR code
    pub payload: String,
    /// Expiry of the intent
    pub expires_at: DateTime<Utc>,
}

/// Issues and checks redemption intents
#[derive(Debug)]
pub struct QrIssuer {
    keypair: KeyPair,
    ttl: Duration,
}

impl QrIssuer {
    /// Create issuer signing with `keypair`; intents live for `ttl`
    pub fn new(keypair: KeyPair, ttl: Duration) -> Self {
        Self { keypair, ttl }
    }

    /// Intent lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue an intent for `account_id` expiring `ttl` after `now`
    pub fn issue(&self, account_id: &AccountId, now: DateTime<Utc>) -> Result<IssuedIntent> {
        let expires_millis = (now + self.ttl).timestamp_millis();
        let expires_at = DateTime::from_timestamp_millis(expires_millis)
            .ok_or_else(|| Error::Validation("Expiry out of range".to_string()))?;

        let intent = RedemptionIntent {
            account_id: account_id.clone(),
            expires_at,
        };
        let wire = WirePayload {
            account_id: account_id.clone(),
            expires_at: expires_millis,
            signature: self.keypair.sign_hex(&intent.signing_bytes()),
        };
        let payload = serde_json::to_string(&wire)
            .map_err(|e| Error::Validation(format!("Failed to encode QR payload: {}", e)))?;

        tracing::debug!(account_id = %account_id, expires_at = %expires_at, "Intent issued");

        Ok(IssuedIntent {
            payload,
            expires_at,
        })
    }

    /// Parse a presented payload and check its signature.
    ///
    /// Accepts the payload object itself or a string holding it. Expiry is
    /// not checked here.
    pub fn present(&self, payload: &Value) -> Result<RedemptionIntent> {
        let parsed;
        let object = match payload {
            Value::Object(map) => map,
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text)
                    .map_err(|_| Error::Validation("Malformed QR code".to_string()))?;
                parsed
                    .as_object()
                    .ok_or_else(|| Error::Validation("Invalid QR payload format".to_string()))?
            }
            _ => return Err(Error::Validation("Invalid QR payload format".to_string())),
        };

        let present = |field: &str| object.get(field).is_some_and(|v| !v.is_null());
        if !["account_id", "expires_at", "signature"]
            .iter()
            .all(|field| present(*field))
        {
            return Err(Error::Validation(
                "QR payload missing required fields".to_string(),
            ));
        }

        let wire: WirePayload = serde_json::from_value(Value::Object(object.clone()))
            .map_err(|_| Error::Validation("Malformed QR code".to_string()))?;
        if wire.account_id.as_str().is_empty() {
            return Err(Error::Validation(
                "QR payload missing required fields".to_string(),
            ));
        }

        let expires_at = DateTime::from_timestamp_millis(wire.expires_at)
            .ok_or_else(|| Error::Validation("Malformed QR code".to_string()))?;
        let intent = RedemptionIntent {
            account_id: wire.account_id,
            expires_at,
        };

        self.keypair
            .verify_hex(&intent.signing_bytes(), &wire.signature)
            .map_err(|e| {
                tracing::warn!(account_id = %intent.account_id, error = %e, "Rejected forged intent");
                Error::Validation("Invalid QR code signature".to_string())
            })?;

        Ok(intent)
    }
}
