//! Principal/role gate
//!
//! Credentials are verified outside the core. A [`TokenVerifier`] turns a
//! bearer credential into a [`Principal`]; every operation then calls
//! [`authorize`] with the roles it admits before touching any state.

use crate::{
    error::{Error, Result},
    types::{Principal, Role},
};
use chrono::{DateTime, Utc};

/// Turns a credential into a verified principal
pub trait TokenVerifier: Send + Sync {
    /// Verify `token`. Implementations return [`Error::Auth`] on failure.
    fn verify(&self, token: &str) -> Result<Principal>;
}

/// Extract the credential from an `Authorization` header value
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Auth("Token is missing".to_string()))?;

    Ok(header.strip_prefix("Bearer ").unwrap_or(header))
}

/// Verify the `Authorization` header and return the principal
pub fn authenticate(verifier: &dyn TokenVerifier, header: Option<&str>) -> Result<Principal> {
    let token = bearer_token(header)?;
    verifier.verify(token)
}

/// Admit `principal` if its credential is live and its role is in `allowed`
pub fn authorize(principal: &Principal, allowed: &[Role], now: DateTime<Utc>) -> Result<()> {
    if principal.expires_at <= now {
        return Err(Error::Auth("Token expired".to_string()));
    }

    if !allowed.contains(&principal.role) {
        let required = allowed
            .iter()
            .map(Role::display_name)
            .collect::<Vec<_>>()
            .join(" or ");
        tracing::warn!(
            account_id = %principal.account_id,
            role = %principal.role,
            "Role rejected"
        );
        return Err(Error::Forbidden(format!(
            "This action requires {} privileges. Please login with the correct account type.",
            required
        )));
    }

    Ok(())
}
