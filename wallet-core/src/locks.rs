//! Per-account exclusive locks
//!
//! Money movements on one account are linearized by an async mutex owned by
//! that account. Different accounts never contend.
//!
//! ```text
//!  deduct(A) ──┐                 ┌── top_up(B)
//!  top_up(A) ──┤   AccountLocks  ├── refund(C)
//!              ▼                 ▼
//!        Mutex(A)            Mutex(B)  Mutex(C)
//!        one holder          run in parallel
//! ```

use crate::types::AccountId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held while an account is being read and mutated. Dropping it releases the lock.
pub type AccountGuard = OwnedMutexGuard<()>;

/// Lock table keyed by account
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl AccountLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `account_id`
    pub async fn lock(&self, account_id: &AccountId) -> AccountGuard {
        // Clone the Arc out so the shard lock is not held across the await.
        let mutex = self
            .locks
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        mutex.lock_owned().await
    }

    /// Number of accounts that have been locked at least once
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no account has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_account_is_exclusive() {
        let locks = Arc::new(AccountLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let account = AccountId::new("student-1");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let account = account.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(&account).await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_accounts_do_not_block() {
        let locks = AccountLocks::new();
        let _a = locks.lock(&AccountId::new("a")).await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&AccountId::new("b")))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let locks = AccountLocks::new();
        let account = AccountId::new("a");

        let guard = locks.lock(&account).await;
        drop(guard);

        let again = tokio::time::timeout(Duration::from_millis(100), locks.lock(&account)).await;
        assert!(again.is_ok());
    }
}
