//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Accounts with their cached balance (key: account_id)
//! - `entries` - Append-only ledger entries (key: entry_id)
//! - `account_entries` - Index: account || entry_id -> empty
//! - `fingerprints` - Unique index: account || fingerprint -> entry_id
//! - `meal_skips` - Meal skips (key: account || date || slot)
//!
//! Account-scoped keys start with the big-endian u16 length of the account id,
//! so no account prefix is a prefix of another account's keys.
//!
//! Every mutation of an account goes through an [`AccountTxn`], which holds
//! the account lock and stages writes in a single `WriteBatch`.

use crate::{
    error::{Error, Result},
    locks::{AccountGuard, AccountLocks},
    meal_skip::MealSkip,
    types::{Account, AccountId, LedgerEntry},
    Config,
};
use chrono::NaiveDate;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_ACCOUNT_ENTRIES: &str = "account_entries";
const CF_FINGERPRINTS: &str = "fingerprints";
const CF_MEAL_SKIPS: &str = "meal_skips";

/// Longest accepted account id, in bytes
pub const MAX_ACCOUNT_ID_LEN: usize = 256;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    locks: AccountLocks,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_ENTRIES, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_FINGERPRINTS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_MEAL_SKIPS, Self::cf_options_hot()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened wallet store");

        Ok(Self {
            db,
            locks: AccountLocks::new(),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Read on every request, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    /// Keys under `prefix` in `cf`, in key order
    fn scan_prefix(&self, cf: &ColumnFamily, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut items = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key, value));
        }
        Ok(items)
    }

    // Transactions

    /// Lock `account_id` and open a transaction on it.
    ///
    /// The lock is held until the transaction is committed or dropped.
    pub async fn begin(&self, account_id: &AccountId) -> Result<AccountTxn<'_>> {
        // Unknown ids never get a lock table entry
        if self.get_account(account_id)?.is_none() {
            return Err(Error::NotFound("User not found".to_string()));
        }

        let guard = self.locks.lock(account_id).await;
        let account = self
            .get_account(account_id)?
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

        Ok(AccountTxn {
            storage: self,
            account,
            batch: WriteBatch::default(),
            staged: Vec::new(),
            _guard: guard,
        })
    }

    // Account operations

    /// Insert a new account. Fails with a conflict if the id is taken.
    pub async fn create_account(&self, account: &Account) -> Result<()> {
        if account.account_id.as_str().len() > MAX_ACCOUNT_ID_LEN {
            return Err(Error::Validation(format!(
                "Account id must be at most {} bytes",
                MAX_ACCOUNT_ID_LEN
            )));
        }

        let _guard = self.locks.lock(&account.account_id).await;
        if self.get_account(&account.account_id)?.is_some() {
            return Err(Error::conflict(format!(
                "Account {} already exists",
                account.account_id
            )));
        }
        self.put_account(account)?;

        tracing::info!(account_id = %account.account_id, role = %account.role, "Account created");
        Ok(())
    }

    /// Overwrite an account record without touching the ledger.
    ///
    /// Balance changes made here bypass the ledger and will be reported and
    /// reverted by the consistency verifier.
    pub fn put_account(&self, account: &Account) -> Result<()> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, account.account_id.as_str().as_bytes(), bincode::serialize(account)?);
        self.write(batch)
    }

    /// Get account by ID
    pub fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, account_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All accounts ordered by id
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            accounts.push(bincode::deserialize(&value)?);
        }
        Ok(accounts)
    }

    // Ledger operations

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let value = self
            .db
            .get_cf(cf, entry_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("Entry not found: {}", entry_id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Committed entries of one account, oldest first
    pub fn entries_for_account(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ACCOUNT_ENTRIES)?;
        let prefix = account_prefix(account_id)?;

        let mut entries = Vec::new();
        for (key, _) in self.scan_prefix(cf, &prefix)? {
            let id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| Error::Storage("Corrupt account_entries key".to_string()))?;
            entries.push(self.get_entry(Uuid::from_bytes(id_bytes))?);
        }
        Ok(entries)
    }

    /// Sum of committed entry amounts for one account
    pub fn sum_for_account(&self, account_id: &AccountId) -> Result<Decimal> {
        Ok(self
            .entries_for_account(account_id)?
            .iter()
            .map(|entry| entry.amount)
            .sum())
    }

    /// Every committed entry, in entry id (time) order
    pub fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Entry that consumed `fingerprint` on `account_id`, if any
    pub fn find_fingerprint(
        &self,
        account_id: &AccountId,
        fingerprint: &str,
    ) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_FINGERPRINTS)?;
        match self.db.get_cf(cf, fingerprint_key(account_id, fingerprint)?)? {
            Some(value) => {
                let id_bytes: [u8; 16] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Corrupt fingerprint value".to_string()))?;
                Ok(Some(self.get_entry(Uuid::from_bytes(id_bytes))?))
            }
            None => Ok(None),
        }
    }

    // Meal skip operations

    /// Insert a meal skip. Returns false if one already exists for the same
    /// account, date and slot.
    pub async fn insert_meal_skip(&self, skip: &MealSkip) -> Result<bool> {
        let _guard = self.locks.lock(&skip.account_id).await;
        let cf = self.cf_handle(CF_MEAL_SKIPS)?;
        let key = meal_skip_key(&skip.account_id, skip.skip_date, skip.meal_slot.as_str())?;

        if self.db.get_cf(cf, &key)?.is_some() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, bincode::serialize(skip)?);
        self.write(batch)?;
        Ok(true)
    }

    /// Meal skips of one account, ordered by date
    pub fn meal_skips_for_account(&self, account_id: &AccountId) -> Result<Vec<MealSkip>> {
        let cf = self.cf_handle(CF_MEAL_SKIPS)?;
        self.scan_prefix(cf, &account_prefix(account_id)?)?
            .into_iter()
            .map(|(_, value)| -> Result<MealSkip> { Ok(bincode::deserialize(&value)?) })
            .collect()
    }

    /// Meal skips of every account on `date`
    pub fn meal_skips_on(&self, date: NaiveDate) -> Result<Vec<MealSkip>> {
        let cf = self.cf_handle(CF_MEAL_SKIPS)?;
        let mut skips = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let skip: MealSkip = bincode::deserialize(&value)?;
            if skip.skip_date == date {
                skips.push(skip);
            }
        }
        Ok(skips)
    }

    /// Remove a meal skip
    pub async fn delete_meal_skip(&self, skip: &MealSkip) -> Result<()> {
        let _guard = self.locks.lock(&skip.account_id).await;
        let cf = self.cf_handle(CF_MEAL_SKIPS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(
            cf,
            meal_skip_key(&skip.account_id, skip.skip_date, skip.meal_slot.as_str())?,
        );
        self.write(batch)
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(self.cf_handle(CF_ACCOUNTS)?)?,
            total_entries: self.approximate_count(self.cf_handle(CF_ENTRIES)?)?,
            total_meal_skips: self.approximate_count(self.cf_handle(CF_MEAL_SKIPS)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        Ok(self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }
}

/// Storage statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Approximate number of accounts
    pub total_accounts: u64,
    /// Approximate number of ledger entries
    pub total_entries: u64,
    /// Approximate number of meal skips
    pub total_meal_skips: u64,
}

/// Exclusive unit of work on one account.
///
/// Reads see committed state. Writes are staged and become visible together
/// on [`commit`](AccountTxn::commit); dropping the transaction discards them.
pub struct AccountTxn<'a> {
    storage: &'a Storage,
    account: Account,
    batch: WriteBatch,
    staged: Vec<LedgerEntry>,
    _guard: AccountGuard,
}

impl<'a> AccountTxn<'a> {
    /// Account as read under the lock, with staged balance changes applied
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Stage a ledger entry
    pub fn append(&mut self, entry: LedgerEntry) -> Result<()> {
        if entry.account_id != self.account.account_id {
            return Err(Error::Storage(format!(
                "Entry for {} appended in transaction of {}",
                entry.account_id, self.account.account_id
            )));
        }

        let mut index_key = account_prefix(&entry.account_id)?;
        index_key.extend_from_slice(entry.entry_id.as_bytes());

        let cf_entries = self.storage.cf_handle(CF_ENTRIES)?;
        self.batch
            .put_cf(cf_entries, entry.entry_id.as_bytes(), bincode::serialize(&entry)?);

        let cf_index = self.storage.cf_handle(CF_ACCOUNT_ENTRIES)?;
        self.batch.put_cf(cf_index, index_key, b"");

        self.staged.push(entry);
        Ok(())
    }

    /// Stage a ledger entry that consumes a redemption fingerprint
    pub fn append_redemption(&mut self, entry: LedgerEntry, fingerprint: &str) -> Result<()> {
        let cf = self.storage.cf_handle(CF_FINGERPRINTS)?;
        self.batch.put_cf(
            cf,
            fingerprint_key(&entry.account_id, fingerprint)?,
            entry.entry_id.as_bytes(),
        );
        self.append(entry)
    }

    /// Stage a new cached balance
    pub fn update_balance(&mut self, new_balance: Decimal) -> Result<()> {
        self.account.balance = new_balance;
        let cf = self.storage.cf_handle(CF_ACCOUNTS)?;
        self.batch.put_cf(
            cf,
            self.account.account_id.as_str().as_bytes(),
            bincode::serialize(&self.account)?,
        );
        Ok(())
    }

    /// Committed ledger sum of the locked account
    pub fn sum_for_account(&self) -> Result<Decimal> {
        self.storage.sum_for_account(&self.account.account_id)
    }

    /// Committed entry holding `fingerprint` on the locked account
    pub fn find_fingerprint(&self, fingerprint: &str) -> Result<Option<LedgerEntry>> {
        self.storage
            .find_fingerprint(&self.account.account_id, fingerprint)
    }

    /// Atomically write all staged changes and release the lock
    pub fn commit(self) -> Result<(Account, Vec<LedgerEntry>)> {
        self.storage.write(self.batch)?;

        for entry in &self.staged {
            tracing::debug!(
                entry_id = %entry.entry_id,
                account_id = %entry.account_id,
                kind = entry.kind.as_str(),
                amount = %entry.amount,
                "Entry appended"
            );
        }

        Ok((self.account, self.staged))
    }
}

// Key helpers

fn account_prefix(account_id: &AccountId) -> Result<Vec<u8>> {
    let id = account_id.as_str().as_bytes();
    let len = u16::try_from(id.len())
        .ok()
        .filter(|len| usize::from(*len) <= MAX_ACCOUNT_ID_LEN)
        .ok_or_else(|| {
            Error::Validation(format!(
                "Account id must be at most {} bytes",
                MAX_ACCOUNT_ID_LEN
            ))
        })?;

    let mut key = Vec::with_capacity(2 + id.len() + 16);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(id);
    Ok(key)
}

fn fingerprint_key(account_id: &AccountId, fingerprint: &str) -> Result<Vec<u8>> {
    let mut key = account_prefix(account_id)?;
    key.extend_from_slice(fingerprint.as_bytes());
    Ok(key)
}

fn meal_skip_key(account_id: &AccountId, date: NaiveDate, slot: &str) -> Result<Vec<u8>> {
    let mut key = account_prefix(account_id)?;
    key.extend_from_slice(date.format("%Y-%m-%d").to_string().as_bytes());
    key.push(b'|');
    key.extend_from_slice(slot.as_bytes());
    Ok(key)
}
