use crate::domain::account::{Account, AccountId, Balance};
use crate::domain::outbox::{DeliveryStatus, OutboxEntry};
use crate::domain::ports::{AtomicUnit, AtomicWork, CommitOutcome, LedgerStore};
use crate::domain::transaction::{Transaction, TransactionRef};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Column Family for account rows.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family for committed transactions.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for outbox entries, keyed by big-endian sequence.
pub const CF_OUTBOX: &str = "outbox";
/// Column Family mapping idempotency keys to transaction references.
pub const CF_IDEMPOTENCY: &str = "idempotency";

/// Persistent ledger store backed by RocksDB.
///
/// Each atomic unit stages its writes into a single `WriteBatch` which RocksDB
/// applies atomically; a commit mutex serializes units so the closure sees
/// exclusive read-modify-write state. `Clone` shares the underlying handle.
#[derive(Clone)]
pub struct RocksDbLedgerStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
    next_sequence: Arc<AtomicU64>,
}

fn store_err(e: impl Display) -> LedgerError {
    LedgerError::StoreUnavailable(e.to_string())
}

fn encode_row<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(store_err)
}

fn decode_row<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(store_err)
}

impl RocksDbLedgerStore {
    /// Opens or creates the database at `path`, ensuring all column families
    /// exist and recovering the outbox sequence counter.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ACCOUNTS, CF_TRANSACTIONS, CF_OUTBOX, CF_IDEMPOTENCY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors).map_err(store_err)?;

        let last_sequence = {
            let cf = db
                .cf_handle(CF_OUTBOX)
                .ok_or_else(|| store_err("outbox column family not found"))?;
            db.iterator_cf(cf, IteratorMode::End)
                .next()
                .transpose()
                .map_err(store_err)?
                .map(|(key, _)| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&key[..8]);
                    u64::from_be_bytes(bytes)
                })
                .unwrap_or(0)
        };

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
            next_sequence: Arc::new(AtomicU64::new(last_sequence)),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| store_err(format!("{name} column family not found")))
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        self.db
            .get_cf(cf, id.as_str().as_bytes())
            .map_err(store_err)?
            .map(|bytes| decode_row(&bytes))
            .transpose()
    }

    fn get_outbox_entry(&self, sequence: u64) -> Result<OutboxEntry> {
        let cf = self.cf(CF_OUTBOX)?;
        let bytes = self
            .db
            .get_cf(cf, sequence.to_be_bytes())
            .map_err(store_err)?
            .ok_or_else(|| store_err(format!("outbox entry {sequence} missing")))?;
        decode_row(&bytes)
    }

    fn put_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let cf = self.cf(CF_OUTBOX)?;
        self.db
            .put_cf(cf, entry.sequence.to_be_bytes(), encode_row(entry)?)
            .map_err(store_err)
    }
}

/// Read-through staged view over the database; writes land in a `WriteBatch`
/// only when the closure succeeds.
struct StagedUnit<'a> {
    store: &'a RocksDbLedgerStore,
    accounts: HashMap<AccountId, Account>,
    transactions: Vec<Transaction>,
    outbox: Vec<OutboxEntry>,
    now: DateTime<Utc>,
}

impl AtomicUnit for StagedUnit<'_> {
    fn account(&mut self, id: &AccountId) -> Result<Account> {
        if let Some(staged) = self.accounts.get(id) {
            return Ok(staged.clone());
        }
        let account = self
            .store
            .get_account(id)?
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))?;
        self.accounts.insert(id.clone(), account.clone());
        Ok(account)
    }

    fn update_balance(
        &mut self,
        id: &AccountId,
        new_balance: Balance,
        expected_version: u64,
    ) -> Result<()> {
        self.account(id)?;
        let staged = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))?;

        if staged.version != expected_version {
            return Err(LedgerError::Conflict {
                account: id.clone(),
                expected: expected_version,
                found: staged.version,
            });
        }

        staged.balance = new_balance;
        staged.version += 1;
        staged.updated_at = self.now;
        Ok(())
    }

    fn insert_transaction(&mut self, tx: Transaction) -> Result<()> {
        self.transactions.push(tx);
        Ok(())
    }

    fn insert_outbox_entry(&mut self, entry: OutboxEntry) -> Result<()> {
        self.outbox.push(entry);
        Ok(())
    }

    fn transaction_by_idempotency_key(&mut self, key: &str) -> Result<Option<Transaction>> {
        if let Some(tx) = self
            .transactions
            .iter()
            .find(|tx| tx.idempotency_key.as_deref() == Some(key))
        {
            return Ok(Some(tx.clone()));
        }

        let idempotency_cf = self.store.cf(CF_IDEMPOTENCY)?;
        let Some(reference) = self
            .store
            .db
            .get_cf(idempotency_cf, key.as_bytes())
            .map_err(store_err)?
        else {
            return Ok(None);
        };

        let transactions_cf = self.store.cf(CF_TRANSACTIONS)?;
        self.store
            .db
            .get_cf(transactions_cf, &reference)
            .map_err(store_err)?
            .map(|bytes| decode_row(&bytes))
            .transpose()
    }
}

#[async_trait]
impl LedgerStore for RocksDbLedgerStore {
    async fn run_atomic(&self, work: AtomicWork) -> Result<CommitOutcome> {
        let _guard = self.commit_lock.lock().await;

        let mut unit = StagedUnit {
            store: self,
            accounts: HashMap::new(),
            transactions: Vec::new(),
            outbox: Vec::new(),
            now: Utc::now(),
        };

        let outcome = work(&mut unit)?;

        let mut batch = WriteBatch::default();
        let accounts_cf = self.cf(CF_ACCOUNTS)?;
        for (id, account) in &unit.accounts {
            batch.put_cf(accounts_cf, id.as_str().as_bytes(), encode_row(account)?);
        }

        let transactions_cf = self.cf(CF_TRANSACTIONS)?;
        let idempotency_cf = self.cf(CF_IDEMPOTENCY)?;
        for tx in &unit.transactions {
            if let Some(key) = &tx.idempotency_key {
                batch.put_cf(
                    idempotency_cf,
                    key.as_bytes(),
                    tx.reference.as_str().as_bytes(),
                );
            }
            batch.put_cf(
                transactions_cf,
                tx.reference.as_str().as_bytes(),
                encode_row(tx)?,
            );
        }

        let outbox_cf = self.cf(CF_OUTBOX)?;
        let mut staged_outbox = std::mem::take(&mut unit.outbox);
        for entry in &mut staged_outbox {
            entry.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            batch.put_cf(outbox_cf, entry.sequence.to_be_bytes(), encode_row(entry)?);
        }

        self.db.write(batch).map_err(store_err)?;
        Ok(outcome)
    }

    async fn create_account(&self, account: Account) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        if self.get_account(&account.id)?.is_some() {
            return Err(LedgerError::InvalidOperation(format!(
                "account {} already exists",
                account.id
            )));
        }
        let cf = self.cf(CF_ACCOUNTS)?;
        self.db
            .put_cf(cf, account.id.as_str().as_bytes(), encode_row(&account)?)
            .map_err(store_err)
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.get_account(id)
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(store_err)?;
            accounts.push(decode_row(&value)?);
        }
        Ok(accounts)
    }

    async fn transaction_by_ref(&self, reference: &TransactionRef) -> Result<Option<Transaction>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        self.db
            .get_cf(cf, reference.as_str().as_bytes())
            .map_err(store_err)?
            .map(|bytes| decode_row(&bytes))
            .transpose()
    }

    async fn transactions(&self) -> Result<Vec<Transaction>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let mut transactions: Vec<Transaction> = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(store_err)?;
            transactions.push(decode_row(&value)?);
        }
        transactions.sort_by_key(|tx| tx.created_at);
        Ok(transactions)
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .outbox_entries()
            .await?
            .into_iter()
            .filter(|entry| entry.status == DeliveryStatus::Pending)
            .collect())
    }

    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        let cf = self.cf(CF_OUTBOX)?;
        let mut entries = Vec::new();
        // Big-endian keys make the natural iteration order the creation order.
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(store_err)?;
            entries.push(decode_row(&value)?);
        }
        Ok(entries)
    }

    async fn mark_delivered(&self, sequence: u64) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        let mut entry = self.get_outbox_entry(sequence)?;
        entry.status = DeliveryStatus::Delivered;
        self.put_outbox_entry(&entry)
    }

    async fn record_attempt(&self, sequence: u64, at: DateTime<Utc>) -> Result<u32> {
        let _guard = self.commit_lock.lock().await;
        let mut entry = self.get_outbox_entry(sequence)?;
        entry.attempts += 1;
        entry.last_attempt_at = Some(at);
        self.put_outbox_entry(&entry)?;
        Ok(entry.attempts)
    }

    async fn mark_failed(&self, sequence: u64) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        let mut entry = self.get_outbox_entry(sequence)?;
        entry.status = DeliveryStatus::Failed;
        self.put_outbox_entry(&entry)
    }
}
