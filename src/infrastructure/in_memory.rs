use crate::domain::account::{Account, AccountId, Balance};
use crate::domain::event::AuditEvent;
use crate::domain::outbox::{DeliveryStatus, OutboxEntry};
use crate::domain::ports::{
    AtomicUnit, AtomicWork, AuditSink, BusRecord, CommitOutcome, DeadLetter, DeadLetterSink,
    LedgerStore, MessageBus, Subscription,
};
use crate::domain::transaction::{Transaction, TransactionRef};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, mpsc};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionRef, Transaction>,
    idempotency: HashMap<String, TransactionRef>,
    outbox: BTreeMap<u64, OutboxEntry>,
    next_sequence: u64,
}

/// Thread-safe in-memory ledger store.
///
/// `run_atomic` holds the state mutex for the duration of the unit, giving the
/// closure exclusive read-modify-write access; staged writes are applied only
/// when the closure succeeds. Ideal for tests and single-process runs.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Staged view over committed state; all mutation is buffered until commit.
struct StagedUnit<'a> {
    base: &'a LedgerState,
    accounts: HashMap<AccountId, Account>,
    transactions: Vec<Transaction>,
    outbox: Vec<OutboxEntry>,
    now: DateTime<Utc>,
}

impl<'a> StagedUnit<'a> {
    fn new(base: &'a LedgerState) -> Self {
        Self {
            base,
            accounts: HashMap::new(),
            transactions: Vec::new(),
            outbox: Vec::new(),
            now: Utc::now(),
        }
    }
}

impl AtomicUnit for StagedUnit<'_> {
    fn account(&mut self, id: &AccountId) -> Result<Account> {
        if let Some(staged) = self.accounts.get(id) {
            return Ok(staged.clone());
        }
        let account = self
            .base
            .accounts
            .get(id)
            .cloned()
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
        Ok(self
            .base
            .idempotency
            .get(key)
            .and_then(|reference| self.base.transactions.get(reference))
            .cloned())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn run_atomic(&self, work: AtomicWork) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;
        let mut unit = StagedUnit::new(&state);

        let outcome = work(&mut unit)?;

        let StagedUnit {
            accounts,
            transactions,
            outbox,
            ..
        } = unit;

        for (id, account) in accounts {
            state.accounts.insert(id, account);
        }
        for tx in transactions {
            if let Some(key) = &tx.idempotency_key {
                state.idempotency.insert(key.clone(), tx.reference.clone());
            }
            state.transactions.insert(tx.reference.clone(), tx);
        }
        for mut entry in outbox {
            state.next_sequence += 1;
            entry.sequence = state.next_sequence;
            state.outbox.insert(entry.sequence, entry);
        }

        Ok(outcome)
    }

    async fn create_account(&self, account: Account) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.id) {
            return Err(LedgerError::InvalidOperation(format!(
                "account {} already exists",
                account.id
            )));
        }
        state.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(id).cloned())
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn transaction_by_ref(&self, reference: &TransactionRef) -> Result<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.get(reference).cloned())
    }

    async fn transactions(&self) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut transactions: Vec<Transaction> = state.transactions.values().cloned().collect();
        transactions.sort_by_key(|tx| tx.created_at);
        Ok(transactions)
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|entry| entry.status == DeliveryStatus::Pending)
            .cloned()
            .collect())
    }

    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        let state = self.state.lock().await;
        Ok(state.outbox.values().cloned().collect())
    }

    async fn mark_delivered(&self, sequence: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = outbox_entry_mut(&mut state, sequence)?;
        entry.status = DeliveryStatus::Delivered;
        Ok(())
    }

    async fn record_attempt(&self, sequence: u64, at: DateTime<Utc>) -> Result<u32> {
        let mut state = self.state.lock().await;
        let entry = outbox_entry_mut(&mut state, sequence)?;
        entry.attempts += 1;
        entry.last_attempt_at = Some(at);
        Ok(entry.attempts)
    }

    async fn mark_failed(&self, sequence: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = outbox_entry_mut(&mut state, sequence)?;
        entry.status = DeliveryStatus::Failed;
        Ok(())
    }
}

fn outbox_entry_mut(state: &mut LedgerState, sequence: u64) -> Result<&mut OutboxEntry> {
    state
        .outbox
        .get_mut(&sequence)
        .ok_or_else(|| LedgerError::StoreUnavailable(format!("outbox entry {sequence} missing")))
}

/// In-process pub/sub bus.
///
/// Broadcast fan-out to per-topic subscriber channels; dead subscribers are
/// dropped on publish. `fail_next` injects delivery failures so relay retry
/// behavior can be exercised without a real broker.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BusRecord>>>>,
    published: Mutex<Vec<BusRecord>>,
    fail_next: AtomicU32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` publish calls fail with a delivery error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Successfully published records, in publish order.
    pub async fn published(&self) -> Vec<BusRecord> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(LedgerError::Delivery(format!(
                "injected failure publishing to {topic}"
            )));
        }

        let record = BusRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        };

        self.published.lock().await.push(record.clone());

        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(topic) {
            senders.retain(|tx| tx.try_send(record.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

/// Audit sink that writes entries to the log stream.
#[derive(Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn notify(&self, event: AuditEvent) -> Result<()> {
        tracing::info!(
            action = %event.action,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            actor = %event.actor,
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Audit sink that records entries for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEvent> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn notify(&self, event: AuditEvent) -> Result<()> {
        self.entries.lock().await.push(event);
        Ok(())
    }
}

/// Dead-letter sink that keeps letters in memory for inspection.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn push(&self, letter: DeadLetter) -> Result<()> {
        tracing::error!(
            topic = %letter.topic,
            reason = %letter.reason,
            "message dead-lettered"
        );
        self.letters.lock().await.push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Amount;
    use crate::domain::transaction::TransactionType;
    use rust_decimal_macros::dec;

    async fn seeded_store(balance: rust_decimal::Decimal) -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        let account = Account::new(
            AccountId::new("ACC-1"),
            "CUST-1",
            "USD",
            Balance::new(balance),
        );
        store.create_account(account).await.unwrap();
        store
    }

    fn deposit(amount: rust_decimal::Decimal) -> Transaction {
        Transaction::record(
            AccountId::new("ACC-1"),
            None,
            TransactionType::Deposit,
            Amount::new(amount).unwrap(),
            "USD",
            None,
            Some("key-1".to_string()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_atomic_commit_applies_all_writes() {
        let store = InMemoryLedgerStore::new();
        store
            .create_account(Account::new(
                AccountId::new("ACC-1"),
                "CUST-1",
                "USD",
                Balance::ZERO,
            ))
            .await
            .unwrap();

        let outcome = store
            .run_atomic(Box::new(|unit| {
                let account = unit.account(&AccountId::new("ACC-1"))?;
                let tx = deposit_static();
                unit.update_balance(&account.id, Balance::new(dec!(10)), account.version)?;
                unit.insert_outbox_entry(OutboxEntry::stage(&tx, 1, vec![0], Utc::now()))?;
                unit.insert_transaction(tx.clone())?;
                Ok(CommitOutcome::Applied(tx))
            }))
            .await
            .unwrap();

        assert!(matches!(outcome, CommitOutcome::Applied(_)));

        let account = store.account(&AccountId::new("ACC-1")).await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(10)));
        assert_eq!(account.version, 1);
        assert_eq!(store.transactions().await.unwrap().len(), 1);

        let outbox = store.outbox_entries().await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].sequence, 1);
    }

    fn deposit_static() -> Transaction {
        Transaction::record(
            AccountId::new("ACC-1"),
            None,
            TransactionType::Deposit,
            Amount::new(dec!(10)).unwrap(),
            "USD",
            None,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_failed_unit_discards_staged_writes() {
        let store = seeded_store(dec!(100)).await;

        let result = store
            .run_atomic(Box::new(|unit| {
                let account = unit.account(&AccountId::new("ACC-1"))?;
                unit.update_balance(&account.id, Balance::new(dec!(0)), account.version)?;
                unit.insert_transaction(deposit_static())?;
                Err(LedgerError::InvalidOperation("late failure".into()))
            }))
            .await;

        assert!(result.is_err());
        let account = store.account(&AccountId::new("ACC-1")).await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(100)));
        assert_eq!(account.version, 0);
        assert!(store.transactions().await.unwrap().is_empty());
        assert!(store.outbox_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_conflicts() {
        let store = seeded_store(dec!(100)).await;

        let result = store
            .run_atomic(Box::new(|unit| {
                let account = unit.account(&AccountId::new("ACC-1"))?;
                unit.update_balance(&account.id, Balance::new(dec!(1)), account.version + 7)?;
                Ok(CommitOutcome::Applied(deposit_static()))
            }))
            .await;

        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_idempotency_key_visible_after_commit() {
        let store = seeded_store(dec!(100)).await;
        let tx = deposit(dec!(5));
        let inserted = tx.clone();

        store
            .run_atomic(Box::new(move |unit| {
                unit.insert_transaction(inserted.clone())?;
                Ok(CommitOutcome::Applied(inserted))
            }))
            .await
            .unwrap();

        let found = store
            .run_atomic(Box::new(|unit| {
                let existing = unit.transaction_by_idempotency_key("key-1")?;
                Ok(CommitOutcome::Duplicate(
                    existing.ok_or_else(|| LedgerError::Validation("missing".into()))?,
                ))
            }))
            .await
            .unwrap();

        assert_eq!(found.transaction().reference, tx.reference);
    }

    #[tokio::test]
    async fn test_outbox_sequences_follow_creation_order() {
        let store = seeded_store(dec!(100)).await;

        for _ in 0..3 {
            store
                .run_atomic(Box::new(|unit| {
                    let tx = deposit_static();
                    unit.insert_outbox_entry(OutboxEntry::stage(&tx, 1, vec![], Utc::now()))?;
                    unit.insert_transaction(tx.clone())?;
                    Ok(CommitOutcome::Applied(tx))
                }))
                .await
                .unwrap();
        }

        let sequences: Vec<u64> = store
            .pending_outbox()
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_bus_publish_and_subscribe() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("transaction-events").await.unwrap();

        bus.publish("transaction-events", "ACC-1", vec![1, 2, 3])
            .await
            .unwrap();

        let record = sub.recv().await.unwrap();
        assert_eq!(record.key, "ACC-1");
        assert_eq!(record.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_bus_injected_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next(2);

        assert!(bus.publish("t", "k", vec![]).await.is_err());
        assert!(bus.publish("t", "k", vec![]).await.is_err());
        assert!(bus.publish("t", "k", vec![]).await.is_ok());
        assert_eq!(bus.published().await.len(), 1);
    }
}
