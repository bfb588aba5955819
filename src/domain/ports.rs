use crate::domain::account::{Account, AccountId, Balance};
use crate::domain::event::AuditEvent;
use crate::domain::outbox::OutboxEntry;
use crate::domain::transaction::{Transaction, TransactionRef};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome of a submit attempt committed through [`LedgerStore::run_atomic`].
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// Balances mutated, transaction and outbox rows written.
    Applied(Transaction),
    /// Idempotency-key hit: the previously committed transaction, untouched.
    Duplicate(Transaction),
}

impl CommitOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Applied(tx) | Self::Duplicate(tx) => tx,
        }
    }
}

/// Read-modify-write view handed to the closure running inside an atomic unit.
///
/// All reads see committed state plus this unit's staged writes; all writes
/// commit together or not at all.
pub trait AtomicUnit {
    fn account(&mut self, id: &AccountId) -> Result<Account>;

    /// Writes a new balance, failing with `Conflict` when `expected_version`
    /// no longer matches the stored row. The stored version is bumped on
    /// success.
    fn update_balance(
        &mut self,
        id: &AccountId,
        new_balance: Balance,
        expected_version: u64,
    ) -> Result<()>;

    fn insert_transaction(&mut self, tx: Transaction) -> Result<()>;

    /// Stages an outbox entry; its sequence is assigned at commit.
    fn insert_outbox_entry(&mut self, entry: OutboxEntry) -> Result<()>;

    fn transaction_by_idempotency_key(&mut self, key: &str) -> Result<Option<Transaction>>;
}

pub type AtomicWork = Box<dyn FnOnce(&mut dyn AtomicUnit) -> Result<CommitOutcome> + Send>;

/// Durable keyed storage for accounts, transactions and outbox entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Executes `work` with exclusive read-modify-write access to the rows it
    /// touches, committing all staged writes together on `Ok` and discarding
    /// them on `Err`.
    async fn run_atomic(&self, work: AtomicWork) -> Result<CommitOutcome>;

    async fn create_account(&self, account: Account) -> Result<()>;
    async fn account(&self, id: &AccountId) -> Result<Option<Account>>;
    async fn accounts(&self) -> Result<Vec<Account>>;

    async fn transaction_by_ref(&self, reference: &TransactionRef) -> Result<Option<Transaction>>;
    async fn transactions(&self) -> Result<Vec<Transaction>>;

    /// PENDING entries in creation (sequence) order.
    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>>;
    /// All entries regardless of status, in sequence order.
    async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>>;
    async fn mark_delivered(&self, sequence: u64) -> Result<()>;
    /// Records a failed delivery attempt and returns the new attempt count.
    async fn record_attempt(&self, sequence: u64, at: DateTime<Utc>) -> Result<u32>;
    async fn mark_failed(&self, sequence: u64) -> Result<()>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;

/// A record as it travels over the message bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Receiving end of a topic subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<BusRecord>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<BusRecord>) -> Self {
        Self { receiver }
    }

    /// Next record, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusRecord> {
        self.receiver.recv().await
    }
}

/// Message bus port. Delivery is at-least-once; subscribers must be
/// idempotent.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

pub type MessageBusRef = Arc<dyn MessageBus>;

/// Fire-and-forget audit notifications. A failing sink is logged and never
/// blocks or rolls back a committed transaction.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn notify(&self, event: AuditEvent) -> Result<()>;
}

pub type AuditSinkRef = Arc<dyn AuditSink>;

/// A message that could not be processed after bounded retries, preserved for
/// inspection rather than discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub topic: String,
    pub payload: Vec<u8>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, letter: DeadLetter) -> Result<()>;
}

pub type DeadLetterSinkRef = Arc<dyn DeadLetterSink>;
