#![allow(dead_code)]

use corebank::application::engine::{EngineConfig, TransactionEngine};
use corebank::application::relay::{OutboxRelay, RelayConfig};
use corebank::domain::account::{Account, AccountId, Balance};
use corebank::domain::event::{TRANSACTION_EVENT_SCHEMA, TRANSACTION_EVENTS_SUBJECT};
use corebank::domain::ports::LedgerStore;
use corebank::domain::transaction::TransactionType;
use corebank::infrastructure::in_memory::{InMemoryBus, InMemoryLedgerStore, RecordingAuditSink};
use corebank::interfaces::request::TransactionRequest;
use corebank::schema::{InMemorySchemaRegistry, SchemaCodec};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "transaction-events";

/// Fully wired in-memory pipeline. The relay is constructed but not spawned;
/// tests drive `relay.sweep()` directly or spawn `relay.run()` themselves.
pub struct TestLedger {
    pub store: Arc<InMemoryLedgerStore>,
    pub bus: Arc<InMemoryBus>,
    pub audit: Arc<RecordingAuditSink>,
    pub codec: Arc<SchemaCodec>,
    pub engine: Arc<TransactionEngine>,
    pub relay: OutboxRelay,
}

pub async fn ledger_with_accounts(accounts: &[(&str, Decimal)]) -> TestLedger {
    ledger_with_config(accounts, RelayConfig {
        topic: TOPIC.to_string(),
        base_backoff: Duration::ZERO,
        ..RelayConfig::default()
    })
    .await
}

pub async fn ledger_with_config(
    accounts: &[(&str, Decimal)],
    relay_config: RelayConfig,
) -> TestLedger {
    let store = Arc::new(InMemoryLedgerStore::new());
    for (id, balance) in accounts {
        store
            .create_account(Account::new(
                AccountId::new(*id),
                format!("CUST-{id}"),
                "USD",
                Balance::new(*balance),
            ))
            .await
            .unwrap();
    }

    let registry = Arc::new(InMemorySchemaRegistry::new());
    let codec = Arc::new(
        SchemaCodec::for_subject(registry, TRANSACTION_EVENTS_SUBJECT, TRANSACTION_EVENT_SCHEMA)
            .unwrap(),
    );

    let bus = Arc::new(InMemoryBus::new());
    let relay = OutboxRelay::new(store.clone(), bus.clone(), relay_config);
    let audit = Arc::new(RecordingAuditSink::new());

    let engine = Arc::new(TransactionEngine::new(
        store.clone(),
        codec.clone(),
        audit.clone(),
        relay.handle(),
        EngineConfig::default(),
    ));

    TestLedger {
        store,
        bus,
        audit,
        codec,
        engine,
        relay,
    }
}

pub fn deposit(account: &str, amount: Decimal) -> TransactionRequest {
    TransactionRequest {
        account_id: account.to_string(),
        related_account_id: None,
        transaction_type: TransactionType::Deposit,
        amount,
        currency: "USD".to_string(),
        description: None,
        idempotency_key: None,
    }
}

pub fn withdrawal(account: &str, amount: Decimal) -> TransactionRequest {
    TransactionRequest {
        transaction_type: TransactionType::Withdrawal,
        ..deposit(account, amount)
    }
}

pub fn transfer(from: &str, to: &str, amount: Decimal) -> TransactionRequest {
    TransactionRequest {
        related_account_id: Some(to.to_string()),
        transaction_type: TransactionType::Transfer,
        ..deposit(from, amount)
    }
}

pub async fn balance_of(store: &InMemoryLedgerStore, id: &str) -> Balance {
    store
        .account(&AccountId::new(id))
        .await
        .unwrap()
        .expect("account should exist")
        .balance
}
