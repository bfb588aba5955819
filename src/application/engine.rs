use crate::application::relay::RelayHandle;
use crate::domain::account::AccountId;
use crate::domain::event::{AuditEvent, TransactionEvent};
use crate::domain::outbox::OutboxEntry;
use crate::domain::ports::{
    AtomicUnit, AuditSink, AuditSinkRef, CommitOutcome, LedgerStore, LedgerStoreRef,
};
use crate::domain::transaction::{Transaction, TransactionType};
use crate::error::{LedgerError, Result};
use crate::interfaces::request::{TransactionRequest, ValidatedRequest};
use crate::schema::SchemaCodec;
use chrono::Utc;
use std::sync::Arc;

const SYSTEM_ACTOR: &str = "SYSTEM";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on engine-level re-execution after an optimistic-lock collision.
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

/// The transaction-commit pipeline.
///
/// Validates a requested money movement, applies balance changes exactly once
/// inside a store atomic unit, and stages the schema-encoded event in the
/// outbox within that same unit. Collaborators are passed in explicitly; the
/// engine owns no storage of its own.
pub struct TransactionEngine {
    store: LedgerStoreRef,
    codec: Arc<SchemaCodec>,
    audit: AuditSinkRef,
    relay: RelayHandle,
    config: EngineConfig,
}

impl TransactionEngine {
    pub fn new(
        store: LedgerStoreRef,
        codec: Arc<SchemaCodec>,
        audit: AuditSinkRef,
        relay: RelayHandle,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            codec,
            audit,
            relay,
            config,
        }
    }

    /// Submits a transaction request.
    ///
    /// Returns the persisted transaction; an idempotency-key replay returns
    /// the previously committed transaction without touching balances. Any
    /// failure leaves all ledger state unchanged.
    pub async fn submit(&self, request: TransactionRequest) -> Result<Transaction> {
        let valid = request.validate()?;

        let mut attempt = 0;
        let outcome = loop {
            match self.try_commit(&valid).await {
                Err(LedgerError::Conflict {
                    account,
                    expected,
                    found,
                }) if attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    tracing::warn!(
                        account = %account,
                        expected,
                        found,
                        attempt,
                        "balance version conflict, re-executing"
                    );
                }
                other => break other?,
            }
        };

        match outcome {
            CommitOutcome::Duplicate(tx) => {
                tracing::debug!(
                    reference = %tx.reference,
                    "idempotency key replay, returning existing transaction"
                );
                Ok(tx)
            }
            CommitOutcome::Applied(tx) => {
                tracing::info!(
                    reference = %tx.reference,
                    account = %tx.account_id,
                    transaction_type = %tx.transaction_type,
                    amount = %tx.amount,
                    "transaction committed"
                );
                self.notify_audit(&tx);
                self.relay.wake();
                Ok(tx)
            }
        }
    }

    /// One full pass of the commit protocol inside a single atomic unit.
    async fn try_commit(&self, valid: &ValidatedRequest) -> Result<CommitOutcome> {
        let valid = valid.clone();
        let codec = Arc::clone(&self.codec);

        self.store
            .run_atomic(Box::new(move |unit| commit_in_unit(unit, &valid, &codec)))
            .await
    }

    /// Audit notification is fire-and-forget: a sink failure is logged and
    /// never rolls back the committed transaction.
    fn notify_audit(&self, tx: &Transaction) {
        let audit = Arc::clone(&self.audit);
        let event = AuditEvent::new(
            tx.transaction_type.as_str(),
            "Transaction",
            tx.reference.as_str(),
            audit_message(tx),
            SYSTEM_ACTOR,
        );
        tokio::spawn(async move {
            if let Err(e) = audit.notify(event).await {
                tracing::warn!(error = %e, "audit notification failed");
            }
        });
    }
}

fn commit_in_unit(
    unit: &mut dyn AtomicUnit,
    valid: &ValidatedRequest,
    codec: &SchemaCodec,
) -> Result<CommitOutcome> {
    // Replayed requests return the original transaction unchanged.
    if let Some(key) = valid.idempotency_key.as_deref() {
        if let Some(existing) = unit.transaction_by_idempotency_key(key)? {
            return Ok(CommitOutcome::Duplicate(existing));
        }
    }

    match valid.transaction_type {
        TransactionType::Deposit => {
            let account = load_active(unit, &valid.account_id)?;
            let new_balance = account.credited(valid.amount);
            unit.update_balance(&account.id, new_balance, account.version)?;
        }
        TransactionType::Withdrawal => {
            let account = load_active(unit, &valid.account_id)?;
            // Funds are checked against the just-loaded balance, not a stale
            // pre-lock read.
            let new_balance = account.debited(valid.amount)?;
            unit.update_balance(&account.id, new_balance, account.version)?;
        }
        TransactionType::Transfer => {
            let destination_id = valid
                .related_account_id
                .clone()
                .ok_or_else(|| LedgerError::Validation("transfer without destination".into()))?;

            // Rows are taken in ascending id order so opposing transfers
            // cannot deadlock.
            let mut ids = [&valid.account_id, &destination_id];
            ids.sort();
            let first = load_active(unit, ids[0])?;
            let second = load_active(unit, ids[1])?;

            let (source, destination) = if first.id == valid.account_id {
                (first, second)
            } else {
                (second, first)
            };

            let new_source = source.debited(valid.amount)?;
            let new_destination = destination.credited(valid.amount);
            unit.update_balance(&source.id, new_source, source.version)?;
            unit.update_balance(&destination.id, new_destination, destination.version)?;
        }
    }

    let tx = Transaction::record(
        valid.account_id.clone(),
        valid.related_account_id.clone(),
        valid.transaction_type,
        valid.amount,
        valid.currency.clone(),
        valid.description.clone(),
        valid.idempotency_key.clone(),
        Utc::now(),
    );

    let event = TransactionEvent::from_transaction(&tx);
    let payload = codec.encode(&event)?;
    unit.insert_outbox_entry(OutboxEntry::stage(
        &tx,
        codec.schema_id(),
        payload,
        tx.created_at,
    ))?;
    unit.insert_transaction(tx.clone())?;

    Ok(CommitOutcome::Applied(tx))
}

fn load_active(
    unit: &mut dyn AtomicUnit,
    id: &AccountId,
) -> Result<crate::domain::account::Account> {
    let account = unit.account(id)?;
    account.ensure_active()?;
    Ok(account)
}

fn audit_message(tx: &Transaction) -> String {
    match tx.transaction_type {
        TransactionType::Deposit => {
            format!("Deposited {} into account {}", tx.amount, tx.account_id)
        }
        TransactionType::Withdrawal => {
            format!("Withdrew {} from account {}", tx.amount, tx.account_id)
        }
        TransactionType::Transfer => {
            let destination = tx
                .related_account_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            format!(
                "Transferred {} from {} to {}",
                tx.amount, tx.account_id, destination
            )
        }
    }
}
