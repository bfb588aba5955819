use crate::domain::account::AccountId;
use crate::domain::ports::{LedgerStore, LedgerStoreRef, MessageBus, MessageBusRef};
use crate::error::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub topic: String,
    /// Safety-net sweep interval; wake-ups from the engine usually arrive
    /// first.
    pub sweep_interval: Duration,
    /// Base of the exponential backoff between delivery attempts.
    pub base_backoff: Duration,
    /// Attempts before an entry is marked FAILED and surfaced as an alert.
    pub max_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: "transaction-events".to_string(),
            sweep_interval: Duration::from_millis(500),
            base_backoff: Duration::from_millis(100),
            max_attempts: 5,
        }
    }
}

/// Wakes the relay after a commit. Cheap to clone and hand to the engine.
#[derive(Clone, Default)]
pub struct RelayHandle {
    notify: Arc<Notify>,
}

impl RelayHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Bridges committed transactions to the message bus.
///
/// Sweeps PENDING outbox entries in creation order and publishes each with the
/// account id as partition key. Failures leave the entry PENDING and back off
/// exponentially; exhausted entries are marked FAILED and logged as an
/// operational alert, never silently dropped. The ledger commit path does not
/// wait on any of this.
pub struct OutboxRelay {
    store: LedgerStoreRef,
    bus: MessageBusRef,
    config: RelayConfig,
    handle: RelayHandle,
}

impl OutboxRelay {
    pub fn new(store: LedgerStoreRef, bus: MessageBusRef, config: RelayConfig) -> Self {
        Self {
            store,
            bus,
            config,
            handle: RelayHandle::new(),
        }
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Runs until `shutdown` flips to true. Sweeps on wake-up and on the
    /// interval tick as a safety net.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.handle.notify.notified() => {}
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("outbox relay shutting down");
                        return;
                    }
                    continue;
                }
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "outbox sweep failed");
            }
        }
    }

    /// One delivery pass over the pending entries.
    ///
    /// Entries for the same account are taken strictly in creation order: a
    /// failed or not-yet-due entry holds back later entries for that account
    /// until it is resolved, so per-account ordering survives retries.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let base = chrono::Duration::from_std(self.config.base_backoff)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let mut stats = SweepStats::default();
        let mut held: HashSet<AccountId> = HashSet::new();

        for entry in self.store.pending_outbox().await? {
            if held.contains(&entry.account_id) {
                continue;
            }
            if !entry.due(now, base) {
                held.insert(entry.account_id.clone());
                continue;
            }

            let publish = self
                .bus
                .publish(
                    &self.config.topic,
                    entry.account_id.as_str(),
                    entry.payload.clone(),
                )
                .await;

            match publish {
                Ok(()) => {
                    self.store.mark_delivered(entry.sequence).await?;
                    stats.delivered += 1;
                    tracing::debug!(
                        sequence = entry.sequence,
                        transaction = %entry.transaction_ref,
                        "outbox entry delivered"
                    );
                }
                Err(e) => {
                    held.insert(entry.account_id.clone());
                    let attempts = self.store.record_attempt(entry.sequence, now).await?;
                    if attempts >= self.config.max_attempts {
                        self.store.mark_failed(entry.sequence).await?;
                        stats.failed += 1;
                        tracing::error!(
                            sequence = entry.sequence,
                            transaction = %entry.transaction_ref,
                            attempts,
                            error = %e,
                            "outbox entry failed permanently, operator attention required"
                        );
                    } else {
                        stats.retried += 1;
                        tracing::warn!(
                            sequence = entry.sequence,
                            transaction = %entry.transaction_ref,
                            attempts,
                            error = %e,
                            "outbox delivery failed, will retry"
                        );
                    }
                }
            }
        }

        Ok(stats)
    }
}
