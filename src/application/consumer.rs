use crate::domain::event::TransactionEvent;
use crate::domain::ports::{DeadLetter, DeadLetterSink, DeadLetterSinkRef, Subscription};
use crate::error::Result;
use crate::schema::SchemaCodec;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// Side-effect applied for each decoded event, e.g. re-deriving ledger
/// activity from an upstream stream. Must be idempotent per transaction id;
/// the consumer additionally suppresses duplicates it has already applied.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn apply(&self, event: &TransactionEvent) -> Result<()>;
}

/// Handler that only logs the consumed event.
#[derive(Default)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn apply(&self, event: &TransactionEvent) -> Result<()> {
        tracing::info!(
            transaction = %event.transaction_id,
            account = %event.account_id,
            transaction_type = %event.transaction_type,
            amount = event.amount,
            "consumed transaction event"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Handler retries before a message is dead-lettered.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Terminal state of one consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Applied,
    /// Duplicate of an already-applied transaction; acknowledged and skipped.
    Skipped,
    DeadLettered,
}

/// Decodes transaction events off the bus and applies them idempotently.
///
/// Undecodable payloads and handler failures that survive the retry budget go
/// to the dead-letter sink; the consuming loop itself never dies on a bad
/// message. A message is acknowledged only once applied, skipped, or
/// dead-lettered.
pub struct EventConsumer {
    codec: Arc<SchemaCodec>,
    handler: Arc<dyn EventHandler>,
    dead_letters: DeadLetterSinkRef,
    applied: Mutex<HashSet<String>>,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        codec: Arc<SchemaCodec>,
        handler: Arc<dyn EventHandler>,
        dead_letters: DeadLetterSinkRef,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            codec,
            handler,
            dead_letters,
            applied: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Consumes `subscription` until `shutdown` flips to true.
    pub async fn run(&self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                record = subscription.recv() => {
                    let Some(record) = record else {
                        tracing::debug!("subscription closed, consumer exiting");
                        return;
                    };
                    if let Err(e) = self.on_message(&record.topic, &record.payload).await {
                        tracing::error!(error = %e, "failed to record dead letter");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("event consumer shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Processes one raw message: RECEIVED -> DECODED -> APPLIED | SKIPPED |
    /// DEAD_LETTERED.
    ///
    /// The returned error covers only dead-letter sink failures; message-level
    /// problems are resolved into the outcome.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<MessageOutcome> {
        let event: TransactionEvent = match self.codec.decode(payload) {
            Ok((_, event)) => event,
            Err(e) => {
                self.dead_letters
                    .push(DeadLetter::new(topic, payload.to_vec(), e.to_string()))
                    .await?;
                return Ok(MessageOutcome::DeadLettered);
            }
        };

        if self.applied.lock().await.contains(&event.transaction_id) {
            tracing::debug!(
                transaction = %event.transaction_id,
                "duplicate event, skipping"
            );
            return Ok(MessageOutcome::Skipped);
        }

        let mut attempt = 0;
        loop {
            match self.handler.apply(&event).await {
                Ok(()) => {
                    self.applied
                        .lock()
                        .await
                        .insert(event.transaction_id.clone());
                    return Ok(MessageOutcome::Applied);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        transaction = %event.transaction_id,
                        attempt,
                        error = %e,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => {
                    self.dead_letters
                        .push(DeadLetter::new(
                            topic,
                            payload.to_vec(),
                            format!("handler exhausted retries: {e}"),
                        ))
                        .await?;
                    return Ok(MessageOutcome::DeadLettered);
                }
            }
        }
    }
}
