mod common;

use async_trait::async_trait;
use common::{deposit, ledger_with_accounts, TOPIC};
use corebank::application::consumer::{ConsumerConfig, EventConsumer, MessageOutcome};
use corebank::application::consumer::EventHandler;
use corebank::domain::event::TransactionEvent;
use corebank::domain::ports::MessageBus;
use corebank::error::Result;
use corebank::infrastructure::in_memory::InMemoryDeadLetterSink;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Handler that records every applied event.
#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<TransactionEvent>>,
}

impl RecordingHandler {
    async fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn apply(&self, event: &TransactionEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_end_to_end_commit_to_consumption() {
    let ledger = ledger_with_accounts(&[("ACC-A", dec!(100.00))]).await;

    let handler = Arc::new(RecordingHandler::default());
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let consumer = EventConsumer::new(
        ledger.codec.clone(),
        handler.clone(),
        sink.clone(),
        ConsumerConfig::default(),
    );

    let mut subscription = ledger.bus.subscribe(TOPIC).await.unwrap();

    let tx = ledger
        .engine
        .submit(deposit("ACC-A", dec!(25.00)))
        .await
        .unwrap();
    ledger.relay.sweep().await.unwrap();

    let record = subscription.recv().await.unwrap();
    let outcome = consumer
        .on_message(&record.topic, &record.payload)
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Applied);

    let events = handler.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transaction_id, tx.reference.to_string());
    assert_eq!(events[0].amount, 25.0);
    assert!(sink.letters().await.is_empty());
}

#[tokio::test]
async fn test_redelivered_event_applied_once() {
    let ledger = ledger_with_accounts(&[("ACC-A", dec!(100.00))]).await;

    let handler = Arc::new(RecordingHandler::default());
    let consumer = EventConsumer::new(
        ledger.codec.clone(),
        handler.clone(),
        Arc::new(InMemoryDeadLetterSink::new()),
        ConsumerConfig::default(),
    );

    ledger
        .engine
        .submit(deposit("ACC-A", dec!(25.00)))
        .await
        .unwrap();
    ledger.relay.sweep().await.unwrap();

    let published = ledger.bus.published().await;
    let payload = &published[0].payload;

    assert_eq!(
        consumer.on_message(TOPIC, payload).await.unwrap(),
        MessageOutcome::Applied
    );
    // At-least-once delivery means the same record can arrive again.
    assert_eq!(
        consumer.on_message(TOPIC, payload).await.unwrap(),
        MessageOutcome::Skipped
    );
    assert_eq!(handler.events().await.len(), 1);
}

#[tokio::test]
async fn test_bad_payload_dead_lettered_while_loop_survives() {
    let ledger = ledger_with_accounts(&[("ACC-A", dec!(100.00))]).await;

    let handler = Arc::new(RecordingHandler::default());
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let consumer = EventConsumer::new(
        ledger.codec.clone(),
        handler.clone(),
        sink.clone(),
        ConsumerConfig::default(),
    );

    let subscription = ledger.bus.subscribe(TOPIC).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(async move { consumer.run(subscription, shutdown_rx).await });

    // A payload carrying a schema id the registry has never issued.
    let mut unknown_schema = vec![0x00];
    unknown_schema.extend_from_slice(&9999u32.to_be_bytes());
    unknown_schema.extend_from_slice(b"{}");
    ledger
        .bus
        .publish(TOPIC, "ACC-X", unknown_schema)
        .await
        .unwrap();

    // A valid event right behind it must still be applied.
    ledger
        .engine
        .submit(deposit("ACC-A", dec!(5.00)))
        .await
        .unwrap();
    ledger.relay.sweep().await.unwrap();

    let mut applied = Vec::new();
    for _ in 0..100 {
        applied = handler.events().await;
        if !applied.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(applied.len(), 1, "consumer must survive the bad payload");

    let letters = sink.letters().await;
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("unknown schema id 9999"));

    shutdown_tx.send(true).unwrap();
    consumer_task.await.unwrap();
}
