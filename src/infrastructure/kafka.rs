use crate::domain::ports::{BusRecord, MessageBus, Subscription};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::mpsc;

/// Kafka-compatible message bus.
///
/// At-least-once semantics: offsets are committed only after a record has been
/// handed to the subscriber channel, so a crash before commit means
/// redelivery. Subscribers must be idempotent.
pub struct KafkaBus {
    producer: FutureProducer,
    brokers: String,
    group_id: String,
    send_timeout: Duration,
}

impl KafkaBus {
    pub fn new(brokers: &str, group_id: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()
            .map_err(|e| LedgerError::Delivery(format!("failed to create producer: {e}")))?;

        tracing::info!(brokers = %brokers, group_id = %group_id, "kafka bus connected");

        Ok(Self {
            producer,
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            send_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let record = FutureRecord::to(topic).payload(&payload).key(key);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::debug!(topic, partition, offset, key, "record published");
                Ok(())
            }
            Err((e, _)) => Err(LedgerError::Delivery(format!(
                "publish to {topic} failed: {e}"
            ))),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| LedgerError::Delivery(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| LedgerError::Delivery(format!("failed to subscribe to {topic}: {e}")))?;

        let (tx, rx) = mpsc::channel(256);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => {
                        let record = BusRecord {
                            topic: message.topic().to_string(),
                            key: message
                                .key()
                                .map(|k| String::from_utf8_lossy(k).into_owned())
                                .unwrap_or_default(),
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        };

                        // Commit only after the record is accepted downstream;
                        // a dropped receiver exits without committing.
                        if tx.send(record).await.is_err() {
                            tracing::debug!(topic = %topic, "subscriber dropped, consumer exiting");
                            return;
                        }
                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            tracing::warn!(error = %e, "offset commit failed, record may be redelivered");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "kafka receive error");
                    }
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
