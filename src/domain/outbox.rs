use crate::domain::account::AccountId;
use crate::domain::transaction::{Transaction, TransactionRef};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// A staged event awaiting delivery to the message bus.
///
/// Created in the same atomic unit as the transaction it represents; the relay
/// is the only component that moves it out of PENDING. The payload is encoded
/// at commit time so delivery never depends on the codec being available.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct OutboxEntry {
    /// Store-assigned, monotonically increasing. Sweeping in sequence order
    /// preserves per-account creation order.
    pub sequence: u64,
    pub transaction_ref: TransactionRef,
    /// Partition key for delivery.
    pub account_id: AccountId,
    pub schema_id: u32,
    pub payload: Vec<u8>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Stages an entry for `transaction`. The sequence is assigned by the
    /// store when the atomic unit commits.
    pub fn stage(
        transaction: &Transaction,
        schema_id: u32,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            transaction_ref: transaction.reference.clone(),
            account_id: transaction.account_id.clone(),
            schema_id,
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            created_at,
            last_attempt_at: None,
        }
    }

    /// Whether the entry is eligible for a delivery attempt at `now`, given
    /// the relay's base backoff. Attempt `n` waits `base * 2^(n-1)` after the
    /// previous failure.
    pub fn due(&self, now: DateTime<Utc>, base_backoff: Duration) -> bool {
        match self.last_attempt_at {
            None => true,
            Some(last) => {
                let shift = self.attempts.saturating_sub(1).min(16);
                let wait = base_backoff * 2_i32.saturating_pow(shift);
                now >= last + wait
            }
        }
    }
}
