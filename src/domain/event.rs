use crate::domain::transaction::Transaction;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Subject under which the transaction event schema is registered.
pub const TRANSACTION_EVENTS_SUBJECT: &str = "transaction-events-value";

/// Schema definition for [`TransactionEvent`], registered once at startup.
pub const TRANSACTION_EVENT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "TransactionEvent",
  "fields": [
    { "name": "transactionId", "type": "string" },
    { "name": "accountId", "type": "string" },
    { "name": "relatedAccountId", "type": ["null", "string"], "default": null },
    { "name": "transactionType", "type": "string" },
    { "name": "amount", "type": "double" },
    { "name": "currency", "type": "string" },
    { "name": "timestamp", "type": "long" }
  ]
}"#;

/// Wire payload published for every committed transaction.
///
/// The amount is a double here because that is what the schema declares;
/// ledger arithmetic stays in fixed-point decimal and this value is only for
/// downstream consumers.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub transaction_id: String,
    pub account_id: String,
    pub related_account_id: Option<String>,
    pub transaction_type: String,
    pub amount: f64,
    pub currency: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl TransactionEvent {
    pub fn from_transaction(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.reference.to_string(),
            account_id: tx.account_id.to_string(),
            related_account_id: tx.related_account_id.as_ref().map(ToString::to_string),
            transaction_type: tx.transaction_type.to_string(),
            amount: tx.amount.value().to_f64().unwrap_or_default(),
            currency: tx.currency.clone(),
            timestamp: tx.created_at.timestamp_millis(),
        }
    }
}

/// Fire-and-forget notification handed to the audit sink.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub message: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        message: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            message: message.into(),
            actor: actor.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{AccountId, Amount};
    use crate::domain::transaction::TransactionType;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_from_transaction() {
        let tx = Transaction::record(
            AccountId::new("ACC-1"),
            Some(AccountId::new("ACC-2")),
            TransactionType::Transfer,
            Amount::new(dec!(60.00)).unwrap(),
            "USD",
            None,
            None,
            Utc::now(),
        );

        let event = TransactionEvent::from_transaction(&tx);
        assert_eq!(event.transaction_id, tx.reference.to_string());
        assert_eq!(event.account_id, "ACC-1");
        assert_eq!(event.related_account_id.as_deref(), Some("ACC-2"));
        assert_eq!(event.transaction_type, "TRANSFER");
        assert_eq!(event.amount, 60.0);
        assert_eq!(event.timestamp, tx.created_at.timestamp_millis());
    }

    #[test]
    fn test_event_json_field_names() {
        let event = TransactionEvent {
            transaction_id: "TXN-1".into(),
            account_id: "ACC-1".into(),
            related_account_id: None,
            transaction_type: "DEPOSIT".into(),
            amount: 10.0,
            currency: "USD".into(),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"transactionId\":\"TXN-1\""));
        assert!(json.contains("\"relatedAccountId\":null"));
    }
}
