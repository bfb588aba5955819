use crate::domain::account::{AccountId, Amount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdrawal => "WITHDRAWAL",
            Self::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Globally unique transaction reference.
///
/// Generated server-side at creation so client retries cannot collide with an
/// existing reference; client-driven replay protection goes through the
/// idempotency key instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionRef(String);

impl TransactionRef {
    pub fn generate() -> Self {
        Self(format!("TXN-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A committed money movement.
///
/// Immutable once created; corrections are new offsetting transactions.
/// `related_account_id` is populated only for transfers (the receiving side).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub reference: TransactionRef,
    pub account_id: AccountId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_account_id: Option<AccountId>,
    pub transaction_type: TransactionType,
    pub amount: Amount,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        account_id: AccountId,
        related_account_id: Option<AccountId>,
        transaction_type: TransactionType,
        amount: Amount,
        currency: impl Into<String>,
        description: Option<String>,
        idempotency_key: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reference: TransactionRef::generate(),
            account_id,
            related_account_id,
            transaction_type,
            amount,
            currency: currency.into(),
            description,
            idempotency_key,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reference_is_unique() {
        let a = TransactionRef::generate();
        let b = TransactionRef::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("TXN-"));
    }

    #[test]
    fn test_transaction_serialization() {
        let tx = Transaction::record(
            AccountId::new("ACC-1"),
            None,
            TransactionType::Deposit,
            Amount::new(dec!(25.50)).unwrap(),
            "USD",
            Some("payroll".to_string()),
            None,
            Utc::now(),
        );

        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"transactionType\":\"DEPOSIT\""));
        // Absent optional fields are omitted, not null.
        assert!(!json.contains("relatedAccountId"));
        assert!(!json.contains("idempotencyKey"));

        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_transfer_carries_related_account() {
        let tx = Transaction::record(
            AccountId::new("ACC-1"),
            Some(AccountId::new("ACC-2")),
            TransactionType::Transfer,
            Amount::new(dec!(60)).unwrap(),
            "USD",
            None,
            None,
            Utc::now(),
        );
        assert_eq!(tx.related_account_id, Some(AccountId::new("ACC-2")));
    }
}
