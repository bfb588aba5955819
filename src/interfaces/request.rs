use crate::domain::account::{AccountId, Amount};
use crate::domain::transaction::TransactionType;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// A transaction submission as received from a client.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_account_id: Option<String>,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// A request that passed structural validation. Produced only by
/// [`TransactionRequest::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub account_id: AccountId,
    pub related_account_id: Option<AccountId>,
    pub transaction_type: TransactionType,
    pub amount: Amount,
    pub currency: String,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

impl TransactionRequest {
    /// Pure structural validation, run before the engine touches any state.
    /// Consistency with ledger state (account existence, funds) is checked
    /// later, under lock.
    pub fn validate(self) -> Result<ValidatedRequest> {
        let amount = Amount::new(self.amount)?;

        if self.account_id.trim().is_empty() {
            return Err(LedgerError::Validation("account id is required".into()));
        }
        if self.currency.trim().is_empty() {
            return Err(LedgerError::Validation("currency is required".into()));
        }

        let related_account_id = match (self.transaction_type, self.related_account_id) {
            (TransactionType::Transfer, None) => {
                return Err(LedgerError::Validation(
                    "related account id is required for transfers".into(),
                ));
            }
            (TransactionType::Transfer, Some(related)) => {
                if related == self.account_id {
                    return Err(LedgerError::InvalidOperation(
                        "cannot transfer to the same account".into(),
                    ));
                }
                Some(AccountId::new(related))
            }
            (_, Some(_)) => {
                return Err(LedgerError::Validation(
                    "related account id is only valid for transfers".into(),
                ));
            }
            (_, None) => None,
        };

        Ok(ValidatedRequest {
            account_id: AccountId::new(self.account_id),
            related_account_id,
            transaction_type: self.transaction_type,
            amount,
            currency: self.currency,
            description: self.description,
            idempotency_key: self.idempotency_key,
        })
    }
}

/// Reads transaction requests from a JSON-lines source.
///
/// Wraps any `BufRead` and yields one `Result<TransactionRequest>` per
/// non-blank line, so large batches stream without loading the whole file.
pub struct RequestReader<R: BufRead> {
    source: R,
}

impl<R: BufRead> RequestReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn requests(self) -> impl Iterator<Item = Result<TransactionRequest>> {
        self.source
            .lines()
            .map(|line| {
                line.map_err(|e| LedgerError::Validation(format!("unreadable request line: {e}")))
            })
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(|line| {
                let line = line?;
                serde_json::from_str(&line)
                    .map_err(|e| LedgerError::Validation(format!("malformed request: {e}")))
            })
    }
}
