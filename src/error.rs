use crate::domain::account::AccountId;
use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

/// Error taxonomy for the ledger pipeline.
///
/// Client-fixable rejections (`Validation`, `InvalidOperation`,
/// `InsufficientFunds`, `AccountNotFound`) are surfaced verbatim and never
/// retried. `Conflict` is retryable at the engine level with a small bounded
/// attempt count. Infrastructure failures (`Delivery`, `StoreUnavailable`) are
/// retried locally before surfacing.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("insufficient funds in account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("version conflict on account {account}: expected {expected}, found {found}")]
    Conflict {
        account: AccountId,
        expected: u64,
        found: u64,
    },

    #[error("unknown schema id {0}")]
    SchemaResolution(u32),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    /// Whether the failed call may be re-executed without client involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Delivery(_) | Self::StoreUnavailable(_)
        )
    }
}
