use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Unique account identifier.
///
/// Ordered so that multi-account operations can take their locks in a fixed,
/// ascending order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A monetary balance in fixed-point decimal.
///
/// Wrapper around `rust_decimal::Decimal` so balance arithmetic never touches
/// binary floating-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// A positive monetary amount for transactions.
///
/// Construction enforces that transaction amounts are always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LedgerError::Validation(
                "amount must be greater than zero".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Closed,
    Frozen,
}

/// A ledger account.
///
/// The balance is the sum of all committed transactions affecting the account
/// and is mutated only inside a store atomic unit. The version counter backs
/// optimistic concurrency checks on balance updates.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub customer_id: String,
    pub currency: String,
    pub balance: Balance,
    pub status: AccountStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        id: AccountId,
        customer_id: impl Into<String>,
        currency: impl Into<String>,
        opening_balance: Balance,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            customer_id: customer_id.into(),
            currency: currency.into(),
            balance: opening_balance,
            status: AccountStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fails with `InvalidOperation` unless the account is ACTIVE.
    pub fn ensure_active(&self) -> Result<()> {
        match self.status {
            AccountStatus::Active => Ok(()),
            AccountStatus::Closed => Err(LedgerError::InvalidOperation(format!(
                "account {} is closed",
                self.id
            ))),
            AccountStatus::Frozen => Err(LedgerError::InvalidOperation(format!(
                "account {} is frozen",
                self.id
            ))),
        }
    }

    /// New balance after crediting `amount`.
    pub fn credited(&self, amount: Amount) -> Balance {
        self.balance + Balance(amount.value())
    }

    /// New balance after debiting `amount`, validated against the current
    /// balance. Balances never go negative.
    pub fn debited(&self, amount: Amount) -> Result<Balance> {
        if self.balance.value() < amount.value() {
            return Err(LedgerError::InsufficientFunds {
                account: self.id.clone(),
                balance: self.balance.value(),
                requested: amount.value(),
            });
        }
        Ok(self.balance - Balance(amount.value()))
    }
}
