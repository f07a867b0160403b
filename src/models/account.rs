use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::chain_instant;

/// A wallet: an initial balance plus the chain of entries recorded against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerAccount {
    pub id: Uuid,
    pub name: String,
    /// Seed of the balance chain. Only changed through a reseed.
    pub initial_balance: Decimal,
    pub is_active: bool,
    /// Instant at which the account's history begins.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerAccount {
    /// Creates a new active account whose history starts at `created_at`.
    pub fn new(name: impl Into<String>, initial_balance: Decimal, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            initial_balance,
            is_active: true,
            created_at: chain_instant(created_at),
            updated_at: Utc::now(),
        }
    }

    /// Returns true if `instant` falls before the account's history begins.
    pub fn predates(&self, instant: DateTime<Utc>) -> bool {
        instant < self.created_at
    }

    /// Marks the account as inactive. New entries are rejected by validation.
    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.updated_at = Utc::now();
    }

    /// Replaces the chain seed. Callers must reprocess the full chain afterwards.
    pub(crate) fn reseed(&mut self, initial_balance: Decimal) {
        self.initial_balance = initial_balance;
        self.updated_at = Utc::now();
    }
}
