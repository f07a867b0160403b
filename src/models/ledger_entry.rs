use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::EntryInput;
use crate::error::{AppError, Result};

/// Fractional digits kept by the `NUMERIC(20,4)` columns.
pub const MAX_AMOUNT_SCALE: u32 = 4;

/// Exclusive upper bound on the magnitude of amounts and balances (10^16).
pub const AMOUNT_LIMIT: Decimal = Decimal::from_parts(0x6FC1_0000, 0x0023_86F2, 0, false, 0);

/// Truncates an instant to the microsecond precision of `TIMESTAMPTZ`, so the
/// chain key held in memory matches the stored one.
pub fn chain_instant(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(6)
}

/// Direction of a ledger entry relative to its account's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "entry_direction", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryDirection {
    /// Increases the balance (income).
    Credit,
    /// Decreases the balance (expense).
    Debit,
}

impl EntryDirection {
    /// Sign multiplier applied to an entry amount.
    pub fn sign(&self) -> i32 {
        match self {
            EntryDirection::Credit => 1,
            EntryDirection::Debit => -1,
        }
    }
}

/// Position of an entry in its account's chain.
///
/// Entries are totally ordered by timestamp, with the id breaking ties between
/// entries that share an instant. Field order matters: the derived `Ord` is
/// lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKey {
    pub occurred_at: DateTime<Utc>,
    pub id: Uuid,
}

impl ChainKey {
    pub fn new(occurred_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { occurred_at, id }
    }
}

/// A single financial movement in an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    /// Always positive; the sign comes from `direction`.
    pub amount: Decimal,
    pub direction: EntryDirection,
    /// Cached account balance immediately before this entry.
    pub previous_balance: Decimal,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Builds a new entry from validated input, seeded with `previous_balance`.
    pub fn from_input(input: EntryInput, previous_balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            occurred_at: chain_instant(input.occurred_at),
            amount: input.amount,
            direction: input.direction,
            previous_balance,
            description: input.description,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Signed contribution of this entry to the running balance.
    pub fn effective_value(&self) -> Decimal {
        self.amount * Decimal::from(self.direction.sign())
    }

    /// Balance immediately after this entry. Derived, never stored.
    pub fn resulting_balance(&self) -> Result<Decimal> {
        self.previous_balance
            .checked_add(self.effective_value())
            .ok_or(AppError::BalanceOverflow(self.id))
    }

    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(self.occurred_at, self.id)
    }

    /// Returns true if applying `input` would invalidate cached balances.
    pub fn touches_chain(&self, input: &EntryInput) -> bool {
        self.occurred_at != chain_instant(input.occurred_at)
            || self.direction != input.direction
            || self.amount != input.amount
            || self.account_id != input.account_id
    }

    /// Copies every field of `input` onto this entry. The cached balance is left alone.
    pub fn apply(&mut self, input: EntryInput) {
        self.account_id = input.account_id;
        self.occurred_at = chain_instant(input.occurred_at);
        self.amount = input.amount;
        self.direction = input.direction;
        self.description = input.description;
        self.metadata = input.metadata;
        self.updated_at = Utc::now();
    }
}

/// Sorts entries into chain order.
pub fn sort_chain(entries: &mut [LedgerEntry]) {
    entries.sort_by_key(LedgerEntry::chain_key);
}
