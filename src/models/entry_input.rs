use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{EntryDirection, LedgerEntry};

/// Fields supplied when creating or editing an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EntryInput {
    pub account_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub amount: Decimal,
    pub direction: EntryDirection,
    #[validate(length(min = 1, max = 255))]
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

impl EntryInput {
    pub fn new(
        account_id: Uuid,
        occurred_at: DateTime<Utc>,
        amount: Decimal,
        direction: EntryDirection,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            occurred_at,
            amount,
            direction,
            description: description.into(),
            metadata: None,
        }
    }

    /// Shorthand for an income entry.
    pub fn credit(
        account_id: Uuid,
        occurred_at: DateTime<Utc>,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Self::new(account_id, occurred_at, amount, EntryDirection::Credit, description)
    }

    /// Shorthand for an expense entry.
    pub fn debit(
        account_id: Uuid,
        occurred_at: DateTime<Utc>,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Self::new(account_id, occurred_at, amount, EntryDirection::Debit, description)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The current values of an entry, as a starting point for an edit.
impl From<&LedgerEntry> for EntryInput {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            account_id: entry.account_id,
            occurred_at: entry.occurred_at,
            amount: entry.amount,
            direction: entry.direction,
            description: entry.description.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}
