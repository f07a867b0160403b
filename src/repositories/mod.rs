pub mod memory_store;
pub mod postgres_store;

pub use memory_store::InMemoryLedgerStore;
pub use postgres_store::PostgresLedgerStore;

use crate::config::{DatabaseSettings, StoreBackend};
use crate::error::{AppError, Result};
use crate::models::{ChainKey, LedgerAccount, LedgerEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Database connection pool type alias.
pub type DbPool = PgPool;

/// Entry point to a backing store. Every read and write happens inside a unit of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens a new unit of work. Nothing it writes is visible to others until commit.
    async fn begin(&self) -> Result<Box<dyn LedgerUnitOfWork>>;

    /// Short backend name for logs.
    fn backend(&self) -> StoreBackend;
}

/// A transactional session against the store.
///
/// Dropping a unit of work without calling [`LedgerUnitOfWork::commit`] discards
/// everything it wrote.
#[async_trait]
pub trait LedgerUnitOfWork: Send {
    /// Reads an account and holds an exclusive lock on it until the unit of work ends.
    async fn lock_account(&mut self, id: Uuid) -> Result<Option<LedgerAccount>>;

    async fn find_account(&mut self, id: Uuid) -> Result<Option<LedgerAccount>>;

    async fn list_accounts(&mut self) -> Result<Vec<LedgerAccount>>;

    async fn insert_account(&mut self, account: &LedgerAccount) -> Result<()>;

    async fn update_account(&mut self, account: &LedgerAccount) -> Result<()>;

    async fn find_entry(&mut self, id: Uuid) -> Result<Option<LedgerEntry>>;

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<()>;

    /// Writes every column of an existing entry.
    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<()>;

    /// Overwrites only the cached previous balance of an entry.
    async fn update_previous_balance(&mut self, id: Uuid, previous_balance: Decimal) -> Result<()>;

    /// Removes an entry. Returns false if it did not exist.
    async fn delete_entry(&mut self, id: Uuid) -> Result<bool>;

    /// All entries of an account, in chain order.
    async fn entries_for_account(&mut self, account_id: Uuid) -> Result<Vec<LedgerEntry>>;

    /// Entries with `occurred_at >= since`, in chain order.
    async fn entries_since(
        &mut self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>>;

    /// Entries with `from <= occurred_at < to`, in chain order.
    async fn entries_between(
        &mut self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>>;

    /// The chain-order last entry with `occurred_at <= instant`.
    async fn last_entry_at_or_before(
        &mut self,
        account_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>>;

    /// The chain-order predecessor of `key`, skipping `exclude`.
    async fn last_entry_before(
        &mut self,
        account_id: Uuid,
        key: ChainKey,
        exclude: Option<Uuid>,
    ) -> Result<Option<LedgerEntry>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Builds the store selected by configuration.
pub async fn build_store(settings: &DatabaseSettings) -> Result<Arc<dyn LedgerStore>> {
    match settings.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryLedgerStore::new())),
        StoreBackend::Postgres => {
            let url = settings.url.as_deref().ok_or_else(|| {
                AppError::Internal("database.url is required for the postgres backend".to_string())
            })?;
            let store = PostgresLedgerStore::connect(url, settings.pool_size, settings.acquire_timeout_secs).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
    }
}
