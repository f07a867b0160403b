use crate::config::StoreBackend;
use crate::error::{AppError, Result};
use crate::models::{ChainKey, LedgerAccount, LedgerEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{LedgerStore, LedgerUnitOfWork};

const ACCOUNT_COLUMNS: &str = "id, name, initial_balance, is_active, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, account_id, occurred_at, amount, direction, previous_balance, description, metadata, created_at, updated_at";

/// Postgres-backed store. Units of work are database transactions and account
/// locks are `SELECT ... FOR UPDATE` row locks.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `url`.
    pub async fn connect(url: &str, pool_size: u32, acquire_timeout_secs: u64) -> Result<Self> {
        info!(pool_size, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
            .connect(url)
            .await
            .map_err(AppError::Database)?;
        info!("PostgreSQL connection pool established");
        Ok(Self::new(pool))
    }

    /// Applies pending schema migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Migrations applied successfully");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerUnitOfWork>> {
        let mut tx = self.pool.begin().await?;

        // Row locks on the account serialize writers; each statement then sees
        // the latest committed chain.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Postgres
    }
}

/// A single database transaction.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerUnitOfWork for PostgresUnitOfWork {
    async fn lock_account(&mut self, id: Uuid) -> Result<Option<LedgerAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, LedgerAccount>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn find_account(&mut self, id: Uuid) -> Result<Option<LedgerAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE id = $1");
        let row = sqlx::query_as::<_, LedgerAccount>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn list_accounts(&mut self) -> Result<Vec<LedgerAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts ORDER BY created_at, id");
        let rows = sqlx::query_as::<_, LedgerAccount>(&sql)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn insert_account(&mut self, account: &LedgerAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (id, name, initial_balance, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(account.initial_balance)
        .bind(account.is_active)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_account(&mut self, account: &LedgerAccount) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET name = $2, initial_balance = $3, is_active = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(account.initial_balance)
        .bind(account.is_active)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Account '{}' not found", account.id)));
        }
        Ok(())
    }

    async fn find_entry(&mut self, id: Uuid) -> Result<Option<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = $1");
        let row = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, account_id, occurred_at, amount, direction, previous_balance, description, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id)
        .bind(entry.occurred_at)
        .bind(entry.amount)
        .bind(entry.direction)
        .bind(entry.previous_balance)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET account_id = $2, occurred_at = $3, amount = $4, direction = $5,
                previous_balance = $6, description = $7, metadata = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id)
        .bind(entry.occurred_at)
        .bind(entry.amount)
        .bind(entry.direction)
        .bind(entry.previous_balance)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Ledger entry '{}' not found", entry.id)));
        }
        Ok(())
    }

    async fn update_previous_balance(&mut self, id: Uuid, previous_balance: Decimal) -> Result<()> {
        let result = sqlx::query("UPDATE ledger_entries SET previous_balance = $2 WHERE id = $1")
            .bind(id)
            .bind(previous_balance)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Ledger entry '{}' not found", id)));
        }
        Ok(())
    }

    async fn delete_entry(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ledger_entries WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn entries_for_account(&mut self, account_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 ORDER BY occurred_at, id"
        );
        let rows = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn entries_since(
        &mut self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 AND occurred_at >= $2 ORDER BY occurred_at, id"
        );
        let rows = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(since)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn entries_between(
        &mut self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 AND occurred_at >= $2 AND occurred_at < $3 ORDER BY occurred_at, id"
        );
        let rows = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(from)
            .bind(to)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn last_entry_at_or_before(
        &mut self,
        account_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 AND occurred_at <= $2 ORDER BY occurred_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(instant)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn last_entry_before(
        &mut self,
        account_id: Uuid,
        key: ChainKey,
        exclude: Option<Uuid>,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE account_id = $1
              AND (occurred_at, id) < ($2, $3)
              AND ($4::uuid IS NULL OR id <> $4)
            ORDER BY occurred_at DESC, id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(key.occurred_at)
            .bind(key.id)
            .bind(exclude)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
