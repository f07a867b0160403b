use crate::config::StoreBackend;
use crate::error::{AppError, Result};
use crate::models::{ChainKey, LedgerAccount, LedgerEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::ops::RangeBounds;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{LedgerStore, LedgerUnitOfWork};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<Uuid, LedgerAccount>,
    entries: HashMap<Uuid, LedgerEntry>,
    /// Chain order of every account, so range queries never scan other accounts.
    chains: HashMap<Uuid, BTreeSet<ChainKey>>,
}

impl LedgerState {
    /// Inserts or replaces an entry, keeping the chain index in step.
    fn put_entry(&mut self, entry: LedgerEntry) -> Option<LedgerEntry> {
        let previous = self.take_entry(entry.id);
        self.chains
            .entry(entry.account_id)
            .or_default()
            .insert(entry.chain_key());
        self.entries.insert(entry.id, entry);
        previous
    }

    fn take_entry(&mut self, id: Uuid) -> Option<LedgerEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(chain) = self.chains.get_mut(&entry.account_id) {
            chain.remove(&entry.chain_key());
        }
        Some(entry)
    }

    fn collect<R>(&self, account_id: Uuid, range: R) -> Vec<LedgerEntry>
    where
        R: RangeBounds<ChainKey>,
    {
        self.chains
            .get(&account_id)
            .map(|chain| {
                chain
                    .range(range)
                    .filter_map(|key| self.entries.get(&key.id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn last_matching<R, F>(&self, account_id: Uuid, range: R, keep: F) -> Option<LedgerEntry>
    where
        R: RangeBounds<ChainKey>,
        F: Fn(&ChainKey) -> bool,
    {
        self.chains
            .get(&account_id)?
            .range(range)
            .rev()
            .find(|key| keep(key))
            .and_then(|key| self.entries.get(&key.id).cloned())
    }
}

/// Lowest chain key at `instant`.
fn first_key_at(instant: DateTime<Utc>) -> ChainKey {
    ChainKey::new(instant, Uuid::nil())
}

/// Highest chain key at `instant`.
fn last_key_at(instant: DateTime<Utc>) -> ChainKey {
    ChainKey::new(instant, Uuid::from_u128(u128::MAX))
}

/// Process-local store. A unit of work holds the store-wide writer lock for its
/// whole lifetime, so units of work are fully serialized.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerUnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(InMemoryUnitOfWork {
            guard,
            journal: Vec::new(),
        }))
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }
}

/// Prior value of a record touched by a unit of work.
enum Undo {
    Account(Uuid, Option<LedgerAccount>),
    Entry(Uuid, Option<LedgerEntry>),
}

/// Writes straight into the locked state and journals what it overwrote.
/// Rollback, or dropping without commit, replays the journal backwards.
pub struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<LedgerState>,
    journal: Vec<Undo>,
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Account(id, Some(account)) => {
                    self.guard.accounts.insert(id, account);
                }
                Undo::Account(id, None) => {
                    self.guard.accounts.remove(&id);
                }
                Undo::Entry(_, Some(entry)) => {
                    self.guard.put_entry(entry);
                }
                Undo::Entry(id, None) => {
                    self.guard.take_entry(id);
                }
            }
        }
    }
}

#[async_trait]
impl LedgerUnitOfWork for InMemoryUnitOfWork {
    async fn lock_account(&mut self, id: Uuid) -> Result<Option<LedgerAccount>> {
        // The store-wide guard already excludes every other unit of work.
        Ok(self.guard.accounts.get(&id).cloned())
    }

    async fn find_account(&mut self, id: Uuid) -> Result<Option<LedgerAccount>> {
        Ok(self.guard.accounts.get(&id).cloned())
    }

    async fn list_accounts(&mut self) -> Result<Vec<LedgerAccount>> {
        let mut accounts: Vec<LedgerAccount> = self.guard.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| (a.created_at, a.id));
        Ok(accounts)
    }

    async fn insert_account(&mut self, account: &LedgerAccount) -> Result<()> {
        if self.guard.accounts.contains_key(&account.id) {
            return Err(AppError::Internal(format!("Account '{}' already exists", account.id)));
        }
        self.guard.accounts.insert(account.id, account.clone());
        self.journal.push(Undo::Account(account.id, None));
        Ok(())
    }

    async fn update_account(&mut self, account: &LedgerAccount) -> Result<()> {
        match self.guard.accounts.get_mut(&account.id) {
            Some(existing) => {
                let previous = std::mem::replace(existing, account.clone());
                self.journal.push(Undo::Account(account.id, Some(previous)));
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Account '{}' not found", account.id))),
        }
    }

    async fn find_entry(&mut self, id: Uuid) -> Result<Option<LedgerEntry>> {
        Ok(self.guard.entries.get(&id).cloned())
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        if self.guard.entries.contains_key(&entry.id) {
            return Err(AppError::Internal(format!("Entry '{}' already exists", entry.id)));
        }
        self.guard.put_entry(entry.clone());
        self.journal.push(Undo::Entry(entry.id, None));
        Ok(())
    }

    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        if !self.guard.entries.contains_key(&entry.id) {
            return Err(AppError::NotFound(format!("Ledger entry '{}' not found", entry.id)));
        }
        let previous = self.guard.put_entry(entry.clone());
        self.journal.push(Undo::Entry(entry.id, previous));
        Ok(())
    }

    async fn update_previous_balance(&mut self, id: Uuid, previous_balance: Decimal) -> Result<()> {
        match self.guard.entries.get_mut(&id) {
            Some(existing) => {
                let previous = existing.clone();
                existing.previous_balance = previous_balance;
                self.journal.push(Undo::Entry(id, Some(previous)));
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Ledger entry '{}' not found", id))),
        }
    }

    async fn delete_entry(&mut self, id: Uuid) -> Result<bool> {
        match self.guard.take_entry(id) {
            Some(previous) => {
                self.journal.push(Undo::Entry(id, Some(previous)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn entries_for_account(&mut self, account_id: Uuid) -> Result<Vec<LedgerEntry>> {
        Ok(self.guard.collect(account_id, ..))
    }

    async fn entries_since(
        &mut self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        Ok(self.guard.collect(account_id, first_key_at(since)..))
    }

    async fn entries_between(
        &mut self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .guard
            .collect(account_id, first_key_at(from)..first_key_at(to)))
    }

    async fn last_entry_at_or_before(
        &mut self,
        account_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>> {
        Ok(self
            .guard
            .last_matching(account_id, ..=last_key_at(instant), |_| true))
    }

    async fn last_entry_before(
        &mut self,
        account_id: Uuid,
        key: ChainKey,
        exclude: Option<Uuid>,
    ) -> Result<Option<LedgerEntry>> {
        Ok(self
            .guard
            .last_matching(account_id, ..key, |k| Some(k.id) != exclude))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        this.journal.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}
