use crate::error::{AppError, Result};
use crate::models::{sort_chain, ChainKey, LedgerAccount, LedgerEntry};
use crate::observability::get_metrics;
use crate::repositories::LedgerUnitOfWork;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Counts from one reprocessing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessSummary {
    /// Entries visited by the fold.
    pub walked: usize,
    /// Entries whose cached balance actually changed and was written back.
    pub rewritten: usize,
}

impl ReprocessSummary {
    pub fn merge(self, other: ReprocessSummary) -> Self {
        Self {
            walked: self.walked + other.walked,
            rewritten: self.rewritten + other.rewritten,
        }
    }
}

/// An entry whose cached previous balance disagrees with the recomputed chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokenLink {
    pub entry_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub cached: Decimal,
    pub expected: Decimal,
}

/// Result of verifying one account's chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport {
    pub account_id: Uuid,
    pub entry_count: usize,
    pub closing_balance: Decimal,
    pub broken_links: Vec<BrokenLink>,
}

impl ChainReport {
    pub fn is_consistent(&self) -> bool {
        self.broken_links.is_empty()
    }
}

/// Recomputes cached balances along an account's chain.
///
/// Never opens or commits a unit of work: every method runs inside the one the
/// caller supplies, so an insert and the reprocessing it triggers commit together.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceChainService;

impl BalanceChainService {
    pub fn new() -> Self {
        Self
    }

    /// Folds `seed` through `entries` (already in chain order), setting each
    /// entry's previous balance. Returns the indices whose cached value changed.
    ///
    /// Fails without touching later entries if the running balance overflows.
    pub fn fold(entries: &mut [LedgerEntry], seed: Decimal) -> Result<Vec<usize>> {
        let mut running = seed;
        let mut changed = Vec::new();
        for (idx, entry) in entries.iter_mut().enumerate() {
            if entry.previous_balance != running {
                entry.previous_balance = running;
                changed.push(idx);
            }
            running = entry.resulting_balance()?;
        }
        Ok(changed)
    }

    /// Balance of an account right after everything recorded at or before `instant`.
    ///
    /// Instants before the account's creation report zero, not the initial balance.
    pub async fn balance_at(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Decimal> {
        let account = uow
            .find_account(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account '{}' not found", account_id)))?;

        if account.predates(instant) {
            return Ok(Decimal::ZERO);
        }

        match uow.last_entry_at_or_before(account_id, instant).await? {
            Some(entry) => entry.resulting_balance(),
            None => Ok(account.initial_balance),
        }
    }

    /// Balance immediately before chain position `key`, ignoring `exclude`.
    ///
    /// This is the exact seed for an entry placed at `key`: the predecessor's
    /// resulting balance, or the account's initial balance for the first entry.
    pub async fn balance_before(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account: &LedgerAccount,
        key: ChainKey,
        exclude: Option<Uuid>,
    ) -> Result<Decimal> {
        match uow.last_entry_before(account.id, key, exclude).await? {
            Some(entry) => entry.resulting_balance(),
            None => Ok(account.initial_balance),
        }
    }

    /// Re-sorts `entries`, folds `seed` through them and writes back every
    /// entry whose cached balance changed.
    pub async fn reprocess_chain(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        mut entries: Vec<LedgerEntry>,
        seed: Decimal,
    ) -> Result<ReprocessSummary> {
        sort_chain(&mut entries);
        let changed = Self::fold(&mut entries, seed)?;

        for idx in &changed {
            let entry = &entries[*idx];
            uow.update_previous_balance(entry.id, entry.previous_balance).await?;
        }

        get_metrics().record_entries_reprocessed(changed.len());
        Ok(ReprocessSummary {
            walked: entries.len(),
            rewritten: changed.len(),
        })
    }

    /// Reprocesses everything chain-ordered strictly after `starting`, seeded
    /// with its resulting balance.
    pub async fn reprocess_from(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        starting: &LedgerEntry,
    ) -> Result<ReprocessSummary> {
        self.reprocess_suffix(
            uow,
            starting.account_id,
            starting.chain_key(),
            false,
            starting.resulting_balance()?,
        )
        .await
    }

    /// Reprocesses entries strictly after chain position `key`, seeded with `seed`.
    /// Used when the entry at `key` has been removed from the account.
    pub async fn reprocess_after(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account_id: Uuid,
        key: ChainKey,
        seed: Decimal,
    ) -> Result<ReprocessSummary> {
        self.reprocess_suffix(uow, account_id, key, false, seed).await
    }

    /// Reprocesses entries at or after chain position `start`, seeded with `seed`.
    pub async fn reprocess_range(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account_id: Uuid,
        start: ChainKey,
        seed: Decimal,
    ) -> Result<ReprocessSummary> {
        self.reprocess_suffix(uow, account_id, start, true, seed).await
    }

    async fn reprocess_suffix(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account_id: Uuid,
        start: ChainKey,
        inclusive: bool,
        seed: Decimal,
    ) -> Result<ReprocessSummary> {
        let suffix: Vec<LedgerEntry> = uow
            .entries_since(account_id, start.occurred_at)
            .await?
            .into_iter()
            .filter(|e| {
                let key = e.chain_key();
                key > start || (inclusive && key == start)
            })
            .collect();

        let summary = self.reprocess_chain(uow, suffix, seed).await?;
        debug!(
            account_id = %account_id,
            walked = summary.walked,
            rewritten = summary.rewritten,
            "Reprocessed chain suffix"
        );
        Ok(summary)
    }

    /// Replaces the account's initial balance and reprocesses its whole history.
    pub async fn reseed_account(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account: &mut LedgerAccount,
        new_initial_balance: Decimal,
    ) -> Result<ReprocessSummary> {
        account.reseed(new_initial_balance);
        uow.update_account(account).await?;

        let entries = uow.entries_for_account(account.id).await?;
        self.reprocess_chain(uow, entries, new_initial_balance).await
    }

    /// Entries of an account in chain order.
    pub async fn chain(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account_id: Uuid,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = uow.entries_for_account(account_id).await?;
        sort_chain(&mut entries);
        Ok(entries)
    }

    /// Walks the stored chain and reports every entry whose cached balance differs
    /// from the one recomputed from the account's initial balance.
    pub async fn verify_chain(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        account: &LedgerAccount,
    ) -> Result<ChainReport> {
        let entries = self.chain(uow, account.id).await?;

        let mut expected = account.initial_balance;
        let mut broken_links = Vec::new();
        for entry in &entries {
            if entry.previous_balance != expected {
                broken_links.push(BrokenLink {
                    entry_id: entry.id,
                    occurred_at: entry.occurred_at,
                    cached: entry.previous_balance,
                    expected,
                });
            }
            // Recompute from the seed so the report matches what a repair rewrites.
            expected = expected
                .checked_add(entry.effective_value())
                .ok_or(AppError::BalanceOverflow(entry.id))?;
        }

        Ok(ChainReport {
            account_id: account.id,
            entry_count: entries.len(),
            closing_balance: expected,
            broken_links,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryDirection, EntryInput};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap()
    }

    fn entry(day: u32, direction: EntryDirection, amount: Decimal, previous: Decimal) -> LedgerEntry {
        LedgerEntry::from_input(
            EntryInput::new(Uuid::new_v4(), at(day), amount, direction, "test"),
            previous,
        )
    }

    #[test]
    fn test_fold_sets_running_balances() {
        let mut entries = vec![
            entry(2, EntryDirection::Debit, dec!(300), dec!(0)),
            entry(3, EntryDirection::Credit, dec!(500), dec!(0)),
            entry(4, EntryDirection::Debit, dec!(50.25), dec!(0)),
        ];

        let changed = BalanceChainService::fold(&mut entries, dec!(1000)).unwrap();

        assert_eq!(changed, vec![0, 1, 2]);
        assert_eq!(entries[0].previous_balance, dec!(1000));
        assert_eq!(entries[0].resulting_balance().unwrap(), dec!(700));
        assert_eq!(entries[1].previous_balance, dec!(700));
        assert_eq!(entries[1].resulting_balance().unwrap(), dec!(1200));
        assert_eq!(entries[2].previous_balance, dec!(1200));
        assert_eq!(entries[2].resulting_balance().unwrap(), dec!(1149.75));
    }

    #[test]
    fn test_fold_reports_only_changed_links() {
        let mut entries = vec![
            entry(2, EntryDirection::Credit, dec!(10), dec!(100)),
            entry(3, EntryDirection::Credit, dec!(10), dec!(110)),
            entry(4, EntryDirection::Credit, dec!(10), dec!(999)),
        ];

        let changed = BalanceChainService::fold(&mut entries, dec!(100)).unwrap();
        assert_eq!(changed, vec![2]);
        assert_eq!(entries[2].previous_balance, dec!(120));
    }

    #[test]
    fn test_fold_empty() {
        let mut entries: Vec<LedgerEntry> = Vec::new();
        assert!(BalanceChainService::fold(&mut entries, dec!(5)).unwrap().is_empty());
    }

    #[test]
    fn test_fold_overflow_is_an_error() {
        let half = Decimal::MAX / dec!(2) + dec!(1);
        let mut entries = vec![
            entry(2, EntryDirection::Credit, half, dec!(0)),
            entry(3, EntryDirection::Credit, half, dec!(0)),
        ];
        let second = entries[1].id;

        let err = BalanceChainService::fold(&mut entries, dec!(0)).unwrap_err();
        assert!(matches!(err, AppError::BalanceOverflow(id) if id == second));
    }

    #[test]
    fn test_summary_merge() {
        let a = ReprocessSummary { walked: 3, rewritten: 1 };
        let b = ReprocessSummary { walked: 2, rewritten: 2 };
        assert_eq!(a.merge(b), ReprocessSummary { walked: 5, rewritten: 3 });
    }
}
