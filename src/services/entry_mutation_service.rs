use crate::config::LedgerSettings;
use crate::error::{AppError, Result};
use crate::models::{EntryInput, LedgerAccount, LedgerEntry};
use crate::observability::{get_metrics, mask_amount, LatencyTimer, MutationKind};
use crate::repositories::{LedgerStore, LedgerUnitOfWork};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::balance_chain_service::BalanceChainService;
use super::entry_rules::{default_entry_pipeline, EntryValidationPipeline};
use super::validation::{ValidationContext, ValidationResult};

/// Creates, edits, moves and deletes entries while keeping every affected
/// account's balance chain consistent.
///
/// The plain methods open a unit of work, retry on concurrency conflicts and
/// commit. The `_in` variants run inside a unit of work owned by the caller and
/// never commit, so several mutations can be composed atomically.
pub struct EntryMutationService {
    store: Arc<dyn LedgerStore>,
    pipeline: EntryValidationPipeline,
    chain: BalanceChainService,
    settings: LedgerSettings,
}

impl EntryMutationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        pipeline: EntryValidationPipeline,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            chain: BalanceChainService::new(),
            settings,
        }
    }

    /// Builds the service with the standard entry rules.
    pub fn with_default_rules(store: Arc<dyn LedgerStore>, settings: LedgerSettings) -> Self {
        let pipeline = default_entry_pipeline(&settings);
        Self::new(store, pipeline, settings)
    }

    pub fn pipeline_mut(&mut self) -> &mut EntryValidationPipeline {
        &mut self.pipeline
    }

    #[instrument(skip(self, input), fields(account_id = %input.account_id, amount = %mask_amount(&input.amount)))]
    pub async fn create_entry(&self, input: EntryInput) -> Result<LedgerEntry> {
        self.create_entry_cancellable(input, &CancellationToken::new()).await
    }

    pub async fn create_entry_cancellable(
        &self,
        input: EntryInput,
        cancel: &CancellationToken,
    ) -> Result<LedgerEntry> {
        let timer = LatencyTimer::new();
        let result = self
            .with_retry(MutationKind::Create, || {
                let input = input.clone();
                async move {
                    let mut uow = self.store.begin().await?;
                    let outcome = until_cancelled(cancel, self.create_entry_in(uow.as_mut(), input)).await;
                    finish(uow, outcome, cancel).await
                }
            })
            .await;
        record(MutationKind::Create, &result, &timer);

        if let Ok(entry) = &result {
            info!(entry_id = %entry.id, "Entry created");
        }
        result
    }

    /// Inserts a new entry at its chain position and re-seeds everything after it.
    pub async fn create_entry_in(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        input: EntryInput,
    ) -> Result<LedgerEntry> {
        lock_in_order(uow, vec![input.account_id]).await?;
        self.validate(uow, &input, None).await?;
        let account = require_account(uow, input.account_id).await?;

        let mut entry = LedgerEntry::from_input(input, account.initial_balance);
        entry.previous_balance = self
            .chain
            .balance_before(uow, &account, entry.chain_key(), None)
            .await?;
        uow.insert_entry(&entry).await?;

        let summary = self.chain.reprocess_from(uow, &entry).await?;
        debug!(
            entry_id = %entry.id,
            previous_balance = %mask_amount(&entry.previous_balance),
            rewritten = summary.rewritten,
            "Entry inserted into chain"
        );
        Ok(entry)
    }

    #[instrument(skip(self, input), fields(entry_id = %id, account_id = %input.account_id))]
    pub async fn update_entry(&self, id: Uuid, input: EntryInput) -> Result<LedgerEntry> {
        self.update_entry_cancellable(id, input, &CancellationToken::new()).await
    }

    pub async fn update_entry_cancellable(
        &self,
        id: Uuid,
        input: EntryInput,
        cancel: &CancellationToken,
    ) -> Result<LedgerEntry> {
        let timer = LatencyTimer::new();
        let result = self
            .with_retry(MutationKind::Update, || {
                let input = input.clone();
                async move {
                    let mut uow = self.store.begin().await?;
                    let outcome = until_cancelled(cancel, self.update_entry_in(uow.as_mut(), id, input)).await;
                    finish(uow, outcome, cancel).await
                }
            })
            .await;
        record(MutationKind::Update, &result, &timer);
        result
    }

    /// Applies `input` to an existing entry.
    ///
    /// Edits that leave timestamp, amount, direction and account untouched are
    /// written as-is. Anything else re-seeds the smallest affected range of the
    /// current account, plus the tail of the old account when the entry moves.
    pub async fn update_entry_in(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        id: Uuid,
        input: EntryInput,
    ) -> Result<LedgerEntry> {
        let seen = require_entry(uow, id).await?;
        lock_in_order(uow, vec![seen.account_id, input.account_id]).await?;

        let mut entry = require_entry(uow, id).await?;
        if entry.account_id != seen.account_id {
            return Err(AppError::ConcurrencyConflict(format!(
                "Entry '{}' moved to another account while being updated",
                id
            )));
        }

        self.validate(uow, &input, Some(id)).await?;

        if !entry.touches_chain(&input) {
            entry.apply(input);
            uow.update_entry(&entry).await?;
            debug!(entry_id = %id, "Updated non-chain fields only");
            return Ok(entry);
        }

        let old_account_id = entry.account_id;
        let old_key = entry.chain_key();
        let old_previous = entry.previous_balance;

        entry.apply(input);
        let new_key = entry.chain_key();
        let account = require_account(uow, entry.account_id).await?;

        let summary = if entry.account_id == old_account_id {
            // The range starts at whichever position comes first. Moving later,
            // the entry's old predecessor still seeds it.
            let (start, seed) = if new_key >= old_key {
                (old_key, old_previous)
            } else {
                let seed = self.chain.balance_before(uow, &account, new_key, Some(id)).await?;
                (new_key, seed)
            };
            uow.update_entry(&entry).await?;
            self.chain.reprocess_range(uow, account.id, start, seed).await?
        } else {
            entry.previous_balance = self.chain.balance_before(uow, &account, new_key, Some(id)).await?;
            uow.update_entry(&entry).await?;

            let moved_in = self.chain.reprocess_from(uow, &entry).await?;
            let moved_out = self
                .chain
                .reprocess_after(uow, old_account_id, old_key, old_previous)
                .await?;
            info!(
                entry_id = %id,
                from_account = %old_account_id,
                to_account = %account.id,
                "Entry moved between accounts"
            );
            moved_in.merge(moved_out)
        };

        debug!(entry_id = %id, walked = summary.walked, rewritten = summary.rewritten, "Chain updated");
        require_entry(uow, id).await
    }

    #[instrument(skip(self), fields(entry_id = %id))]
    pub async fn delete_entry(&self, id: Uuid) -> Result<LedgerEntry> {
        self.delete_entry_cancellable(id, &CancellationToken::new()).await
    }

    pub async fn delete_entry_cancellable(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<LedgerEntry> {
        let timer = LatencyTimer::new();
        let result = self
            .with_retry(MutationKind::Delete, || async move {
                let mut uow = self.store.begin().await?;
                let outcome = until_cancelled(cancel, self.delete_entry_in(uow.as_mut(), id)).await;
                finish(uow, outcome, cancel).await
            })
            .await;
        record(MutationKind::Delete, &result, &timer);
        result
    }

    /// Removes an entry and re-seeds its former successors as if it never existed.
    /// Returns the removed entry.
    pub async fn delete_entry_in(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        id: Uuid,
    ) -> Result<LedgerEntry> {
        let seen = require_entry(uow, id).await?;
        lock_in_order(uow, vec![seen.account_id]).await?;

        let entry = require_entry(uow, id).await?;
        if entry.account_id != seen.account_id {
            return Err(AppError::ConcurrencyConflict(format!(
                "Entry '{}' moved to another account while being deleted",
                id
            )));
        }

        if !uow.delete_entry(id).await? {
            return Err(AppError::NotFound(format!("Entry '{}' not found", id)));
        }

        let summary = self
            .chain
            .reprocess_after(uow, entry.account_id, entry.chain_key(), entry.previous_balance)
            .await?;
        debug!(entry_id = %id, rewritten = summary.rewritten, "Entry removed from chain");
        Ok(entry)
    }

    /// Creates every entry in one unit of work. Either all of them are stored
    /// or none are.
    #[instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn import_entries(&self, inputs: Vec<EntryInput>) -> Result<Vec<LedgerEntry>> {
        self.import_entries_cancellable(inputs, &CancellationToken::new()).await
    }

    pub async fn import_entries_cancellable(
        &self,
        inputs: Vec<EntryInput>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LedgerEntry>> {
        let timer = LatencyTimer::new();
        let result = self
            .with_retry(MutationKind::Import, || {
                let inputs = inputs.clone();
                async move {
                    let mut uow = self.store.begin().await?;
                    let outcome = until_cancelled(cancel, self.import_entries_in(uow.as_mut(), inputs)).await;
                    finish(uow, outcome, cancel).await
                }
            })
            .await;
        record(MutationKind::Import, &result, &timer);

        if let Ok(entries) = &result {
            info!(imported = entries.len(), "Entries imported");
        }
        result
    }

    pub async fn import_entries_in(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        inputs: Vec<EntryInput>,
    ) -> Result<Vec<LedgerEntry>> {
        // Take every lock up front so the import never waits while holding a subset.
        lock_in_order(uow, inputs.iter().map(|i| i.account_id).collect()).await?;

        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            created.push(self.create_entry_in(uow, input).await?);
        }
        Ok(created)
    }

    async fn validate(
        &self,
        uow: &mut dyn LedgerUnitOfWork,
        input: &EntryInput,
        editing_id: Option<Uuid>,
    ) -> Result<()> {
        let mut ctx = ValidationContext::new(uow, editing_id);
        if let ValidationResult::Invalid(violation) = self.pipeline.validate(input, &mut ctx).await? {
            get_metrics().record_validation_rejected(violation.code.as_str());
            info!(code = violation.code.as_str(), message = %violation.message, "Entry rejected by validation");
            return Err(AppError::ValidationFailed(violation));
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, kind: MutationKind, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(err) if err.is_retryable() && retries < self.settings.max_conflict_retries => {
                    retries += 1;
                    get_metrics().record_conflict_retry(kind);
                    warn!(kind = kind.as_str(), retry = retries, error = %err, "Retrying mutation after conflict");
                }
                other => return other,
            }
        }
    }
}

/// Locks accounts in ascending id order so two mutations never wait on each other in a cycle.
async fn lock_in_order(uow: &mut dyn LedgerUnitOfWork, mut account_ids: Vec<Uuid>) -> Result<()> {
    account_ids.sort();
    account_ids.dedup();
    for id in account_ids {
        uow.lock_account(id).await?;
    }
    Ok(())
}

async fn require_account(uow: &mut dyn LedgerUnitOfWork, id: Uuid) -> Result<LedgerAccount> {
    uow.find_account(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Account '{}' not found", id)))
}

async fn require_entry(uow: &mut dyn LedgerUnitOfWork, id: Uuid) -> Result<LedgerEntry> {
    uow.find_entry(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Entry '{}' not found", id)))
}

/// Drives `work` unless `cancel` fires first. `None` means it was cancelled.
async fn until_cancelled<T, F>(cancel: &CancellationToken, work: F) -> Option<Result<T>>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = work => Some(result),
    }
}

/// Commits a successful, uncancelled unit of work and rolls back anything else.
async fn finish<T>(
    uow: Box<dyn LedgerUnitOfWork>,
    outcome: Option<Result<T>>,
    cancel: &CancellationToken,
) -> Result<T> {
    let result = match outcome {
        Some(result) if !cancel.is_cancelled() => result,
        _ => Err(AppError::Cancelled),
    };

    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

fn record<T>(kind: MutationKind, result: &Result<T>, timer: &LatencyTimer) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    get_metrics().record_mutation(kind, outcome, timer.elapsed_ms());
}
