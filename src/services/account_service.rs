use crate::error::{AppError, Result};
use crate::models::{LedgerAccount, LedgerEntry};
use crate::observability::{get_metrics, mask_amount, LatencyTimer, MutationKind};
use crate::repositories::{LedgerStore, LedgerUnitOfWork};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::balance_chain_service::{BalanceChainService, ChainReport, ReprocessSummary};
use super::entry_rules::{check_amount_bounds, EntryRuleCode};
use super::validation::RuleViolation;

/// Request to open a new account.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OpenAccountRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub initial_balance: Decimal,
    /// Instant at which the account's history begins.
    pub created_at: DateTime<Utc>,
}

impl OpenAccountRequest {
    pub fn new(name: impl Into<String>, initial_balance: Decimal, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            initial_balance,
            created_at,
        }
    }
}

/// One line of an account statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementLine {
    pub entry: LedgerEntry,
    pub resulting_balance: Decimal,
}

/// Service for account lifecycle and read-side queries over the balance chain.
pub struct AccountService {
    store: Arc<dyn LedgerStore>,
    chain: BalanceChainService,
}

impl AccountService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            chain: BalanceChainService::new(),
        }
    }

    /// Opens a new active account.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn open_account(&self, request: OpenAccountRequest) -> Result<LedgerAccount> {
        if let Err(errors) = request.validate() {
            return Err(AppError::ValidationFailed(RuleViolation::new(
                EntryRuleCode::InvalidField,
                errors.to_string(),
            )));
        }
        if let Some(violation) = check_amount_bounds(request.initial_balance, "Initial balance") {
            return Err(AppError::ValidationFailed(violation));
        }

        let account = LedgerAccount::new(request.name, request.initial_balance, request.created_at);

        let mut uow = self.store.begin().await?;
        uow.insert_account(&account).await?;
        uow.commit().await?;

        info!(
            account_id = %account.id,
            initial_balance = %mask_amount(&account.initial_balance),
            "Account opened"
        );
        Ok(account)
    }

    pub async fn get_account(&self, id: Uuid) -> Result<LedgerAccount> {
        let mut uow = self.store.begin().await?;
        let account = find(uow.as_mut(), id).await;
        uow.rollback().await?;
        account
    }

    pub async fn list_accounts(&self) -> Result<Vec<LedgerAccount>> {
        let mut uow = self.store.begin().await?;
        let accounts = uow.list_accounts().await;
        uow.rollback().await?;
        accounts
    }

    /// Stops the account from accepting new entries. Its history is untouched.
    #[instrument(skip(self))]
    pub async fn deactivate_account(&self, id: Uuid) -> Result<LedgerAccount> {
        let mut uow = self.store.begin().await?;
        let mut account = lock(uow.as_mut(), id).await?;
        if !account.is_active {
            uow.rollback().await?;
            return Ok(account);
        }

        account.deactivate();
        uow.update_account(&account).await?;
        uow.commit().await?;

        info!(account_id = %id, "Account deactivated");
        Ok(account)
    }

    /// Replaces the initial balance and re-seeds the whole chain.
    #[instrument(skip(self, new_initial_balance), fields(account_id = %id))]
    pub async fn reseed_initial_balance(
        &self,
        id: Uuid,
        new_initial_balance: Decimal,
    ) -> Result<ReprocessSummary> {
        let timer = LatencyTimer::new();
        let result = self.reseed(id, new_initial_balance).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        get_metrics().record_mutation(MutationKind::Reseed, outcome, timer.elapsed_ms());
        result
    }

    async fn reseed(&self, id: Uuid, new_initial_balance: Decimal) -> Result<ReprocessSummary> {
        if let Some(violation) = check_amount_bounds(new_initial_balance, "Initial balance") {
            return Err(AppError::ValidationFailed(violation));
        }

        let mut uow = self.store.begin().await?;
        let mut account = lock(uow.as_mut(), id).await?;
        let summary = self
            .chain
            .reseed_account(uow.as_mut(), &mut account, new_initial_balance)
            .await?;
        uow.commit().await?;

        info!(
            account_id = %id,
            initial_balance = %mask_amount(&new_initial_balance),
            rewritten = summary.rewritten,
            "Account reseeded"
        );
        Ok(summary)
    }

    /// Balance right after everything recorded at or before `instant`.
    pub async fn balance_at(&self, account_id: Uuid, instant: DateTime<Utc>) -> Result<Decimal> {
        let mut uow = self.store.begin().await?;
        let balance = self.chain.balance_at(uow.as_mut(), account_id, instant).await;
        uow.rollback().await?;
        balance
    }

    /// Chain-ordered entries of an account with their resulting balances.
    pub async fn statement(&self, account_id: Uuid) -> Result<Vec<StatementLine>> {
        let mut uow = self.store.begin().await?;
        find(uow.as_mut(), account_id).await?;
        let entries = self.chain.chain(uow.as_mut(), account_id).await?;
        uow.rollback().await?;

        entries
            .into_iter()
            .map(|entry| {
                Ok(StatementLine {
                    resulting_balance: entry.resulting_balance()?,
                    entry,
                })
            })
            .collect()
    }

    pub async fn verify_chain(&self, account_id: Uuid) -> Result<ChainReport> {
        let mut uow = self.store.begin().await?;
        let account = find(uow.as_mut(), account_id).await?;
        let report = self.chain.verify_chain(uow.as_mut(), &account).await?;
        uow.rollback().await?;

        report_broken(&report);
        Ok(report)
    }

    /// Verifies every account against one consistent snapshot.
    #[instrument(skip(self))]
    pub async fn verify_all(&self) -> Result<Vec<ChainReport>> {
        let mut uow = self.store.begin().await?;
        let accounts = uow.list_accounts().await?;

        let mut reports = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let report = self.chain.verify_chain(uow.as_mut(), account).await?;
            report_broken(&report);
            reports.push(report);
        }
        uow.rollback().await?;

        info!(
            accounts = reports.len(),
            inconsistent = reports.iter().filter(|r| !r.is_consistent()).count(),
            "Chain verification finished"
        );
        Ok(reports)
    }

    /// Recomputes the full chain from the stored initial balance.
    #[instrument(skip(self))]
    pub async fn repair_chain(&self, account_id: Uuid) -> Result<ReprocessSummary> {
        let mut uow = self.store.begin().await?;
        let account = lock(uow.as_mut(), account_id).await?;
        let entries = uow.entries_for_account(account_id).await?;
        let summary = self
            .chain
            .reprocess_chain(uow.as_mut(), entries, account.initial_balance)
            .await?;
        uow.commit().await?;

        info!(account_id = %account_id, rewritten = summary.rewritten, "Chain repaired");
        Ok(summary)
    }
}

async fn find(uow: &mut dyn LedgerUnitOfWork, id: Uuid) -> Result<LedgerAccount> {
    uow.find_account(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Account '{}' not found", id)))
}

async fn lock(uow: &mut dyn LedgerUnitOfWork, id: Uuid) -> Result<LedgerAccount> {
    uow.lock_account(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Account '{}' not found", id)))
}

fn report_broken(report: &ChainReport) {
    if report.is_consistent() {
        return;
    }
    get_metrics().record_broken_links(report.broken_links.len());
    warn!(
        account_id = %report.account_id,
        broken_links = report.broken_links.len(),
        "Balance chain is inconsistent"
    );
}
