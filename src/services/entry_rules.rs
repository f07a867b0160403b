use crate::config::LedgerSettings;
use crate::error::{AppError, Result};
use crate::models::{EntryInput, AMOUNT_LIMIT, MAX_AMOUNT_SCALE};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

use super::validation::{RuleOutcome, RuleViolation, ValidationContext, ValidationPipeline, ValidationRule};

/// Failure codes of the entry rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryRuleCode {
    InvalidField,
    AmountNotPositive,
    AmountOutOfRange,
    AmountTooPrecise,
    AccountNotFound,
    AccountInactive,
    DuplicateEntry,
}

impl EntryRuleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryRuleCode::InvalidField => "INVALID_FIELD",
            EntryRuleCode::AmountNotPositive => "AMOUNT_NOT_POSITIVE",
            EntryRuleCode::AmountOutOfRange => "AMOUNT_OUT_OF_RANGE",
            EntryRuleCode::AmountTooPrecise => "AMOUNT_TOO_PRECISE",
            EntryRuleCode::AccountNotFound => "ACCOUNT_NOT_FOUND",
            EntryRuleCode::AccountInactive => "ACCOUNT_INACTIVE",
            EntryRuleCode::DuplicateEntry => "DUPLICATE_ENTRY",
        }
    }
}

pub type EntryValidationPipeline = ValidationPipeline<EntryInput, EntryRuleCode>;

/// The standard rule set, in the order it runs.
pub fn default_entry_pipeline(settings: &LedgerSettings) -> EntryValidationPipeline {
    ValidationPipeline::new()
        .with_rule(FieldRule)
        .with_rule(PositiveAmountRule)
        .with_rule(AmountBoundsRule)
        .with_rule(ActiveAccountRule)
        .with_rule(DuplicateEntryRule::new(settings.duplicate_window_secs))
}

/// Field-level constraints declared on [`EntryInput`].
pub struct FieldRule;

#[async_trait]
impl ValidationRule<EntryInput, EntryRuleCode> for FieldRule {
    fn name(&self) -> &'static str {
        "fields"
    }

    async fn check(
        &self,
        input: &EntryInput,
        _ctx: &mut ValidationContext<'_>,
    ) -> Result<RuleOutcome<EntryRuleCode>> {
        match input.validate() {
            Ok(()) => Ok(RuleOutcome::Pass),
            Err(errors) => Ok(RuleOutcome::Reject(RuleViolation::new(
                EntryRuleCode::InvalidField,
                errors.to_string(),
            ))),
        }
    }
}

pub struct PositiveAmountRule;

#[async_trait]
impl ValidationRule<EntryInput, EntryRuleCode> for PositiveAmountRule {
    fn name(&self) -> &'static str {
        "positive_amount"
    }

    async fn check(
        &self,
        input: &EntryInput,
        _ctx: &mut ValidationContext<'_>,
    ) -> Result<RuleOutcome<EntryRuleCode>> {
        if input.amount <= Decimal::ZERO {
            return Ok(RuleOutcome::Reject(RuleViolation::new(
                EntryRuleCode::AmountNotPositive,
                format!("Amount must be positive, got {}", input.amount),
            )));
        }
        Ok(RuleOutcome::Pass)
    }
}

/// Checks that `value` fits a `NUMERIC(20,4)` column exactly: magnitude below
/// [`AMOUNT_LIMIT`] and at most [`MAX_AMOUNT_SCALE`] fractional digits.
pub fn check_amount_bounds(value: Decimal, field: &str) -> Option<RuleViolation<EntryRuleCode>> {
    if value.abs() >= AMOUNT_LIMIT {
        return Some(RuleViolation::new(
            EntryRuleCode::AmountOutOfRange,
            format!("{field} must be below {AMOUNT_LIMIT} in magnitude"),
        ));
    }
    // Trailing zeros are not precision.
    if value.normalize().scale() > MAX_AMOUNT_SCALE {
        return Some(RuleViolation::new(
            EntryRuleCode::AmountTooPrecise,
            format!("{field} {value} has more than {MAX_AMOUNT_SCALE} decimal places"),
        ));
    }
    None
}

pub struct AmountBoundsRule;

#[async_trait]
impl ValidationRule<EntryInput, EntryRuleCode> for AmountBoundsRule {
    fn name(&self) -> &'static str {
        "amount_bounds"
    }

    async fn check(
        &self,
        input: &EntryInput,
        _ctx: &mut ValidationContext<'_>,
    ) -> Result<RuleOutcome<EntryRuleCode>> {
        Ok(match check_amount_bounds(input.amount, "Amount") {
            Some(violation) => RuleOutcome::Reject(violation),
            None => RuleOutcome::Pass,
        })
    }
}

/// The target account must exist and accept new entries.
pub struct ActiveAccountRule;

#[async_trait]
impl ValidationRule<EntryInput, EntryRuleCode> for ActiveAccountRule {
    fn name(&self) -> &'static str {
        "active_account"
    }

    async fn check(
        &self,
        input: &EntryInput,
        ctx: &mut ValidationContext<'_>,
    ) -> Result<RuleOutcome<EntryRuleCode>> {
        let outcome = match ctx.uow.find_account(input.account_id).await? {
            None => RuleOutcome::Reject(
                RuleViolation::new(
                    EntryRuleCode::AccountNotFound,
                    format!("Account '{}' not found", input.account_id),
                )
                .with_offending_ids(vec![input.account_id]),
            ),
            Some(account) if !account.is_active => RuleOutcome::Reject(
                RuleViolation::new(
                    EntryRuleCode::AccountInactive,
                    format!("Account '{}' is inactive", account.name),
                )
                .with_offending_ids(vec![account.id]),
            ),
            Some(_) => RuleOutcome::Pass,
        };
        Ok(outcome)
    }
}

/// Rejects an entry that repeats another one in the same account within the
/// same time bucket: same amount, direction and description.
pub struct DuplicateEntryRule {
    window_secs: i64,
}

impl DuplicateEntryRule {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs: window_secs.max(1),
        }
    }

    /// Start and end of the bucket containing `instant`.
    fn bucket(&self, instant: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let secs = instant.timestamp();
        let start = secs - secs.rem_euclid(self.window_secs);
        let from = DateTime::<Utc>::from_timestamp(start, 0)
            .ok_or_else(|| AppError::Internal(format!("Timestamp {start} out of range")))?;
        Ok((from, from + Duration::seconds(self.window_secs)))
    }
}

#[async_trait]
impl ValidationRule<EntryInput, EntryRuleCode> for DuplicateEntryRule {
    fn name(&self) -> &'static str {
        "duplicate_entry"
    }

    async fn check(
        &self,
        input: &EntryInput,
        ctx: &mut ValidationContext<'_>,
    ) -> Result<RuleOutcome<EntryRuleCode>> {
        let (from, to) = self.bucket(input.occurred_at)?;
        let editing_id = ctx.editing_id;
        let duplicates: Vec<Uuid> = ctx
            .uow
            .entries_between(input.account_id, from, to)
            .await?
            .into_iter()
            .filter(|e| Some(e.id) != editing_id)
            .filter(|e| {
                e.amount == input.amount
                    && e.direction == input.direction
                    && e.description == input.description
            })
            .map(|e| e.id)
            .collect();

        if duplicates.is_empty() {
            return Ok(RuleOutcome::Pass);
        }
        Ok(RuleOutcome::Reject(
            RuleViolation::new(
                EntryRuleCode::DuplicateEntry,
                format!("An identical entry already exists within the same {}s window", self.window_secs),
            )
            .with_offending_ids(duplicates),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LedgerAccount, LedgerEntry};
    use crate::repositories::{InMemoryLedgerStore, LedgerStore};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 2, h, m, s).unwrap()
    }

    #[test]
    fn test_bucket_aligns_to_window() {
        let rule = DuplicateEntryRule::new(60);
        let (from, to) = rule.bucket(at(10, 15, 42)).unwrap();
        assert_eq!(from, at(10, 15, 0));
        assert_eq!(to, at(10, 16, 0));
    }

    #[test]
    fn test_amount_bounds() {
        assert!(check_amount_bounds(dec!(12.3400), "Amount").is_none());
        assert!(check_amount_bounds(dec!(1.500000), "Amount").is_none());
        assert!(check_amount_bounds(dec!(-9999999999999999.9999), "Amount").is_none());

        let code = |v: Decimal| check_amount_bounds(v, "Amount").map(|violation| violation.code);
        assert_eq!(code(dec!(0.12345)), Some(EntryRuleCode::AmountTooPrecise));
        assert_eq!(code(AMOUNT_LIMIT), Some(EntryRuleCode::AmountOutOfRange));
        assert_eq!(code(-AMOUNT_LIMIT), Some(EntryRuleCode::AmountOutOfRange));
        assert_eq!(code(Decimal::MAX), Some(EntryRuleCode::AmountOutOfRange));
    }

    #[test]
    fn test_default_pipeline_order() {
        let pipeline = default_entry_pipeline(&LedgerSettings::default());
        assert_eq!(
            pipeline.rule_names(),
            vec!["fields", "positive_amount", "amount_bounds", "active_account", "duplicate_entry"]
        );
    }

    #[tokio::test]
    async fn test_rules_against_store() {
        let store = InMemoryLedgerStore::new();
        let mut uow = store.begin().await.unwrap();

        let mut closed = LedgerAccount::new("Old card", dec!(0), at(0, 0, 0));
        closed.deactivate();
        let open = LedgerAccount::new("Checking", dec!(0), at(0, 0, 0));
        uow.insert_account(&closed).await.unwrap();
        uow.insert_account(&open).await.unwrap();

        let existing = LedgerEntry::from_input(
            EntryInput::debit(open.id, at(10, 15, 5), dec!(20), "Lunch"),
            dec!(0),
        );
        uow.insert_entry(&existing).await.unwrap();

        let pipeline = default_entry_pipeline(&LedgerSettings::default());

        let cases = vec![
            (EntryInput::debit(open.id, at(9, 0, 0), dec!(20), ""), Some(EntryRuleCode::InvalidField)),
            (EntryInput::debit(open.id, at(9, 0, 0), dec!(0), "Lunch"), Some(EntryRuleCode::AmountNotPositive)),
            (EntryInput::debit(open.id, at(9, 0, 0), Decimal::MAX, "Lunch"), Some(EntryRuleCode::AmountOutOfRange)),
            (EntryInput::debit(open.id, at(9, 0, 0), dec!(5.00001), "Lunch"), Some(EntryRuleCode::AmountTooPrecise)),
            (EntryInput::debit(Uuid::new_v4(), at(9, 0, 0), dec!(5), "Lunch"), Some(EntryRuleCode::AccountNotFound)),
            (EntryInput::debit(closed.id, at(9, 0, 0), dec!(5), "Lunch"), Some(EntryRuleCode::AccountInactive)),
            (EntryInput::debit(open.id, at(10, 15, 50), dec!(20), "Lunch"), Some(EntryRuleCode::DuplicateEntry)),
            (EntryInput::debit(open.id, at(10, 16, 1), dec!(20), "Lunch"), None),
            (EntryInput::credit(open.id, at(10, 15, 50), dec!(20), "Lunch"), None),
        ];

        for (input, expected) in cases {
            let mut ctx = ValidationContext::new(uow.as_mut(), None);
            let result = pipeline.validate(&input, &mut ctx).await.unwrap();
            let code = result.into_result().err().map(|v| v.code);
            assert_eq!(code, expected, "input: {:?}", input);
        }

        // Editing the existing entry must not flag itself.
        let same = EntryInput::debit(open.id, at(10, 15, 5), dec!(20), "Lunch");
        let mut ctx = ValidationContext::new(uow.as_mut(), Some(existing.id));
        assert!(pipeline.validate(&same, &mut ctx).await.unwrap().is_valid());

        let mut ctx = ValidationContext::new(uow.as_mut(), None);
        let violation = pipeline.validate(&same, &mut ctx).await.unwrap().into_result().unwrap_err();
        assert_eq!(violation.offending_ids, vec![existing.id]);
    }
}
