use crate::services::entry_rules::EntryRuleCode;
use crate::services::validation::RuleViolation;
use thiserror::Error;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(RuleViolation<EntryRuleCode>),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Balance overflow at entry {0}")]
    BalanceOverflow(uuid::Uuid),

    #[error("Operation cancelled before commit")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true for errors the caller may resolve by retrying the whole mutation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ConcurrencyConflict(_))
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::ValidationFailed(_) => "validation_failed",
            AppError::ConcurrencyConflict(_) => "concurrency_conflict",
            AppError::BalanceOverflow(_) => "balance_overflow",
            AppError::Cancelled => "cancelled",
            AppError::Database(_) => "database",
            AppError::Migration(_) => "migration",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        // 40001 serialization_failure, 40P01 deadlock_detected
        if let sqlx::Error::Database(db_err) = &err {
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return AppError::ConcurrencyConflict(db_err.message().to_string());
            }
        }
        AppError::Database(err)
    }
}

impl From<RuleViolation<EntryRuleCode>> for AppError {
    fn from(violation: RuleViolation<EntryRuleCode>) -> Self {
        AppError::ValidationFailed(violation)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
