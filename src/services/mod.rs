pub mod account_service;
pub mod balance_chain_service;
pub mod entry_mutation_service;
pub mod entry_rules;
pub mod validation;

pub use account_service::{AccountService, OpenAccountRequest, StatementLine};
pub use balance_chain_service::{BalanceChainService, BrokenLink, ChainReport, ReprocessSummary};
pub use entry_mutation_service::EntryMutationService;
pub use entry_rules::{
    check_amount_bounds, default_entry_pipeline, ActiveAccountRule, AmountBoundsRule,
    DuplicateEntryRule, EntryRuleCode, EntryValidationPipeline, FieldRule, PositiveAmountRule,
};
pub use validation::{
    RuleOutcome, RuleViolation, ValidationContext, ValidationPipeline, ValidationResult, ValidationRule,
};
