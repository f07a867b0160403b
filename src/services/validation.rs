use crate::error::Result;
use crate::repositories::LedgerUnitOfWork;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// A typed rule failure: a code, a human-readable message and the ids of the
/// records that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleViolation<C> {
    pub code: C,
    pub message: String,
    pub offending_ids: Vec<Uuid>,
}

impl<C> RuleViolation<C> {
    pub fn new(code: C, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            offending_ids: Vec::new(),
        }
    }

    pub fn with_offending_ids(mut self, ids: Vec<Uuid>) -> Self {
        self.offending_ids = ids;
        self
    }
}

impl<C: fmt::Debug> fmt::Display for RuleViolation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if !self.offending_ids.is_empty() {
            let ids: Vec<String> = self.offending_ids.iter().map(Uuid::to_string).collect();
            write!(f, " [{}]", ids.join(", "))?;
        }
        Ok(())
    }
}

/// What a single rule decided.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome<C> {
    Pass,
    Reject(RuleViolation<C>),
}

/// Outcome of running a whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult<C> {
    Valid,
    Invalid(RuleViolation<C>),
}

impl<C> ValidationResult<C> {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn into_result(self) -> std::result::Result<(), RuleViolation<C>> {
        match self {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(violation) => Err(violation),
        }
    }
}

/// Data a rule may consult besides the input itself.
pub struct ValidationContext<'a> {
    /// Id of the record being edited, `None` when creating.
    pub editing_id: Option<Uuid>,
    /// The unit of work the mutation runs in, so rules read the same state the
    /// mutation will write to.
    pub uow: &'a mut dyn LedgerUnitOfWork,
}

impl<'a> ValidationContext<'a> {
    pub fn new(uow: &'a mut dyn LedgerUnitOfWork, editing_id: Option<Uuid>) -> Self {
        Self { editing_id, uow }
    }
}

/// One check applied to inputs of type `I`, failing with codes of type `C`.
#[async_trait]
pub trait ValidationRule<I, C>: Send + Sync {
    /// Stable name used to register and remove the rule.
    fn name(&self) -> &'static str;

    /// Inspects `input`. An `Err` means the check itself could not run.
    async fn check(&self, input: &I, ctx: &mut ValidationContext<'_>) -> Result<RuleOutcome<C>>;
}

/// Ordered rule registry. Rules run in registration order and the first
/// rejection stops the pipeline.
pub struct ValidationPipeline<I, C> {
    rules: Vec<Box<dyn ValidationRule<I, C>>>,
}

impl<I, C> Default for ValidationPipeline<I, C> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<I, C> ValidationPipeline<I, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule, builder style.
    pub fn with_rule<R>(mut self, rule: R) -> Self
    where
        R: ValidationRule<I, C> + 'static,
    {
        self.register(Box::new(rule));
        self
    }

    /// Appends a rule. A rule registered under an existing name replaces it in place.
    pub fn register(&mut self, rule: Box<dyn ValidationRule<I, C>>) {
        match self.rules.iter().position(|r| r.name() == rule.name()) {
            Some(idx) => self.rules[idx] = rule,
            None => self.rules.push(rule),
        }
    }

    /// Removes a rule by name. Returns false if no such rule was registered.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name() != name);
        self.rules.len() != before
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs every rule in order, stopping at the first rejection.
    pub async fn validate(
        &self,
        input: &I,
        ctx: &mut ValidationContext<'_>,
    ) -> Result<ValidationResult<C>> {
        for rule in &self.rules {
            if let RuleOutcome::Reject(violation) = rule.check(input, ctx).await? {
                tracing::debug!(rule = rule.name(), "Validation rule rejected input");
                return Ok(ValidationResult::Invalid(violation));
            }
        }
        Ok(ValidationResult::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{InMemoryLedgerStore, LedgerStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Code {
        TooSmall,
        Odd,
    }

    struct MinRule {
        min: i64,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ValidationRule<i64, Code> for MinRule {
        fn name(&self) -> &'static str {
            "min"
        }

        async fn check(&self, input: &i64, _ctx: &mut ValidationContext<'_>) -> Result<RuleOutcome<Code>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *input < self.min {
                return Ok(RuleOutcome::Reject(RuleViolation::new(Code::TooSmall, "too small")));
            }
            Ok(RuleOutcome::Pass)
        }
    }

    struct EvenRule {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ValidationRule<i64, Code> for EvenRule {
        fn name(&self) -> &'static str {
            "even"
        }

        async fn check(&self, input: &i64, _ctx: &mut ValidationContext<'_>) -> Result<RuleOutcome<Code>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input % 2 != 0 {
                return Ok(RuleOutcome::Reject(RuleViolation::new(Code::Odd, "odd")));
            }
            Ok(RuleOutcome::Pass)
        }
    }

    fn pipeline(min_calls: Arc<AtomicUsize>, even_calls: Arc<AtomicUsize>) -> ValidationPipeline<i64, Code> {
        ValidationPipeline::new()
            .with_rule(MinRule { min: 10, calls: min_calls })
            .with_rule(EvenRule { calls: even_calls })
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let store = InMemoryLedgerStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut ctx = ValidationContext::new(uow.as_mut(), None);

        let min_calls = Arc::new(AtomicUsize::new(0));
        let even_calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(min_calls.clone(), even_calls.clone());

        let result = pipeline.validate(&3, &mut ctx).await.unwrap();
        assert_eq!(
            result,
            ValidationResult::Invalid(RuleViolation::new(Code::TooSmall, "too small"))
        );
        assert_eq!(min_calls.load(Ordering::SeqCst), 1);
        assert_eq!(even_calls.load(Ordering::SeqCst), 0);

        let result = pipeline.validate(&11, &mut ctx).await.unwrap();
        assert!(matches!(result, ValidationResult::Invalid(RuleViolation { code: Code::Odd, .. })));

        assert!(pipeline.validate(&12, &mut ctx).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_register_replace_and_remove() {
        let mut pipeline = pipeline(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        assert_eq!(pipeline.rule_names(), vec!["min", "even"]);

        pipeline.register(Box::new(MinRule { min: 0, calls: Arc::new(AtomicUsize::new(0)) }));
        assert_eq!(pipeline.rule_names(), vec!["min", "even"]);

        assert!(pipeline.remove("even"));
        assert!(!pipeline.remove("even"));
        assert_eq!(pipeline.len(), 1);

        let store = InMemoryLedgerStore::new();
        let mut uow = store.begin().await.unwrap();
        let mut ctx = ValidationContext::new(uow.as_mut(), None);
        assert!(pipeline.validate(&1, &mut ctx).await.unwrap().is_valid());
    }

    #[test]
    fn test_violation_display() {
        let id = Uuid::nil();
        let violation = RuleViolation::new(Code::Odd, "odd").with_offending_ids(vec![id]);
        assert_eq!(
            violation.to_string(),
            "Odd: odd [00000000-0000-0000-0000-000000000000]"
        );
    }
}
