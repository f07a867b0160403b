use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Kind of chain mutation, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Import,
    Reseed,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::Import => "import",
            MutationKind::Reseed => "reseed",
        }
    }
}

/// Metrics collector for the ledger.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_mutation(&self, kind: MutationKind, outcome: &str, duration_ms: f64) {
        counter!("ledger_mutations_total", "kind" => kind.as_str(), "outcome" => outcome.to_string()).increment(1);
        histogram!("ledger_mutation_duration_ms", "kind" => kind.as_str()).record(duration_ms);
    }

    pub fn record_entries_reprocessed(&self, count: usize) {
        counter!("ledger_entries_reprocessed_total").increment(count as u64);
        histogram!("ledger_reprocess_range_size").record(count as f64);
    }

    pub fn record_validation_rejected(&self, code: &str) {
        counter!("ledger_validation_rejections_total", "code" => code.to_string()).increment(1);
    }

    pub fn record_conflict_retry(&self, kind: MutationKind) {
        counter!("ledger_conflict_retries_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn record_broken_links(&self, count: usize) {
        counter!("ledger_broken_links_total").increment(count as u64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(format!("Failed to install Prometheus recorder: {e}")))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("ledger_mutations_total", Unit::Count, "Entry mutations by kind and outcome");
    describe_histogram!("ledger_mutation_duration_ms", Unit::Milliseconds, "Mutation latency in milliseconds");
    describe_counter!("ledger_entries_reprocessed_total", Unit::Count, "Cached balances rewritten by reprocessing");
    describe_histogram!("ledger_reprocess_range_size", Unit::Count, "Entries rewritten per reprocessing pass");
    describe_counter!("ledger_validation_rejections_total", Unit::Count, "Mutations rejected by validation rules");
    describe_counter!("ledger_conflict_retries_total", Unit::Count, "Mutations retried after a concurrency conflict");
    describe_counter!("ledger_broken_links_total", Unit::Count, "Chain links found inconsistent by verification");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = get_metrics();
        metrics.record_mutation(MutationKind::Create, "ok", 1.5);
        metrics.record_entries_reprocessed(3);
        metrics.record_validation_rejected("DuplicateEntry");
    }

    #[test]
    fn test_mutation_kind_labels() {
        assert_eq!(MutationKind::Update.as_str(), "update");
        assert_eq!(MutationKind::Reseed.as_str(), "reseed");
    }
}
