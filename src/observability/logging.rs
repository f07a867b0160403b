use rust_decimal::Decimal;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for logging.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level applied to this crate. Dependencies stay at `warn`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

fn ledger_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,wallet_ledger={level}")))
}

/// Initializes the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Json output closes every instrumented mutation span, so each create, update
/// and delete leaves one line with its duration.
pub fn init_logging(config: &LogConfig) {
    let registry = tracing_subscriber::registry().with(ledger_filter(&config.level));

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_events(FmtSpan::CLOSE))
            .init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }

    tracing::info!(level = %config.level, format = ?config.format, "Logging initialized");
}

/// Masks a balance or amount for logs, keeping only its order of magnitude.
pub fn mask_amount(amount: &Decimal) -> String {
    let abs = amount.abs();
    let sign = if amount.is_sign_negative() && !amount.is_zero() { "-" } else { "" };
    if abs >= Decimal::from(1_000_000) {
        format!("{sign}***M+")
    } else if abs >= Decimal::from(1_000) {
        format!("{sign}***K+")
    } else {
        format!("{sign}***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_amount() {
        assert_eq!(mask_amount(&Decimal::from(500)), "***");
        assert_eq!(mask_amount(&Decimal::from(5000)), "***K+");
        assert_eq!(mask_amount(&Decimal::from(5_000_000)), "***M+");
        assert_eq!(mask_amount(&Decimal::from(-1200)), "-***K+");
        assert_eq!(mask_amount(&Decimal::ZERO), "***");
    }

    #[test]
    fn test_filter_scopes_level_to_crate() {
        std::env::remove_var("RUST_LOG");
        let filter = ledger_filter("debug").to_string();
        assert!(filter.contains("wallet_ledger=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from("json"), LogFormat::Json);
        assert_eq!(LogFormat::from("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::from("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from("unknown"), LogFormat::Pretty);
    }
}
