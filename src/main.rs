use anyhow::Context;
use tracing::{info, warn};
use wallet_ledger::config::Settings;
use wallet_ledger::observability::{init_logging, init_metrics};
use wallet_ledger::repositories::{build_store, LedgerStore};
use wallet_ledger::services::AccountService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::new().context("failed to load configuration")?;
    init_logging(&settings.logging.to_log_config());
    init_metrics().context("failed to install metrics recorder")?;
    info!("Configuration loaded");

    let store = build_store(&settings.database)
        .await
        .context("failed to open ledger store")?;
    info!(backend = store.backend().as_str(), "Ledger store ready");
    let accounts = AccountService::new(store);

    let reports = accounts.verify_all().await.context("chain verification failed")?;
    let broken: Vec<_> = reports.iter().filter(|r| !r.is_consistent()).collect();

    if broken.is_empty() {
        info!(accounts = reports.len(), "All balance chains are consistent");
        return Ok(());
    }

    for report in &broken {
        warn!(
            account_id = %report.account_id,
            broken_links = report.broken_links.len(),
            "Inconsistent balance chain"
        );
    }

    if !settings.ledger.repair_on_startup {
        warn!(accounts = broken.len(), "Repair disabled, leaving chains untouched");
        return Ok(());
    }

    for report in broken {
        let summary = accounts
            .repair_chain(report.account_id)
            .await
            .with_context(|| format!("failed to repair account {}", report.account_id))?;
        info!(account_id = %report.account_id, rewritten = summary.rewritten, "Chain repaired");
    }

    Ok(())
}
