//! Wallet audit binary
//!
//! Sweeps every account through the consistency verifier, then prints the
//! sweep result, the ledger report and storage statistics as JSON.
//!
//! Usage: `wallet-audit [config.toml]`. Without a file, configuration is read
//! from `WALLET_*` environment variables.

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use wallet_core::{
    reports::{self, LedgerReport},
    storage::StorageStats,
    verifier::SweepReport,
    Config, Wallet,
};

#[derive(Serialize)]
struct AuditOutput {
    sweep: SweepReport,
    report: LedgerReport,
    stats: StorageStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };

    tracing::info!(data_dir = ?config.data_dir, "Starting wallet audit");

    let wallet = Wallet::open(config).context("Failed to open wallet")?;

    let sweep = wallet
        .verifier()
        .verify_all()
        .await
        .context("Consistency sweep failed")?;
    if !sweep.corrected.is_empty() {
        tracing::warn!(corrected = sweep.corrected.len(), "Consistency faults healed");
    }

    let storage = wallet.storage();
    let report = reports::build_report(&storage.list_accounts()?, &storage.all_entries()?, Utc::now());
    let stats = storage.get_stats()?;

    let output = AuditOutput {
        sweep,
        report,
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    tracing::info!("Wallet audit finished");
    Ok(())
}
