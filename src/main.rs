mod cleanup;
mod cli;
mod clock;
mod config;
mod daemon;
mod db;
mod error;
mod fetch;
mod http;
mod llm;
mod models;
mod parse;
mod pipeline;
mod prompts;
mod quality;
mod scheduler;
mod server;
mod store;
mod telemetry;
#[cfg(test)]
mod testing;
mod text;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::{load_config, validate_config};
use crate::pipeline::BatchSummary;
use crate::store::SqliteStore;
use crate::telemetry::{MemoryTelemetry, TelemetrySink};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agora.log_level));
    if config.agora.debug {
        let directive: tracing_subscriber::filter::Directive =
            "agora=debug".parse().context("building debug log directive")?;
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Run) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let store = Arc::new(SqliteStore::new(pool.clone()));
            let (orchestrator, _) = daemon::build_orchestrator(&config, store.clone(), store)?;

            let summary = orchestrator
                .run_manual()
                .await
                .map_err(|e| anyhow::anyhow!("generation run failed ({}): {e}", e.kind()))?;
            print_summary(&summary)?;
            pool.close().await;
        }
        Some(Commands::Test) => {
            // Test runs never persist, so telemetry stays in memory
            let pool = db::create_pool(&config).await.context("creating database")?;
            let store = Arc::new(SqliteStore::new(pool.clone()));
            let telemetry = Arc::new(MemoryTelemetry::new());
            let (orchestrator, _) = daemon::build_orchestrator(&config, store, telemetry)?;

            let summary = orchestrator
                .run_test()
                .await
                .map_err(|e| anyhow::anyhow!("test run failed ({}): {e}", e.kind()))?;
            print_summary(&summary)?;
            pool.close().await;
        }
        Some(Commands::Check) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let store = Arc::new(SqliteStore::new(pool.clone()));
            let (_, llm) = daemon::build_orchestrator(&config, store.clone(), store)?;

            let report = llm
                .test_connection()
                .await
                .map_err(|e| anyhow::anyhow!("connection test failed ({}): {e}", e.kind()))?;
            println!("Provider OK: model {} answered in {} ms", report.model, report.latency_ms);
            pool.close().await;
        }
        Some(Commands::Health) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let store = Arc::new(SqliteStore::new(pool.clone()));
            let (_, llm) = daemon::build_orchestrator(&config, store.clone(), store.clone())?;

            let report = serde_json::json!({
                "provider": llm.health(),
                "totals": store.totals().await?,
                "last_run_at": store.last_run_at().await?,
                "recent_errors": store.recent_errors(5).await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            pool.close().await;
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}

fn print_summary(summary: &BatchSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary).context("serializing run summary")?);
    Ok(())
}
