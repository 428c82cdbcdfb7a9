use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::fetch::ContentFetcher;
use crate::http::{ReqwestTransport, Transport};
use crate::llm::{ClientSettings, LlmClient};
use crate::pipeline::{GenerationSettings, Orchestrator};
use crate::scheduler::RunLock;
use crate::store::{self, Persistence, SqliteStore};
use crate::telemetry::TelemetrySink;
use crate::{cleanup, db, scheduler, server};

/// Wire the LLM client, fetcher and orchestrator from config.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<dyn Persistence>,
    telemetry: Arc<dyn TelemetrySink>,
) -> Result<(Arc<Orchestrator>, Arc<LlmClient>)> {
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new().context("building HTTP client")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let settings = ClientSettings::from_config(config)?;
    if settings.api_key.is_none() {
        warn!(env = %config.provider.api_key_env, "no provider API key configured, generation will fail");
    }
    let llm = Arc::new(LlmClient::new(settings, transport.clone(), clock.clone()));
    let fetcher = ContentFetcher::from_config(config, transport, clock.clone())?;

    let orchestrator = Orchestrator::new(
        GenerationSettings::from_config(config),
        llm.clone(),
        fetcher,
        store,
        telemetry,
        clock,
    );
    Ok((Arc::new(orchestrator), llm))
}

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    let status_token = bootstrap_status_token(&pool, &config).await?;

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let (orchestrator, llm) = build_orchestrator(&config, store.clone(), store)?;
    info!(
        sources = config.source.len(),
        schedule = %orchestrator.schedule(),
        model = %config.provider.model,
        "generator ready"
    );

    let cancel = CancellationToken::new();
    let run_lock = RunLock::default();

    // Spawn background tasks
    let scheduler_handle = tokio::spawn(scheduler::scheduler_loop(
        orchestrator.clone(),
        run_lock.clone(),
        cancel.clone(),
    ));

    let cleanup_handle = tokio::spawn(cleanup::cleanup_loop(llm, cancel.clone()));

    // Build and start HTTP server
    let app_state = server::AppState {
        orchestrator,
        status_token,
        run_lock,
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.agora.listen)
        .await
        .with_context(|| format!("binding to {}", config.agora.listen))?;

    info!(listen = %config.agora.listen, "HTTP server listening");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    // An in-flight batch is not interrupted; give it a bounded window to finish
    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = scheduler_handle.await;
        let _ = cleanup_handle.await;
        let _ = server_handle.await;
    })
    .await;

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn bootstrap_status_token(pool: &SqlitePool, config: &Config) -> Result<String> {
    // Priority: config value → DB stored value → auto-generate
    if let Some(ref token) = config.agora.status_token {
        store::set_setting(pool, "status_token", token).await?;
        info!("using status token from config");
        return Ok(token.clone());
    }

    if let Some(token) = store::get_setting(pool, "status_token").await? {
        info!("using stored status token");
        return Ok(token);
    }

    let token = generate_token();
    store::set_setting(pool, "status_token", &token).await?;
    warn!(token = %token, "status token generated, save it for /status and /run");
    Ok(token)
}

fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, waiting for ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
