//! Application entry point for the `fieldbus-sim-bridge` service.
//!
//! This binary runs a scenario-driven simulator of a building's environmental
//! sensors and bridges its readings into a dashboard's database:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Connecting to the reading store and the destination (dashboard) store
//! - Creating the reading store schema if it does not exist
//! - Spawning the periodic jobs: scenario tick, sync bridge, mapping refresh
//!   and retention
//! - Serving the administrative API until shutdown
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – reading store connection string
//! - `DESTINATION_DATABASE_URL` (optional) – dashboard database (default: `DATABASE_URL`)
//! - `APP_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `APP_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the full list.
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use chrono::Utc;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

mod bridge;
mod config;
mod error;
mod mapping;
mod models;
mod retention;
mod routes;
mod scenario;
mod scheduler;
mod schema;
mod sensor;
mod store;

use bridge::{BridgeJob, SyncBridge, SyncStatusHandle};
use mapping::{MappingRefreshJob, MappingResolver};
use retention::RetentionJob;
use scenario::{ScenarioEngine, ScenarioJob, ScenarioTuning};
use sensor::SimHandle;
use store::{PgDestinationStore, PgReadingStore, ReadingStore};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();
    let specs = cfg.sensor_specs()?;

    let source_pool = connect(&cfg.db_url, cfg.db_pool_max).await?;
    let destination_pool = if cfg.shared_database() {
        source_pool.clone()
    } else {
        connect(&cfg.destination_db_url, cfg.db_pool_max).await?
    };

    schema::create_schema(&source_pool).await?;

    let readings = Arc::new(PgReadingStore::new(source_pool));
    let destination = Arc::new(PgDestinationStore::new(destination_pool));

    let persisted_cursor = readings
        .load_cursor()
        .await
        .context("Failed to load sync cursor")?;

    // Simulator: resume numbering and timestamps after whatever is stored
    let sim = SimHandle::new(&specs, cfg.manual);
    let next_seq = readings
        .last_tick_seq()
        .await
        .context("Failed to read last tick sequence")?
        .map_or(1, |seq| seq + 1);
    let latest = readings
        .latest_recorded_at()
        .await
        .context("Failed to read latest reading timestamp")?;
    let engine = ScenarioEngine::new(sim.clone(), ScenarioTuning::default(), next_seq)
        .resume_after(latest.max(persisted_cursor));
    tracing::info!(
        sensors = sim.sensor_count(),
        next_seq = engine.next_seq(),
        "Simulator ready"
    );

    // Bridge: the mapping must be readable before the first cycle
    let resolver = MappingResolver::new(cfg.mapping_fallback);
    resolver
        .refresh(destination.as_ref(), cfg.store_timeout)
        .await
        .context("Failed to build initial sensor mapping")?;

    let cursor = match persisted_cursor {
        Some(cursor) => {
            tracing::info!("Resuming sync after persisted cursor {}", cursor);
            cursor
        }
        None => {
            let cursor = Utc::now()
                .checked_sub_signed(cfg.sync_backfill)
                .context("SYNC_BACKFILL_MINS reaches past the earliest timestamp")?;
            tracing::info!("No persisted cursor, starting sync at {}", cursor);
            cursor
        }
    };
    let status = SyncStatusHandle::new(Some(cursor));
    let bridge = SyncBridge::new(
        Arc::clone(&readings),
        Arc::clone(&destination),
        resolver.clone(),
        status.clone(),
        cfg.bridge_settings(),
    );

    let cancel = CancellationToken::new();
    let jobs = vec![
        scheduler::spawn_periodic(
            ScenarioJob::new(engine, Arc::clone(&readings), cfg.store_timeout),
            cfg.tick_interval,
            cancel.clone(),
        ),
        scheduler::spawn_periodic(BridgeJob::new(bridge), cfg.sync_interval, cancel.clone()),
        scheduler::spawn_periodic(
            MappingRefreshJob::new(resolver, destination, cfg.store_timeout),
            cfg.mapping_refresh,
            cancel.clone(),
        ),
        scheduler::spawn_periodic(
            RetentionJob::new(
                readings,
                status.clone(),
                cfg.reading_retention,
                cfg.store_timeout,
            ),
            cfg.retention_interval,
            cancel.clone(),
        ),
    ];

    let app: Router = routes::router(sim, status);

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    tracing::info!("Listening on {}", cfg.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!("Background job ended abnormally: {}", e);
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

// ---

async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    // ---
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database '{}': {}", url, e))?;

    tracing::info!("Successfully connected to database");
    Ok(pool)
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, stopping");
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `APP_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG` if set, else `APP_LOG_LEVEL` (default `debug`)
fn init_tracing() {
    // ---
    let span_events = match env::var("APP_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("APP_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
