use std::sync::Arc;

use clap::Parser;
use libhub_core::LibhubConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use libhub_server::state::{needs_database, AppState};
use libhub_server::subsystems::indexer::{self, IndexMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "libhub.toml")]
    config: String,

    /// Check database connectivity and exit.
    #[arg(long)]
    health: bool,

    /// Import a JSON book catalog into Postgres and exit.
    #[arg(long, value_name = "FILE")]
    import: Option<String>,

    /// Re-embed the whole catalog and exit.
    #[arg(long)]
    reindex: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match LibhubConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    let pool = if needs_database(&config) || args.health || args.import.is_some() {
        match libhub_core::db::create_pool(&config.database).await {
            Ok(p) => Some(p),
            Err(e) => {
                eprintln!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    if args.health {
        if let Some(pool) = &pool {
            match libhub_core::db::health_check(pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            }

            match libhub_core::db::check_pgvector(pool).await {
                Ok(v) => println!("✅ pgvector version: {}", v),
                Err(e) if config.index.backend == "pgvector" => {
                    println!("❌ pgvector check failed: {}", e);
                    std::process::exit(1);
                }
                Err(e) => println!("⚠️  pgvector unavailable (not needed for the memory index): {}", e),
            }
        }

        println!("✅ Library Hub health check passed");
        return Ok(());
    }

    if let Some(path) = &args.import {
        let Some(pool) = &pool else {
            anyhow::bail!("--import needs a database connection");
        };
        let entries = libhub_ingest::load_catalog(path).await?;
        let report =
            libhub_ingest::import_catalog(pool, &entries, config.catalog.default_copies).await?;
        println!(
            "✅ Imported {} books from {} ({} new, {} updated, {} copies created)",
            entries.len(),
            path,
            report.inserted,
            report.updated,
            report.copies_created
        );
        return Ok(());
    }

    let state = match AppState::from_config(config, pool).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to start Library Hub: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.reindex {
        let report = indexer::index_catalog(
            state.catalog.as_ref(),
            state.backend.as_ref(),
            state.index.as_ref(),
            IndexMode::Full,
            state.config.index.rate_limit_rpm,
        )
        .await?;
        println!(
            "✅ Reindexed catalog: {} embedded, {} skipped, {} removed",
            report.embedded, report.skipped, report.removed
        );
        return Ok(());
    }

    // Fill the index before serving so the first searches have something to find
    if let Err(e) = indexer::index_catalog(
        state.catalog.as_ref(),
        state.backend.as_ref(),
        state.index.as_ref(),
        IndexMode::Missing,
        0,
    )
    .await
    {
        tracing::warn!(error = %e, "Initial indexing pass failed; serving with the current index");
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(indexer::run_reindex_worker(
        state.catalog.clone(),
        state.backend.clone(),
        state.index.clone(),
        state.config.index.clone(),
        tx.subscribe(),
    ));

    libhub_server::http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
