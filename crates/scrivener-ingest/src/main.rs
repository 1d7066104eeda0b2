//! Scrivener ingestion daemon.
//!
//! This is the main entry point for the message indexing service. It wires
//! the document store, the rate-limited REST client, N backfill workers,
//! and the live gateway session together, then runs until terminated.
//!
//! # Usage
//!
//! ```bash
//! # Configuration comes from the environment; the token is required.
//! DISCORD_BOT_TOKEN=... scrivener-ingest
//!
//! # Flags override individual env values
//! scrivener-ingest --workers 4 --metrics-port 0 --guild-ids 111,222
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) for graceful shutdown:
//! 1. The gateway session tears down and stops reconnecting
//! 2. Backfill workers release their claims and exit
//! 3. The stale-claim sweeper stops
//! 4. Exits cleanly

use anyhow::{Context, Result};
use clap::Parser;
use metrics::{counter, gauge};
use scrivener_core::metrics::{init_metrics, start_metrics_server};
use scrivener_core::{now_ms, Source};
use scrivener_ingest::{
    ingest_payload, run_backfill_worker, run_gateway, BackfillSettings, Config, GatewaySettings,
    IngestResult, MongoStore, RestClient, Store,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Scrivener ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "scrivener-ingest")]
#[command(about = "Live gateway + backfill ingestion daemon for the message index")]
#[command(version)]
struct Args {
    /// Number of concurrent backfill workers (overrides INDEXER_BACKFILL_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Metrics HTTP server port, 0 to disable (overrides INDEXER_METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Guild ids to index, comma-separated (overrides DISCORD_GUILD_IDS)
    #[arg(long, value_delimiter = ',')]
    guild_ids: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("scrivener_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Scrivener ingestion daemon starting...");

    // Configuration errors are fatal before any connection is opened.
    let mut config = Config::from_env().context("configuration error")?;
    if let Some(workers) = args.workers {
        config.backfill_workers = workers;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    if let Some(guild_ids) = args.guild_ids {
        config.guild_ids = guild_ids;
    }

    // Initialize metrics
    if config.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(config.metrics_port, metrics_handle).await?;
        gauge!("ingestion_running").set(1.0);
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Open the store and the shared REST client; everything downstream
    // receives these handles explicitly.
    let store: Arc<dyn Store> = Arc::new(
        MongoStore::connect(&config.mongodb_uri, &config.mongodb_db)
            .await
            .context("Failed to connect to the document store")?,
    );
    store
        .ensure_indexes()
        .await
        .context("Failed to ensure store indexes")?;

    let rest = Arc::new(
        RestClient::new(&config.token, &config.api_base)
            .context("Failed to build the REST client")?,
    );

    // Discover guilds and channels, seed backfill state.
    let seeded = seed_channels(&config, store.as_ref(), rest.as_ref())
        .await
        .context("Failed to seed backfill state")?;
    tracing::info!("Backfill state seeded: {} new channels", seeded);

    // Spawn backfill workers and the stale-claim sweeper as a structured
    // group so panics and errors surface at shutdown.
    let mut workers = tokio::task::JoinSet::new();
    let settings = BackfillSettings::from_config(&config);
    for worker_id in 0..config.backfill_workers {
        workers.spawn(run_backfill_worker(
            worker_id,
            Arc::clone(&store),
            Arc::clone(&rest),
            settings.clone(),
            Arc::clone(&running),
        ));
    }
    {
        let store = Arc::clone(&store);
        let running = Arc::clone(&running);
        let threshold_ms = (config.stale_claim_minutes * 60 * 1000) as i64;
        workers.spawn(run_claim_sweeper(store, threshold_ms, running));
    }

    // Run the gateway supervisor in this task; it returns once the
    // shutdown flag flips.
    let gateway_settings = GatewaySettings {
        url: config.gateway_url.clone(),
        token: config.token.clone(),
        intents: config.intents,
    };
    let gateway_store = Arc::clone(&store);
    run_gateway(&gateway_settings, Arc::clone(&running), move |payload| {
        let store = Arc::clone(&gateway_store);
        async move {
            match ingest_payload(store.as_ref(), &payload, Source::Live).await {
                Ok(IngestResult::Inserted) => {
                    counter!("live_messages_inserted_total").increment(1);
                }
                Ok(IngestResult::Duplicate) => {
                    counter!("live_messages_duplicate_total").increment(1);
                }
                Ok(IngestResult::Skipped) => {}
                Err(e) => tracing::error!("live message insert failed: {}", e),
            }
        }
    })
    .await;

    // Shutdown sequence
    tracing::info!("Shutting down...");
    running.store(false, Ordering::SeqCst);

    while let Some(result) = workers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("worker exited with error: {}", e),
            Err(e) => tracing::error!("worker panicked: {}", e),
        }
    }

    gauge!("ingestion_running").set(0.0);
    tracing::info!("SHUTDOWN COMPLETE");

    Ok(())
}

/// Resolve the guild list (configured, else discovered through the API),
/// enumerate each guild's text and announcement channels, and seed their
/// backfill state. Returns the number of newly seeded channels.
async fn seed_channels(
    config: &Config,
    store: &dyn Store,
    rest: &RestClient,
) -> scrivener_ingest::Result<usize> {
    let guild_ids: Vec<String> = if config.guild_ids.is_empty() {
        rest.list_guilds().await?.into_iter().map(|g| g.id).collect()
    } else {
        config.guild_ids.clone()
    };
    tracing::info!("Indexing {} guilds", guild_ids.len());

    let mut seeded = 0;
    for guild_id in &guild_ids {
        let channels = rest.list_channels(guild_id).await?;
        for channel in channels.iter().filter(|c| c.is_indexable()) {
            if store.seed_backfill(&channel.id, guild_id).await? {
                seeded += 1;
            }
        }
    }
    Ok(seeded)
}

/// Periodically release claims abandoned by crashed workers so their
/// channels re-enter the rotation.
async fn run_claim_sweeper(
    store: Arc<dyn Store>,
    threshold_ms: i64,
    running: Arc<AtomicBool>,
) -> scrivener_ingest::Result<()> {
    let sweep_interval = Duration::from_secs(60);

    while running.load(Ordering::SeqCst) {
        match store.recover_stale_claims(now_ms() - threshold_ms).await {
            Ok(0) => {}
            Ok(recovered) => {
                counter!("backfill_stale_claims_recovered_total").increment(recovered);
            }
            Err(e) => tracing::warn!("stale-claim sweep failed: {}", e),
        }

        // Chunked sleep so shutdown is not delayed by a full interval.
        let mut slept = Duration::ZERO;
        while slept < sweep_interval && running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            slept += Duration::from_secs(1);
        }
    }
    Ok(())
}
