use anyhow::Context;
use clap::Parser; // for cli
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use session_watchdog::config::Args;
use session_watchdog::handlers;
use session_watchdog::ingest::Ingestor;
use session_watchdog::log_stream::{fetch_token, run_log_stream};
use session_watchdog::reaper::{eviction_worker, expiry_reaper};
use session_watchdog::state::AppState;
use session_watchdog::store::open_backend;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "session_watchdog=debug,info"
    } else {
        "session_watchdog=info,warn"
    };
    // RUST_LOG wins over the built-in filter
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let stores = open_backend(args.storage, &args.storage_location())
        .await
        .context("Failed to open storage backend")?;
    let cancel = CancellationToken::new();

    // Without a valid token there is nothing to watch
    let stream_config = args.stream_config();
    let client = reqwest::Client::new();
    let token = fetch_token(&client, &stream_config)
        .await
        .context("Error getting token")?;

    let ingestor = Ingestor::new(stores.sessions.clone(), args.max_allow_users);
    let stream_task = tokio::spawn(run_log_stream(
        stream_config,
        token,
        ingestor,
        cancel.clone(),
    ));

    let reaper_config = args.reaper_config();
    let (evict_tx, evict_rx) = mpsc::channel::<String>(reaper_config.queue_capacity);
    let worker_task = tokio::spawn(eviction_worker(
        stores.sessions.clone(),
        evict_rx,
        reaper_config.inactivity_delay,
        cancel.clone(),
    ));
    let reaper_task = tokio::spawn(expiry_reaper(
        stores.clone(),
        reaper_config,
        evict_tx,
        cancel.clone(),
    ));

    let state = Arc::new(AppState::new(&stores, args.max_allow_users, args.ban_minutes));
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        port = args.port,
        storage = ?args.storage,
        log_server = %args.address,
        "Watchdog admin API listening"
    );

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        .context("Admin API server failed")?;

    cancel.cancel();
    let (stream, reaper, worker) = tokio::join!(stream_task, reaper_task, worker_task);
    for (task, result) in [("log stream", stream), ("reaper", reaper), ("eviction worker", worker)] {
        if let Err(e) = result {
            error!(task, error = %e, "Background task failed");
        }
    }
    info!("Watchdog stopped");
    Ok(())
}
