//! brined — Salt event telemetry daemon.
//!
//! Tails the master event bus, aggregates job and state apply events into
//! in-memory stores, and serves the resulting metrics over HTTP.

mod config;
mod ipc;
mod pipeline;
mod restapi;
mod source;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use brine_data::DataMerger;
use clap::Parser;
use tokio::signal;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "brined", about = "Reads events from the Salt master event bus")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "/etc/brine/brined.yaml")]
    config: PathBuf,
    /// Log filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        info!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
        Config::default()
    };
    config.validate()?;

    std::fs::create_dir_all(&config.sock_dir).with_context(|| {
        format!("Could not create sock_dir: {}", config.sock_dir.display())
    })?;

    // Binding the publisher socket doubles as the duplicate-instance
    // check: a live socket means another brined owns this sock_dir.
    let publisher = ipc::MetricsPublisher::bind(&config.sock_dir, config.ipc_write_buffer).await?;

    let merger = Arc::new(DataMerger::new(config.merger_options()));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (raw_tx, raw_rx) = flume::bounded(4096);
    let (parsed_tx, parsed_rx) = flume::bounded(4096);

    let event_filter =
        source::EventFilter::new(&config.events_regex_filter, &config.events_additional)
            .context("Invalid event filter")?;
    let source_task = tokio::spawn(source::run_source(
        config.master_event_pub.clone(),
        event_filter,
        raw_tx,
        stop_rx.clone(),
    ));
    let reader_tasks = pipeline::spawn_readers(&config, raw_rx, parsed_tx)?;
    let merger_task = pipeline::spawn_merger(merger.clone(), parsed_rx);
    let maintenance_task = pipeline::spawn_maintenance(merger.clone(), &config, stop_rx.clone());
    let publisher_task = pipeline::spawn_publisher(merger.clone(), publisher, stop_rx.clone());

    let metrics_buf = Arc::new(RwLock::new(None));
    let subscriber_task = ipc::spawn_subscriber(
        config.sock_dir.join(ipc::PUBLISHER_SOCKET),
        metrics_buf.clone(),
        stop_rx.clone(),
    );

    let state = Arc::new(restapi::ApiState { metrics_buf });
    let static_dir = config
        .restapi
        .static_dir
        .clone()
        .map(|dir| (config.restapi.static_path.clone(), dir));
    let router = restapi::router(state, static_dir);
    let addr = format!("{}:{}", config.restapi.host, config.restapi.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Could not bind the REST API listener on {}", addr))?;
    info!("REST API listening on {}", addr);
    let mut server_stop = stop_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_stop.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    info!("Shutting down");
    let _ = stop_tx.send(true);

    // The producer exits first and closes the raw queue; readers and the
    // merger drain what is left before stopping.
    let _ = source_task.await;
    for task in reader_tasks {
        let _ = task.await;
    }
    let _ = merger_task.await;
    let _ = maintenance_task.await;
    let _ = publisher_task.await;
    let _ = subscriber_task.await;
    let _ = server_task.await;

    info!("brined is shut down");
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Could not install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = terminate => {}
    }
}
