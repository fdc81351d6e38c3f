use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings, prepare_database_url},
    dispatcher::forward_pushes,
    sync::{push::spawn_push_listener, HttpSyncChannel, MemorySyncChannel},
    CanvasClient, ClientEvent, DispatchMessage, Dispatcher, SnapshotStore, SyncChannel,
};
use storage::Storage;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `backend_url` from canvas.toml.
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    /// Run against an in-process backend instead of the HTTP one.
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.backend_url {
        settings.backend_url = url;
    }
    if let Some(url) = args.database_url {
        settings.database_url = url;
    }

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url)
        .await
        .context("failed to open the local document store")?;
    let store: Arc<dyn SnapshotStore> = Arc::new(storage);

    let (tx, rx) = mpsc::channel(settings.push_queue_capacity.max(1));
    let channel: Arc<dyn SyncChannel> = if args.offline {
        let memory = Arc::new(MemorySyncChannel::new());
        forward_pushes(memory.subscribe_pushes().await, tx.clone());
        info!("running against the in-process backend");
        memory
    } else {
        match spawn_push_listener(&settings.backend_url, tx.clone()).await {
            Ok(_) => {}
            Err(err) => warn!("continuing without push notifications: {err}"),
        }
        Arc::new(HttpSyncChannel::new(settings.backend_url.clone()))
    };

    let client = CanvasClient::new(channel, store, settings);
    let dispatcher = Dispatcher::new(client.clone(), rx).spawn();

    let mut events = BroadcastStream::new(client.subscribe_events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(ClientEvent::Notification { level, message }) => {
                    info!(?level, "{message}");
                }
                Ok(ClientEvent::SaveStatusChanged(status)) if !status.label().is_empty() => {
                    info!(status = status.label(), "save status");
                }
                Ok(event) => tracing::debug!(?event, "client event"),
                Err(err) => warn!("event log lagged: {err}"),
            }
        }
    });

    if let Err(err) = client.load_from_backend().await {
        warn!("initial canvas load failed: {err}");
    }
    if let Err(err) = client.load_ui_settings().await {
        warn!("using default ui settings: {err}");
    }
    match client.restore_saved_canvas().await {
        Ok(Some(report)) => info!(
            nodes = report.nodes_replayed + report.nodes_local,
            connections = report.connections_replayed + report.connections_local,
            "restored saved canvas"
        ),
        Ok(None) => info!("no saved canvas to restore"),
        Err(err) => warn!("could not restore saved canvas: {err}"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    let _ = tx.send(DispatchMessage::Shutdown).await;
    if let Err(err) = dispatcher.await {
        warn!("dispatcher task failed: {err}");
    }
    client.save_now().await?;
    Ok(())
}
