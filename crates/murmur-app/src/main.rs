//! # Murmur
//!
//! Headless ambient soundscape mixer. Reads control commands from stdin, one per line.

mod cli;
mod commands;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use murmur_audio::{AudioSession, MixEngine, OutputMode};
use murmur_core::Catalog;
use murmur_store::SnapshotStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Args;
use crate::commands::Command;
use crate::state::App;

/// Render cadence when no device drives the clock.
const OFFLINE_PUMP: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,murmur_app=debug,murmur_audio=info".into()),
        )
        .init();

    info!("Starting Murmur v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = args.engine_config()?;
    let catalog = Catalog::load(&args.catalog)
        .with_context(|| format!("Failed to load catalog {}", args.catalog.display()))?;

    let store = match &args.data_dir {
        Some(dir) => SnapshotStore::with_path(dir)?,
        None => SnapshotStore::new()?,
    };
    let snapshot = store.load_snapshot();

    let offline = config.output == OutputMode::Offline;
    let engine = MixEngine::new(catalog, config);
    engine
        .initialize(snapshot.initial_mix(engine.catalog()))
        .await;

    let shutdown = CancellationToken::new();
    if offline {
        if let Some(session) = engine.session() {
            tokio::spawn(pump_offline(session, shutdown.clone()));
        }
    }

    let mut app = App::new(engine.clone(), store, snapshot);
    println!("murmur ready, type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match commands::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => match app.apply(command) {
                        Ok(reply) => println!("{reply}"),
                        Err(e) => {
                            warn!("Command failed: {e:#}");
                            println!("error: {e:#}");
                        }
                    },
                    Err(e) => println!("error: {e:#}"),
                }
            }
        }
    }

    shutdown.cancel();
    engine.cleanup();
    info!("Goodbye");
    Ok(())
}

/// Drive the session clock in real time when there is no output device.
async fn pump_offline(session: Arc<AudioSession>, cancel_token: CancellationToken) {
    let frames = (u64::from(session.sample_rate()) * OFFLINE_PUMP.as_millis() as u64 / 1000) as usize;
    let mut interval = tokio::time::interval(OFFLINE_PUMP);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = interval.tick() => {
                if session.is_closed() {
                    break;
                }
                session.render_frames(frames);
            }
        }
    }
    if !session.is_closed() {
        error!("Offline pump stopped while the session was still open");
    }
}
