//! # presence-collector
//!
//! Collection point process: scans for beacons and streams `clientIn` /
//! `clientOut` messages to stdout as JSON lines.
//!
//! ## Running
//!
//! ```bash
//! # Development, replaying a capture
//! PRESENCE_SOURCE__KIND=replay PRESENCE_SOURCE__REPLAY_PATH=frames.jsonl \
//!     cargo run --package presence-collector
//!
//! # Production (live radio)
//! PRESENCE_ENV=production ./presence-collector
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use presence_core::{
    default_config_path, ChannelSink, CollectionPoint, ConfiguredSource, PresenceConfig,
    PresenceError, SourceKind,
};
use presence_collector::{logging, output};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Overrides the configuration file location.
const CONFIG_PATH_ENV: &str = "PRESENCE_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!("Starting presence-collector");

    let config_path =
        config_path().map_err(|err| report(err, "Failed to determine configuration path"))?;
    let config = PresenceConfig::load_or_init(&config_path).map_err(|err| {
        report(
            err,
            format!("Failed to load configuration from {}", config_path.display()),
        )
    })?;

    info!(
        collection_point = %config.collection_point.id,
        source = ?config.source.kind,
        policy = ?config.policy.kind,
        "Configuration loaded"
    );

    if config.source.kind == SourceKind::Bluez && !cfg!(feature = "bluetooth") {
        warn!("source.kind = \"bluez\" needs a build with `--features bluetooth`");
    }

    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(output::forward_messages(message_rx, tokio::io::stdout()));

    let point = CollectionPoint::new(&config, Arc::new(ChannelSink::new(message_tx)));
    let source = ConfiguredSource::open(&config.source)
        .await
        .map_err(|err| report(err.into(), "Failed to open frame source"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Received Ctrl-C");
        shutdown_tx.send_replace(true);
    });

    let result = point.run(source, shutdown_rx).await;
    info!(audit = ?point.audit(), "Final audit");

    // Dropping the point drops the last sink, which closes the writer's channel.
    drop(point);
    let written = writer.await.context("Output writer panicked")??;
    info!(written, "Stopped presence-collector");

    result.map_err(|err| report(err, "Collection point failed"))
}

fn config_path() -> presence_core::Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(default_config_path()?)
}

/// Log `err` with its code and operator hint, then wrap it for `main`.
fn report<C>(err: PresenceError, context: C) -> anyhow::Error
where
    C: std::fmt::Display + Send + Sync + 'static,
{
    error!(
        code = err.error_code(),
        fatal = err.is_fatal(),
        recoverable = err.is_recoverable(),
        hint = err.hint(),
        error = %err,
        "{context}"
    );
    anyhow::Error::new(err).context(context)
}
