//! ksbus CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use ksbus_client::{BusClient, BusConfig};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long to wait for the server to answer the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize minimal tracing for CLI
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let cli = Cli::parse();
    let config = base_config(&cli);

    match cli.command {
        Commands::Listen { topics, count } => listen(config, topics, count).await,
        Commands::Publish { topic, payload } => {
            let client = open(config).await?;
            client.publish(&topic, &payload)?;
            client.close().await?;
            Ok(())
        }
        Commands::Send { id, payload } => {
            let client = open(config).await?;
            client.publish_to_id(&id, &payload)?;
            client.close().await?;
            Ok(())
        }
        Commands::Request {
            topic,
            payload,
            timeout_ms,
        } => {
            let client = open(config.reply_timeout(Duration::from_millis(timeout_ms))).await?;
            let reply = client.request(&topic, &payload).await;
            client.close().await?;
            print_json(&reply.with_context(|| format!("No reply on {}", topic))?.into_value())
        }
        Commands::RequestId {
            id,
            payload,
            timeout_ms,
        } => {
            let client = open(config.reply_timeout(Duration::from_millis(timeout_ms))).await?;
            let reply = client.request_id(&id, &payload).await;
            client.close().await?;
            print_json(&reply.with_context(|| format!("No reply from {}", id))?.into_value())
        }
    }
}

fn base_config(cli: &Cli) -> BusConfig {
    let mut config = BusConfig::new(cli.address.clone()).path(cli.path.clone());
    if let Some(id) = &cli.id {
        config = config.id(id.clone());
    }
    if cli.secure {
        config = config.secure();
    }
    if cli.auto_restart {
        config = config.auto_restart(Duration::from_secs(cli.restart_every));
    }
    config
}

/// Connect and wait for the handshake to complete
async fn open(config: BusConfig) -> Result<BusClient> {
    let (open_tx, mut open_rx) = mpsc::unbounded_channel();
    let config = config.on_open(move |_| {
        let _ = open_tx.send(());
    });

    let url = config.url();
    let client = BusClient::new(config);
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, open_rx.recv())
        .await
        .context("Server did not answer the handshake")?;
    debug!(id = %client.id(), "Handshake complete");

    Ok(client)
}

async fn listen(config: BusConfig, topics: Vec<String>, count: Option<usize>) -> Result<()> {
    let client = open(config).await?;
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();

    for topic in &topics {
        let tx = msg_tx.clone();
        client.subscribe(topic, move |msg, _| {
            let _ = tx.send(msg.clone());
        })?;
    }
    info!("Listening on {}", topics.join(", "));

    let mut seen = 0usize;
    loop {
        tokio::select! {
            msg = msg_rx.recv() => {
                let Some(msg) = msg else { break };
                print_json(&msg.into_value())?;
                seen += 1;
                if count.is_some_and(|n| seen >= n) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await?;
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
