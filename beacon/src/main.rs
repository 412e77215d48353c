//! beacon - CLI tool for the local telemetry queue
//!
//! This tool provides commands for:
//! - Checking collector configuration and queue health
//! - Tracking a one-off event into the durable queue
//! - Flushing queued events to the collector
//! - Inspecting, replaying and purging dead letters
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/beacon/queue.db (~/.local/share/beacon/queue.db)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)
//! - Logs: $XDG_STATE_HOME/beacon/beacon.log (~/.local/state/beacon/beacon.log)

use anyhow::{bail, Context, Result};
use beacon_core::{
    Config, HttpNetwork, Properties, PropertyValue, SqliteStorage, TelemetryClient, TrackOutcome,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Inspect and flush the beacon telemetry queue")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show collector configuration and queue status
    Status,

    /// Durably enqueue one event
    Track {
        /// Event name (lowercase snake_case)
        name: String,

        /// Property as key=value (repeatable)
        #[arg(short, long = "prop", value_name = "KEY=VALUE")]
        prop: Vec<String>,
    },

    /// Send queued events to the collector
    Flush,

    /// Inspect and manage dead letters
    #[command(subcommand)]
    DeadLetters(DeadLettersCommand),
}

#[derive(Subcommand)]
enum DeadLettersCommand {
    /// List dead letters, oldest first
    List {
        /// Maximum number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Put a dead letter back in the queue
    Replay {
        /// Event id of the dead letter
        event_id: Uuid,
    },

    /// Drop dead letters older than the given age
    Purge {
        /// Age threshold in hours
        #[arg(long, default_value_t = 72)]
        older_than_hours: i64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async move {
        match args.command {
            Command::Status => cmd_status(config).await,
            Command::Track { name, prop } => cmd_track(config, &name, &prop).await,
            Command::Flush => cmd_flush(config).await,
            Command::DeadLetters(command) => cmd_dead_letters(config, command).await,
        }
    })
}

/// Start a client over the local queue.
///
/// With `online == false` the collector endpoint is cleared so nothing is
/// sent, not even by the final flush at shutdown.
async fn open_client(mut config: Config, online: bool) -> Result<TelemetryClient> {
    if !online {
        config.collector.server_url = None;
    }
    let storage = Arc::new(
        SqliteStorage::open(&Config::database_path()).context("failed to open queue database")?,
    );
    let network = Arc::new(HttpNetwork::new().context("failed to create HTTP client")?);

    let client = TelemetryClient::builder(storage, network)
        .pre_init_capacity(config.scheduler.pre_init_capacity)
        .build();
    client
        .initialize(config)
        .await
        .context("failed to initialize telemetry client")?;
    Ok(client)
}

async fn cmd_status(config: Config) -> Result<()> {
    println!("Beacon Collector Configuration");
    println!("==============================");
    println!();

    let collector = &config.collector;
    println!(
        "Server URL:      {}",
        collector.server_url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Collector ID:    {}",
        collector.collector_id.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if collector.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Batch Size:      {}", config.queue.batch_max_events);
    println!("Flush Interval:  {}s", config.scheduler.flush_interval_secs);
    println!("Max Retries:     {}", config.transport.max_retries);
    println!("Queue Capacity:  {}", config.queue.capacity);

    println!();
    if collector.is_ready() {
        println!("Status: Ready to publish");
    } else {
        println!("Status: Not ready (missing server_url)");
        println!();
        println!("Configure the collector in config.toml:");
        println!();
        println!("  [collector]");
        println!("  server_url = \"https://collector.example.com\"");
        println!("  api_key = \"bk_live_xxxxxxxxxxxx\"");
    }

    let db_path = Config::database_path();
    if !db_path.exists() {
        println!();
        println!("Queue database not found at {}", db_path.display());
        return Ok(());
    }

    let client = open_client(config, false).await?;
    let diagnostics = client.diagnostics();
    client.shutdown().await;

    println!();
    println!("Queue Size:      {}", diagnostics.queue_size);
    println!("Dead Letters:    {}", diagnostics.dlq_size);
    println!("Circuit:         {}", diagnostics.circuit_state);

    Ok(())
}

async fn cmd_track(config: Config, name: &str, props: &[String]) -> Result<()> {
    let properties = parse_props(props)?;

    let client = open_client(config, false).await?;
    let outcome = client.track(name, properties);
    client.shutdown().await;

    match outcome {
        TrackOutcome::Enqueued(event_id) => {
            println!("Enqueued {}", event_id);
            Ok(())
        }
        TrackOutcome::Suppressed => {
            println!("Suppressed (duplicate)");
            Ok(())
        }
        TrackOutcome::Dropped(reason) => bail!("event dropped: {}", reason),
        TrackOutcome::Buffered => bail!("client was not initialized"),
    }
}

async fn cmd_flush(config: Config) -> Result<()> {
    if !config.collector.is_ready() {
        println!("Collector is not configured. Run 'status' for details.");
        return Ok(());
    }

    let client = open_client(config, true).await?;
    let queued = client.diagnostics().queue_size;
    if queued == 0 {
        println!("No pending events to flush.");
        client.shutdown().await;
        return Ok(());
    }

    println!("Flushing {} pending event(s)...", queued);

    let result = client.flush().await;
    let diagnostics = client.diagnostics();
    client.shutdown().await;
    let result = result.context("flush failed")?;
    tracing::debug!(outcome = ?result.outcome, batches = result.batches, "Flush finished");

    println!("Flushed {} event(s)", result.acked);
    if result.requeued > 0 {
        println!("Requeued:        {}", result.requeued);
    }
    if result.dead_lettered > 0 {
        println!("Dead-lettered:   {}", result.dead_lettered);
    }
    println!("Remaining:       {}", diagnostics.queue_size);
    println!("Circuit:         {}", diagnostics.circuit_state);

    Ok(())
}

async fn cmd_dead_letters(config: Config, command: DeadLettersCommand) -> Result<()> {
    let client = open_client(config, false).await?;
    let outcome = run_dead_letters(&client, command);
    client.shutdown().await;
    outcome
}

fn run_dead_letters(client: &TelemetryClient, command: DeadLettersCommand) -> Result<()> {
    match command {
        DeadLettersCommand::List { limit } => {
            let entries = client.dead_letters(limit)?;
            if entries.is_empty() {
                println!("No dead letters.");
                return Ok(());
            }

            println!(
                "{:<38} {:<24} {:>8} {:<20}",
                "Event ID", "Name", "Attempts", "Reason"
            );
            println!("{:-<92}", "");
            for dead in entries {
                println!(
                    "{:<38} {:<24} {:>8} {:<20}",
                    dead.event_id(),
                    dead.entry.event.name,
                    dead.entry.attempt_count,
                    dead.reason
                );
            }
        }
        DeadLettersCommand::Replay { event_id } => {
            client
                .replay_dead_letter(event_id)
                .with_context(|| format!("failed to replay {}", event_id))?;
            println!("Replayed {}", event_id);
        }
        DeadLettersCommand::Purge { older_than_hours } => {
            let removed = client.purge_dead_letters(chrono::Duration::hours(older_than_hours))?;
            println!("Purged {} dead letter(s)", removed);
        }
    }
    Ok(())
}

/// Parse `key=value` pairs. Values that read as a bool or a number keep
/// that type; everything else is a string.
fn parse_props(pairs: &[String]) -> Result<Properties> {
    let mut properties = Properties::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid property {:?}, expected key=value", pair);
        };
        if key.is_empty() {
            bail!("invalid property {:?}, empty key", pair);
        }
        properties.insert(key.to_string(), parse_value(value));
    }
    Ok(properties)
}

fn parse_value(value: &str) -> PropertyValue {
    if let Ok(b) = value.parse::<bool>() {
        return PropertyValue::Bool(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return PropertyValue::Int(i);
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() => PropertyValue::Float(f),
        _ => PropertyValue::String(value.to_string()),
    }
}
