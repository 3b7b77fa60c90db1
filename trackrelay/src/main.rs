//! trackrelay - offline-resilient analytics event relay
//!
//! Delivers tracking events to the collector and, when that fails, keeps
//! them in a durable queue until a sync signal resends them.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/trackrelay/queue.db (~/.local/share/trackrelay/queue.db)
//! - Logs: $XDG_STATE_HOME/trackrelay/trackrelay.log.YYYY-MM-DD (~/.local/state/trackrelay/)
//! - Config: $XDG_CONFIG_HOME/trackrelay/config.toml (~/.config/trackrelay/config.toml)

mod process_lock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use process_lock::acquire_queue_guard;
use tokio::io::{AsyncBufReadExt, BufReader};
use trackrelay_core::logging::{self, LogOutput};
use trackrelay_core::source::TrackingContext;
use trackrelay_core::{
    Config, DrainReport, EventQueue, InboundMessage, MessageOutcome, Payload, QueueStore, Relay,
};

/// How often the run loop checks the Ctrl+C flag while idle
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "trackrelay")]
#[command(about = "Offline-resilient analytics event relay")]
#[command(version)]
struct Args {
    /// Log to the state directory and echo to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay NDJSON messages from stdin until EOF or Ctrl+C
    Run,

    /// Show configuration and queue depth
    Status,

    /// List queued events, oldest first
    List,

    /// Resend queued events now
    Drain,

    /// Remove queued events older than the retention window
    Sweep {
        /// Retention window in days (default: from config)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Submit one custom event
    Send {
        /// Event name
        event: String,

        /// Website the event belongs to
        #[arg(long, default_value = "cli")]
        website_id: String,

        /// Endpoint tag (default: the event endpoint)
        #[arg(long)]
        tag: Option<String>,

        /// Page URL recorded with the event
        #[arg(long, default_value = "")]
        url: String,

        /// Page path recorded with the event
        #[arg(long, default_value = "/")]
        path: String,

        /// Event properties as a JSON object
        #[arg(long)]
        properties: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    // The relay loop always logs to file; one-shot commands only with --verbose
    let log_output = match (&args.command, args.verbose) {
        (Command::Run, _) => Some(LogOutput::File),
        (_, true) => Some(LogOutput::FileAndStderr),
        (_, false) => None,
    };
    let _log_guard = match log_output {
        Some(output) => Some(
            logging::init(&config.logging, output).context("failed to initialize logging")?,
        ),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    let result = runtime.block_on(async {
        match args.command {
            Command::Run => cmd_run(&config).await,
            Command::Status => cmd_status(&config).await,
            Command::List => cmd_list(&config).await,
            Command::Drain => cmd_drain(&config).await,
            Command::Sweep { days } => cmd_sweep(&config, days).await,
            Command::Send {
                event,
                website_id,
                tag,
                url,
                path,
                properties,
            } => {
                cmd_send(
                    &config,
                    SendArgs {
                        event,
                        website_id,
                        tag,
                        url,
                        path,
                        properties,
                    },
                )
                .await
            }
        }
    });

    // A blocked stdin read must not hold the process open
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn cmd_run(config: &Config) -> Result<()> {
    let queue_path = config.queue_path();
    let _queue_guard = acquire_queue_guard(&queue_path).context("failed to acquire process lock")?;

    tracing::info!(path = %queue_path.display(), "trackrelay starting");

    let relay = Relay::from_config(config).context("failed to start relay")?;
    let pending = relay.activate().await;

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    eprintln!(
        "Relay active ({} queued, sync every {}s). Reading messages from stdin.",
        pending,
        config.relay.sync_interval().as_secs()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sync_tick = tokio::time::interval(config.relay.sync_interval());
    let mut shutdown_poll = tokio::time::interval(SHUTDOWN_POLL);

    // Each operation runs to completion; the flag is only checked between them
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let outcome = relay.handle_line(&line).await;
                    print_outcome(&outcome);
                }
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = sync_tick.tick() => {
                if let Some(report) = relay.tick().await {
                    print_drain(&report);
                }
            }
            _ = shutdown_poll.tick() => {}
        }
    }

    if relay.trigger().is_pending() {
        tracing::info!("Running final drain before exit");
        if let Some(report) = relay.tick().await {
            print_drain(&report);
        }
    }

    let stats = relay.pipeline().stats();
    eprintln!(
        "Relay stopped: {} delivered, {} queued, {} dropped, {} resent, {} aged out",
        stats.delivered, stats.queued, stats.dropped, stats.resent, stats.aged_out
    );
    tracing::info!(?stats, "trackrelay stopped");

    Ok(())
}

fn print_outcome(outcome: &MessageOutcome) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    match outcome {
        MessageOutcome::Delivered => println!("[{}] delivered", timestamp),
        MessageOutcome::Queued => println!("[{}] queued", timestamp),
        MessageOutcome::Synced(report) => print_drain(report),
        MessageOutcome::Ignored => {}
    }
}

fn print_drain(report: &DrainReport) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    if report.coalesced() {
        println!("[{}] sync: drain already running", timestamp);
        return;
    }
    println!(
        "[{}] sync: {} resent, {} aged out, {} remaining",
        timestamp, report.resent, report.aged_out, report.remaining
    );
}

async fn cmd_status(config: &Config) -> Result<()> {
    let relay = &config.relay;
    let queue_path = config.queue_path();

    println!("trackrelay Configuration");
    println!("========================");
    println!();
    println!("Base endpoint:    {}", relay.base_endpoint);
    println!("Default endpoint: {}", relay.default_endpoint);
    println!("Timeout:          {}s", relay.timeout_secs);
    println!("Retention:        {} days", relay.retention_days);
    println!("Sync tag:         {}", relay.sync_tag);
    println!("Sync interval:    {}s", relay.sync_interval_secs);
    println!("Config file:      {}", Config::config_path().display());
    println!("Queue:            {}", queue_path.display());
    println!("Logs:             {}", Config::state_dir().display());
    println!();

    if !queue_path.exists() {
        println!("Queued events:    0 (queue not created yet)");
        return Ok(());
    }

    let store = QueueStore::open(&queue_path).context("failed to open queue")?;
    let depth = store.len().await.context("failed to read queue")?;
    println!("Queued events:    {}", depth);

    Ok(())
}

async fn cmd_list(config: &Config) -> Result<()> {
    let queue_path = config.queue_path();
    if !queue_path.exists() {
        println!("No queued events.");
        return Ok(());
    }

    let store = QueueStore::open(&queue_path).context("failed to open queue")?;
    let records = store.list_all().await.context("failed to read queue")?;

    if records.is_empty() {
        println!("No queued events.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<26}  {:<16}  {:<6}  EVENT",
        "ID", "TIMESTAMP", "SOURCE", "RESENT"
    );
    for record in &records {
        println!(
            "{:>6}  {:<26}  {:<16}  {:<6}  {}",
            record.id,
            record.timestamp,
            record.source.as_deref().unwrap_or("-"),
            if record.resent { "yes" } else { "no" },
            record.event_name()
        );
    }
    println!();
    println!("{} queued event(s)", records.len());

    Ok(())
}

async fn cmd_drain(config: &Config) -> Result<()> {
    let _queue_guard =
        acquire_queue_guard(&config.queue_path()).context("failed to acquire process lock")?;

    let relay = Relay::from_config(config).context("failed to start relay")?;
    let report = relay.pipeline().drain().await;

    println!("Drain complete:");
    println!("  Resent:     {}", report.resent);
    println!("  Aged out:   {}", report.aged_out);
    println!("  Remaining:  {}", report.remaining);
    if let Some(id) = report.stopped_at {
        println!("  Stopped at: #{} (will retry later)", id);
    }

    Ok(())
}

async fn cmd_sweep(config: &Config, days: Option<u32>) -> Result<()> {
    let queue_path = config.queue_path();
    let _queue_guard = acquire_queue_guard(&queue_path).context("failed to acquire process lock")?;

    let mut relay_config = config.relay.clone();
    if let Some(days) = days {
        relay_config.retention_days = days;
    }
    relay_config
        .validate()
        .context("invalid retention window")?;

    let store = QueueStore::open(&queue_path).context("failed to open queue")?;
    let cutoff = relay_config.retention_cutoff(chrono::Utc::now());
    let removed = store
        .age_sweep(cutoff)
        .await
        .context("failed to sweep queue")?;

    println!(
        "Removed {} event(s) older than {} days",
        removed, relay_config.retention_days
    );

    Ok(())
}

struct SendArgs {
    event: String,
    website_id: String,
    tag: Option<String>,
    url: String,
    path: String,
    properties: Option<String>,
}

async fn cmd_send(config: &Config, args: SendArgs) -> Result<()> {
    let _queue_guard =
        acquire_queue_guard(&config.queue_path()).context("failed to acquire process lock")?;

    let mut event = TrackingContext::new(args.website_id).custom(&args.event, &args.url, &args.path);
    if let Some(raw) = args.properties.as_deref() {
        let properties: Payload =
            serde_json::from_str(raw).context("--properties must be a JSON object")?;
        event = event.with_properties(properties);
    }

    let endpoint = args.tag.unwrap_or_else(|| event.endpoint().to_string());
    let message = InboundMessage::Track {
        endpoint: Some(endpoint.clone()),
        tracking_data: Some(serde_json::Value::Object(event.into_payload())),
    };

    let relay = Relay::from_config(config).context("failed to start relay")?;
    match relay.handle_message(message).await {
        MessageOutcome::Delivered => println!("Delivered '{}' to {}", args.event, endpoint),
        MessageOutcome::Queued if relay.pipeline().stats().dropped > 0 => {
            println!("Dropped '{}': queue unavailable", args.event)
        }
        MessageOutcome::Queued => {
            let pending = relay.pipeline().queue().len().await.unwrap_or(0);
            println!("Queued '{}' ({} pending)", args.event, pending);
        }
        other => anyhow::bail!("unexpected outcome for send: {:?}", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_send() {
        let args = Args::try_parse_from([
            "trackrelay",
            "send",
            "signup",
            "--website-id",
            "site-1",
            "--properties",
            r#"{"plan":"pro"}"#,
        ])
        .unwrap();
        match args.command {
            Command::Send {
                event,
                website_id,
                tag,
                ..
            } => {
                assert_eq!(event, "signup");
                assert_eq!(website_id, "site-1");
                assert!(tag.is_none());
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_args_parse_sweep_days() {
        let args = Args::try_parse_from(["trackrelay", "-v", "sweep", "--days", "3"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(args.command, Command::Sweep { days: Some(3) }));
    }
}
