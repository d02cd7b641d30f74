//! Rallytime launcher
//!
//! - `serve`: HTTP snapshot/stream/append/clear, optionally with MQTT ingestion
//! - `ingest`: MQTT ingestion only
//! - `append`, `clear`, `show`, `tail`: operator tools on one gate partition
//! - `match`: attach tags read from stdin to a gate's finishes

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rallytime::RallytimeConfig;
use rallytime_ingest::{parse_timestamp, IngestStats, IngestWorker, MqttSource};
use rallytime_log::{spawn_tail, EventLog, TailEvent};
use rallytime_logging::{init_logging, LogConfig};
use rallytime_protocol::{GateId, LogRecord, PartitionKey};
use rallytime_timing::{Association, DecoderSession, Finish, FinishQueue, Key, KeyEvent};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rallytime", about = "Rally timing: gate pass log, live stream and tag matching")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.rallytime/rallytime.toml)
    #[arg(long, global = true, env = "RALLYTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_root` from the config file
    #[arg(long, global = true, env = "RALLYTIME_DATA_ROOT")]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Listen address (overrides http.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Also ingest passes from MQTT
        #[arg(long)]
        ingest: bool,
    },

    /// Ingest passes from MQTT until interrupted
    Ingest,

    /// Append one pass to today's partition
    Append {
        gate: String,

        /// Pass time, RFC 3339 (default: now)
        #[arg(long)]
        ts: Option<String>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Clear a gate partition
    Clear {
        gate: String,

        /// UTC day as YYYYMMDD (default: today)
        #[arg(long)]
        day: Option<String>,
    },

    /// Print a gate partition
    Show {
        gate: String,

        /// UTC day as YYYYMMDD (default: today)
        #[arg(long)]
        day: Option<String>,

        /// Print a JSON array instead of NDJSON
        #[arg(long)]
        json: bool,
    },

    /// Print new records of today's partition as they arrive
    Tail { gate: String },

    /// Tag today's finishes with tags read from stdin, one per line
    Match { gate: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "rallytime",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(rallytime_protocol::paths::default_config_path);
    let mut config = RallytimeConfig::load(&config_path)?;
    if let Some(data_root) = cli.data_root {
        config.data_root = data_root;
    }
    debug!("Data root: {}", config.data_root.display());

    match cli.command {
        Commands::Serve { bind, ingest } => cmd_serve(&config, bind, ingest).await,
        Commands::Ingest => cmd_ingest(&config).await,
        Commands::Append { gate, ts, tag } => cmd_append(&config, &gate, ts, tag),
        Commands::Clear { gate, day } => cmd_clear(&config, &gate, day),
        Commands::Show { gate, day, json } => cmd_show(&config, &gate, day, json),
        Commands::Tail { gate } => cmd_tail(&config, &gate).await,
        Commands::Match { gate } => cmd_match(&config, &gate).await,
    }
}

fn open_log(config: &RallytimeConfig) -> Result<Arc<EventLog>> {
    let log = EventLog::with_options(&config.data_root, config.log.options())
        .with_context(|| format!("Failed to open event log at {}", config.data_root.display()))?;
    Ok(Arc::new(log))
}

fn partition(gate: &str, day: Option<String>) -> Result<PartitionKey> {
    let gate = GateId::parse(gate)?;
    Ok(match day {
        Some(stamp) => PartitionKey::new(gate, PartitionKey::parse_day(&stamp)?),
        None => PartitionKey::today(gate),
    })
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down..."),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Services
// ============================================================================

type IngestHandle = (mpsc::Sender<()>, JoinHandle<IngestStats>);

fn start_ingest(config: &RallytimeConfig, log: Arc<EventLog>) -> Result<IngestHandle> {
    let options = config.mqtt.ingest_options()?;
    let source = MqttSource::new(config.mqtt.source_config());
    info!(
        "MQTT ingestion from {}:{} ({})",
        config.mqtt.host,
        config.mqtt.port,
        source.topic_filter()
    );
    let (worker, shutdown_tx) = IngestWorker::new(source, log, options);
    Ok((shutdown_tx, tokio::spawn(worker.run())))
}

async fn stop_ingest((shutdown_tx, handle): IngestHandle) -> Result<()> {
    let _ = shutdown_tx.send(()).await;
    let stats = handle.await.context("Ingestion task failed")?;
    debug!("Ingestion stats: {:?}", stats);
    Ok(())
}

async fn cmd_serve(config: &RallytimeConfig, bind: Option<String>, ingest: bool) -> Result<()> {
    let log = open_log(config)?;
    let bind = bind.unwrap_or_else(|| config.http.bind.clone());
    let state = rallytime::AppState::new(
        Arc::clone(&log),
        config.tail.options(),
        config.tail.retry_hint(),
    );

    let ingest = if ingest {
        Some(start_ingest(config, Arc::clone(&log))?)
    } else {
        None
    };

    let served = rallytime::serve(state, &bind, shutdown_signal()).await;
    if let Some(handle) = ingest {
        stop_ingest(handle).await?;
    }
    served
}

async fn cmd_ingest(config: &RallytimeConfig) -> Result<()> {
    let log = open_log(config)?;
    let handle = start_ingest(config, log)?;
    shutdown_signal().await;
    stop_ingest(handle).await
}

// ============================================================================
// Operator tools
// ============================================================================

fn cmd_append(
    config: &RallytimeConfig,
    gate: &str,
    ts: Option<String>,
    tag: Option<String>,
) -> Result<()> {
    let log = open_log(config)?;
    let key = partition(gate, None)?;
    let ts = match ts {
        Some(text) => parse_timestamp(&text)
            .with_context(|| format!("Invalid timestamp '{}', expected RFC 3339", text))?,
        None => Utc::now(),
    };

    let mut record = LogRecord::pass(key.gate_id.clone(), ts);
    record.tag = tag;
    log.append(&key, &record)?;
    print!("{}", record.to_ndjson_line()?);
    Ok(())
}

fn cmd_clear(config: &RallytimeConfig, gate: &str, day: Option<String>) -> Result<()> {
    let log = open_log(config)?;
    let key = partition(gate, day)?;
    log.truncate(&key)?;
    println!("Cleared {}", log.partition_path(&key).display());
    Ok(())
}

fn cmd_show(config: &RallytimeConfig, gate: &str, day: Option<String>, json: bool) -> Result<()> {
    let log = open_log(config)?;
    let key = partition(gate, day)?;
    let report = log.read_all_report(&key)?;
    if report.skipped > 0 {
        warn!("{}: skipped {} malformed lines", key, report.skipped);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report.records)?);
    } else {
        for record in &report.records {
            print!("{}", record.to_ndjson_line()?);
        }
    }
    Ok(())
}

async fn cmd_tail(config: &RallytimeConfig, gate: &str) -> Result<()> {
    let log = open_log(config)?;
    let key = partition(gate, None)?;
    let mut subscription = spawn_tail(log, key, config.tail.options())?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = subscription.recv() => match event {
                Some(TailEvent::Ready) => info!("Tailing {}", subscription.key()),
                Some(TailEvent::Line(line)) => println!("{}", line),
                Some(TailEvent::Error(message)) => warn!("Tail error: {}", message),
                None => break,
            },
        }
    }
    subscription.close().await;
    Ok(())
}

/// Feed one stdin line to the decoder as a reader burst followed by Enter.
///
/// Stdin is line buffered, so the real inter-key timing is lost; only the
/// length and character checks of the decoder apply here.
async fn feed_line(keys: &mpsc::Sender<KeyEvent>, line: &str) -> bool {
    let now = std::time::Instant::now();
    for ch in line.trim_end_matches('\r').chars() {
        if keys.send(KeyEvent::new(Key::Char(ch), now)).await.is_err() {
            return false;
        }
    }
    keys.send(KeyEvent::new(Key::Enter, now)).await.is_ok()
}

async fn cmd_match(config: &RallytimeConfig, gate: &str) -> Result<()> {
    let log = open_log(config)?;
    let key = partition(gate, None)?;
    let max_finishes = config.association.max_finishes;

    // Open the tail before reading the snapshot so a pass appended in
    // between is seen by exactly one of them.
    let mut subscription = spawn_tail(Arc::clone(&log), key.clone(), config.tail.options())?;
    let mut queue: FinishQueue = log
        .read_until(&key, subscription.start_offset())?
        .records
        .iter()
        .filter(|record| record.is_pass())
        .map(Finish::from)
        .collect();
    queue.trim(max_finishes);
    info!(
        "Matching tags for {}: {} finishes, {} untagged",
        key,
        queue.len(),
        queue.pending()
    );

    let mut session = DecoderSession::spawn(config.decoder.clone())?;
    let keys = session.key_sender();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,

            event = subscription.recv() => match event {
                Some(TailEvent::Line(line)) => match LogRecord::from_ndjson_line(&line) {
                    Ok(record) if record.is_pass() => {
                        queue.push(Finish::from(&record));
                        queue.trim(max_finishes);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping malformed line: {}", e),
                },
                Some(TailEvent::Ready) => debug!("Tail ready"),
                Some(TailEvent::Error(message)) => warn!("Tail error: {}", message),
                None => break,
            },

            tag = session.next_tag() => {
                let Some(tag) = tag else { break };
                match queue.associate_tag(&tag.value) {
                    Association::Assigned { index } => {
                        if let Some(tagged) = queue.get(index).and_then(Finish::tagged) {
                            println!("{}", serde_json::to_string(&tagged)?);
                        }
                    }
                    Association::AlreadyAssigned { .. } => {
                        info!("Tag {} already assigned", tag.value);
                    }
                    Association::Dropped => {
                        warn!("No untagged finish for tag {}", tag.value);
                    }
                }
            }

            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if !feed_line(&keys, &line).await {
                        break;
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    subscription.close().await;
    drop(keys);
    session.shutdown().await;
    Ok(())
}
