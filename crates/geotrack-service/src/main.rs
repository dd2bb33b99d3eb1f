//! geotrack - offline location tracking agent.
//!
//! Run with: `cargo run -p geotrack-service -- run --input fixes.jsonl`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::BufReader;
use tracing::info;

use geotrack_core::{Schedule, local_now};
use geotrack_service::{AppState, Config, ReplaySource, Runner, default_config_path};
use geotrack_store::{LocationQuery, Store};

/// geotrack - offline location tracking agent.
#[derive(Parser, Debug)]
#[command(name = "geotrack")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Upload URL (overrides config).
    #[arg(short, long, global = true)]
    url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay fixes through the pipeline until input ends or Ctrl-C.
    Run {
        /// JSON-lines file of fixes (stdin when omitted).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Delay between fixes in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Print every pipeline event to stdout as JSON.
        #[arg(long)]
        print_events: bool,
    },

    /// Run one sync cycle.
    Flush,

    /// Show queue counts and tracking options.
    Status,

    /// Release every queue lock.
    Unlock,

    /// Apply the retention policy to the queue.
    Prune,

    /// List queued locations as JSON.
    Locations {
        /// Maximum number of records.
        #[arg(short = 'n', long)]
        limit: Option<u32>,

        /// Only records waiting for upload.
        #[arg(long, conflicts_with = "locked")]
        unlocked: bool,

        /// Only records held by a sync cycle.
        #[arg(long)]
        locked: bool,

        /// Newest records first.
        #[arg(long)]
        newest_first: bool,
    },

    /// Show the next schedule transition.
    Schedule {
        /// Evaluate at this RFC 3339 instant instead of now.
        #[arg(long)]
        at: Option<String>,

        /// Assume tracking is currently enabled.
        #[arg(long)]
        enabled: bool,
    },

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("geotrack_core=info".parse()?)
                .add_directive("geotrack_store=info".parse()?)
                .add_directive("geotrack_service=info".parse()?),
        )
        .init();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    if let Command::Init { force } = args.command {
        return init_config(&config_path, force);
    }

    let mut config = match &args.config {
        Some(path) => Config::load_validated(path)?,
        None => {
            let config = Config::load_default()?;
            config.validate()?;
            config
        }
    };
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    if let Some(url) = args.url {
        config.tracking.url = url;
    }

    match args.command {
        Command::Run {
            input,
            interval_ms,
            print_events,
        } => run(config, input, interval_ms, print_events).await,
        Command::Flush => flush(config).await,
        Command::Status => status(config).await,
        Command::Unlock => {
            let store = open_store(&config)?;
            let released = store.unlock_all()?;
            println!("Released {} lock(s)", released);
            Ok(())
        }
        Command::Prune => prune(config).await,
        Command::Locations {
            limit,
            unlocked,
            locked,
            newest_first,
        } => {
            let store = open_store(&config)?;
            let mut query = LocationQuery::new();
            if unlocked {
                query = query.unlocked();
            }
            if locked {
                query = query.locked();
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            if newest_first {
                query = query.newest_first();
            }
            let records = store.query(&query)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::Schedule { at, enabled } => schedule(config, at.as_deref(), enabled),
        Command::Init { .. } => Ok(()),
    }
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    Store::open(&config.storage.path)
        .with_context(|| format!("Failed to open database at {}", config.storage.path.display()))
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run(
    config: Config,
    input: Option<PathBuf>,
    interval_ms: Option<u64>,
    print_events: bool,
) -> anyhow::Result<()> {
    info!("Opening database at {:?}", config.storage.path);
    let store = open_store(&config)?;
    let state = AppState::new(store, config).context("Failed to build HTTP client")?;

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                state.shutdown.cancel();
            }
        });
    }

    if print_events {
        let mut events = state.events().subscribe();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                println!("{}", json);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => return,
                    },
                }
            }
        });
    }

    let runner = Runner::new(Arc::clone(&state));
    let summary = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let source = with_interval(ReplaySource::new(BufReader::new(file)), interval_ms);
            runner.run(source).await
        }
        None => {
            let source = with_interval(ReplaySource::new(BufReader::new(tokio::io::stdin())), interval_ms);
            runner.run(source).await
        }
    };

    let odometer = state.config().read().await.odometer;
    eprintln!(
        "accepted={} discarded={} rejected={} odometer={:.3}km",
        summary.accepted, summary.discarded, summary.rejected, odometer
    );
    if let Some(outcome) = summary.final_sync {
        eprintln!("final sync: {:?}", outcome);
    }
    Ok(())
}

fn with_interval<R>(source: ReplaySource<R>, interval_ms: Option<u64>) -> ReplaySource<R>
where
    R: tokio::io::AsyncBufRead + Unpin + Send,
{
    match interval_ms {
        Some(ms) => source.with_interval(Duration::from_millis(ms)),
        None => source,
    }
}

async fn flush(config: Config) -> anyhow::Result<()> {
    if config.tracking.url.is_empty() {
        anyhow::bail!("No upload URL configured (set tracking.url or pass --url)");
    }
    let store = open_store(&config)?;
    let state = AppState::new(store, config).context("Failed to build HTTP client")?;
    let outcome = state.tracker.sync_engine().sync().await;
    println!("{:?}", outcome);
    Ok(())
}

async fn status(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let counts = store.counts()?;
    let tracking = &config.tracking;

    println!("Database:     {}", config.storage.path.display());
    println!("Queued:       {} ({} unlocked, {} locked)", counts.total, counts.unlocked, counts.locked);
    println!(
        "Upload:       {} {}",
        tracking.method,
        if tracking.url.is_empty() { "(no url)" } else { tracking.url.as_str() }
    );
    println!(
        "Batching:     {} (max {}, threshold {})",
        if tracking.batch_sync { "on" } else { "off" },
        tracking.max_batch_size,
        tracking.auto_sync_threshold
    );
    println!(
        "Retention:    {} day(s), {} record(s)",
        tracking.max_days_to_persist, tracking.max_records_to_persist
    );
    println!("Schedule:     {} window(s)", tracking.schedule.len());
    Ok(())
}

async fn prune(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let state = AppState::new(store, config).context("Failed to build HTTP client")?;
    let report = state.prune().await?;
    println!("Removed {} record(s), {} remaining", report.removed, report.remaining);
    Ok(())
}

fn schedule(config: Config, at: Option<&str>, enabled: bool) -> anyhow::Result<()> {
    let now = match at {
        Some(at) => OffsetDateTime::parse(at, &Rfc3339).with_context(|| format!("Invalid instant '{}'", at))?,
        None => local_now(),
    };
    let (schedule, errors) = Schedule::parse_all(&config.tracking.schedule);
    for error in &errors {
        eprintln!("warning: {}", error);
    }
    if schedule.is_empty() {
        println!("No schedule configured");
        return Ok(());
    }

    match schedule.next_transition(now, enabled) {
        Some(t) => {
            let when = t.fire_at.format(&Rfc3339)?;
            let action = if t.enabled { "enable" } else { "disable" };
            if t.fire_at == now {
                println!("{} tracking now ({})", action, t.tracking_mode);
            } else {
                println!("{} tracking at {} ({})", action, when, t.tracking_mode);
            }
        }
        None => println!("No transition within the next 7 days"),
    }
    Ok(())
}
