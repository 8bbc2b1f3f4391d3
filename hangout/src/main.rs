//! hangout-sync - inspect and replay the realtime sync pipeline
//!
//! Uses XDG Base Directory specification for file locations:
//! - Logs: $XDG_STATE_HOME/hangout/hangout.log (~/.local/state/hangout/hangout.log)
//! - Config: $XDG_CONFIG_HOME/hangout/config.toml (~/.config/hangout/config.toml)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hangout_core::format::{badge_label, format_relative_time};
use hangout_core::replay::{load_changes, load_snapshot, parse_domains};
use hangout_core::{
    Collection, Config, DataSource, Domain, LocalTransport, MemoryDataSource, RestDataSource,
    Section, Session, StateStore, SyncService, UnreadCounts,
};

#[derive(Parser)]
#[command(name = "hangout-sync")]
#[command(about = "Inspect and replay the hangout realtime sync pipeline")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and readiness
    Status {
        /// Also check that the backend answers
        #[arg(long)]
        check: bool,
    },

    /// Fetch every domain from the backend and print unread counts
    Fetch {
        /// Comma-separated domains (default: all configured)
        #[arg(long)]
        domain: Option<String>,

        /// Session access token
        #[arg(long, env = "HANGOUT_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Replay a captured change stream against a snapshot
    Replay {
        /// JSON snapshot: {"plans": [...], "friends": [...], ...}
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// JSONL change stream, one event per line
        #[arg(long)]
        events: PathBuf,

        /// Print every record after the replay
        #[arg(long)]
        records: bool,
    },

    /// Replay a change stream and print counts as they change until Ctrl+C
    Watch {
        #[arg(long)]
        snapshot: Option<PathBuf>,

        #[arg(long)]
        events: PathBuf,

        /// Delay between replayed events in milliseconds
        #[arg(long, default_value = "500")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        hangout_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("hangout-sync starting");

    match args.command {
        Command::Status { check } => run_status(&config, check).await,
        Command::Fetch { domain, token } => run_fetch(&config, domain.as_deref(), token).await,
        Command::Replay {
            snapshot,
            events,
            records,
        } => run_replay(&config, snapshot.as_deref(), &events, records).await,
        Command::Watch {
            snapshot,
            events,
            interval,
        } => run_watch(&config, snapshot.as_deref(), &events, interval).await,
    }
}

async fn run_status(config: &Config, check: bool) -> Result<()> {
    let config_path = Config::config_path();
    println!(
        "Config: {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (not found, using defaults)" }
    );
    println!("Logs: {}", hangout_core::logging::log_file_path().display());

    match (&config.backend.url, config.backend.is_ready()) {
        (Some(url), true) => println!("Backend: {} (ready)", url),
        (Some(url), false) => println!("Backend: {} (missing anon_key)", url),
        (None, _) => println!("Backend: not configured"),
    }
    if check {
        let source =
            RestDataSource::new(config.backend.clone()).context("backend is not configured")?;
        let reachable = source
            .health_check()
            .await
            .context("failed to check backend")?;
        println!("Reachable: {}", if reachable { "yes" } else { "no" });
    }

    let realtime = &config.realtime;
    let domains: Vec<&str> = realtime.domains.iter().map(Domain::as_str).collect();
    println!("Domains: {}", domains.join(", "));
    for domain in &realtime.domains {
        let filter = config.backend.filter_for(*domain).unwrap_or("-");
        println!(
            "  {:<14} table={} filter={}",
            domain.as_str(),
            config.backend.table_for(*domain),
            filter
        );
    }
    println!("Debounce: {}ms", realtime.debounce_ms);
    println!(
        "Reconnect backoff: {}ms .. {}ms",
        realtime.backoff_initial_ms, realtime.backoff_max_ms
    );
    match realtime.backstop_interval() {
        Some(interval) => println!("Backstop reload: every {}s", interval.as_secs()),
        None => println!("Backstop reload: disabled"),
    }
    Ok(())
}

async fn run_fetch(config: &Config, domain: Option<&str>, token: Option<String>) -> Result<()> {
    let domains = match domain {
        Some(list) => parse_domains(list).context("invalid --domain")?,
        None => config.realtime.domains.clone(),
    };
    let source =
        RestDataSource::new(config.backend.clone()).context("backend is not configured")?;
    if let Some(token) = token {
        source.set_session(Some(&Session::new(token)));
    }

    let store = StateStore::new();
    for domain in &domains {
        let records = source
            .fetch_all(*domain, config.backend.filter_for(*domain))
            .await
            .with_context(|| format!("failed to fetch {}", domain))?;
        println!("Fetched {} {}", records.len(), domain);
        store.replace(*domain, records);
    }

    println!();
    print_counts(&store.unread_counts());
    Ok(())
}

/// Service over an in-process transport, seeded from a snapshot file
struct ReplaySetup {
    service: SyncService,
    transport: LocalTransport,
    events: Vec<hangout_core::ChangeEvent>,
}

async fn prepare_replay(
    config: &Config,
    snapshot: Option<&Path>,
    events: &Path,
) -> Result<ReplaySetup> {
    let source = Arc::new(MemoryDataSource::new());
    if let Some(path) = snapshot {
        let rows = load_snapshot(path)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?;
        for (domain, records) in rows {
            source.set(domain, records);
        }
    }

    let log = load_changes(events)
        .with_context(|| format!("failed to load events {}", events.display()))?;
    for warning in &log.warnings {
        eprintln!("warning: {}", warning);
    }

    // Room for the whole stream, so a fast publisher never laps a channel.
    let capacity = log.events.len().max(LocalTransport::DEFAULT_CAPACITY);
    let transport = LocalTransport::new(capacity);
    let service = SyncService::new(
        config,
        Arc::new(transport.clone()),
        source as Arc<dyn DataSource>,
    )
    .context("invalid realtime configuration")?;

    // The first reload of each domain lands once its channel is up.
    let mut initial: BTreeMap<Domain, _> = config
        .realtime
        .domains
        .iter()
        .map(|domain| (*domain, service.subscribe_to_collection(*domain)))
        .collect();
    service.on_session_acquired(Session::new("replay"));

    let timeout = config.realtime.debounce_window() + Duration::from_secs(10);
    for (domain, receiver) in initial.iter_mut() {
        tokio::time::timeout(timeout, receiver.changed())
            .await
            .with_context(|| format!("timed out loading {}", domain))?
            .with_context(|| format!("collection channel closed for {}", domain))?;
    }

    Ok(ReplaySetup {
        service,
        transport,
        events: log.events,
    })
}

async fn run_replay(
    config: &Config,
    snapshot: Option<&Path>,
    events: &Path,
    show_records: bool,
) -> Result<()> {
    let setup = prepare_replay(config, snapshot, events).await?;
    let total = setup.events.len();
    let reloads_before = requested_reloads(config, &setup.service);

    let mut skipped = 0;
    for event in setup.events {
        if setup.transport.publish(event) == 0 {
            skipped += 1;
        }
        tokio::task::yield_now().await;
    }
    // Let the channel tasks drain.
    tokio::time::sleep(Duration::from_millis(250)).await;

    // A gap schedules a reload; wait for it so the counts below are settled.
    let gap_reloads = requested_reloads(config, &setup.service) - reloads_before;
    if gap_reloads > 0 {
        tokio::time::sleep(config.realtime.debounce_window() + Duration::from_millis(250)).await;
    }

    println!("Replayed {} event(s)", total - skipped);
    if skipped > 0 {
        println!("Skipped {} event(s) for domains not subscribed", skipped);
    }
    if gap_reloads > 0 {
        println!(
            "Warning: a channel fell behind; {} reload(s) replaced replayed state from the snapshot",
            gap_reloads
        );
    }
    println!();
    print_counts(&setup.service.unread_counts());

    if show_records {
        for domain in &config.realtime.domains {
            print_collection(*domain, &setup.service.collection(*domain));
        }
    }

    setup.service.on_session_lost();
    Ok(())
}

/// Reload requests so far across the configured domains
fn requested_reloads(config: &Config, service: &SyncService) -> usize {
    config
        .realtime
        .domains
        .iter()
        .map(|domain| service.refresh_stats(*domain).requested)
        .sum()
}

async fn run_watch(
    config: &Config,
    snapshot: Option<&Path>,
    events: &Path,
    interval: u64,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let setup = prepare_replay(config, snapshot, events).await?;
    let mut counts = setup.service.watch_unread_counts();
    println!("Watching (Ctrl+C to stop)");
    print_counts(&counts.borrow_and_update());

    let mut pending = setup.events.into_iter();
    let mut ticker = tokio::time::interval(Duration::from_millis(interval.max(1)));

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            changed = counts.changed() => {
                if changed.is_err() {
                    bail!("unread counts channel closed");
                }
                println!("[{}]", setup.service.connection_signal());
                print_counts(&counts.borrow_and_update());
            }
            _ = ticker.tick() => {
                if let Some(event) = pending.next() {
                    tracing::debug!(domain = %event.domain, id = %event.entity_id, "Replaying event");
                    setup.transport.publish(event);
                }
            }
        }
    }

    println!("\nStopping...");
    setup.service.on_session_lost();
    tracing::info!("hangout-sync watch stopped");
    Ok(())
}

fn print_counts(counts: &UnreadCounts) {
    println!("Unread:");
    for section in Section::ALL {
        let count = counts.get(section);
        let badge = badge_label(count)
            .map(|label| format!("  ({})", label))
            .unwrap_or_default();
        println!("  {:<14} {:>5}{}", section.as_str(), count, badge);
    }
    println!("  {:<14} {:>5}", "total", counts.total());
}

fn print_collection(domain: Domain, collection: &Collection) {
    println!("\n{} ({})", domain, collection.len());
    for record in collection.records() {
        let marker = if record.is_unread() { "*" } else { " " };
        let label = record
            .str_field("title")
            .or_else(|| record.str_field("name"))
            .unwrap_or("");
        let updated = record
            .updated_at()
            .map(format_relative_time)
            .unwrap_or_default();
        println!("  {} {:<12} {:<30} {}", marker, record.id, label, updated);
    }
}
