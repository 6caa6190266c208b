use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use procwatch_monitor::live_ui::{format_details, format_table, LiveView};
use procwatch_monitor::{MonitorService, Query};
use procwatch_shared::logging::{self, LogCategory};
use procwatch_shared::{log_debug, Config, SortKey, TerminateOutcome};

#[derive(Parser)]
#[command(name = "procwatch")]
#[command(about = "Sample, rank and terminate processes from /proc")]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: auto-detected .procwatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Listing {
    /// Sort key: cpu, memory, pid or name
    #[arg(long)]
    sort: Option<SortKey>,

    /// Maximum number of rows
    #[arg(long)]
    limit: Option<usize>,

    /// Print one JSON object per row
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Live ranked view, refreshed every interval until Ctrl+C
    Watch {
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        sort: Option<SortKey>,
        /// Case-insensitive command name substring
        #[arg(long)]
        filter: Option<String>,
        /// Only processes owned by this user
        #[arg(long)]
        user: Option<String>,
    },
    /// Top processes from a single sample
    Top {
        #[command(flatten)]
        listing: Listing,
    },
    /// All processes, optionally for one user
    Ps {
        #[arg(long)]
        user: Option<String>,
        #[command(flatten)]
        listing: Listing,
    },
    /// Processes whose command name contains NAME
    Find {
        name: String,
        #[command(flatten)]
        listing: Listing,
    },
    /// Details of one process
    Info {
        pid: u32,
        #[arg(long)]
        json: bool,
    },
    /// Terminate a process: SIGTERM, then SIGKILL after the grace period
    Kill {
        pid: u32,
        /// Seconds to wait after SIGTERM
        #[arg(long)]
        grace: Option<u64>,
        /// Skip the grace period
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if cli.verbose {
        config.logging.verbose = true;
    }
    init_logging(&config)?;

    let service = MonitorService::from_config(&config);

    match cli.command {
        Command::Watch {
            interval_ms,
            limit,
            sort,
            filter,
            user,
        } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.sampling.interval());
            let query = Query {
                sort: sort.unwrap_or(config.ranking.sort),
                limit: Some(limit.unwrap_or(config.ranking.limit)),
                name_filter: filter,
                owner: user,
            };
            run_watch(&service, interval, query, config.logging.verbose).await
        }
        Command::Top { listing } => {
            let query = listing_query(&listing, &config, Some(config.ranking.limit));
            run_listing(&service, &config, query, listing.json).await
        }
        Command::Ps { user, listing } => {
            let mut query = listing_query(&listing, &config, None);
            query.owner = user;
            run_listing(&service, &config, query, listing.json).await
        }
        Command::Find { name, listing } => {
            let query = listing_query(&listing, &config, None).with_name(name);
            run_listing(&service, &config, query, listing.json).await
        }
        Command::Info { pid, json } => run_info(&service, pid, json),
        Command::Kill { pid, grace, force } => {
            let grace = if force {
                0
            } else {
                grace.unwrap_or_else(|| config.control.grace_timeout().as_secs())
            };
            run_kill(&service, pid, grace).await
        }
    }
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    logging::set_log_level(config.logging.effective_level());
    if let Some(ref path) = config.logging.log_file {
        logging::set_log_file(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
    }
    log_debug!(LogCategory::System, "procwatch {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn listing_query(listing: &Listing, config: &Config, default_limit: Option<usize>) -> Query {
    Query {
        sort: listing.sort.unwrap_or(config.ranking.sort),
        limit: listing.limit.or(default_limit),
        name_filter: None,
        owner: None,
    }
}

async fn run_watch(
    service: &MonitorService,
    interval: Duration,
    query: Query,
    verbose: bool,
) -> anyhow::Result<()> {
    // subscribe before starting so the first tick is not missed
    let mut live = LiveView::new(service.ranking(), service.subscribe(), query, verbose);
    let handle = service
        .start_monitoring(interval)
        .context("Failed to start monitoring")?;

    let result = tokio::select! {
        result = live.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            Ok(())
        }
    };

    service.stop_monitoring(&handle).await;
    result
}

async fn run_listing(
    service: &MonitorService,
    config: &Config,
    query: Query,
    json: bool,
) -> anyhow::Result<()> {
    service
        .sample_once(config.sampling.settle())
        .await
        .context("Failed to sample the process table")?;

    let rows = service.query_with(&query).rows();
    if json {
        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
    } else {
        let width = term_size::dimensions().map_or(80, |(w, _)| w.max(40));
        print!("{}", format_table(&rows, width));
    }
    Ok(())
}

fn run_info(service: &MonitorService, pid: u32, json: bool) -> anyhow::Result<()> {
    let Some(details) = service.inspect(pid) else {
        bail!("No such process: {pid}");
    };

    if json {
        let value = serde_json::json!({
            "pid": details.identity.pid,
            "start_time": details.identity.start_time,
            "name": details.name,
            "owner": details.owner,
            "state": details.state,
            "parent_pid": details.parent_pid,
            "threads": details.threads,
            "resident_bytes": details.resident_bytes,
            "virtual_bytes": details.virtual_bytes,
            "started_at": details.started_at,
            "command_line": details.command_line,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", format_details(&details));
    }
    Ok(())
}

async fn run_kill(service: &MonitorService, pid: u32, grace_secs: u64) -> anyhow::Result<()> {
    let outcome = service.terminate(pid, grace_secs).await;
    println!("{pid}: {outcome}");

    match outcome {
        TerminateOutcome::Terminated => Ok(()),
        TerminateOutcome::NotFound => bail!("No such process: {pid}"),
        TerminateOutcome::Denied => bail!("Permission denied for pid {pid}"),
        TerminateOutcome::StillAlive => bail!("Process {pid} survived SIGKILL"),
    }
}
