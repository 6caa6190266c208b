use chrono::{DateTime, Utc};
use procwatch_shared::{log_debug, logging::LogCategory, MonitorEvent, ProcessRow, TickEvent};
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::procfs::ProcessDetails;
use crate::ranking::{Query, RankingEngine};
use crate::unicode_utils::{fit_str, truncate_str};

/// Terminal width, at least 40 columns (80 when unknown)
fn get_terminal_width() -> usize {
    if let Some((width, _)) = term_size::dimensions() {
        width.max(40)
    } else {
        80
    }
}

const PID_W: usize = 7;
const USER_W: usize = 10;
const PCT_W: usize = 6;
const STATE_W: usize = 9;

fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}"),
        None => "-".to_string(),
    }
}

/// Fixed-column process table fitted to `width`
pub fn format_table(rows: &[ProcessRow], width: usize) -> String {
    let fixed = PID_W + USER_W + PCT_W * 2 + STATE_W + 5;
    let command_w = width.saturating_sub(fixed).max(10);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>PID_W$} {} {:>PCT_W$} {:>PCT_W$} {} COMMAND",
        "PID",
        fit_str("USER", USER_W),
        "CPU%",
        "MEM%",
        fit_str("STATE", STATE_W),
    );

    for row in rows {
        let _ = writeln!(
            out,
            "{:>PID_W$} {} {:>PCT_W$} {:>PCT_W$} {} {}",
            row.pid,
            fit_str(&row.owner, USER_W),
            format_percent(row.cpu_percent),
            format_percent(row.memory_percent),
            fit_str(row.state.label(), STATE_W),
            truncate_str(&row.command, command_w),
        );
    }
    out
}

/// Age of `time`, e.g. "42s", "5m", "3h", "2d"
pub fn format_age(time: DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(time);

    if duration.num_seconds() < 60 {
        format!("{}s", duration.num_seconds().max(0))
    } else if duration.num_minutes() < 60 {
        format!("{}m", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h", duration.num_hours())
    } else {
        format!("{}d", duration.num_days())
    }
}

fn format_bytes(bytes: Option<u64>) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let Some(bytes) = bytes else {
        return "-".to_string();
    };
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Multi-line report for `procwatch info`
pub fn format_details(details: &ProcessDetails) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "PID:        {}", details.identity.pid);
    let _ = writeln!(out, "Name:       {}", details.name);
    let _ = writeln!(out, "User:       {}", details.owner);
    let _ = writeln!(out, "State:      {}", details.state);
    let _ = writeln!(out, "Parent:     {}", details.parent_pid);
    let threads = details
        .threads
        .map_or_else(|| "-".to_string(), |t| t.to_string());
    let _ = writeln!(out, "Threads:    {threads}");
    let _ = writeln!(out, "Resident:   {}", format_bytes(details.resident_bytes));
    let _ = writeln!(out, "Virtual:    {}", format_bytes(details.virtual_bytes));
    match details.started_at {
        Some(started) => {
            let _ = writeln!(
                out,
                "Started:    {} ({} ago)",
                started.format("%Y-%m-%d %H:%M:%S UTC"),
                format_age(started)
            );
        }
        None => {
            let _ = writeln!(out, "Started:    -");
        }
    }
    let command = if details.command_line.is_empty() {
        format!("[{}]", details.name)
    } else {
        details.command_line.join(" ")
    };
    let _ = writeln!(out, "Command:    {command}");
    out
}

/// Live refresh of the ranked table, driven by tick events
pub struct LiveView {
    ranking: Arc<RankingEngine>,
    events: broadcast::Receiver<MonitorEvent>,
    query: Query,
    verbose: bool,
    last_update: Option<DateTime<Utc>>,
}

impl LiveView {
    pub fn new(
        ranking: Arc<RankingEngine>,
        events: broadcast::Receiver<MonitorEvent>,
        query: Query,
        verbose: bool,
    ) -> Self {
        Self {
            ranking,
            events,
            query,
            verbose,
            last_update: None,
        }
    }

    /// Renders every tick until the loop reports `Stopped`
    pub async fn run(&mut self) -> anyhow::Result<()> {
        println!("procwatch - collecting first sample...");

        loop {
            match self.events.recv().await {
                Ok(MonitorEvent::Tick(tick)) => self.render(&tick)?,
                Ok(MonitorEvent::TickFailed { tick, message, .. }) => {
                    eprintln!("tick {tick} failed: {message}");
                }
                Ok(MonitorEvent::Stopped { ticks }) => {
                    log_debug!(LogCategory::Display, "loop stopped after {ticks} ticks");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_debug!(LogCategory::Display, "display lagged, {skipped} events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        Ok(())
    }

    fn render(&mut self, tick: &TickEvent) -> io::Result<()> {
        let view = self.ranking.query(&self.query);
        let width = get_terminal_width();
        let mut stdout = io::stdout().lock();

        if self.last_update.is_some() {
            // clear screen, cursor home
            write!(stdout, "\x1b[2J\x1b[H")?;
        }
        self.last_update = Some(tick.timestamp);

        let overrun = if tick.overrun { "  [overrun]" } else { "" };
        writeln!(
            stdout,
            "procwatch  tick {}  {}  sort: {}{overrun}",
            view.tick,
            tick.timestamp.format("%H:%M:%S"),
            self.query.sort,
        )?;
        writeln!(stdout, "{}", "=".repeat(width))?;
        write!(stdout, "{}", format_table(&view.rows(), width))?;

        if !tick.exited.is_empty() {
            let pids: Vec<String> = tick.exited.iter().map(u32::to_string).collect();
            writeln!(stdout)?;
            writeln!(stdout, "exited: {}", truncate_str(&pids.join(", "), width.saturating_sub(8)))?;
        }

        if self.verbose {
            writeln!(stdout, "{} processes in view", view.len())?;
        }
        writeln!(stdout, "Press Ctrl+C to exit")?;
        stdout.flush()
    }
}
