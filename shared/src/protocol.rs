use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Scheduler state of a process as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Idle,
    Dead,
    Unknown,
}

impl ProcessState {
    /// Maps the single-letter state code of `/proc/<pid>/stat`
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::DiskSleep,
            'T' | 't' => Self::Stopped,
            'Z' => Self::Zombie,
            'I' => Self::Idle,
            'X' | 'x' => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Whether the process has finished running (it may still await reaping)
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Zombie | Self::Dead)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::DiskSleep => "disk-sleep",
            Self::Stopped => "stopped",
            Self::Zombie => "zombie",
            Self::Idle => "idle",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Ranking order for process queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// CPU usage, highest first
    #[default]
    Cpu,
    /// Memory share, highest first
    Memory,
    /// Process id, lowest first
    Pid,
    /// Command name, alphabetical (case-insensitive)
    Name,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "memory" | "mem" => Ok(Self::Memory),
            "pid" => Ok(Self::Pid),
            "name" => Ok(Self::Name),
            other => Err(format!(
                "unknown sort key '{other}' (expected cpu, memory, pid or name)"
            )),
        }
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Pid => "pid",
            Self::Name => "name",
        };
        f.write_str(name)
    }
}

/// One row of a ranked query, as handed to renderers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub owner: String,
    /// `None` while no rate is known yet (new or restricted process)
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub state: ProcessState,
    pub command: String,
}

/// Result of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateOutcome {
    /// The process exited after being signalled
    Terminated,
    /// No process with the requested identity exists (exited or pid reused)
    NotFound,
    /// The signal was refused, or the target is protected
    Denied,
    /// The process survived the forceful signal
    StillAlive,
}

impl TerminateOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Terminated => "terminated",
            Self::NotFound => "not found",
            Self::Denied => "permission denied",
            Self::StillAlive => "still alive",
        }
    }
}

impl std::fmt::Display for TerminateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-tick notification for live renderers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    /// The tick's work took longer than the sampling interval
    pub overrun: bool,
    /// Pids that disappeared since the previous tick
    pub exited: Vec<u32>,
}

/// Events published by the monitor loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A tick completed and a fresh view was published
    Tick(TickEvent),
    /// The process table could not be read; the loop continues
    TickFailed {
        tick: u64,
        timestamp: DateTime<Utc>,
        message: String,
    },
    /// The loop reached its terminal state
    Stopped { ticks: u64 },
}
