//! Point-in-time capture of the process table
//!
//! A [`Snapshot`] maps each [`ProcessIdentity`] to the raw counters read for
//! it. Host access goes through [`ProcessTable`] so the capture logic works
//! the same against `/proc` and against an in-memory table.

use chrono::{DateTime, Utc};
use procwatch_shared::{log_sampler, ProcessState};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{MonitorError, MonitorResult, ProbeError};

/// One process instance: a pid plus its start time (clock ticks since boot).
///
/// A pid reused after exit yields a different identity because the start
/// time differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// Counters that may be withheld for processes owned by other users
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Counters {
    /// User plus kernel time consumed since the process started
    pub cpu_time: Duration,
    pub resident_bytes: u64,
    pub threads: u32,
}

/// What the host reports for one pid
#[derive(Debug)]
pub struct RawProcess {
    pub identity: ProcessIdentity,
    pub name: String,
    pub owner: String,
    pub state: ProcessState,
    pub parent_pid: u32,
    pub counters: Result<Counters, ProbeError>,
}

/// Raw counters for one identity at one sampling instant
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub name: String,
    pub owner: String,
    pub state: ProcessState,
    pub parent_pid: u32,
    pub cpu_time: Option<Duration>,
    pub resident_bytes: Option<u64>,
    pub threads: Option<u32>,
    /// Detailed counters were not readable
    pub restricted: bool,
}

impl ProcessSample {
    /// A fully readable sample
    pub fn new(name: &str, owner: &str, state: ProcessState, counters: Counters) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            state,
            parent_pid: 0,
            cpu_time: Some(counters.cpu_time),
            resident_bytes: Some(counters.resident_bytes),
            threads: Some(counters.threads),
            restricted: false,
        }
    }

    /// A sample whose counters were withheld
    pub fn restricted(name: &str, owner: &str, state: ProcessState) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            state,
            parent_pid: 0,
            cpu_time: None,
            resident_bytes: None,
            threads: None,
            restricted: true,
        }
    }
}

/// Read access to the host's process table
pub trait ProcessTable: Send + Sync {
    /// Every pid currently visible
    fn pids(&self) -> Result<Vec<u32>, ProbeError>;

    /// Identity, descriptive fields and counters of one pid
    fn probe(&self, pid: u32) -> Result<RawProcess, ProbeError>;

    /// Physical memory in bytes
    fn total_memory(&self) -> Result<u64, ProbeError>;

    /// Logical cores available to the scheduler
    fn cpu_count(&self) -> usize;
}

/// The whole process table at one instant
#[derive(Debug, Clone)]
pub struct Snapshot {
    processes: BTreeMap<ProcessIdentity, ProcessSample>,
    captured_at: Instant,
    wall_time: DateTime<Utc>,
    total_memory: u64,
    cpu_count: usize,
}

impl Snapshot {
    pub fn from_parts<I>(
        captured_at: Instant,
        wall_time: DateTime<Utc>,
        total_memory: u64,
        cpu_count: usize,
        processes: I,
    ) -> Self
    where
        I: IntoIterator<Item = (ProcessIdentity, ProcessSample)>,
    {
        Self {
            processes: processes.into_iter().collect(),
            captured_at,
            wall_time,
            total_memory,
            cpu_count: cpu_count.max(1),
        }
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&ProcessSample> {
        self.processes.get(identity)
    }

    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.processes.contains_key(identity)
    }

    /// Samples in identity order
    pub fn iter(&self) -> impl Iterator<Item = (&ProcessIdentity, &ProcessSample)> {
        self.processes.iter()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Monotonic capture time, used for rate computation
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall-clock capture time, used for display
    pub fn wall_time(&self) -> DateTime<Utc> {
        self.wall_time
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

/// Captures the current process table.
///
/// Processes that exit mid-read are dropped; processes whose counters are
/// withheld are kept with `restricted` set. Only a failure to enumerate the
/// table (or to size physical memory) fails the capture.
pub fn capture(table: &dyn ProcessTable) -> MonitorResult<Snapshot> {
    let pids = table.pids().map_err(MonitorError::TableUnreadable)?;
    let total_memory = table.total_memory().map_err(MonitorError::TableUnreadable)?;
    let cpu_count = table.cpu_count();

    let mut processes = BTreeMap::new();
    let mut vanished = 0usize;
    let mut restricted = 0usize;

    for pid in pids {
        let raw = match table.probe(pid) {
            Ok(raw) => raw,
            Err(ProbeError::Vanished) => {
                vanished += 1;
                continue;
            }
            Err(e) => {
                log_sampler!(trace, "pid {pid} skipped: {e}");
                continue;
            }
        };

        let sample = match raw.counters {
            Ok(counters) => ProcessSample {
                name: raw.name,
                owner: raw.owner,
                state: raw.state,
                parent_pid: raw.parent_pid,
                cpu_time: Some(counters.cpu_time),
                resident_bytes: Some(counters.resident_bytes),
                threads: Some(counters.threads),
                restricted: false,
            },
            Err(ProbeError::Vanished) => {
                vanished += 1;
                continue;
            }
            Err(e) => {
                if !matches!(e, ProbeError::PermissionDenied) {
                    log_sampler!(debug, "pid {pid} counters unreadable: {e}");
                }
                restricted += 1;
                ProcessSample {
                    parent_pid: raw.parent_pid,
                    ..ProcessSample::restricted(&raw.name, &raw.owner, raw.state)
                }
            }
        };

        processes.insert(raw.identity, sample);
    }

    log_sampler!(
        debug,
        "captured {} processes ({restricted} restricted, {vanished} vanished mid-read)",
        processes.len()
    );

    Ok(Snapshot {
        processes,
        captured_at: Instant::now(),
        wall_time: Utc::now(),
        total_memory,
        cpu_count: cpu_count.max(1),
    })
}
